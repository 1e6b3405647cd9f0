use std::path::{Path, PathBuf};
use std::sync::Arc;
use std::time::Duration;

use anyhow::{Context, Result};
use reqwest::{Method, RequestBuilder, Response, StatusCode};
use tokio_util::io::ReaderStream;

use crate::auth::Session;

use super::types::ApiErrorEnvelope;

const API_BASE: &str = "https://www.googleapis.com/drive/v3";
const UPLOAD_BASE: &str = "https://www.googleapis.com/upload/drive/v3";

const MAX_RETRIES: u32 = 5;

pub struct DriveClient {
    http: reqwest::Client,
    session: Arc<Session>,
    api_base: String,
    upload_base: String,
    pub(super) resumable_threshold: u64,
}

impl DriveClient {
    pub fn new(session: Arc<Session>) -> Result<Self> {
        Self::with_base_urls(session, API_BASE, UPLOAD_BASE)
    }

    pub fn with_base_urls(session: Arc<Session>, api_base: &str, upload_base: &str) -> Result<Self> {
        let http = reqwest::Client::builder()
            .timeout(Duration::from_secs(300))
            .connect_timeout(Duration::from_secs(30))
            .build()
            .context("Failed to build HTTP client")?;

        Ok(Self {
            http,
            session,
            api_base: api_base.trim_end_matches('/').to_string(),
            upload_base: upload_base.trim_end_matches('/').to_string(),
            resumable_threshold: super::files::RESUMABLE_THRESHOLD,
        })
    }

    /// Request against the metadata endpoint (`/drive/v3`).
    pub fn api_request(&self, method: Method, path: &str) -> AuthenticatedRequest<'_> {
        self.request_url(method, &format!("{}{path}", self.api_base))
    }

    /// Request against the media upload endpoint (`/upload/drive/v3`).
    pub fn upload_request(&self, method: Method, path: &str) -> AuthenticatedRequest<'_> {
        self.request_url(method, &format!("{}{path}", self.upload_base))
    }

    /// Request against an absolute URL, e.g. a resumable session URI.
    pub fn request_url(&self, method: Method, url: &str) -> AuthenticatedRequest<'_> {
        AuthenticatedRequest {
            client: self,
            builder: self.http.request(method, url),
            file_body: None,
        }
    }
}

/// Attaches the bearer token and sends with retry on 429 and 5xx.
pub struct AuthenticatedRequest<'a> {
    client: &'a DriveClient,
    builder: RequestBuilder,
    file_body: Option<PathBuf>,
}

impl AuthenticatedRequest<'_> {
    pub fn query(mut self, params: &[(&str, &str)]) -> Self {
        self.builder = self.builder.query(params);
        self
    }

    pub fn header(mut self, key: &str, value: &str) -> Self {
        self.builder = self.builder.header(key, value);
        self
    }

    pub fn json<T: serde::Serialize + ?Sized>(mut self, body: &T) -> Self {
        self.builder = self.builder.json(body);
        self
    }

    pub fn body(mut self, body: Vec<u8>) -> Self {
        self.builder = self.builder.body(body);
        self
    }

    /// Stream the file at `path` as the body instead of buffering it.
    pub fn file_body(mut self, path: &Path) -> Self {
        self.file_body = Some(path.to_path_buf());
        self
    }

    pub async fn send(self) -> Result<Response> {
        let mut builder = self.builder;

        for attempt in 0..=MAX_RETRIES {
            let token = self.client.session.access_token().await?;
            let retry_builder = builder.try_clone();

            let mut request = builder.bearer_auth(&token);
            if let Some(path) = &self.file_body {
                request = attach_file(request, path).await?;
            }

            let resp = request
                .send()
                .await
                .context("HTTP request failed")?;

            let status = resp.status();
            if status.is_success() {
                return Ok(resp);
            }

            let retryable =
                status == StatusCode::TOO_MANY_REQUESTS || status.is_server_error();
            if retryable && attempt < MAX_RETRIES {
                let wait = retry_delay(&resp, attempt);
                tracing::warn!(%status, attempt = attempt + 1, "Drive request throttled, waiting {wait:?}");
                tokio::time::sleep(wait).await;

                builder = retry_builder
                    .context("Drive request failed and its body cannot be replayed")?;
                continue;
            }

            return Err(error_from_response(resp).await);
        }

        anyhow::bail!("Drive request failed after {MAX_RETRIES} retries")
    }
}

/// Opened on every attempt, so a retry resends from the first byte.
async fn attach_file(builder: RequestBuilder, path: &Path) -> Result<RequestBuilder> {
    let file = tokio::fs::File::open(path)
        .await
        .with_context(|| format!("Failed to open {}", path.display()))?;
    let len = file
        .metadata()
        .await
        .with_context(|| format!("Failed to stat {}", path.display()))?
        .len();
    Ok(builder
        .header(reqwest::header::CONTENT_LENGTH, len)
        .body(reqwest::Body::wrap_stream(ReaderStream::new(file))))
}

fn retry_delay(resp: &Response, attempt: u32) -> Duration {
    let base = resp
        .headers()
        .get(reqwest::header::RETRY_AFTER)
        .and_then(|v| v.to_str().ok())
        .and_then(|v| v.parse::<u64>().ok())
        .unwrap_or_else(|| 1u64 << attempt.min(5));
    Duration::from_secs(base) + jitter()
}

async fn error_from_response(resp: Response) -> anyhow::Error {
    let status = resp.status();
    let body = resp.text().await.unwrap_or_default();
    match serde_json::from_str::<ApiErrorEnvelope>(&body) {
        Ok(env) => anyhow::anyhow!("{}", env.error),
        Err(_) => anyhow::anyhow!("Drive API error ({status}): {body}"),
    }
}

fn jitter() -> Duration {
    Duration::from_millis(rand::random::<u64>() % 500)
}
