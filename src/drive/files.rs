use std::path::Path;

use anyhow::{Context, Result};
use reqwest::Method;

use super::client::DriveClient;
use super::types::{DriveFile, FILE_FIELDS, FOLDER_MIME_TYPE, FileList, NewFile};

/// Content above this size goes through a resumable session instead of a
/// single multipart request. Only content under it is ever held in memory.
pub(super) const RESUMABLE_THRESHOLD: u64 = 5 * 1024 * 1024;

const PAGE_SIZE: &str = "1000";

impl DriveClient {
    /// Run a `files.list` query, following `nextPageToken` until exhausted.
    pub async fn list_files(&self, query: &str) -> Result<Vec<DriveFile>> {
        let fields = format!("nextPageToken,files({FILE_FIELDS})");
        let mut all = Vec::new();
        let mut page_token: Option<String> = None;

        loop {
            let mut params = vec![
                ("q", query),
                ("fields", fields.as_str()),
                ("pageSize", PAGE_SIZE),
                ("spaces", "drive"),
            ];
            if let Some(ref t) = page_token {
                params.push(("pageToken", t.as_str()));
            }

            let page: FileList = self
                .api_request(Method::GET, "/files")
                .query(&params)
                .send()
                .await
                .context("Failed to list files")?
                .json()
                .await
                .context("Failed to parse files.list response")?;

            all.extend(page.files);

            match page.next_page_token {
                Some(t) if !t.is_empty() => page_token = Some(t),
                _ => break,
            }
        }

        Ok(all)
    }

    /// Create a folder at the root of My Drive.
    pub async fn create_folder(&self, name: &str) -> Result<DriveFile> {
        let meta = NewFile {
            name,
            parents: Vec::new(),
            mime_type: Some(FOLDER_MIME_TYPE),
        };

        self.api_request(Method::POST, "/files")
            .query(&[("fields", FILE_FIELDS)])
            .json(&meta)
            .send()
            .await
            .with_context(|| format!("Failed to create folder {name}"))?
            .json()
            .await
            .context("Failed to parse create folder response")
    }

    /// Upload the local file `source` as `name` into `parent_id`.
    pub async fn create_file(
        &self,
        parent_id: &str,
        name: &str,
        source: &Path,
        mime_type: &str,
    ) -> Result<DriveFile> {
        let meta = NewFile {
            name,
            parents: vec![parent_id],
            mime_type: Some(mime_type),
        };
        let meta_json = serde_json::to_vec(&meta)?;

        let len = file_len(source).await?;
        if len > self.resumable_threshold {
            let session_url = self
                .start_resumable(Method::POST, "/files", meta_json, mime_type, len)
                .await?;
            return self.finish_resumable(&session_url, source, mime_type).await;
        }

        let content = tokio::fs::read(source)
            .await
            .with_context(|| format!("Failed to read {}", source.display()))?;
        let boundary = random_boundary();
        let body = multipart_related(&boundary, &meta_json, mime_type, &content);

        self.upload_request(Method::POST, "/files")
            .query(&[("uploadType", "multipart"), ("fields", FILE_FIELDS)])
            .header(
                "content-type",
                &format!("multipart/related; boundary={boundary}"),
            )
            .body(body)
            .send()
            .await
            .with_context(|| format!("Failed to upload {name}"))?
            .json()
            .await
            .context("Failed to parse upload response")
    }

    /// Replace the content of an existing file with the local file `source`.
    pub async fn update_file(
        &self,
        file_id: &str,
        source: &Path,
        mime_type: &str,
    ) -> Result<DriveFile> {
        let path = format!("/files/{file_id}");

        let len = file_len(source).await?;
        if len > self.resumable_threshold {
            let session_url = self
                .start_resumable(Method::PATCH, &path, b"{}".to_vec(), mime_type, len)
                .await?;
            return self.finish_resumable(&session_url, source, mime_type).await;
        }

        self.upload_request(Method::PATCH, &path)
            .query(&[("uploadType", "media"), ("fields", FILE_FIELDS)])
            .header("content-type", mime_type)
            .file_body(source)
            .send()
            .await
            .with_context(|| format!("Failed to update file {file_id}"))?
            .json()
            .await
            .context("Failed to parse update response")
    }

    /// Open a resumable upload session and return its session URI.
    async fn start_resumable(
        &self,
        method: Method,
        path: &str,
        meta_json: Vec<u8>,
        mime_type: &str,
        len: u64,
    ) -> Result<String> {
        let resp = self
            .upload_request(method, path)
            .query(&[("uploadType", "resumable"), ("fields", FILE_FIELDS)])
            .header("content-type", "application/json; charset=UTF-8")
            .header("x-upload-content-type", mime_type)
            .header("x-upload-content-length", &len.to_string())
            .body(meta_json)
            .send()
            .await
            .context("Failed to start resumable upload")?;

        let location = resp
            .headers()
            .get(reqwest::header::LOCATION)
            .and_then(|v| v.to_str().ok())
            .context("Resumable upload response had no Location header")?;
        tracing::debug!(session = %location, size = len, "resumable upload session opened");
        Ok(location.to_string())
    }

    /// Stream `source` into an open session in a single request.
    async fn finish_resumable(
        &self,
        session_url: &str,
        source: &Path,
        mime_type: &str,
    ) -> Result<DriveFile> {
        self.request_url(Method::PUT, session_url)
            .header("content-type", mime_type)
            .file_body(source)
            .send()
            .await
            .context("Failed to upload content to resumable session")?
            .json()
            .await
            .context("Failed to parse resumable upload response")
    }
}

async fn file_len(path: &Path) -> Result<u64> {
    let meta = tokio::fs::metadata(path)
        .await
        .with_context(|| format!("Failed to stat {}", path.display()))?;
    Ok(meta.len())
}

fn random_boundary() -> String {
    format!("drivesyncd-{:016x}{:016x}", rand::random::<u64>(), rand::random::<u64>())
}

/// Build a `multipart/related` body: JSON metadata part, then the media part.
fn multipart_related(boundary: &str, meta_json: &[u8], mime_type: &str, content: &[u8]) -> Vec<u8> {
    let mut body = Vec::with_capacity(content.len() + meta_json.len() + 256);
    body.extend_from_slice(
        format!("--{boundary}\r\nContent-Type: application/json; charset=UTF-8\r\n\r\n").as_bytes(),
    );
    body.extend_from_slice(meta_json);
    body.extend_from_slice(format!("\r\n--{boundary}\r\nContent-Type: {mime_type}\r\n\r\n").as_bytes());
    body.extend_from_slice(content);
    body.extend_from_slice(format!("\r\n--{boundary}--\r\n").as_bytes());
    body
}
