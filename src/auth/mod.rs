//! OAuth session for the Drive API.
//!
//! A [`Session`] moves through `Absent → PendingAuthorization → Active`,
//! drops to `Expired` when the access token runs out and returns to
//! `Active` after a refresh. It is created once at startup and handed to
//! the Drive client; nothing else touches the token file.

mod oauth;
mod token_store;

pub use oauth::run_auth_flow;
pub use token_store::TokenData;

use std::path::{Path, PathBuf};

use anyhow::{Context, Result};
use tokio::sync::Mutex;

use crate::config::AuthConfig;

const TOKEN_URL: &str = "https://oauth2.googleapis.com/token";

/// Refresh when the access token expires within this many seconds.
const REFRESH_MARGIN_SECS: i64 = 60;

#[derive(Debug, Clone, PartialEq, Eq)]
pub enum SessionState {
    Absent,
    PendingAuthorization,
    Active(TokenData),
    Expired(TokenData),
}

impl SessionState {
    pub fn label(&self) -> &'static str {
        match self {
            SessionState::Absent => "not authenticated",
            SessionState::PendingAuthorization => "authorization pending",
            SessionState::Active(_) => "active",
            SessionState::Expired(_) => "expired (will refresh on next request)",
        }
    }

    fn from_tokens(tokens: TokenData) -> Self {
        if tokens.expires_within(chrono::Duration::seconds(REFRESH_MARGIN_SECS)) {
            SessionState::Expired(tokens)
        } else {
            SessionState::Active(tokens)
        }
    }
}

pub struct Session {
    client_id: String,
    client_secret: String,
    token_path: PathBuf,
    token_url: String,
    state: Mutex<SessionState>,
    http: reqwest::Client,
}

#[derive(serde::Deserialize)]
struct TokenResponse {
    access_token: String,
    #[serde(default)]
    refresh_token: Option<String>,
    expires_in: i64,
}

impl Session {
    /// Build a session from the persisted token file, if any.
    pub fn load(auth: &AuthConfig) -> Result<Self> {
        let token_path = token_store::resolve_token_path(auth.token_path.as_deref())?;
        let state = if token_path.exists() {
            match token_store::load_tokens(&token_path) {
                Ok(t) => SessionState::from_tokens(t),
                Err(e) => {
                    tracing::warn!("ignoring unreadable token file: {e:#}");
                    SessionState::Absent
                }
            }
        } else {
            SessionState::Absent
        };

        tracing::debug!(state = state.label(), path = %token_path.display(), "session loaded");

        Ok(Self {
            client_id: auth.client_id.clone(),
            client_secret: auth.client_secret.clone(),
            token_path,
            token_url: TOKEN_URL.to_string(),
            state: Mutex::new(state),
            http: reqwest::Client::new(),
        })
    }

    #[cfg(test)]
    pub fn with_access_token(token: &str) -> Self {
        Self {
            client_id: "test-client".into(),
            client_secret: "test-secret".into(),
            token_path: std::env::temp_dir().join("drivesyncd-test-tokens.json"),
            token_url: TOKEN_URL.to_string(),
            state: Mutex::new(SessionState::Active(TokenData {
                access_token: token.to_string(),
                refresh_token: "unused".into(),
                expires_at: chrono::Utc::now() + chrono::Duration::hours(1),
            })),
            http: reqwest::Client::new(),
        }
    }

    #[cfg(test)]
    fn with_token_url(mut self, url: String) -> Self {
        self.token_url = url;
        self
    }

    pub fn client_id(&self) -> &str {
        &self.client_id
    }

    pub fn token_path(&self) -> &Path {
        &self.token_path
    }

    pub async fn state(&self) -> SessionState {
        self.state.lock().await.clone()
    }

    /// Fail early, before any remote work, when there is nothing to refresh from.
    pub async fn ensure_authenticated(&self) -> Result<()> {
        match &*self.state.lock().await {
            SessionState::Active(_) | SessionState::Expired(_) => Ok(()),
            SessionState::Absent | SessionState::PendingAuthorization => {
                anyhow::bail!("Not authenticated. Run `drivesyncd auth` first.")
            }
        }
    }

    /// Get a valid access token, refreshing if necessary.
    pub async fn access_token(&self) -> Result<String> {
        let mut guard = self.state.lock().await;
        let margin = chrono::Duration::seconds(REFRESH_MARGIN_SECS);

        let tokens = match &*guard {
            SessionState::Active(t) if !t.expires_within(margin) => {
                return Ok(t.access_token.clone());
            }
            SessionState::Active(t) | SessionState::Expired(t) => t.clone(),
            SessionState::Absent | SessionState::PendingAuthorization => {
                anyhow::bail!("Not authenticated. Run `drivesyncd auth` first.")
            }
        };

        *guard = SessionState::Expired(tokens.clone());
        tracing::debug!("access token expired or expiring soon, refreshing");

        let refreshed = self
            .request_tokens(
                &[
                    ("grant_type", "refresh_token"),
                    ("refresh_token", tokens.refresh_token.as_str()),
                ],
                Some(&tokens.refresh_token),
            )
            .await
            .context("Token refresh failed. You may need to run `drivesyncd auth` again")?;

        token_store::save_tokens(&self.token_path, &refreshed)?;
        let access = refreshed.access_token.clone();
        *guard = SessionState::Active(refreshed);
        tracing::debug!("token refreshed successfully");
        Ok(access)
    }

    pub async fn begin_authorization(&self) {
        *self.state.lock().await = SessionState::PendingAuthorization;
    }

    /// Abort a pending authorization, falling back to whatever is on disk.
    pub async fn cancel_authorization(&self) {
        let restored = token_store::load_tokens(&self.token_path)
            .map(SessionState::from_tokens)
            .unwrap_or(SessionState::Absent);
        *self.state.lock().await = restored;
    }

    /// Exchange an authorization code and persist the resulting tokens.
    pub async fn complete_authorization(&self, code: &str, redirect_uri: &str) -> Result<()> {
        let tokens = self
            .request_tokens(
                &[
                    ("grant_type", "authorization_code"),
                    ("code", code),
                    ("redirect_uri", redirect_uri),
                ],
                None,
            )
            .await
            .context("Token exchange failed")?;

        token_store::save_tokens(&self.token_path, &tokens)?;
        *self.state.lock().await = SessionState::Active(tokens);
        Ok(())
    }

    async fn request_tokens(
        &self,
        grant: &[(&str, &str)],
        previous_refresh_token: Option<&str>,
    ) -> Result<TokenData> {
        let mut form: Vec<(&str, &str)> = vec![
            ("client_id", self.client_id.as_str()),
            ("client_secret", self.client_secret.as_str()),
        ];
        form.extend_from_slice(grant);

        let resp = self
            .http
            .post(&self.token_url)
            .form(&form)
            .send()
            .await
            .context("Failed to contact Google token endpoint")?;

        if !resp.status().is_success() {
            let status = resp.status();
            let body = resp.text().await.unwrap_or_default();
            anyhow::bail!("token endpoint returned {status}: {body}");
        }

        let tr: TokenResponse = resp
            .json()
            .await
            .context("Failed to parse token response")?;

        // Google only returns a refresh token on the first consent
        let refresh_token = match (tr.refresh_token, previous_refresh_token) {
            (Some(t), _) => t,
            (None, Some(prev)) => prev.to_string(),
            (None, None) => anyhow::bail!(
                "token response carried no refresh token; revoke the app's access and retry"
            ),
        };

        Ok(TokenData {
            access_token: tr.access_token,
            refresh_token,
            expires_at: chrono::Utc::now() + chrono::Duration::seconds(tr.expires_in),
        })
    }
}
