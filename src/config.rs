use std::path::{Path, PathBuf};

use anyhow::{Context, Result};
use serde::Deserialize;

#[derive(Debug, Clone, Deserialize)]
pub struct Config {
    pub general: GeneralConfig,
    #[serde(default)]
    pub auth: AuthConfig,
    #[serde(default)]
    pub cache: CacheConfig,
}

#[derive(Debug, Clone, Deserialize)]
pub struct GeneralConfig {
    /// Local directory mirrored into Drive. Created if missing.
    pub local_folder: PathBuf,
    /// Name of the Drive folder that receives uploads.
    #[serde(default = "default_drive_folder_name")]
    pub drive_folder_name: String,
    /// Upper bound on concurrent reconciliations in watch mode.
    #[serde(default = "default_workers")]
    pub workers: usize,
    /// Capacity of the watcher → dispatcher event channel.
    #[serde(default = "default_queue_capacity")]
    pub queue_capacity: usize,
    #[serde(default)]
    pub exclude: Vec<String>,
    /// The startup scan is always flat; this controls whether the live
    /// watcher also reports files in subdirectories.
    #[serde(default = "default_true")]
    pub watch_recursive: bool,
    /// Compare fingerprints for live events instead of always uploading.
    #[serde(default)]
    pub watch_skip_unchanged: bool,
}

fn default_drive_folder_name() -> String {
    "backup-gs65".into()
}
fn default_workers() -> usize {
    4
}
fn default_queue_capacity() -> usize {
    1024
}
fn default_true() -> bool {
    true
}

#[derive(Debug, Clone, Default, Deserialize)]
pub struct AuthConfig {
    #[serde(default)]
    pub client_id: String,
    #[serde(default)]
    pub client_secret: String,
    /// Port for the local OAuth callback server
    pub redirect_port: Option<u16>,
    /// Custom path for token storage
    pub token_path: Option<PathBuf>,
}

#[derive(Debug, Clone, Default, Deserialize)]
pub struct CacheConfig {
    #[serde(default)]
    pub enabled: bool,
    pub db_path: Option<PathBuf>,
}

const BUILTIN_CLIENT_ID: Option<&str> = option_env!("DRIVESYNCD_CLIENT_ID");
const BUILTIN_CLIENT_SECRET: Option<&str> = option_env!("DRIVESYNCD_CLIENT_SECRET");

pub fn has_builtin_credentials() -> bool {
    BUILTIN_CLIENT_ID.is_some_and(|s| !s.is_empty())
        && BUILTIN_CLIENT_SECRET.is_some_and(|s| !s.is_empty())
}

/// Auth settings from compiled-in credentials, for running `auth` before a
/// config file exists.
fn builtin_auth_config() -> Option<AuthConfig> {
    if !has_builtin_credentials() {
        return None;
    }
    Some(AuthConfig {
        client_id: BUILTIN_CLIENT_ID.unwrap_or_default().to_string(),
        client_secret: BUILTIN_CLIENT_SECRET.unwrap_or_default().to_string(),
        ..AuthConfig::default()
    })
}

/// Auth settings for the `auth` command: the config file's when it loaded,
/// otherwise the built-in credentials, otherwise the load error.
pub fn auth_config_or_builtin(loaded: Result<Config>) -> Result<AuthConfig> {
    match loaded {
        Ok(config) => Ok(config.auth),
        Err(e) => match builtin_auth_config() {
            Some(auth) => {
                tracing::debug!("no usable config ({e:#}), using built-in credentials");
                Ok(auth)
            }
            None => Err(e),
        },
    }
}

pub fn default_config_path() -> Result<PathBuf> {
    let dir = dirs::config_dir().context("Could not determine config directory")?;
    Ok(dir.join("drivesyncd").join("config.toml"))
}

pub fn load_config(path: Option<&Path>) -> Result<Config> {
    let path = match path {
        Some(p) => p.to_path_buf(),
        None => default_config_path()?,
    };

    let content = std::fs::read_to_string(&path).with_context(|| {
        format!(
            "Failed to read config file: {}\n\
             See config/drivesyncd.example.toml for an example.",
            path.display()
        )
    })?;

    parse_config(&content).with_context(|| format!("Invalid config file: {}", path.display()))
}

fn parse_config(content: &str) -> Result<Config> {
    let mut config: Config = toml::from_str(content)?;

    config.general.local_folder = expand_home(&config.general.local_folder);
    if let Some(p) = config.auth.token_path.take() {
        config.auth.token_path = Some(expand_home(&p));
    }
    if let Some(p) = config.cache.db_path.take() {
        config.cache.db_path = Some(expand_home(&p));
    }

    if config.auth.client_id.is_empty()
        && config.auth.client_secret.is_empty()
        && let Some(builtin) = builtin_auth_config()
    {
        config.auth.client_id = builtin.client_id;
        config.auth.client_secret = builtin.client_secret;
    }

    if config.auth.client_id.is_empty() {
        anyhow::bail!("auth.client_id must not be empty");
    }
    if config.auth.client_secret.is_empty() {
        anyhow::bail!("auth.client_secret must not be empty");
    }
    if config.general.drive_folder_name.trim().is_empty() {
        anyhow::bail!("general.drive_folder_name must not be empty");
    }
    if config.general.workers == 0 {
        anyhow::bail!("general.workers must be at least 1");
    }
    if config.general.queue_capacity == 0 {
        anyhow::bail!("general.queue_capacity must be at least 1");
    }

    Ok(config)
}

fn expand_home(path: &Path) -> PathBuf {
    match path.strip_prefix("~") {
        Ok(rest) => match dirs::home_dir() {
            Some(home) => home.join(rest),
            None => path.to_path_buf(),
        },
        Err(_) => path.to_path_buf(),
    }
}
