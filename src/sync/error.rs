use std::path::PathBuf;

use thiserror::Error;

/// Why a single file failed to sync. None of these stop a scan or the
/// watch loop; they are logged at the per-file boundary.
#[derive(Debug, Error)]
pub enum SyncError {
    /// The local file could not be read (vanished, permissions, ...).
    #[error("cannot read {}: {source}", .path.display())]
    Io {
        path: PathBuf,
        source: std::io::Error,
    },

    /// The catalog query for this name failed.
    #[error("remote lookup for {name} failed: {error:#}")]
    RemoteService { name: String, error: anyhow::Error },

    /// The create or update call failed.
    #[error("upload of {name} failed: {error:#}")]
    Upload { name: String, error: anyhow::Error },
}

impl SyncError {
    pub fn io(path: impl Into<PathBuf>) -> impl FnOnce(std::io::Error) -> Self {
        let path = path.into();
        move |source| SyncError::Io { path, source }
    }

    pub fn kind(&self) -> &'static str {
        match self {
            SyncError::Io { .. } => "io",
            SyncError::RemoteService { .. } => "remote",
            SyncError::Upload { .. } => "upload",
        }
    }
}
