mod client;
mod files;
pub mod types;

pub use client::DriveClient;
pub use types::DriveFile;

use std::path::Path;

use anyhow::Result;
use async_trait::async_trait;

/// The slice of the Drive API the sync core depends on.
#[async_trait]
pub trait DriveApi: Send + Sync {
    /// All results of a `files.list` query, across pages.
    async fn list_files(&self, query: &str) -> Result<Vec<DriveFile>>;

    /// Upload the local file `source` as `name`. Large files are streamed
    /// from disk, never read whole.
    async fn create_file(
        &self,
        parent_id: &str,
        name: &str,
        source: &Path,
        mime_type: &str,
    ) -> Result<DriveFile>;

    async fn update_file(&self, file_id: &str, source: &Path, mime_type: &str) -> Result<DriveFile>;

    async fn create_folder(&self, name: &str) -> Result<DriveFile>;
}

#[async_trait]
impl DriveApi for DriveClient {
    async fn list_files(&self, query: &str) -> Result<Vec<DriveFile>> {
        DriveClient::list_files(self, query).await
    }

    async fn create_file(
        &self,
        parent_id: &str,
        name: &str,
        source: &Path,
        mime_type: &str,
    ) -> Result<DriveFile> {
        DriveClient::create_file(self, parent_id, name, source, mime_type).await
    }

    async fn update_file(&self, file_id: &str, source: &Path, mime_type: &str) -> Result<DriveFile> {
        DriveClient::update_file(self, file_id, source, mime_type).await
    }

    async fn create_folder(&self, name: &str) -> Result<DriveFile> {
        DriveClient::create_folder(self, name).await
    }
}
