use anyhow::{Context, Result};

use crate::drive::types::FOLDER_MIME_TYPE;
use crate::drive::{DriveApi, DriveFile};
use crate::util::hash::Fingerprint;

/// The Drive folder that receives every synced file.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct RemoteContainer {
    pub id: String,
    pub name: String,
}

/// What the remote side knows about one name in the container.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct RemoteObjectDescriptor {
    pub id: String,
    pub name: String,
    pub fingerprint: Option<Fingerprint>,
    pub is_folder: bool,
}

impl From<DriveFile> for RemoteObjectDescriptor {
    fn from(f: DriveFile) -> Self {
        let is_folder = f.is_folder();
        Self {
            fingerprint: f.md5_checksum.map(Fingerprint::from_hex),
            id: f.id,
            name: f.name,
            is_folder,
        }
    }
}

/// Quote a value for the Drive query language.
pub fn quote(value: &str) -> String {
    let mut out = String::with_capacity(value.len() + 2);
    out.push('\'');
    for c in value.chars() {
        if c == '\\' || c == '\'' {
            out.push('\\');
        }
        out.push(c);
    }
    out.push('\'');
    out
}

/// Look up a non-trashed object called `name` inside `container`.
///
/// Matches by name only, so a folder with the same name is returned as well.
/// When the service reports several matches the first one wins.
pub async fn find_by_name(
    api: &dyn DriveApi,
    container: &RemoteContainer,
    name: &str,
) -> Result<Option<RemoteObjectDescriptor>> {
    let query = format!(
        "name = {} and {} in parents and trashed = false",
        quote(name),
        quote(&container.id)
    );
    let mut matches = api.list_files(&query).await?;

    if matches.len() > 1 {
        tracing::debug!(name, count = matches.len(), "several remote objects share this name, using the first");
    }
    if matches.is_empty() {
        return Ok(None);
    }
    Ok(Some(matches.swap_remove(0).into()))
}

/// Reuse the first existing folder called `name`, or create it.
pub async fn ensure_container(api: &dyn DriveApi, name: &str) -> Result<RemoteContainer> {
    let query = format!(
        "name = {} and mimeType = {} and trashed = false",
        quote(name),
        quote(FOLDER_MIME_TYPE)
    );
    let existing = api
        .list_files(&query)
        .await
        .with_context(|| format!("Failed to look up Drive folder {name}"))?;

    if let Some(folder) = existing.into_iter().next() {
        tracing::info!(folder = name, id = %folder.id, "using existing Drive folder");
        return Ok(RemoteContainer {
            id: folder.id,
            name: folder.name,
        });
    }

    let folder = api
        .create_folder(name)
        .await
        .with_context(|| format!("Failed to create Drive folder {name}"))?;
    tracing::info!(folder = name, id = %folder.id, "created Drive folder");
    Ok(RemoteContainer {
        id: folder.id,
        name: folder.name,
    })
}
