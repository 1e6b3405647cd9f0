//! In-memory Drive used by the sync tests.

use std::collections::{HashMap, HashSet};
use std::path::Path;
use std::sync::Mutex;
use std::time::Duration;

use anyhow::{Context, Result};
use async_trait::async_trait;

use crate::drive::types::FOLDER_MIME_TYPE;
use crate::drive::{DriveApi, DriveFile};
use crate::util::hash::fingerprint_bytes;

#[derive(Debug, Clone, PartialEq, Eq)]
pub enum Mutation {
    Create {
        parent: String,
        name: String,
        content: Vec<u8>,
        mime_type: String,
    },
    Update {
        id: String,
        content: Vec<u8>,
    },
}

#[derive(Debug, Clone)]
struct Object {
    id: String,
    parent: Option<String>,
    name: String,
    mime_type: String,
    content: Vec<u8>,
    report_checksum: bool,
}

#[derive(Default)]
struct State {
    objects: Vec<Object>,
    next_id: u64,
    mutations: Vec<Mutation>,
    lookups: usize,
    folder_creations: usize,
    failing_lookups: HashSet<String>,
    failing_uploads: HashSet<String>,
    active: HashMap<String, usize>,
    max_active: HashMap<String, usize>,
}

#[derive(Default)]
pub struct FakeDrive {
    state: Mutex<State>,
    upload_delay: Option<Duration>,
}

impl FakeDrive {
    pub fn new() -> Self {
        Self::default()
    }

    /// Every create/update sleeps this long, to overlap concurrent calls.
    pub fn with_upload_delay(delay: Duration) -> Self {
        Self {
            upload_delay: Some(delay),
            ..Self::default()
        }
    }

    pub fn insert_file(&self, parent: &str, name: &str, content: &[u8]) -> String {
        self.insert(parent, name, content, "text/plain", true)
    }

    /// A file whose remote checksum is not reported.
    pub fn insert_file_without_checksum(&self, parent: &str, name: &str, content: &[u8]) -> String {
        self.insert(parent, name, content, "text/plain", false)
    }

    pub fn insert_folder(&self, parent: &str, name: &str) -> String {
        self.insert(parent, name, b"", FOLDER_MIME_TYPE, false)
    }

    fn insert(&self, parent: &str, name: &str, content: &[u8], mime: &str, checksum: bool) -> String {
        let mut st = self.state.lock().unwrap();
        st.next_id += 1;
        let id = format!("id{}", st.next_id);
        st.objects.push(Object {
            id: id.clone(),
            parent: Some(parent.to_string()),
            name: name.to_string(),
            mime_type: mime.to_string(),
            content: content.to_vec(),
            report_checksum: checksum,
        });
        id
    }

    pub fn fail_lookup_for(&self, name: &str) {
        self.state.lock().unwrap().failing_lookups.insert(name.to_string());
    }

    pub fn fail_uploads_for(&self, name: &str) {
        self.state.lock().unwrap().failing_uploads.insert(name.to_string());
    }

    pub fn mutations(&self) -> Vec<Mutation> {
        self.state.lock().unwrap().mutations.clone()
    }

    pub fn lookups(&self) -> usize {
        self.state.lock().unwrap().lookups
    }

    pub fn folder_creations(&self) -> usize {
        self.state.lock().unwrap().folder_creations
    }

    pub fn content_of(&self, id: &str) -> Option<Vec<u8>> {
        let st = self.state.lock().unwrap();
        st.objects.iter().find(|o| o.id == id).map(|o| o.content.clone())
    }

    /// Highest number of overlapping create/update calls seen for `name`.
    pub fn max_concurrent_uploads(&self, name: &str) -> usize {
        self.state.lock().unwrap().max_active.get(name).copied().unwrap_or(0)
    }

    fn to_drive_file(o: &Object) -> DriveFile {
        DriveFile {
            id: o.id.clone(),
            name: o.name.clone(),
            mime_type: Some(o.mime_type.clone()),
            md5_checksum: o
                .report_checksum
                .then(|| fingerprint_bytes(&o.content).to_string()),
        }
    }

    async fn track_upload(&self, name: &str) -> Result<()> {
        {
            let mut st = self.state.lock().unwrap();
            if st.failing_uploads.contains(name) {
                anyhow::bail!("The user's Drive storage quota has been exceeded.");
            }
            let n = {
                let active = st.active.entry(name.to_string()).or_default();
                *active += 1;
                *active
            };
            let max = st.max_active.entry(name.to_string()).or_default();
            *max = (*max).max(n);
        }
        if let Some(d) = self.upload_delay {
            tokio::time::sleep(d).await;
        }
        let mut st = self.state.lock().unwrap();
        if let Some(active) = st.active.get_mut(name) {
            *active -= 1;
        }
        Ok(())
    }
}

/// Quoted literals of a Drive query, in order, unescaped.
fn literals(query: &str) -> Vec<String> {
    let mut out = Vec::new();
    let mut chars = query.chars();
    while let Some(c) = chars.next() {
        if c != '\'' {
            continue;
        }
        let mut lit = String::new();
        while let Some(c) = chars.next() {
            match c {
                '\\' => lit.extend(chars.next()),
                '\'' => break,
                _ => lit.push(c),
            }
        }
        out.push(lit);
    }
    out
}

/// Content is taken when the upload starts, like a real request body.
async fn read_source(source: &Path) -> Result<Vec<u8>> {
    tokio::fs::read(source)
        .await
        .with_context(|| format!("Failed to open {}", source.display()))
}

#[async_trait]
impl DriveApi for FakeDrive {
    async fn list_files(&self, query: &str) -> Result<Vec<DriveFile>> {
        let lits = literals(query);
        let mut st = self.state.lock().unwrap();
        st.lookups += 1;

        let name = lits.first().cloned().unwrap_or_default();
        if st.failing_lookups.contains(&name) {
            anyhow::bail!("connection reset by peer");
        }

        let files = if query.contains("in parents") {
            let parent = lits.get(1).cloned();
            st.objects
                .iter()
                .filter(|o| o.name == name && o.parent == parent)
                .map(Self::to_drive_file)
                .collect()
        } else {
            st.objects
                .iter()
                .filter(|o| o.name == name && o.mime_type == FOLDER_MIME_TYPE)
                .map(Self::to_drive_file)
                .collect()
        };
        Ok(files)
    }

    async fn create_file(
        &self,
        parent_id: &str,
        name: &str,
        source: &Path,
        mime_type: &str,
    ) -> Result<DriveFile> {
        let content = read_source(source).await?;
        self.track_upload(name).await?;
        let id = self.insert(parent_id, name, &content, mime_type, true);
        let mut st = self.state.lock().unwrap();
        st.mutations.push(Mutation::Create {
            parent: parent_id.to_string(),
            name: name.to_string(),
            content,
            mime_type: mime_type.to_string(),
        });
        let obj = st.objects.iter().find(|o| o.id == id).map(Self::to_drive_file);
        obj.ok_or_else(|| anyhow::anyhow!("created object vanished"))
    }

    async fn update_file(
        &self,
        file_id: &str,
        source: &Path,
        _mime_type: &str,
    ) -> Result<DriveFile> {
        let content = read_source(source).await?;
        let name = {
            let st = self.state.lock().unwrap();
            match st.objects.iter().find(|o| o.id == file_id) {
                Some(o) if o.mime_type == FOLDER_MIME_TYPE => {
                    anyhow::bail!("File {file_id} is a folder and has no content")
                }
                Some(o) => o.name.clone(),
                None => anyhow::bail!("File not found: {file_id}"),
            }
        };
        self.track_upload(&name).await?;

        let mut st = self.state.lock().unwrap();
        st.mutations.push(Mutation::Update {
            id: file_id.to_string(),
            content: content.clone(),
        });
        let obj = st
            .objects
            .iter_mut()
            .find(|o| o.id == file_id)
            .ok_or_else(|| anyhow::anyhow!("File not found: {file_id}"))?;
        obj.content = content;
        obj.report_checksum = true;
        Ok(Self::to_drive_file(obj))
    }

    async fn create_folder(&self, name: &str) -> Result<DriveFile> {
        let id = {
            let mut st = self.state.lock().unwrap();
            st.folder_creations += 1;
            st.next_id += 1;
            let id = format!("id{}", st.next_id);
            st.objects.push(Object {
                id: id.clone(),
                parent: None,
                name: name.to_string(),
                mime_type: FOLDER_MIME_TYPE.to_string(),
                content: Vec::new(),
                report_checksum: false,
            });
            id
        };
        Ok(DriveFile {
            id,
            name: name.to_string(),
            mime_type: Some(FOLDER_MIME_TYPE.to_string()),
            md5_checksum: None,
        })
    }
}
