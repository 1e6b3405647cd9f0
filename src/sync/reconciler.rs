use std::path::{Path, PathBuf};
use std::sync::Arc;

use crate::drive::DriveApi;
use crate::util::hash::{self, Fingerprint};
use crate::util::path as sync_path;

use super::cache::CatalogCache;
use super::catalog::{self, RemoteContainer};
use super::error::SyncError;

/// What reconciliation decided for one file.
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum SyncDecision {
    /// Remote already holds these bytes; nothing was sent.
    Skip,
    /// No object with this name existed; a new one was created.
    Create,
    /// The existing object was overwritten with the local content.
    Update { file_id: String },
}

/// How an existing remote object is treated.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum ReconcilePolicy {
    /// Compare fingerprints and skip identical content (scans).
    CompareFingerprint,
    /// Upload on every change event without comparing (live watch).
    AlwaysUpload,
}

/// Result of [`Reconciler::sync_file`], after logging.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum SyncOutcome {
    Skipped,
    Created,
    Updated,
    Failed,
}

impl From<&SyncDecision> for SyncOutcome {
    fn from(d: &SyncDecision) -> Self {
        match d {
            SyncDecision::Skip => SyncOutcome::Skipped,
            SyncDecision::Create => SyncOutcome::Created,
            SyncDecision::Update { .. } => SyncOutcome::Updated,
        }
    }
}

/// Decides create, update or skip for a single local file and performs
/// the mutation.
pub struct Reconciler {
    api: Arc<dyn DriveApi>,
    root: PathBuf,
    cache: Option<CatalogCache>,
}

impl Reconciler {
    pub fn new(api: Arc<dyn DriveApi>, root: impl Into<PathBuf>) -> Self {
        Self {
            api,
            root: root.into(),
            cache: None,
        }
    }

    pub fn with_cache(mut self, cache: CatalogCache) -> Self {
        self.cache = Some(cache);
        self
    }

    /// Sync one file and log the outcome. Never fails: every error is
    /// reported here and the caller moves on to the next file.
    pub async fn sync_file(
        &self,
        container: &RemoteContainer,
        path: &Path,
        policy: ReconcilePolicy,
    ) -> SyncOutcome {
        match self.reconcile(container, path, policy).await {
            Ok(decision) => {
                match &decision {
                    SyncDecision::Skip => tracing::info!(path = %path.display(), "skipped"),
                    SyncDecision::Create => tracing::info!(path = %path.display(), "created"),
                    SyncDecision::Update { file_id } => {
                        tracing::info!(path = %path.display(), id = %file_id, "updated")
                    }
                }
                SyncOutcome::from(&decision)
            }
            Err(e) => {
                tracing::error!(path = %path.display(), kind = e.kind(), error = %e, "sync failed");
                SyncOutcome::Failed
            }
        }
    }

    pub async fn reconcile(
        &self,
        container: &RemoteContainer,
        path: &Path,
        policy: ReconcilePolicy,
    ) -> Result<SyncDecision, SyncError> {
        let name = sync_path::file_name(path).ok_or_else(|| SyncError::Io {
            path: path.to_path_buf(),
            source: std::io::Error::new(
                std::io::ErrorKind::InvalidInput,
                "path has no UTF-8 file name",
            ),
        })?;
        let relative = sync_path::relative_path(&self.root, path).unwrap_or_else(|| name.to_string());

        // A vanished file is a local failure, not something to ask Drive about
        tokio::fs::metadata(path).await.map_err(SyncError::io(path))?;

        let mut local_fp = None;
        if policy == ReconcilePolicy::CompareFingerprint
            && let Some(cache) = &self.cache
        {
            let fp = hash::fingerprint(path).await.map_err(SyncError::io(path))?;
            match cache.get(&container.id, name).await {
                Ok(Some(entry)) if entry.fingerprint.matches(fp.as_str()) => {
                    tracing::debug!(path = %relative, "unchanged since last confirmed sync");
                    return Ok(SyncDecision::Skip);
                }
                Ok(_) => {}
                Err(e) => tracing::warn!(error = %e, "catalog cache lookup failed"),
            }
            local_fp = Some(fp);
        }

        let existing = catalog::find_by_name(self.api.as_ref(), container, name)
            .await
            .map_err(|error| SyncError::RemoteService {
                name: name.to_string(),
                error,
            })?;

        let mime = sync_path::mime_type(path);

        let Some(remote) = existing else {
            let result = self.api.create_file(&container.id, name, path, &mime).await;
            return match result {
                Ok(file) => {
                    let confirmed = file.md5_checksum.map(Fingerprint::from_hex).or(local_fp);
                    self.remember(container, name, &relative, &file.id, confirmed).await;
                    Ok(SyncDecision::Create)
                }
                Err(error) => {
                    self.invalidate(container, name).await;
                    Err(SyncError::Upload {
                        name: name.to_string(),
                        error,
                    })
                }
            };
        };

        if remote.is_folder {
            tracing::warn!(
                path = %relative,
                name = %remote.name,
                id = %remote.id,
                "remote object with this name is a folder"
            );
        }

        if policy == ReconcilePolicy::CompareFingerprint {
            let fp = match local_fp.take() {
                Some(fp) => fp,
                None => hash::fingerprint(path).await.map_err(SyncError::io(path))?,
            };
            if remote
                .fingerprint
                .as_ref()
                .is_some_and(|r| fp.matches(r.as_str()))
            {
                self.remember(container, name, &relative, &remote.id, Some(fp)).await;
                return Ok(SyncDecision::Skip);
            }
            local_fp = Some(fp);
        }

        match self.api.update_file(&remote.id, path, &mime).await {
            Ok(file) => {
                let confirmed = file.md5_checksum.map(Fingerprint::from_hex).or(local_fp);
                self.remember(container, name, &relative, &remote.id, confirmed).await;
                Ok(SyncDecision::Update { file_id: remote.id })
            }
            Err(error) => {
                self.invalidate(container, name).await;
                Err(SyncError::Upload {
                    name: name.to_string(),
                    error,
                })
            }
        }
    }

    /// Record what Drive now holds under `name`. Without a fingerprint
    /// there is nothing to compare against later, so the entry is dropped.
    async fn remember(
        &self,
        container: &RemoteContainer,
        name: &str,
        relative: &str,
        remote_id: &str,
        fp: Option<Fingerprint>,
    ) {
        let Some(cache) = &self.cache else {
            return;
        };
        let Some(fp) = fp else {
            self.invalidate(container, name).await;
            return;
        };
        if let Err(e) = cache.record(&container.id, name, relative, remote_id, &fp).await {
            tracing::warn!(path = %relative, error = %e, "failed to update catalog cache");
        }
    }

    async fn invalidate(&self, container: &RemoteContainer, name: &str) {
        if let Some(cache) = &self.cache
            && let Err(e) = cache.forget(&container.id, name).await
        {
            tracing::warn!(name, error = %e, "failed to invalidate catalog cache");
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::sync::testing::{FakeDrive, Mutation};
    use crate::util::hash::fingerprint_bytes;

    use ReconcilePolicy::{AlwaysUpload, CompareFingerprint};

    fn container() -> RemoteContainer {
        RemoteContainer {
            id: "c1".into(),
            name: "backup-gs65".into(),
        }
    }

    fn setup() -> (tempfile::TempDir, Arc<FakeDrive>, Reconciler) {
        let dir = tempfile::tempdir().unwrap();
        let drive = Arc::new(FakeDrive::new());
        let reconciler = Reconciler::new(drive.clone(), dir.path());
        (dir, drive, reconciler)
    }

    fn write(dir: &tempfile::TempDir, name: &str, content: &[u8]) -> PathBuf {
        let path = dir.path().join(name);
        std::fs::write(&path, content).unwrap();
        path
    }

    #[tokio::test]
    async fn test_absent_remote_creates() {
        let (dir, drive, r) = setup();
        let path = write(&dir, "report.txt", b"hello");

        let decision = r.reconcile(&container(), &path, CompareFingerprint).await.unwrap();
        assert_eq!(decision, SyncDecision::Create);
        assert_eq!(
            drive.mutations(),
            vec![Mutation::Create {
                parent: "c1".into(),
                name: "report.txt".into(),
                content: b"hello".to_vec(),
                mime_type: "text/plain".into(),
            }]
        );
    }

    #[tokio::test]
    async fn test_unknown_extension_uses_octet_stream() {
        let (dir, drive, r) = setup();
        let path = write(&dir, "blob.zzqx", b"\x00\x01");

        r.reconcile(&container(), &path, CompareFingerprint).await.unwrap();
        assert!(matches!(
            &drive.mutations()[0],
            Mutation::Create { mime_type, .. } if mime_type == "application/octet-stream"
        ));
    }

    #[tokio::test]
    async fn test_identical_content_skips_without_mutation() {
        let (dir, drive, r) = setup();
        drive.insert_file("c1", "report.txt", b"hello");
        let path = write(&dir, "report.txt", b"hello");

        let decision = r.reconcile(&container(), &path, CompareFingerprint).await.unwrap();
        assert_eq!(decision, SyncDecision::Skip);
        assert!(drive.mutations().is_empty());
    }

    #[tokio::test]
    async fn test_modified_content_updates_existing_id() {
        let (dir, drive, r) = setup();
        let id = drive.insert_file("c1", "report.txt", b"hello");
        let path = write(&dir, "report.txt", b"hello world");

        let decision = r.reconcile(&container(), &path, CompareFingerprint).await.unwrap();
        assert_eq!(decision, SyncDecision::Update { file_id: id.clone() });
        assert_eq!(
            drive.mutations(),
            vec![Mutation::Update {
                id: id.clone(),
                content: b"hello world".to_vec(),
            }]
        );
        assert_eq!(drive.content_of(&id).unwrap(), b"hello world");
    }

    #[tokio::test]
    async fn test_missing_remote_checksum_updates() {
        let (dir, drive, r) = setup();
        let id = drive.insert_file_without_checksum("c1", "report.txt", b"hello");
        let path = write(&dir, "report.txt", b"hello");

        let decision = r.reconcile(&container(), &path, CompareFingerprint).await.unwrap();
        assert_eq!(decision, SyncDecision::Update { file_id: id });
    }

    #[tokio::test]
    async fn test_always_upload_never_skips() {
        let (dir, drive, r) = setup();
        let id = drive.insert_file("c1", "report.txt", b"hello");
        let path = write(&dir, "report.txt", b"hello");

        let decision = r.reconcile(&container(), &path, AlwaysUpload).await.unwrap();
        assert_eq!(decision, SyncDecision::Update { file_id: id });
        assert_eq!(drive.mutations().len(), 1);

        let fresh = write(&dir, "new.txt", b"x");
        let decision = r.reconcile(&container(), &fresh, AlwaysUpload).await.unwrap();
        assert_eq!(decision, SyncDecision::Create);
    }

    #[tokio::test]
    async fn test_zero_byte_file() {
        let (dir, drive, r) = setup();
        let path = write(&dir, "empty.txt", b"");

        let decision = r.reconcile(&container(), &path, CompareFingerprint).await.unwrap();
        assert_eq!(decision, SyncDecision::Create);

        // The created object reports MD5 of no bytes, so a rescan skips it
        let decision = r.reconcile(&container(), &path, CompareFingerprint).await.unwrap();
        assert_eq!(decision, SyncDecision::Skip);
        assert_eq!(drive.mutations().len(), 1);
    }

    #[tokio::test]
    async fn test_vanished_file_is_io_error() {
        let (dir, drive, r) = setup();
        let path = dir.path().join("gone.txt");

        let err = r.reconcile(&container(), &path, CompareFingerprint).await.unwrap_err();
        assert!(matches!(err, SyncError::Io { .. }), "got {err:?}");
        assert!(drive.mutations().is_empty());
        assert_eq!(
            r.sync_file(&container(), &path, AlwaysUpload).await,
            SyncOutcome::Failed
        );
    }

    #[tokio::test]
    async fn test_lookup_failure_is_remote_error() {
        let (dir, drive, r) = setup();
        drive.fail_lookup_for("broken.bin");
        let path = write(&dir, "broken.bin", b"data");

        let err = r.reconcile(&container(), &path, CompareFingerprint).await.unwrap_err();
        assert!(matches!(err, SyncError::RemoteService { ref name, .. } if name == "broken.bin"));
        assert!(drive.mutations().is_empty());
    }

    #[tokio::test]
    async fn test_upload_failure_is_reported_not_raised() {
        let (dir, drive, r) = setup();
        drive.fail_uploads_for("report.txt");
        let path = write(&dir, "report.txt", b"hello");

        let err = r.reconcile(&container(), &path, CompareFingerprint).await.unwrap_err();
        assert_eq!(err.kind(), "upload");
        assert_eq!(
            r.sync_file(&container(), &path, CompareFingerprint).await,
            SyncOutcome::Failed
        );
    }

    #[tokio::test]
    async fn test_folder_name_collision_fails_as_upload_error() {
        let (dir, drive, r) = setup();
        drive.insert_folder("c1", "photos");
        let path = write(&dir, "photos", b"not a folder");

        let err = r.reconcile(&container(), &path, CompareFingerprint).await.unwrap_err();
        assert!(matches!(err, SyncError::Upload { .. }), "got {err:?}");
    }

    #[tokio::test]
    async fn test_sync_file_reports_outcomes() {
        let (dir, drive, r) = setup();
        drive.insert_file("c1", "same.txt", b"same");
        let same = write(&dir, "same.txt", b"same");
        let fresh = write(&dir, "fresh.txt", b"fresh");

        assert_eq!(
            r.sync_file(&container(), &same, CompareFingerprint).await,
            SyncOutcome::Skipped
        );
        assert_eq!(
            r.sync_file(&container(), &fresh, CompareFingerprint).await,
            SyncOutcome::Created
        );
        assert_eq!(
            r.sync_file(&container(), &same, AlwaysUpload).await,
            SyncOutcome::Updated
        );
    }

    #[tokio::test]
    async fn test_cache_skips_remote_lookup_after_confirmed_create() {
        let dir = tempfile::tempdir().unwrap();
        let drive = Arc::new(FakeDrive::new());
        let cache = CatalogCache::new(crate::db::init_memory_db().await);
        let r = Reconciler::new(drive.clone(), dir.path()).with_cache(cache.clone());
        let path = write(&dir, "report.txt", b"hello");

        assert_eq!(
            r.reconcile(&container(), &path, CompareFingerprint).await.unwrap(),
            SyncDecision::Create
        );
        assert_eq!(drive.lookups(), 1);
        let entry = cache.get("c1", "report.txt").await.unwrap().unwrap();
        assert_eq!(entry.fingerprint, fingerprint_bytes(b"hello"));

        assert_eq!(
            r.reconcile(&container(), &path, CompareFingerprint).await.unwrap(),
            SyncDecision::Skip
        );
        assert_eq!(drive.lookups(), 1);

        // Changed content falls through to the remote check
        std::fs::write(&path, b"hello world").unwrap();
        assert!(matches!(
            r.reconcile(&container(), &path, CompareFingerprint).await.unwrap(),
            SyncDecision::Update { .. }
        ));
        assert_eq!(drive.lookups(), 2);
    }

    #[tokio::test]
    async fn test_failed_mutation_invalidates_cache_entry() {
        let dir = tempfile::tempdir().unwrap();
        let drive = Arc::new(FakeDrive::new());
        let cache = CatalogCache::new(crate::db::init_memory_db().await);
        let r = Reconciler::new(drive.clone(), dir.path()).with_cache(cache.clone());

        let id = drive.insert_file("c1", "a.txt", b"old");
        cache
            .record("c1", "a.txt", "a.txt", &id, &fingerprint_bytes(b"old"))
            .await
            .unwrap();
        drive.fail_uploads_for("a.txt");
        let path = write(&dir, "a.txt", b"new");

        assert!(r.reconcile(&container(), &path, CompareFingerprint).await.is_err());
        assert!(cache.get("c1", "a.txt").await.unwrap().is_none());
    }

    #[tokio::test]
    async fn test_nested_file_with_same_name_invalidates_cached_skip() {
        let dir = tempfile::tempdir().unwrap();
        let drive = Arc::new(FakeDrive::new());
        let cache = CatalogCache::new(crate::db::init_memory_db().await);
        let r = Reconciler::new(drive.clone(), dir.path()).with_cache(cache.clone());
        let top = write(&dir, "a.txt", b"top");
        std::fs::create_dir(dir.path().join("sub")).unwrap();
        let nested = write(&dir, "sub/a.txt", b"nested");

        assert_eq!(
            r.reconcile(&container(), &top, CompareFingerprint).await.unwrap(),
            SyncDecision::Create
        );
        let id = match r.reconcile(&container(), &nested, AlwaysUpload).await.unwrap() {
            SyncDecision::Update { file_id } => file_id,
            other => panic!("expected update, got {other:?}"),
        };
        assert_eq!(drive.content_of(&id).unwrap(), b"nested");
        let entry = cache.get("c1", "a.txt").await.unwrap().unwrap();
        assert_eq!(entry.relative_path, "sub/a.txt");

        // Drive now holds the nested bytes, so the top-level file must go up again
        assert_eq!(
            r.reconcile(&container(), &top, CompareFingerprint).await.unwrap(),
            SyncDecision::Update { file_id: id.clone() }
        );
        assert_eq!(drive.content_of(&id).unwrap(), b"top");
    }

    #[tokio::test]
    async fn test_path_outside_root_is_uploaded_by_name() {
        let base = tempfile::tempdir().unwrap();
        let root = base.path().join("a");
        let elsewhere = base.path().join("b");
        std::fs::create_dir(&root).unwrap();
        std::fs::create_dir(&elsewhere).unwrap();
        let path = elsewhere.join("stray.txt");
        std::fs::write(&path, b"stray").unwrap();

        let drive = Arc::new(FakeDrive::new());
        let cache = CatalogCache::new(crate::db::init_memory_db().await);
        let r = Reconciler::new(drive.clone(), &root).with_cache(cache.clone());

        assert_eq!(
            r.reconcile(&container(), &path, CompareFingerprint).await.unwrap(),
            SyncDecision::Create
        );
        assert!(matches!(
            &drive.mutations()[..],
            [Mutation::Create { name, content, .. }] if name == "stray.txt" && content == b"stray"
        ));
        let entry = cache.get("c1", "stray.txt").await.unwrap().unwrap();
        assert_eq!(entry.relative_path, "stray.txt");
        assert_eq!(entry.fingerprint, fingerprint_bytes(b"stray"));
    }
}
