use std::path::{Path, PathBuf};

use anyhow::{Context, Result};

use crate::util::path as sync_path;

use super::catalog::RemoteContainer;
use super::reconciler::{ReconcilePolicy, Reconciler, SyncOutcome};

/// Per-outcome tally of one scan, for the closing log line.
#[derive(Debug, Default, Clone, Copy, PartialEq, Eq)]
pub struct ScanSummary {
    pub skipped: usize,
    pub created: usize,
    pub updated: usize,
    pub failed: usize,
}

impl ScanSummary {
    fn add(&mut self, outcome: SyncOutcome) {
        match outcome {
            SyncOutcome::Skipped => self.skipped += 1,
            SyncOutcome::Created => self.created += 1,
            SyncOutcome::Updated => self.updated += 1,
            SyncOutcome::Failed => self.failed += 1,
        }
    }
}

/// Reconcile every regular file directly inside `dir`, one at a time.
///
/// Subdirectories are not descended into and symlinks are ignored. Only a
/// failure to list `dir` itself is returned; per-file failures are logged
/// and counted.
pub async fn scan_once(
    reconciler: &Reconciler,
    container: &RemoteContainer,
    dir: &Path,
    exclude: &[String],
) -> Result<ScanSummary> {
    let files = list_regular_files(dir, exclude).await?;
    tracing::info!(
        dir = %dir.display(),
        drive_folder = %container.name,
        count = files.len(),
        "scanning local folder"
    );

    let mut summary = ScanSummary::default();
    for path in files {
        let outcome = reconciler
            .sync_file(container, &path, ReconcilePolicy::CompareFingerprint)
            .await;
        summary.add(outcome);
    }

    tracing::info!(
        skipped = summary.skipped,
        created = summary.created,
        updated = summary.updated,
        failed = summary.failed,
        "scan complete"
    );
    Ok(summary)
}

async fn list_regular_files(dir: &Path, exclude: &[String]) -> Result<Vec<PathBuf>> {
    let mut read_dir = tokio::fs::read_dir(dir)
        .await
        .with_context(|| format!("Failed to read dir: {}", dir.display()))?;

    let mut files = Vec::new();
    while let Some(entry) = read_dir
        .next_entry()
        .await
        .with_context(|| format!("Failed to read dir: {}", dir.display()))?
    {
        let path = entry.path();
        let meta = match tokio::fs::symlink_metadata(&path).await {
            Ok(m) => m,
            Err(e) => {
                tracing::warn!(path = %path.display(), error = %e, "cannot stat, skipping");
                continue;
            }
        };
        if !meta.is_file() {
            tracing::debug!(path = %path.display(), "not a regular file, skipping");
            continue;
        }
        if let Some(name) = sync_path::file_name(&path)
            && sync_path::matches_exclude(name, exclude)
        {
            tracing::debug!(path = %path.display(), "excluded");
            continue;
        }
        files.push(path);
    }

    files.sort();
    Ok(files)
}

#[cfg(test)]
mod tests {
    use std::sync::Arc;

    use super::*;
    use crate::sync::testing::{FakeDrive, Mutation};

    fn container() -> RemoteContainer {
        RemoteContainer {
            id: "c1".into(),
            name: "backup-gs65".into(),
        }
    }

    #[tokio::test]
    async fn test_lookup_error_does_not_stop_scan() {
        let dir = tempfile::tempdir().unwrap();
        std::fs::write(dir.path().join("broken.bin"), b"bad").unwrap();
        std::fs::write(dir.path().join("ok.bin"), b"good").unwrap();

        let drive = Arc::new(FakeDrive::new());
        drive.fail_lookup_for("broken.bin");
        let reconciler = Reconciler::new(drive.clone(), dir.path());

        let summary = scan_once(&reconciler, &container(), dir.path(), &[])
            .await
            .unwrap();
        assert_eq!(summary.failed, 1);
        assert_eq!(summary.created, 1);
        assert!(matches!(
            &drive.mutations()[..],
            [Mutation::Create { name, .. }] if name == "ok.bin"
        ));
    }

    #[tokio::test]
    async fn test_scan_is_flat_and_honours_excludes() {
        let dir = tempfile::tempdir().unwrap();
        std::fs::write(dir.path().join("report.txt"), b"hello").unwrap();
        std::fs::write(dir.path().join("scratch.tmp"), b"tmp").unwrap();
        std::fs::create_dir(dir.path().join("nested")).unwrap();
        std::fs::write(dir.path().join("nested").join("deep.txt"), b"deep").unwrap();

        let drive = Arc::new(FakeDrive::new());
        let reconciler = Reconciler::new(drive.clone(), dir.path());

        let summary = scan_once(&reconciler, &container(), dir.path(), &["*.tmp".to_string()])
            .await
            .unwrap();
        assert_eq!(
            summary,
            ScanSummary {
                created: 1,
                ..Default::default()
            }
        );
        assert!(matches!(
            &drive.mutations()[..],
            [Mutation::Create { name, content, .. }] if name == "report.txt" && content == b"hello"
        ));
    }

    #[tokio::test]
    async fn test_rescan_skips_unchanged() {
        let dir = tempfile::tempdir().unwrap();
        std::fs::write(dir.path().join("a.txt"), b"a").unwrap();
        std::fs::write(dir.path().join("b.txt"), b"b").unwrap();

        let drive = Arc::new(FakeDrive::new());
        let reconciler = Reconciler::new(drive.clone(), dir.path());

        scan_once(&reconciler, &container(), dir.path(), &[]).await.unwrap();
        std::fs::write(dir.path().join("b.txt"), b"b2").unwrap();
        let summary = scan_once(&reconciler, &container(), dir.path(), &[])
            .await
            .unwrap();

        assert_eq!(summary.skipped, 1);
        assert_eq!(summary.updated, 1);
        assert_eq!(drive.mutations().len(), 3);
    }

    #[tokio::test]
    async fn test_missing_dir_is_an_error() {
        let dir = tempfile::tempdir().unwrap();
        let reconciler = Reconciler::new(Arc::new(FakeDrive::new()), dir.path());
        let missing = dir.path().join("nope");
        assert!(scan_once(&reconciler, &container(), &missing, &[]).await.is_err());
    }

    #[cfg(unix)]
    #[tokio::test]
    async fn test_symlinks_are_ignored() {
        let dir = tempfile::tempdir().unwrap();
        let target = dir.path().join("real.txt");
        std::fs::write(&target, b"real").unwrap();
        std::os::unix::fs::symlink(&target, dir.path().join("link.txt")).unwrap();

        let drive = Arc::new(FakeDrive::new());
        let reconciler = Reconciler::new(drive.clone(), dir.path());
        let summary = scan_once(&reconciler, &container(), dir.path(), &[])
            .await
            .unwrap();
        assert_eq!(summary.created, 1);
    }
}
