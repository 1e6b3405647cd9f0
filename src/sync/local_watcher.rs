use std::path::{Path, PathBuf};

use anyhow::{Context, Result};
use notify::event::{ModifyKind, RenameMode};
use notify::{EventKind, RecommendedWatcher, RecursiveMode, Watcher};
use tokio::sync::mpsc;

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum ChangeKind {
    Created,
    Modified,
}

/// A create or modify event from the local filesystem watcher.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct LocalChange {
    pub kind: ChangeKind,
    /// Absolute path of the changed file or directory.
    pub path: PathBuf,
}

/// Start watching `root` for created and modified entries.
///
/// Events are forwarded undebounced onto a bounded channel; when it is full
/// the notification thread blocks until the dispatcher catches up. The
/// watcher runs until the returned `WatcherHandle` is dropped.
pub fn start_local_watcher(
    root: &Path,
    recursive: bool,
    capacity: usize,
) -> Result<(mpsc::Receiver<LocalChange>, WatcherHandle)> {
    let (tx, rx) = mpsc::channel(capacity.max(1));

    let mut watcher = RecommendedWatcher::new(
        move |res: notify::Result<notify::Event>| match res {
            Ok(event) => {
                if let Some(change) = map_event(&event)
                    && tx.blocking_send(change).is_err()
                {
                    tracing::debug!("change receiver dropped, discarding event");
                }
            }
            Err(e) => {
                tracing::error!(error = %e, "local watcher error");
            }
        },
        notify::Config::default(),
    )
    .context("Failed to create file watcher")?;

    let mode = if recursive {
        RecursiveMode::Recursive
    } else {
        RecursiveMode::NonRecursive
    };
    watcher
        .watch(root, mode)
        .with_context(|| format!("Failed to watch {}", root.display()))?;
    tracing::info!(root = %root.display(), recursive, "watching for local changes");

    Ok((rx, WatcherHandle { _watcher: watcher }))
}

/// Handle that keeps the watcher alive. Drop to stop watching.
pub struct WatcherHandle {
    _watcher: RecommendedWatcher,
}

/// Only content-bearing events pass. A rename into place counts as a
/// creation of the destination, which is how most editors save.
fn map_event(event: &notify::Event) -> Option<LocalChange> {
    let kind = match &event.kind {
        EventKind::Create(_) => ChangeKind::Created,
        EventKind::Modify(ModifyKind::Data(_) | ModifyKind::Any) => ChangeKind::Modified,
        EventKind::Modify(ModifyKind::Name(RenameMode::To | RenameMode::Both)) => {
            let path = event.paths.last()?;
            return Some(LocalChange {
                kind: ChangeKind::Created,
                path: path.clone(),
            });
        }
        _ => {
            tracing::trace!(kind = ?event.kind, "ignoring event kind");
            return None;
        }
    };
    let path = event.paths.first()?;
    Some(LocalChange {
        kind,
        path: path.clone(),
    })
}
