use std::collections::HashMap;
use std::path::PathBuf;
use std::sync::Arc;

use tokio::sync::{Mutex, Semaphore, mpsc};
use tokio::task::JoinSet;
use tokio_util::sync::CancellationToken;

use crate::util::path as sync_path;

use super::catalog::RemoteContainer;
use super::local_watcher::LocalChange;
use super::reconciler::{ReconcilePolicy, Reconciler};

/// Counters reported when the dispatcher stops.
#[derive(Debug, Default, Clone, Copy, PartialEq, Eq)]
pub struct DispatchStats {
    /// Events that started a reconciliation job.
    pub dispatched: usize,
    /// Events folded into a job already running for the same remote name.
    pub coalesced: usize,
    /// Directory and excluded-path events.
    pub ignored: usize,
}

/// Remote name → pending path. A name is present while a job owns it; a
/// pending path means another event for that name arrived meanwhile and
/// the job must run once more, on that path.
type InFlight = Arc<Mutex<HashMap<String, Option<PathBuf>>>>;

/// Turns local change events into reconciliation jobs.
///
/// Uploads are flat, so `x.txt` and `sub/x.txt` target the same Drive
/// object. At most one job runs per remote name at any time and at most
/// `workers` jobs run overall. Events for a name that is already being
/// synced are not queued separately: the running job picks up the newest
/// event when it finishes.
pub struct Dispatcher {
    reconciler: Arc<Reconciler>,
    container: Arc<RemoteContainer>,
    root: PathBuf,
    exclude: Vec<String>,
    policy: ReconcilePolicy,
    permits: Arc<Semaphore>,
    in_flight: InFlight,
}

impl Dispatcher {
    pub fn new(
        reconciler: Arc<Reconciler>,
        container: RemoteContainer,
        root: impl Into<PathBuf>,
        workers: usize,
    ) -> Self {
        Self {
            reconciler,
            container: Arc::new(container),
            root: root.into(),
            exclude: Vec::new(),
            policy: ReconcilePolicy::AlwaysUpload,
            permits: Arc::new(Semaphore::new(workers.max(1))),
            in_flight: Arc::new(Mutex::new(HashMap::new())),
        }
    }

    pub fn with_exclude(mut self, exclude: Vec<String>) -> Self {
        self.exclude = exclude;
        self
    }

    pub fn with_policy(mut self, policy: ReconcilePolicy) -> Self {
        self.policy = policy;
        self
    }

    /// Consume events until the channel closes or `cancel` fires, then wait
    /// for running jobs to finish.
    pub async fn run(
        self,
        mut changes: mpsc::Receiver<LocalChange>,
        cancel: CancellationToken,
    ) -> DispatchStats {
        let mut stats = DispatchStats::default();
        let mut jobs = JoinSet::new();

        loop {
            tokio::select! {
                _ = cancel.cancelled() => {
                    tracing::info!("stopping watch dispatcher");
                    break;
                }
                change = changes.recv() => match change {
                    Some(change) => self.dispatch(change, &mut jobs, &mut stats).await,
                    None => {
                        tracing::debug!("change channel closed");
                        break;
                    }
                },
                Some(res) = jobs.join_next(), if !jobs.is_empty() => {
                    if let Err(e) = res {
                        tracing::error!(error = %e, "sync job panicked");
                    }
                }
            }
        }

        changes.close();
        if !jobs.is_empty() {
            tracing::info!(count = jobs.len(), "waiting for in-flight uploads");
        }
        while let Some(res) = jobs.join_next().await {
            if let Err(e) = res {
                tracing::error!(error = %e, "sync job panicked");
            }
        }

        tracing::info!(
            dispatched = stats.dispatched,
            coalesced = stats.coalesced,
            ignored = stats.ignored,
            "watch dispatcher stopped"
        );
        stats
    }

    async fn dispatch(&self, change: LocalChange, jobs: &mut JoinSet<()>, stats: &mut DispatchStats) {
        let path = change.path;

        // A missing path still goes through so it surfaces as a read error
        if let Ok(meta) = tokio::fs::symlink_metadata(&path).await
            && !meta.is_file()
        {
            tracing::debug!(path = %path.display(), "not a regular file, ignoring");
            stats.ignored += 1;
            return;
        }

        if let Some(relative) = sync_path::relative_path(&self.root, &path)
            && sync_path::matches_exclude(&relative, &self.exclude)
        {
            tracing::debug!(path = %relative, "excluded");
            stats.ignored += 1;
            return;
        }

        let key = sync_path::file_name(&path)
            .map(str::to_owned)
            .unwrap_or_else(|| path.to_string_lossy().into_owned());

        {
            let mut in_flight = self.in_flight.lock().await;
            if let Some(pending) = in_flight.get_mut(&key) {
                tracing::debug!(path = %path.display(), kind = ?change.kind, "already syncing, will re-run");
                *pending = Some(path);
                stats.coalesced += 1;
                return;
            }
            in_flight.insert(key.clone(), None);
        }

        tracing::debug!(path = %path.display(), kind = ?change.kind, "dispatching");
        stats.dispatched += 1;

        let reconciler = Arc::clone(&self.reconciler);
        let container = Arc::clone(&self.container);
        let permits = Arc::clone(&self.permits);
        let in_flight = Arc::clone(&self.in_flight);
        let policy = self.policy;

        jobs.spawn(async move {
            let mut path = path;
            loop {
                {
                    let Ok(_permit) = permits.acquire().await else {
                        break;
                    };
                    reconciler.sync_file(&container, &path, policy).await;
                }

                let mut in_flight = in_flight.lock().await;
                match in_flight.get_mut(&key).and_then(Option::take) {
                    Some(next) => path = next,
                    None => {
                        in_flight.remove(&key);
                        break;
                    }
                }
            }
        });
    }
}
