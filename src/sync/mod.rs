pub mod cache;
pub mod catalog;
pub mod dispatcher;
pub mod error;
pub mod local_watcher;
pub mod reconciler;
pub mod scanner;

#[cfg(test)]
pub(crate) mod testing;

use std::path::Path;
use std::sync::Arc;

use anyhow::{Context, Result};
use tokio_util::sync::CancellationToken;

use crate::config::Config;
use crate::drive::DriveApi;

use cache::CatalogCache;
use catalog::RemoteContainer;
use dispatcher::{DispatchStats, Dispatcher};
use reconciler::{ReconcilePolicy, Reconciler};
use scanner::ScanSummary;

/// Ties the local folder, the Drive container and the reconciler together
/// for the two entry points: a one-shot backup and the long-running watch.
pub struct SyncEngine {
    api: Arc<dyn DriveApi>,
    config: Config,
    cache: Option<CatalogCache>,
}

impl SyncEngine {
    pub fn new(api: Arc<dyn DriveApi>, config: Config) -> Self {
        Self {
            api,
            config,
            cache: None,
        }
    }

    pub fn with_cache(mut self, cache: CatalogCache) -> Self {
        self.cache = Some(cache);
        self
    }

    fn local_folder(&self) -> &Path {
        &self.config.general.local_folder
    }

    /// Create the local folder if needed and resolve the Drive container.
    async fn prepare(&self) -> Result<(Reconciler, RemoteContainer)> {
        let local = self.local_folder();
        tokio::fs::create_dir_all(local)
            .await
            .with_context(|| format!("Failed to create local folder: {}", local.display()))?;

        let container =
            catalog::ensure_container(self.api.as_ref(), &self.config.general.drive_folder_name)
                .await?;

        let mut reconciler = Reconciler::new(Arc::clone(&self.api), local);
        if let Some(cache) = &self.cache {
            reconciler = reconciler.with_cache(cache.clone());
        }
        Ok((reconciler, container))
    }

    /// Scan the local folder once and exit.
    pub async fn run_backup(&self) -> Result<ScanSummary> {
        let (reconciler, container) = self.prepare().await?;
        scanner::scan_once(
            &reconciler,
            &container,
            self.local_folder(),
            &self.config.general.exclude,
        )
        .await
    }

    /// Scan once, then mirror live changes until `cancel` fires.
    pub async fn run_watch(&self, cancel: CancellationToken) -> Result<DispatchStats> {
        let general = &self.config.general;
        let (reconciler, container) = self.prepare().await?;

        // Subscribe before scanning so changes made during the scan are queued
        let (changes, watcher) = local_watcher::start_local_watcher(
            self.local_folder(),
            general.watch_recursive,
            general.queue_capacity,
        )?;

        tokio::select! {
            res = scanner::scan_once(&reconciler, &container, self.local_folder(), &general.exclude) => {
                res?;
            }
            _ = cancel.cancelled() => {
                tracing::info!("interrupted during initial scan");
                return Ok(DispatchStats::default());
            }
        }

        let policy = if general.watch_skip_unchanged {
            ReconcilePolicy::CompareFingerprint
        } else {
            ReconcilePolicy::AlwaysUpload
        };
        let dispatcher = Dispatcher::new(
            Arc::new(reconciler),
            container,
            self.local_folder(),
            general.workers,
        )
        .with_exclude(general.exclude.clone())
        .with_policy(policy);

        tracing::info!(workers = general.workers, ?policy, "watching");
        let stats = dispatcher.run(changes, cancel).await;
        drop(watcher);
        Ok(stats)
    }
}
