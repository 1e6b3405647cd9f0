use std::path::PathBuf;
use std::sync::Arc;

use anyhow::Result;
use clap::{Parser, Subcommand};
use tokio_util::sync::CancellationToken;

mod auth;
mod config;
mod db;
mod drive;
mod sync;
mod util;

const LONG_VERSION: &str = concat!(env!("CARGO_PKG_VERSION"), " (built ", env!("BUILD_DATE"), ")");

#[derive(Parser)]
#[command(
    name = "drivesyncd",
    version,
    long_version = LONG_VERSION,
    about = "Mirror a local folder into a Google Drive folder"
)]
struct Cli {
    /// Path to config file [default: ~/.config/drivesyncd/config.toml]
    #[arg(short, long)]
    config: Option<PathBuf>,

    /// Increase log verbosity (-v, -vv, -vvv)
    #[arg(short, long, action = clap::ArgAction::Count)]
    verbose: u8,

    #[command(subcommand)]
    command: Command,
}

#[derive(Subcommand)]
enum Command {
    /// Authorize access to Google Drive (opens browser for OAuth)
    Auth,
    /// Upload new and changed files once, then exit
    Backup,
    /// Upload once, then keep mirroring changes until interrupted
    Watch,
    /// Show authentication and cache status
    Status,
}

fn init_tracing(verbosity: u8) {
    let default_filter = match verbosity {
        0 => "drivesyncd=info",
        1 => "drivesyncd=debug",
        2 => "drivesyncd=trace",
        _ => "trace",
    };

    tracing_subscriber::fmt()
        .with_env_filter(
            tracing_subscriber::EnvFilter::try_from_default_env()
                .unwrap_or_else(|_| default_filter.into()),
        )
        .init();
}

/// Check inotify watch limits on Linux and warn if they look too low.
fn check_inotify_limits() {
    let path = "/proc/sys/fs/inotify/max_user_watches";
    if let Ok(content) = std::fs::read_to_string(path)
        && let Ok(limit) = content.trim().parse::<u64>()
    {
        if limit < 8192 {
            tracing::warn!(
                max_user_watches = limit,
                "inotify watch limit is low, deep folders may not be fully watched. \
                 Increase with: echo 524288 | sudo tee {path}"
            );
        } else {
            tracing::debug!(max_user_watches = limit, "inotify watch limit OK");
        }
    }
}

/// Cancel `token` on the first SIGINT or SIGTERM.
fn spawn_signal_handler(token: CancellationToken) -> Result<()> {
    let mut sigterm = tokio::signal::unix::signal(tokio::signal::unix::SignalKind::terminate())?;
    tokio::spawn(async move {
        tokio::select! {
            _ = tokio::signal::ctrl_c() => tracing::info!("received SIGINT, shutting down"),
            _ = sigterm.recv() => tracing::info!("received SIGTERM, shutting down"),
        }
        token.cancel();
    });
    Ok(())
}

async fn build_engine(cfg: &config::Config) -> Result<(sync::SyncEngine, Option<sqlx::SqlitePool>)> {
    let session = auth::Session::load(&cfg.auth)?;
    session.ensure_authenticated().await?;
    let client = drive::DriveClient::new(Arc::new(session))?;

    let engine = sync::SyncEngine::new(Arc::new(client), cfg.clone());
    if !cfg.cache.enabled {
        return Ok((engine, None));
    }
    let pool = db::init_db(cfg.cache.db_path.as_deref()).await?;
    let cache = sync::cache::CatalogCache::new(pool.clone());
    Ok((engine.with_cache(cache), Some(pool)))
}

#[tokio::main]
async fn main() -> Result<()> {
    let cli = Cli::parse();
    init_tracing(cli.verbose);

    let loaded = config::load_config(cli.config.as_deref());

    match cli.command {
        Command::Auth => {
            // Works without a config file when credentials are compiled in
            let auth_cfg = config::auth_config_or_builtin(loaded)?;
            let session = auth::Session::load(&auth_cfg)?;
            auth::run_auth_flow(&auth_cfg, &session).await?;
        }
        Command::Backup => {
            let cfg = loaded?;
            let (engine, pool) = build_engine(&cfg).await?;

            tracing::info!(
                local = %cfg.general.local_folder.display(),
                drive_folder = %cfg.general.drive_folder_name,
                "running backup"
            );
            let summary = engine.run_backup().await?;

            if let Some(pool) = pool {
                pool.close().await;
            }
            println!(
                "backup complete: {} created, {} updated, {} skipped, {} failed",
                summary.created, summary.updated, summary.skipped, summary.failed
            );
        }
        Command::Watch => {
            let cfg = loaded?;
            check_inotify_limits();
            let (engine, pool) = build_engine(&cfg).await?;

            let cancel = CancellationToken::new();
            spawn_signal_handler(cancel.clone())?;

            tracing::info!(
                local = %cfg.general.local_folder.display(),
                drive_folder = %cfg.general.drive_folder_name,
                "drivesyncd ready, running initial scan"
            );
            engine.run_watch(cancel).await?;

            if let Some(pool) = pool {
                tracing::info!("closing database");
                pool.close().await;
            }
            tracing::info!("drivesyncd stopped");
        }
        Command::Status => print_status(&loaded?).await?,
    }

    Ok(())
}

async fn print_status(cfg: &config::Config) -> Result<()> {
    let session = auth::Session::load(&cfg.auth)?;

    println!("drivesyncd status");
    println!("=================");
    println!("Local folder: {}", cfg.general.local_folder.display());
    println!("Drive folder: {}", cfg.general.drive_folder_name);
    println!(
        "Session:      {} ({})",
        session.state().await.label(),
        session.token_path().display()
    );

    if !cfg.cache.enabled {
        println!("Cache:        disabled");
        return Ok(());
    }

    let Some(pool) = db::open_db_readonly(cfg.cache.db_path.as_deref()).await? else {
        println!("Cache:        enabled, not created yet");
        return Ok(());
    };
    let cache = sync::cache::CatalogCache::new(pool.clone());
    let summary = cache.summary().await?;
    println!(
        "Cache:        {} entries, last update {}",
        summary.entries,
        summary.last_update.as_deref().unwrap_or("never")
    );

    let recent = cache.recent(10).await?;
    if !recent.is_empty() {
        println!();
        println!("Recently confirmed:");
        for entry in &recent {
            println!(
                "  {} -> {} (from {}, {})",
                entry.name, entry.remote_id, entry.relative_path, entry.updated_at
            );
        }
    }

    pool.close().await;
    Ok(())
}
