use std::path::{Path, PathBuf};

use anyhow::{Context, Result};
use sqlx::sqlite::{SqlitePool, SqlitePoolOptions};

/// Resolve the cache database path: the configured one, otherwise
/// `$XDG_DATA_HOME/drivesyncd/catalog.db`.
pub fn resolve_db_path(custom: Option<&Path>) -> Result<PathBuf> {
    match custom {
        Some(p) => Ok(p.to_path_buf()),
        None => {
            let dir = dirs::data_dir().context("Could not determine data directory")?;
            Ok(dir.join("drivesyncd").join("catalog.db"))
        }
    }
}

/// Open the existing database read-only, `None` when it was never created.
pub async fn open_db_readonly(custom: Option<&Path>) -> Result<Option<SqlitePool>> {
    let db_path = resolve_db_path(custom)?;
    if !db_path.exists() {
        return Ok(None);
    }

    let pool = SqlitePoolOptions::new()
        .max_connections(1)
        .connect(&format!("sqlite:{}?mode=ro", db_path.display()))
        .await
        .with_context(|| format!("Failed to open database read-only: {}", db_path.display()))?;

    Ok(Some(pool))
}

pub async fn init_db(custom: Option<&Path>) -> Result<SqlitePool> {
    let db_path = resolve_db_path(custom)?;

    if let Some(parent) = db_path.parent() {
        std::fs::create_dir_all(parent)
            .with_context(|| format!("Failed to create data directory: {}", parent.display()))?;
    }

    tracing::debug!(path = %db_path.display(), "opening database");

    let pool = SqlitePoolOptions::new()
        .max_connections(4)
        .connect(&format!("sqlite:{}?mode=rwc", db_path.display()))
        .await
        .with_context(|| format!("Failed to open database: {}", db_path.display()))?;

    migrate(&pool).await?;
    tracing::info!(path = %db_path.display(), "catalog cache ready");
    Ok(pool)
}

async fn migrate(pool: &SqlitePool) -> Result<()> {
    sqlx::migrate!("./migrations")
        .run(pool)
        .await
        .context("Failed to run database migrations")
}

#[cfg(test)]
pub async fn init_memory_db() -> SqlitePool {
    // One connection: every in-memory connection is a separate database
    let pool = SqlitePoolOptions::new()
        .max_connections(1)
        .connect("sqlite::memory:")
        .await
        .unwrap();
    migrate(&pool).await.unwrap();
    pool
}
