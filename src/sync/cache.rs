use anyhow::{Context, Result};
use sqlx::{Row, SqlitePool};

use crate::util::hash::Fingerprint;

/// Last remote state confirmed for a name in a container.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct CachedEntry {
    pub name: String,
    /// Local file that last wrote this name.
    pub relative_path: String,
    pub remote_id: String,
    pub fingerprint: Fingerprint,
    pub updated_at: String,
}

impl CachedEntry {
    fn from_row(row: &sqlx::sqlite::SqliteRow) -> Self {
        Self {
            name: row.get("name"),
            relative_path: row.get("relative_path"),
            remote_id: row.get("remote_id"),
            fingerprint: Fingerprint::from_hex(row.get::<String, _>("fingerprint")),
            updated_at: row.get("updated_at"),
        }
    }
}

#[derive(Debug, Clone, PartialEq, Eq)]
pub struct CacheSummary {
    pub entries: i64,
    pub last_update: Option<String>,
}

/// Name → (remote id, fingerprint) memory that lets a scan skip unchanged
/// files without asking Drive.
///
/// Keyed by name rather than local path: `a.txt` and `sub/a.txt` both land
/// on the same Drive object, so they must share one entry.
#[derive(Clone)]
pub struct CatalogCache {
    pool: SqlitePool,
}

impl CatalogCache {
    pub fn new(pool: SqlitePool) -> Self {
        Self { pool }
    }

    pub async fn get(&self, container_id: &str, name: &str) -> Result<Option<CachedEntry>> {
        let row = sqlx::query("SELECT * FROM catalog_entries WHERE container_id = ? AND name = ?")
            .bind(container_id)
            .bind(name)
            .fetch_optional(&self.pool)
            .await
            .context("Failed to read catalog cache")?;

        Ok(row.as_ref().map(CachedEntry::from_row))
    }

    /// Remember a state that Drive has just confirmed.
    pub async fn record(
        &self,
        container_id: &str,
        name: &str,
        relative_path: &str,
        remote_id: &str,
        fingerprint: &Fingerprint,
    ) -> Result<()> {
        let now = chrono::Utc::now().to_rfc3339();
        sqlx::query(
            r#"INSERT INTO catalog_entries
                (container_id, name, relative_path, remote_id, fingerprint, updated_at)
            VALUES (?, ?, ?, ?, ?, ?)
            ON CONFLICT(container_id, name) DO UPDATE SET
                relative_path = excluded.relative_path,
                remote_id = excluded.remote_id,
                fingerprint = excluded.fingerprint,
                updated_at = excluded.updated_at"#,
        )
        .bind(container_id)
        .bind(name)
        .bind(relative_path)
        .bind(remote_id)
        .bind(fingerprint.as_str())
        .bind(&now)
        .execute(&self.pool)
        .await
        .context("Failed to update catalog cache")?;
        Ok(())
    }

    pub async fn forget(&self, container_id: &str, name: &str) -> Result<()> {
        sqlx::query("DELETE FROM catalog_entries WHERE container_id = ? AND name = ?")
            .bind(container_id)
            .bind(name)
            .execute(&self.pool)
            .await
            .context("Failed to invalidate catalog cache entry")?;
        Ok(())
    }

    pub async fn summary(&self) -> Result<CacheSummary> {
        let (entries, last_update): (i64, Option<String>) =
            sqlx::query_as("SELECT COUNT(*), MAX(updated_at) FROM catalog_entries")
                .fetch_one(&self.pool)
                .await
                .context("Failed to summarize catalog cache")?;
        Ok(CacheSummary {
            entries,
            last_update,
        })
    }

    pub async fn recent(&self, limit: i64) -> Result<Vec<CachedEntry>> {
        let rows = sqlx::query("SELECT * FROM catalog_entries ORDER BY updated_at DESC LIMIT ?")
            .bind(limit)
            .fetch_all(&self.pool)
            .await
            .context("Failed to list catalog cache")?;
        Ok(rows.iter().map(CachedEntry::from_row).collect())
    }
}
