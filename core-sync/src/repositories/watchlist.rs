//! Acknowledged versions and ledger bookkeeping.
//!
//! The ledger row holds the `lastChanged` cursor, which only ever moves
//! forward, and the runtime sequence used as the expiration clock.

use async_trait::async_trait;
use sqlx::{FromRow, Row, SqlitePool};
use std::cmp::Ordering;
use tokio::sync::Mutex;
use tracing::debug;

use crate::error::{Result, SyncError};
use crate::models::{LedgerState, WatchlistEntry};
use crate::paths::prefix_upper_bound;

#[async_trait]
pub trait WatchlistLedger: Send + Sync {
    async fn initialize(&self) -> Result<()>;

    async fn get(&self, file_path: &str) -> Result<Option<WatchlistEntry>>;

    async fn upsert(&self, entry: &WatchlistEntry) -> Result<()>;

    async fn delete(&self, file_path: &str) -> Result<bool>;

    async fn delete_prefix(&self, prefix: &str) -> Result<u64>;

    /// Every entry, ordered by path.
    async fn all(&self) -> Result<Vec<WatchlistEntry>>;

    async fn state(&self) -> Result<LedgerState>;

    async fn runtime_sequence(&self) -> Result<i64>;

    /// Advance the runtime sequence by one and return the new value.
    async fn increment_runtime_sequence(&self) -> Result<i64>;

    /// Move the `lastChanged` cursor to `proposed` unless that would move it
    /// backwards. Returns whether the stored value changed.
    async fn set_last_changed(&self, proposed: &str) -> Result<bool>;
}

/// Order two change markers.
///
/// Markers are compared as integers when both parse as one, otherwise as
/// strings.
pub fn compare_markers(a: &str, b: &str) -> Ordering {
    match (a.parse::<u128>(), b.parse::<u128>()) {
        (Ok(a), Ok(b)) => a.cmp(&b),
        _ => a.cmp(b),
    }
}

pub struct SqliteWatchlistLedger {
    pool: SqlitePool,
    // Serializes read-compare-write of the cursor.
    ratchet: Mutex<()>,
}

impl SqliteWatchlistLedger {
    pub fn new(pool: SqlitePool) -> Self {
        Self {
            pool,
            ratchet: Mutex::new(()),
        }
    }
}

#[derive(Debug, FromRow)]
struct WatchlistRow {
    file_path: String,
    version: String,
}

impl From<WatchlistRow> for WatchlistEntry {
    fn from(row: WatchlistRow) -> Self {
        WatchlistEntry {
            file_path: row.file_path,
            version: row.version,
        }
    }
}

#[async_trait]
impl WatchlistLedger for SqliteWatchlistLedger {
    async fn initialize(&self) -> Result<()> {
        sqlx::query(
            r#"
            CREATE TABLE IF NOT EXISTS watchlist_entries (
                file_path TEXT PRIMARY KEY NOT NULL,
                version TEXT NOT NULL
            )
            "#,
        )
        .execute(&self.pool)
        .await
        .map_err(|e| SyncError::Database(e.to_string()))?;

        sqlx::query(
            r#"
            CREATE TABLE IF NOT EXISTS watchlist_ledger (
                id INTEGER PRIMARY KEY NOT NULL CHECK (id = 1),
                last_changed TEXT,
                runtime_sequence INTEGER NOT NULL DEFAULT 1
            )
            "#,
        )
        .execute(&self.pool)
        .await
        .map_err(|e| SyncError::Database(e.to_string()))?;

        sqlx::query(
            "INSERT OR IGNORE INTO watchlist_ledger (id, last_changed, runtime_sequence) VALUES (1, NULL, 1)",
        )
        .execute(&self.pool)
        .await
        .map_err(|e| SyncError::Database(e.to_string()))?;

        Ok(())
    }

    async fn get(&self, file_path: &str) -> Result<Option<WatchlistEntry>> {
        let row = sqlx::query_as::<_, WatchlistRow>(
            "SELECT file_path, version FROM watchlist_entries WHERE file_path = ?",
        )
        .bind(file_path)
        .fetch_optional(&self.pool)
        .await
        .map_err(|e| SyncError::Database(e.to_string()))?;

        Ok(row.map(WatchlistEntry::from))
    }

    async fn upsert(&self, entry: &WatchlistEntry) -> Result<()> {
        sqlx::query(
            r#"
            INSERT INTO watchlist_entries (file_path, version) VALUES (?, ?)
            ON CONFLICT(file_path) DO UPDATE SET version = excluded.version
            "#,
        )
        .bind(&entry.file_path)
        .bind(&entry.version)
        .execute(&self.pool)
        .await
        .map_err(|e| SyncError::Database(e.to_string()))?;

        Ok(())
    }

    async fn delete(&self, file_path: &str) -> Result<bool> {
        let result = sqlx::query("DELETE FROM watchlist_entries WHERE file_path = ?")
            .bind(file_path)
            .execute(&self.pool)
            .await
            .map_err(|e| SyncError::Database(e.to_string()))?;

        Ok(result.rows_affected() > 0)
    }

    async fn delete_prefix(&self, prefix: &str) -> Result<u64> {
        let result = match prefix_upper_bound(prefix) {
            Some(upper) => {
                sqlx::query("DELETE FROM watchlist_entries WHERE file_path >= ? AND file_path < ?")
                    .bind(prefix)
                    .bind(upper)
                    .execute(&self.pool)
                    .await
            }
            None => {
                sqlx::query("DELETE FROM watchlist_entries")
                    .execute(&self.pool)
                    .await
            }
        }
        .map_err(|e| SyncError::Database(e.to_string()))?;

        Ok(result.rows_affected())
    }

    async fn all(&self) -> Result<Vec<WatchlistEntry>> {
        let rows = sqlx::query_as::<_, WatchlistRow>(
            "SELECT file_path, version FROM watchlist_entries ORDER BY file_path",
        )
        .fetch_all(&self.pool)
        .await
        .map_err(|e| SyncError::Database(e.to_string()))?;

        Ok(rows.into_iter().map(WatchlistEntry::from).collect())
    }

    async fn state(&self) -> Result<LedgerState> {
        let row = sqlx::query("SELECT last_changed, runtime_sequence FROM watchlist_ledger WHERE id = 1")
            .fetch_optional(&self.pool)
            .await
            .map_err(|e| SyncError::Database(e.to_string()))?;

        Ok(row
            .map(|row| LedgerState {
                last_changed: row.get("last_changed"),
                runtime_sequence: row.get("runtime_sequence"),
            })
            .unwrap_or_default())
    }

    async fn runtime_sequence(&self) -> Result<i64> {
        Ok(self.state().await?.runtime_sequence)
    }

    async fn increment_runtime_sequence(&self) -> Result<i64> {
        sqlx::query("UPDATE watchlist_ledger SET runtime_sequence = runtime_sequence + 1 WHERE id = 1")
            .execute(&self.pool)
            .await
            .map_err(|e| SyncError::Database(e.to_string()))?;

        self.runtime_sequence().await
    }

    async fn set_last_changed(&self, proposed: &str) -> Result<bool> {
        let _guard = self.ratchet.lock().await;

        let current = self.state().await?.last_changed;
        if let Some(current) = current.as_deref() {
            if compare_markers(proposed, current) == Ordering::Less {
                debug!(
                    proposed = %proposed,
                    current = %current,
                    "Ignoring older lastChanged"
                );
                return Ok(false);
            }
            if proposed == current {
                return Ok(false);
            }
        }

        sqlx::query("UPDATE watchlist_ledger SET last_changed = ? WHERE id = 1")
            .bind(proposed)
            .execute(&self.pool)
            .await
            .map_err(|e| SyncError::Database(e.to_string()))?;

        Ok(true)
    }
}
