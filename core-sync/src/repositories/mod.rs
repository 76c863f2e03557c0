//! # Persistent Stores
//!
//! Three keyed collections and one singleton ledger row, all in one SQLite
//! database:
//!
//! - [`MetadataStore`]: per-path sync status, version and download token
//! - [`OwnerRegistry`]: which local consumers watch which paths
//! - [`WatchlistLedger`]: versions acknowledged to the origin, plus the
//!   `lastChanged` cursor and the runtime sequence
//!
//! Each store is an async trait with a SQLite implementation. Folder cascades
//! use range scans over the `file_path` primary key.

pub mod metadata;
pub mod owners;
pub mod watchlist;

pub use metadata::{MetadataStore, SqliteMetadataStore};
pub use owners::{OwnerRegistry, SqliteOwnerRegistry};
pub use watchlist::{SqliteWatchlistLedger, WatchlistLedger};

use sqlx::sqlite::{SqliteConnectOptions, SqliteJournalMode, SqlitePoolOptions};
use sqlx::SqlitePool;
use std::path::Path;
use std::sync::Arc;
use std::time::Duration;
use tracing::{debug, info};

use crate::error::{Result, SyncError};

/// Open (creating if needed) the SQLite database at `path`.
pub async fn open_pool(path: &Path) -> Result<SqlitePool> {
    if let Some(parent) = path.parent() {
        if !parent.as_os_str().is_empty() {
            tokio::fs::create_dir_all(parent)
                .await
                .map_err(|e| SyncError::Io(e.to_string()))?;
        }
    }

    let options = SqliteConnectOptions::new()
        .filename(path)
        .create_if_missing(true)
        .journal_mode(SqliteJournalMode::Wal)
        .busy_timeout(Duration::from_secs(5));

    let pool = SqlitePoolOptions::new()
        .max_connections(4)
        .connect_with(options)
        .await
        .map_err(|e| SyncError::Database(e.to_string()))?;

    info!(path = %path.display(), "Opened sync database");
    Ok(pool)
}

/// Handles to the three stores, shared by every component.
#[derive(Clone)]
pub struct Stores {
    pub metadata: Arc<dyn MetadataStore>,
    pub owners: Arc<dyn OwnerRegistry>,
    pub watchlist: Arc<dyn WatchlistLedger>,
}

impl Stores {
    /// SQLite-backed stores sharing `pool`. Call [`initialize`](Self::initialize)
    /// before use.
    pub fn sqlite(pool: SqlitePool) -> Self {
        Self {
            metadata: Arc::new(SqliteMetadataStore::new(pool.clone())),
            owners: Arc::new(SqliteOwnerRegistry::new(pool.clone())),
            watchlist: Arc::new(SqliteWatchlistLedger::new(pool)),
        }
    }

    /// Create tables and the ledger row.
    pub async fn initialize(&self) -> Result<()> {
        self.metadata.initialize().await?;
        self.owners.initialize().await?;
        self.watchlist.initialize().await?;
        Ok(())
    }

    /// Remove every record of `file_path` from all three collections.
    pub async fn purge(&self, file_path: &str) -> Result<()> {
        self.metadata.delete(file_path).await?;
        self.owners.delete(file_path).await?;
        self.watchlist.delete(file_path).await?;
        debug!(file_path = %file_path, "Purged records");
        Ok(())
    }
}

impl std::fmt::Debug for Stores {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("Stores").finish_non_exhaustive()
    }
}

#[cfg(test)]
pub(crate) async fn test_pool() -> SqlitePool {
    SqlitePoolOptions::new()
        .max_connections(1)
        .connect("sqlite::memory:")
        .await
        .unwrap()
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::models::{FileEntry, FileStatus, WatchlistEntry};

    #[tokio::test]
    async fn test_purge_removes_all_records() {
        let stores = Stores::sqlite(test_pool().await);
        stores.initialize().await.unwrap();

        let path = "bucket/a.png";
        stores
            .metadata
            .upsert(&FileEntry::new(path, FileStatus::Current, "3"))
            .await
            .unwrap();
        stores.owners.add_owner(path, "widget").await.unwrap();
        stores
            .watchlist
            .upsert(&WatchlistEntry::new(path, "3"))
            .await
            .unwrap();

        stores.purge(path).await.unwrap();

        assert!(stores.metadata.get(path).await.unwrap().is_none());
        assert!(stores.owners.get(path).await.unwrap().is_none());
        assert!(stores.watchlist.get(path).await.unwrap().is_none());
    }

    #[tokio::test]
    async fn test_initialize_is_idempotent() {
        let stores = Stores::sqlite(test_pool().await);
        stores.initialize().await.unwrap();
        stores.initialize().await.unwrap();
        assert_eq!(stores.watchlist.runtime_sequence().await.unwrap(), 1);
    }

    #[tokio::test]
    async fn test_open_pool_creates_file() {
        let dir = tempfile::tempdir().unwrap();
        let path = dir.path().join("nested").join("sync.db");

        let pool = open_pool(&path).await.unwrap();
        Stores::sqlite(pool).initialize().await.unwrap();

        assert!(path.exists());
    }
}
