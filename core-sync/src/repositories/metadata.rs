//! Per-path sync metadata.

use async_trait::async_trait;
use sqlx::{FromRow, SqlitePool};

use crate::error::{Result, SyncError};
use crate::models::{now_millis, DownloadToken, FileEntry, FileStatus};
use crate::paths::prefix_upper_bound;

#[async_trait]
pub trait MetadataStore: Send + Sync {
    /// Create the backing table if it does not exist.
    async fn initialize(&self) -> Result<()>;

    async fn get(&self, file_path: &str) -> Result<Option<FileEntry>>;

    /// Insert or replace status, version and token of an entry.
    ///
    /// `watch_sequence` and `cached_version` of an existing row are kept; they
    /// are owned by [`set_watch_sequence`](Self::set_watch_sequence) and
    /// [`complete_download`](Self::complete_download).
    async fn upsert(&self, entry: &FileEntry) -> Result<()>;

    /// Set only the status, creating the entry with version `"0"` if missing.
    async fn upsert_status(&self, file_path: &str, status: FileStatus) -> Result<()>;

    /// Record the runtime sequence of the latest WATCH. Returns false if the
    /// entry does not exist.
    async fn set_watch_sequence(&self, file_path: &str, sequence: i64) -> Result<bool>;

    /// Record that `downloaded_version` was promoted into the cache.
    ///
    /// The entry becomes CURRENT when it still expects that version and
    /// STALE when a newer version arrived during the download. A demoted
    /// entry whose pending version was downloaded gets that version back. Returns the
    /// updated entry, or `None` if it was deleted meanwhile.
    async fn complete_download(
        &self,
        file_path: &str,
        downloaded_version: &str,
    ) -> Result<Option<FileEntry>>;

    /// Demote after a failed download: UNKNOWN with version `"0"`.
    ///
    /// The version the token refers to moves to `pending_version` so a later
    /// retry can restore it.
    async fn mark_failed(&self, file_path: &str) -> Result<bool>;

    async fn delete(&self, file_path: &str) -> Result<bool>;

    /// Delete every entry whose path starts with `prefix`.
    async fn delete_prefix(&self, prefix: &str) -> Result<u64>;

    /// Entries whose path starts with `prefix`, ordered by path.
    async fn find_by_prefix(&self, prefix: &str) -> Result<Vec<FileEntry>>;

    /// Entries that have been watched at least once.
    async fn find_watched(&self) -> Result<Vec<FileEntry>>;

    /// Downloadable entries (STALE or UNKNOWN, with a token), least recently
    /// touched first.
    async fn find_download_candidates(&self, limit: u32) -> Result<Vec<FileEntry>>;
}

// ============================================================================
// SQLite Implementation
// ============================================================================

pub struct SqliteMetadataStore {
    pool: SqlitePool,
}

impl SqliteMetadataStore {
    pub fn new(pool: SqlitePool) -> Self {
        Self { pool }
    }
}

#[derive(Debug, FromRow)]
struct FileEntryRow {
    file_path: String,
    status: String,
    version: String,
    token: Option<String>,
    watch_sequence: i64,
    cached_version: Option<String>,
    pending_version: Option<String>,
    updated_at: i64,
}

impl TryFrom<FileEntryRow> for FileEntry {
    type Error = SyncError;

    fn try_from(row: FileEntryRow) -> Result<Self> {
        let token = row
            .token
            .as_deref()
            .map(serde_json::from_str::<DownloadToken>)
            .transpose()?;

        Ok(FileEntry {
            file_path: row.file_path,
            status: row.status.parse()?,
            version: row.version,
            token,
            watch_sequence: row.watch_sequence,
            cached_version: row.cached_version,
            pending_version: row.pending_version,
            updated_at: row.updated_at,
        })
    }
}

fn encode_token(token: Option<&DownloadToken>) -> Result<Option<String>> {
    Ok(token.map(serde_json::to_string).transpose()?)
}

/// SQL list of the statuses the download queue picks up.
fn download_status_list() -> String {
    FileStatus::ALL
        .iter()
        .filter(|status| status.needs_download())
        .map(|status| format!("'{}'", status.as_str()))
        .collect::<Vec<_>>()
        .join(", ")
}

fn into_entries(rows: Vec<FileEntryRow>) -> Result<Vec<FileEntry>> {
    rows.into_iter().map(FileEntry::try_from).collect()
}

const SELECT_COLUMNS: &str =
    "SELECT file_path, status, version, token, watch_sequence, cached_version, pending_version, updated_at FROM file_entries";

#[async_trait]
impl MetadataStore for SqliteMetadataStore {
    async fn initialize(&self) -> Result<()> {
        sqlx::query(
            r#"
            CREATE TABLE IF NOT EXISTS file_entries (
                file_path TEXT PRIMARY KEY NOT NULL,
                status TEXT NOT NULL,
                version TEXT NOT NULL DEFAULT '0',
                token TEXT,
                watch_sequence INTEGER NOT NULL DEFAULT 0,
                cached_version TEXT,
                pending_version TEXT,
                updated_at INTEGER NOT NULL,
                CONSTRAINT file_entries_status_check CHECK (
                    status IN ('UNKNOWN', 'STALE', 'CURRENT', 'DELETED', 'NOEXIST')
                )
            )
            "#,
        )
        .execute(&self.pool)
        .await
        .map_err(|e| SyncError::Database(e.to_string()))?;

        sqlx::query(
            "CREATE INDEX IF NOT EXISTS idx_file_entries_pending ON file_entries (status, updated_at)",
        )
        .execute(&self.pool)
        .await
        .map_err(|e| SyncError::Database(e.to_string()))?;

        Ok(())
    }

    async fn get(&self, file_path: &str) -> Result<Option<FileEntry>> {
        let row = sqlx::query_as::<_, FileEntryRow>(&format!("{} WHERE file_path = ?", SELECT_COLUMNS))
            .bind(file_path)
            .fetch_optional(&self.pool)
            .await
            .map_err(|e| SyncError::Database(e.to_string()))?;

        row.map(FileEntry::try_from).transpose()
    }

    async fn upsert(&self, entry: &FileEntry) -> Result<()> {
        sqlx::query(
            r#"
            INSERT INTO file_entries (
                file_path, status, version, token, watch_sequence, cached_version, updated_at
            ) VALUES (?, ?, ?, ?, ?, ?, ?)
            ON CONFLICT(file_path) DO UPDATE SET
                status = excluded.status,
                version = excluded.version,
                token = excluded.token,
                pending_version = NULL,
                updated_at = excluded.updated_at
            "#,
        )
        .bind(&entry.file_path)
        .bind(entry.status.as_str())
        .bind(&entry.version)
        .bind(encode_token(entry.token.as_ref())?)
        .bind(entry.watch_sequence)
        .bind(&entry.cached_version)
        .bind(now_millis())
        .execute(&self.pool)
        .await
        .map_err(|e| SyncError::Database(e.to_string()))?;

        Ok(())
    }

    async fn upsert_status(&self, file_path: &str, status: FileStatus) -> Result<()> {
        sqlx::query(
            r#"
            INSERT INTO file_entries (file_path, status, version, updated_at)
            VALUES (?, ?, '0', ?)
            ON CONFLICT(file_path) DO UPDATE SET
                status = excluded.status,
                updated_at = excluded.updated_at
            "#,
        )
        .bind(file_path)
        .bind(status.as_str())
        .bind(now_millis())
        .execute(&self.pool)
        .await
        .map_err(|e| SyncError::Database(e.to_string()))?;

        Ok(())
    }

    async fn set_watch_sequence(&self, file_path: &str, sequence: i64) -> Result<bool> {
        let result = sqlx::query("UPDATE file_entries SET watch_sequence = ? WHERE file_path = ?")
            .bind(sequence)
            .bind(file_path)
            .execute(&self.pool)
            .await
            .map_err(|e| SyncError::Database(e.to_string()))?;

        Ok(result.rows_affected() > 0)
    }

    async fn complete_download(
        &self,
        file_path: &str,
        downloaded_version: &str,
    ) -> Result<Option<FileEntry>> {
        let mut tx = self
            .pool
            .begin()
            .await
            .map_err(|e| SyncError::Database(e.to_string()))?;

        let row = sqlx::query_as::<_, FileEntryRow>(&format!("{} WHERE file_path = ?", SELECT_COLUMNS))
            .bind(file_path)
            .fetch_optional(&mut *tx)
            .await
            .map_err(|e| SyncError::Database(e.to_string()))?;

        let Some(row) = row else {
            tx.rollback()
                .await
                .map_err(|e| SyncError::Database(e.to_string()))?;
            return Ok(None);
        };

        let mut entry = FileEntry::try_from(row)?;
        if entry.pending_version.as_deref() == Some(downloaded_version) {
            entry.version = downloaded_version.to_string();
        }
        entry.status = if entry.version == downloaded_version {
            FileStatus::Current
        } else {
            FileStatus::Stale
        };
        entry.pending_version = None;
        entry.cached_version = Some(downloaded_version.to_string());
        entry.updated_at = now_millis();

        sqlx::query(
            r#"
            UPDATE file_entries
            SET status = ?, version = ?, cached_version = ?, pending_version = NULL, updated_at = ?
            WHERE file_path = ?
            "#,
        )
        .bind(entry.status.as_str())
        .bind(&entry.version)
        .bind(&entry.cached_version)
        .bind(entry.updated_at)
        .bind(file_path)
        .execute(&mut *tx)
        .await
        .map_err(|e| SyncError::Database(e.to_string()))?;

        tx.commit()
            .await
            .map_err(|e| SyncError::Database(e.to_string()))?;

        Ok(Some(entry))
    }

    async fn mark_failed(&self, file_path: &str) -> Result<bool> {
        let result = sqlx::query(
            r#"
            UPDATE file_entries
            SET status = 'UNKNOWN',
                pending_version = CASE WHEN version = '0' THEN pending_version ELSE version END,
                version = '0',
                updated_at = ?
            WHERE file_path = ?
            "#,
        )
        .bind(now_millis())
        .bind(file_path)
        .execute(&self.pool)
        .await
        .map_err(|e| SyncError::Database(e.to_string()))?;

        Ok(result.rows_affected() > 0)
    }

    async fn delete(&self, file_path: &str) -> Result<bool> {
        let result = sqlx::query("DELETE FROM file_entries WHERE file_path = ?")
            .bind(file_path)
            .execute(&self.pool)
            .await
            .map_err(|e| SyncError::Database(e.to_string()))?;

        Ok(result.rows_affected() > 0)
    }

    async fn delete_prefix(&self, prefix: &str) -> Result<u64> {
        let result = match prefix_upper_bound(prefix) {
            Some(upper) => {
                sqlx::query("DELETE FROM file_entries WHERE file_path >= ? AND file_path < ?")
                    .bind(prefix)
                    .bind(upper)
                    .execute(&self.pool)
                    .await
            }
            None => sqlx::query("DELETE FROM file_entries").execute(&self.pool).await,
        }
        .map_err(|e| SyncError::Database(e.to_string()))?;

        Ok(result.rows_affected())
    }

    async fn find_by_prefix(&self, prefix: &str) -> Result<Vec<FileEntry>> {
        let rows = match prefix_upper_bound(prefix) {
            Some(upper) => {
                sqlx::query_as::<_, FileEntryRow>(&format!(
                    "{} WHERE file_path >= ? AND file_path < ? ORDER BY file_path",
                    SELECT_COLUMNS
                ))
                .bind(prefix)
                .bind(upper)
                .fetch_all(&self.pool)
                .await
            }
            None => {
                sqlx::query_as::<_, FileEntryRow>(&format!("{} ORDER BY file_path", SELECT_COLUMNS))
                    .fetch_all(&self.pool)
                    .await
            }
        }
        .map_err(|e| SyncError::Database(e.to_string()))?;

        into_entries(rows)
    }

    async fn find_watched(&self) -> Result<Vec<FileEntry>> {
        let rows = sqlx::query_as::<_, FileEntryRow>(&format!(
            "{} WHERE watch_sequence > 0 ORDER BY file_path",
            SELECT_COLUMNS
        ))
        .fetch_all(&self.pool)
        .await
        .map_err(|e| SyncError::Database(e.to_string()))?;

        into_entries(rows)
    }

    async fn find_download_candidates(&self, limit: u32) -> Result<Vec<FileEntry>> {
        let rows = sqlx::query_as::<_, FileEntryRow>(&format!(
            r#"{}
            WHERE token IS NOT NULL AND status IN ({})
            ORDER BY updated_at ASC, file_path ASC
            LIMIT ?"#,
            SELECT_COLUMNS,
            download_status_list()
        ))
        .bind(limit as i64)
        .fetch_all(&self.pool)
        .await
        .map_err(|e| SyncError::Database(e.to_string()))?;

        into_entries(rows)
    }
}
