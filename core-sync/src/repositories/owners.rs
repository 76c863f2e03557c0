//! Watch ownership per path.
//!
//! Stored as one row per (path, owner) pair so adding an owner is an
//! idempotent insert and folder cascades are a range delete.

use async_trait::async_trait;
use sqlx::{Row, SqlitePool};
use tracing::warn;

use crate::error::{Result, SyncError};
use crate::models::OwnerEntry;
use crate::paths::{parent_folder, prefix_upper_bound};

#[async_trait]
pub trait OwnerRegistry: Send + Sync {
    async fn initialize(&self) -> Result<()>;

    /// Owners of `file_path` in registration order, or `None` if it has none.
    async fn get(&self, file_path: &str) -> Result<Option<OwnerEntry>>;

    /// Register `owner`; a no-op if already registered.
    async fn add_owner(&self, file_path: &str, owner: &str) -> Result<()>;

    async fn add_owners(&self, file_path: &str, owners: &[String]) -> Result<()>;

    async fn delete(&self, file_path: &str) -> Result<bool>;

    async fn delete_prefix(&self, prefix: &str) -> Result<u64>;

    /// Copy the owners of the parent folder onto `file_path`.
    ///
    /// Returns false, changing nothing, when the parent has no owners.
    async fn assign_from_parent(&self, file_path: &str) -> Result<bool> {
        let parent = match parent_folder(file_path) {
            Some(parent) => parent,
            None => {
                warn!(file_path = %file_path, "Path has no parent folder");
                return Ok(false);
            }
        };

        match self.get(parent).await? {
            Some(entry) if !entry.owners.is_empty() => {
                self.add_owners(file_path, &entry.owners).await?;
                Ok(true)
            }
            _ => {
                warn!(
                    file_path = %file_path,
                    parent = %parent,
                    "Parent folder has no owners"
                );
                Ok(false)
            }
        }
    }
}

pub struct SqliteOwnerRegistry {
    pool: SqlitePool,
}

impl SqliteOwnerRegistry {
    pub fn new(pool: SqlitePool) -> Self {
        Self { pool }
    }
}

#[async_trait]
impl OwnerRegistry for SqliteOwnerRegistry {
    async fn initialize(&self) -> Result<()> {
        sqlx::query(
            r#"
            CREATE TABLE IF NOT EXISTS file_owners (
                file_path TEXT NOT NULL,
                owner TEXT NOT NULL,
                PRIMARY KEY (file_path, owner)
            )
            "#,
        )
        .execute(&self.pool)
        .await
        .map_err(|e| SyncError::Database(e.to_string()))?;

        Ok(())
    }

    async fn get(&self, file_path: &str) -> Result<Option<OwnerEntry>> {
        let rows = sqlx::query("SELECT owner FROM file_owners WHERE file_path = ? ORDER BY rowid")
            .bind(file_path)
            .fetch_all(&self.pool)
            .await
            .map_err(|e| SyncError::Database(e.to_string()))?;

        if rows.is_empty() {
            return Ok(None);
        }

        Ok(Some(OwnerEntry {
            file_path: file_path.to_string(),
            owners: rows.iter().map(|row| row.get("owner")).collect(),
        }))
    }

    async fn add_owner(&self, file_path: &str, owner: &str) -> Result<()> {
        sqlx::query("INSERT OR IGNORE INTO file_owners (file_path, owner) VALUES (?, ?)")
            .bind(file_path)
            .bind(owner)
            .execute(&self.pool)
            .await
            .map_err(|e| SyncError::Database(e.to_string()))?;

        Ok(())
    }

    async fn add_owners(&self, file_path: &str, owners: &[String]) -> Result<()> {
        let mut tx = self
            .pool
            .begin()
            .await
            .map_err(|e| SyncError::Database(e.to_string()))?;

        for owner in owners {
            sqlx::query("INSERT OR IGNORE INTO file_owners (file_path, owner) VALUES (?, ?)")
                .bind(file_path)
                .bind(owner)
                .execute(&mut *tx)
                .await
                .map_err(|e| SyncError::Database(e.to_string()))?;
        }

        tx.commit()
            .await
            .map_err(|e| SyncError::Database(e.to_string()))?;

        Ok(())
    }

    async fn delete(&self, file_path: &str) -> Result<bool> {
        let result = sqlx::query("DELETE FROM file_owners WHERE file_path = ?")
            .bind(file_path)
            .execute(&self.pool)
            .await
            .map_err(|e| SyncError::Database(e.to_string()))?;

        Ok(result.rows_affected() > 0)
    }

    async fn delete_prefix(&self, prefix: &str) -> Result<u64> {
        let result = match prefix_upper_bound(prefix) {
            Some(upper) => {
                sqlx::query("DELETE FROM file_owners WHERE file_path >= ? AND file_path < ?")
                    .bind(prefix)
                    .bind(upper)
                    .execute(&self.pool)
                    .await
            }
            None => sqlx::query("DELETE FROM file_owners").execute(&self.pool).await,
        }
        .map_err(|e| SyncError::Database(e.to_string()))?;

        Ok(result.rows_affected())
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::repositories::test_pool;

    async fn registry() -> SqliteOwnerRegistry {
        let registry = SqliteOwnerRegistry::new(test_pool().await);
        registry.initialize().await.unwrap();
        registry
    }

    #[tokio::test]
    async fn test_add_owner_is_idempotent() {
        let registry = registry().await;
        registry.add_owner("bucket/a", "widget").await.unwrap();
        registry.add_owner("bucket/a", "widget").await.unwrap();
        registry.add_owner("bucket/a", "player").await.unwrap();

        let entry = registry.get("bucket/a").await.unwrap().unwrap();
        assert_eq!(entry.owners, vec!["widget".to_string(), "player".to_string()]);
        assert!(registry.get("bucket/b").await.unwrap().is_none());
    }

    #[tokio::test]
    async fn test_assign_from_parent() {
        let registry = registry().await;
        registry.add_owner("bucket/dir/", "widget").await.unwrap();

        assert!(registry.assign_from_parent("bucket/dir/new.png").await.unwrap());
        let entry = registry.get("bucket/dir/new.png").await.unwrap().unwrap();
        assert!(entry.contains("widget"));

        assert!(!registry.assign_from_parent("bucket/other/new.png").await.unwrap());
        assert!(registry.get("bucket/other/new.png").await.unwrap().is_none());
    }

    #[tokio::test]
    async fn test_delete_prefix() {
        let registry = registry().await;
        registry.add_owner("bucket/dir/", "w").await.unwrap();
        registry.add_owner("bucket/dir/a", "w").await.unwrap();
        registry.add_owner("bucket/dir2/a", "w").await.unwrap();

        assert_eq!(registry.delete_prefix("bucket/dir/").await.unwrap(), 2);
        assert!(registry.get("bucket/dir2/a").await.unwrap().is_some());
    }
}
