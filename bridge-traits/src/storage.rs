//! File System Abstraction
//!
//! Provides a platform-agnostic trait for the file operations the cache needs:
//! staging writes, atomic promotion, eviction and free-space queries.

use async_trait::async_trait;
use bytes::Bytes;
use std::path::Path;
use tokio::io::AsyncWrite;

use crate::error::Result;

/// File metadata information
#[derive(Debug, Clone)]
pub struct FileMetadata {
    pub size: u64,
    pub modified_at: Option<i64>,
    pub is_directory: bool,
}

/// File system access trait
///
/// # Example
///
/// ```ignore
/// use bridge_traits::storage::FileSystemAccess;
///
/// async fn promote(fs: &dyn FileSystemAccess, staged: &Path, cached: &Path) -> Result<()> {
///     fs.rename(staged, cached).await
/// }
/// ```
#[async_trait]
pub trait FileSystemAccess: Send + Sync {
    /// Check if a file or directory exists
    async fn exists(&self, path: &Path) -> Result<bool>;

    /// Get metadata for a file or directory
    async fn metadata(&self, path: &Path) -> Result<FileMetadata>;

    /// Create a directory and all parent directories if they don't exist
    async fn create_dir_all(&self, path: &Path) -> Result<()>;

    /// Read entire file contents into memory
    async fn read_file(&self, path: &Path) -> Result<Bytes>;

    /// Write data to a file, creating it if it doesn't exist
    async fn write_file(&self, path: &Path, data: Bytes) -> Result<()>;

    /// Delete a file. Deleting a missing file is not an error.
    async fn delete_file(&self, path: &Path) -> Result<()>;

    /// Move a file, replacing the destination.
    ///
    /// Source and destination are expected to live on the same volume so the
    /// move is atomic.
    async fn rename(&self, from: &Path, to: &Path) -> Result<()>;

    /// Bytes available to unprivileged writers on the volume holding `path`.
    async fn available_space(&self, path: &Path) -> Result<u64>;

    /// Open a file for streaming writes, truncating any existing content
    async fn open_write_stream(&self, path: &Path) -> Result<Box<dyn AsyncWrite + Send + Unpin>>;
}
