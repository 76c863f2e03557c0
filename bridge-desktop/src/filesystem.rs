//! File System Access Implementation using Tokio

use async_trait::async_trait;
use bridge_traits::{
    error::{BridgeError, Result},
    storage::{FileMetadata, FileSystemAccess},
};
use bytes::Bytes;
use std::io::ErrorKind;
use std::path::{Path, PathBuf};
use tokio::fs;
use tracing::debug;

/// Platform data directory for the sync daemon (`~/.local/share/display-sync`
/// on Linux). Falls back to the working directory when the platform reports
/// none.
pub fn default_data_root() -> PathBuf {
    dirs::data_dir()
        .or_else(|| dirs::home_dir().map(|home| home.join(".local").join("share")))
        .unwrap_or_else(|| PathBuf::from("."))
        .join("display-sync")
}

/// Tokio-based file system implementation
///
/// Free space is read with `statvfs(3)` on Unix. Other targets report an
/// unbounded volume, which disables disk admission there.
#[derive(Debug, Clone, Default)]
pub struct TokioFileSystem;

impl TokioFileSystem {
    pub fn new() -> Self {
        Self
    }

    fn map_io_error(e: std::io::Error) -> BridgeError {
        BridgeError::Io(e)
    }

    /// `statvfs` needs an existing path; walk up until one is found so the
    /// query works before the cache directory is created.
    fn nearest_existing(path: &Path) -> PathBuf {
        let mut candidate = path;
        loop {
            if candidate.exists() {
                return candidate.to_path_buf();
            }
            match candidate.parent() {
                Some(parent) if !parent.as_os_str().is_empty() => candidate = parent,
                _ => return PathBuf::from("."),
            }
        }
    }

    #[cfg(unix)]
    fn volume_available(path: &Path) -> Result<u64> {
        let stats = nix::sys::statvfs::statvfs(path)
            .map_err(|errno| BridgeError::Io(std::io::Error::from(errno)))?;
        #[allow(clippy::unnecessary_cast)]
        let available = stats.blocks_available() as u64 * stats.fragment_size() as u64;
        Ok(available)
    }

    #[cfg(not(unix))]
    fn volume_available(_path: &Path) -> Result<u64> {
        Ok(u64::MAX)
    }
}

#[async_trait]
impl FileSystemAccess for TokioFileSystem {
    async fn exists(&self, path: &Path) -> Result<bool> {
        fs::try_exists(path).await.map_err(Self::map_io_error)
    }

    async fn metadata(&self, path: &Path) -> Result<FileMetadata> {
        let metadata = fs::metadata(path).await.map_err(Self::map_io_error)?;

        Ok(FileMetadata {
            size: metadata.len(),
            modified_at: metadata
                .modified()
                .ok()
                .and_then(|t| t.duration_since(std::time::UNIX_EPOCH).ok())
                .map(|d| d.as_secs() as i64),
            is_directory: metadata.is_dir(),
        })
    }

    async fn create_dir_all(&self, path: &Path) -> Result<()> {
        fs::create_dir_all(path)
            .await
            .map_err(Self::map_io_error)?;
        debug!(path = ?path, "Created directory");
        Ok(())
    }

    async fn read_file(&self, path: &Path) -> Result<Bytes> {
        let data = fs::read(path).await.map_err(Self::map_io_error)?;
        debug!(path = ?path, size = data.len(), "Read file");
        Ok(Bytes::from(data))
    }

    async fn write_file(&self, path: &Path, data: Bytes) -> Result<()> {
        if let Some(parent) = path.parent() {
            self.create_dir_all(parent).await?;
        }

        fs::write(path, data.as_ref())
            .await
            .map_err(Self::map_io_error)?;
        debug!(path = ?path, size = data.len(), "Wrote file");
        Ok(())
    }

    async fn delete_file(&self, path: &Path) -> Result<()> {
        match fs::remove_file(path).await {
            Ok(()) => {
                debug!(path = ?path, "Deleted file");
                Ok(())
            }
            Err(e) if e.kind() == ErrorKind::NotFound => Ok(()),
            Err(e) => Err(Self::map_io_error(e)),
        }
    }

    async fn rename(&self, from: &Path, to: &Path) -> Result<()> {
        if let Some(parent) = to.parent() {
            self.create_dir_all(parent).await?;
        }

        fs::rename(from, to).await.map_err(Self::map_io_error)?;
        debug!(from = ?from, to = ?to, "Renamed file");
        Ok(())
    }

    async fn available_space(&self, path: &Path) -> Result<u64> {
        let probe = Self::nearest_existing(path);
        let available = tokio::task::spawn_blocking(move || Self::volume_available(&probe))
            .await
            .map_err(|e| BridgeError::OperationFailed(format!("statvfs task failed: {}", e)))??;
        debug!(path = ?path, available, "Queried free space");
        Ok(available)
    }

    async fn open_write_stream(
        &self,
        path: &Path,
    ) -> Result<Box<dyn tokio::io::AsyncWrite + Send + Unpin>> {
        if let Some(parent) = path.parent() {
            self.create_dir_all(parent).await?;
        }

        let file = fs::File::create(path).await.map_err(Self::map_io_error)?;
        debug!(path = ?path, "Opened file for writing");
        Ok(Box::new(file))
    }
}
