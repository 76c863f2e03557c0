//! # File Fetcher
//!
//! Downloads one file version into the local cache.
//!
//! ## Pipeline
//!
//! 1. Cache hit: the promoted file already holds the wanted version
//! 2. Disk check against bytes already reserved by other downloads
//! 3. Per attempt: signed URL, GET, admission by `Content-Length`, stream to
//!    the staging file, verify length, rename into the cache
//! 4. Transport failures are retried with a fixed delay; origin rejections,
//!    admission and I/O failures are not
//!
//! A failed fetch leaves no staging file behind and releases its reservation.

use bridge_traits::http::HttpRequest;
use bridge_traits::{FileSystemAccess, HttpClient, Scheduler};
use core_runtime::config::DownloadSettings;
use core_runtime::logging::{redact_url, strip_path};
use std::path::{Path, PathBuf};
use std::sync::atomic::{AtomicU64, Ordering};
use std::sync::Arc;
use tokio::io::{AsyncReadExt, AsyncWriteExt};
use tokio::time::timeout;
use tracing::{debug, info, instrument, warn};

use crate::credentials::CredentialProvider;
use crate::error::{Result, SyncError};
use crate::models::{DownloadToken, FileEntry};
use crate::paths::CacheLayout;

const CHUNK_SIZE: usize = 64 * 1024;

/// Result of a successful fetch.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct FetchOutcome {
    /// Version the promoted bytes belong to
    pub version: String,
    pub bytes: u64,
    pub from_cache: bool,
    pub cache_path: PathBuf,
}

pub struct FileFetcher {
    http: Arc<dyn HttpClient>,
    fs: Arc<dyn FileSystemAccess>,
    scheduler: Arc<dyn Scheduler>,
    credentials: Arc<dyn CredentialProvider>,
    layout: CacheLayout,
    settings: DownloadSettings,
    in_flight_bytes: Arc<AtomicU64>,
}

/// Bytes counted against the cache volume until dropped.
struct Reservation {
    counter: Arc<AtomicU64>,
    bytes: u64,
}

impl Drop for Reservation {
    fn drop(&mut self) {
        self.counter.fetch_sub(self.bytes, Ordering::SeqCst);
    }
}

impl FileFetcher {
    pub fn new(
        http: Arc<dyn HttpClient>,
        fs: Arc<dyn FileSystemAccess>,
        scheduler: Arc<dyn Scheduler>,
        credentials: Arc<dyn CredentialProvider>,
        layout: CacheLayout,
        settings: DownloadSettings,
    ) -> Self {
        Self {
            http,
            fs,
            scheduler,
            credentials,
            layout,
            settings,
            in_flight_bytes: Arc::new(AtomicU64::new(0)),
        }
    }

    /// Bytes reserved by downloads currently streaming.
    pub fn in_flight_bytes(&self) -> u64 {
        self.in_flight_bytes.load(Ordering::SeqCst)
    }

    pub fn layout(&self) -> &CacheLayout {
        &self.layout
    }

    /// Bring the target version of `entry.file_path` into the cache.
    #[instrument(skip(self, entry), fields(file_path = %entry.file_path, version = %entry.target_version()))]
    pub async fn fetch(&self, entry: &FileEntry) -> Result<FetchOutcome> {
        let cache_path = self.layout.cache_path(&entry.file_path);
        let version = entry.target_version();

        if entry.cached_version.as_deref() == Some(version)
            && self.fs.exists(&cache_path).await.map_err(SyncError::io)?
        {
            debug!("Cached copy already matches");
            return Ok(FetchOutcome {
                version: version.to_string(),
                bytes: 0,
                from_cache: true,
                cache_path,
            });
        }

        let token = entry
            .token
            .as_ref()
            .ok_or_else(|| SyncError::Validation("entry has no download token".to_string()))?;

        self.check_space(self.in_flight_bytes()).await?;

        let staging_path = self.layout.staging_path(&entry.file_path);
        let result = self
            .fetch_with_retry(token, &staging_path, &cache_path)
            .await;

        match result {
            Ok(bytes) => {
                info!(
                    bytes,
                    cache_file = %strip_path(&cache_path.to_string_lossy()),
                    "Promoted file into cache"
                );
                Ok(FetchOutcome {
                    version: version.to_string(),
                    bytes,
                    from_cache: false,
                    cache_path,
                })
            }
            Err(error) => {
                if let Err(cleanup) = self.fs.delete_file(&staging_path).await {
                    warn!(
                        error = %cleanup,
                        staging_file = %strip_path(&staging_path.to_string_lossy()),
                        "Failed to remove staging file"
                    );
                }
                Err(error)
            }
        }
    }

    async fn fetch_with_retry(
        &self,
        token: &DownloadToken,
        staging_path: &Path,
        cache_path: &Path,
    ) -> Result<u64> {
        let attempts = self.settings.max_retry_attempts.max(1);
        let mut last_error = String::new();

        for attempt in 1..=attempts {
            debug!(attempt, attempts, "Download attempt");

            match timeout(
                self.settings.download_timeout,
                self.attempt(token, staging_path, cache_path),
            )
            .await
            {
                Ok(Ok(bytes)) => return Ok(bytes),
                Ok(Err(error)) if !error.is_transient() => return Err(error),
                Ok(Err(error)) => {
                    warn!(attempt, error = %error, "Download attempt failed");
                    last_error = error.to_string();
                }
                Err(_) => {
                    warn!(attempt, "Download attempt timed out");
                    last_error = format!(
                        "attempt timed out after {:?}",
                        self.settings.download_timeout
                    );
                }
            }

            if attempt < attempts {
                self.scheduler.sleep(self.settings.retry_delay).await;
            }
        }

        Err(SyncError::RetriesExhausted {
            attempts,
            last_error,
        })
    }

    async fn attempt(
        &self,
        token: &DownloadToken,
        staging_path: &Path,
        cache_path: &Path,
    ) -> Result<u64> {
        let url = self.credentials.signed_url(token).await?;
        debug!(url = %redact_url(&url), "Requesting file from origin");
        let download = self
            .http
            .download_stream(HttpRequest::get(url))
            .await
            .map_err(SyncError::transport)?;

        if !download.is_success() {
            return Err(SyncError::Origin {
                status: download.status,
            });
        }

        let expected = download.content_length;
        let _reservation = self.admit(expected.unwrap_or(0)).await?;

        let mut body = download.body;
        let mut writer = self
            .fs
            .open_write_stream(staging_path)
            .await
            .map_err(SyncError::io)?;

        let mut buffer = vec![0u8; CHUNK_SIZE];
        let mut written: u64 = 0;
        loop {
            let read = body
                .read(&mut buffer)
                .await
                .map_err(|e| SyncError::Transport(e.to_string()))?;
            if read == 0 {
                break;
            }
            writer
                .write_all(&buffer[..read])
                .await
                .map_err(|e| SyncError::Io(e.to_string()))?;
            written += read as u64;
        }
        writer
            .shutdown()
            .await
            .map_err(|e| SyncError::Io(e.to_string()))?;
        drop(writer);

        if let Some(expected) = expected {
            if written != expected {
                return Err(SyncError::Transport(format!(
                    "body ended after {} of {} bytes",
                    written, expected
                )));
            }
        }

        self.fs
            .rename(staging_path, cache_path)
            .await
            .map_err(SyncError::io)?;

        Ok(written)
    }

    /// Reserve `bytes` and check the volume can hold every reservation.
    async fn admit(&self, bytes: u64) -> Result<Reservation> {
        self.in_flight_bytes.fetch_add(bytes, Ordering::SeqCst);
        let reservation = Reservation {
            counter: self.in_flight_bytes.clone(),
            bytes,
        };

        self.check_space(self.in_flight_bytes()).await?;
        Ok(reservation)
    }

    async fn check_space(&self, reserved: u64) -> Result<()> {
        let available = self
            .fs
            .available_space(self.layout.cache_dir())
            .await
            .map_err(SyncError::io)?;
        let required = reserved.saturating_add(self.settings.min_free_space_bytes);

        if available < required {
            warn!(required, available, "Not enough disk space for download");
            return Err(SyncError::InsufficientDiskSpace {
                required,
                available,
            });
        }
        Ok(())
    }
}
