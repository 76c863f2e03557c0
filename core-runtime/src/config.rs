//! # Core Configuration Module
//!
//! Provides configuration management for the display sync daemon.
//!
//! ## Overview
//!
//! The configuration system uses a builder pattern to construct a `CoreConfig`
//! instance that holds every dependency and tunable the sync core needs.
//! Validation is fail-fast: a missing bridge or an inconsistent setting is
//! reported from [`CoreConfigBuilder::build`], before any component starts.
//!
//! ## Required Settings
//!
//! - `display_id` - identity of this endpoint, echoed in outbound WATCH requests
//! - `credential_endpoint` - URL that exchanges download tokens for signed URLs
//!
//! ## Bridges (with platform defaults)
//!
//! - `HttpClient` - HTTP operations (desktop default: reqwest)
//! - `FileSystemAccess` - Cache and staging I/O (desktop default: tokio fs)
//! - `Scheduler` - Timers for polling and retry delays (desktop default: tokio)
//!
//! When the `desktop-shims` feature is enabled, desktop implementations and
//! data directories are injected automatically if not provided.
//!
//! ## Usage
//!
//! ```ignore
//! use core_runtime::config::{CoreConfig, DownloadSettings};
//!
//! let config = CoreConfig::builder()
//!     .display_id("display-42")
//!     .credential_endpoint("https://origin.example.com/v1/signed-url")
//!     .direct_channel_id("player-ui")
//!     .download_settings(DownloadSettings {
//!         max_concurrent_downloads: 2,
//!         ..DownloadSettings::default()
//!     })
//!     .build()?;
//! ```

use crate::error::{Error, Result};
use bridge_traits::{FileSystemAccess, HttpClient, Scheduler};
use std::path::PathBuf;
use std::sync::Arc;
use std::time::Duration;

/// Download pipeline tunables.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct DownloadSettings {
    /// Attempts per download before giving up on transport failures
    pub max_retry_attempts: u32,

    /// Fixed delay between attempts
    pub retry_delay: Duration,

    /// Wall-clock limit for a single attempt, body included
    pub download_timeout: Duration,

    /// Pause between polls when no stale entry is pending
    pub idle_interval: Duration,

    /// Upper bound on simultaneous fetches. Paths are always single-flight.
    pub max_concurrent_downloads: usize,

    /// Space left untouched on the cache volume after admission
    pub min_free_space_bytes: u64,
}

impl Default for DownloadSettings {
    fn default() -> Self {
        Self {
            max_retry_attempts: 4,
            retry_delay: Duration::from_secs(3),
            download_timeout: Duration::from_secs(10 * 60),
            idle_interval: Duration::from_secs(10),
            max_concurrent_downloads: 1,
            min_free_space_bytes: 0,
        }
    }
}

/// Watch-sequence eviction tunables.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct ExpirationSettings {
    /// Epochs a watched entry may go without a refresh before it is evicted
    pub max_expire_count: i64,

    /// Period of the epoch tick
    pub epoch_interval: Duration,

    /// Period of the eviction sweep
    pub sweep_interval: Duration,
}

impl Default for ExpirationSettings {
    fn default() -> Self {
        Self {
            max_expire_count: 5,
            epoch_interval: Duration::from_secs(30 * 60 * 60),
            sweep_interval: Duration::from_secs(60 * 60),
        }
    }
}

/// Core configuration for the display sync daemon.
///
/// Use [`CoreConfigBuilder`] to construct instances.
#[derive(Clone)]
pub struct CoreConfig {
    /// Identity of this display endpoint
    pub display_id: String,

    /// Path to the SQLite database file
    pub database_path: PathBuf,

    /// Directory holding promoted cache files
    pub cache_dir: PathBuf,

    /// Directory holding in-progress downloads; must share a volume with `cache_dir`
    pub download_dir: PathBuf,

    /// Endpoint exchanging a download token for a signed URL
    pub credential_endpoint: String,

    /// Owner id that is served over the local direct channel
    pub direct_channel_id: Option<String>,

    pub http_client: Arc<dyn HttpClient>,

    pub file_system: Arc<dyn FileSystemAccess>,

    pub scheduler: Arc<dyn Scheduler>,

    pub download: DownloadSettings,

    pub expiration: ExpirationSettings,
}

impl std::fmt::Debug for CoreConfig {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("CoreConfig")
            .field("display_id", &self.display_id)
            .field("database_path", &self.database_path)
            .field("cache_dir", &self.cache_dir)
            .field("download_dir", &self.download_dir)
            .field("credential_endpoint", &self.credential_endpoint)
            .field("direct_channel_id", &self.direct_channel_id)
            .field("http_client", &"HttpClient { ... }")
            .field("file_system", &"FileSystemAccess { ... }")
            .field("scheduler", &"Scheduler { ... }")
            .field("download", &self.download)
            .field("expiration", &self.expiration)
            .finish()
    }
}

impl CoreConfig {
    /// Creates a new builder for constructing a `CoreConfig`.
    pub fn builder() -> CoreConfigBuilder {
        CoreConfigBuilder::default()
    }

    /// Validates the configuration and returns an error if invalid.
    ///
    /// This checks:
    /// - Display id and credential endpoint are not empty
    /// - Paths are not empty
    /// - Retry, concurrency and expiration values are usable
    pub fn validate(&self) -> Result<()> {
        if self.display_id.trim().is_empty() {
            return Err(Error::Config("Display id cannot be empty".to_string()));
        }

        if self.credential_endpoint.trim().is_empty() {
            return Err(Error::Config(
                "Credential endpoint cannot be empty".to_string(),
            ));
        }

        if self.database_path.as_os_str().is_empty() {
            return Err(Error::Config("Database path cannot be empty".to_string()));
        }

        if self.cache_dir.as_os_str().is_empty() {
            return Err(Error::Config("Cache directory cannot be empty".to_string()));
        }

        if self.download_dir.as_os_str().is_empty() {
            return Err(Error::Config(
                "Download directory cannot be empty".to_string(),
            ));
        }

        if self.cache_dir == self.download_dir {
            return Err(Error::Config(
                "Download directory must differ from the cache directory".to_string(),
            ));
        }

        if self.download.max_retry_attempts == 0 {
            return Err(Error::Config(
                "At least one download attempt is required".to_string(),
            ));
        }

        if self.download.max_concurrent_downloads == 0 {
            return Err(Error::Config(
                "max_concurrent_downloads must be greater than 0".to_string(),
            ));
        }

        if self.download.download_timeout.is_zero() {
            return Err(Error::Config(
                "Download timeout must be greater than 0".to_string(),
            ));
        }

        if self.expiration.max_expire_count <= 0 {
            return Err(Error::Config(
                "max_expire_count must be greater than 0".to_string(),
            ));
        }

        if self.expiration.epoch_interval.is_zero() || self.expiration.sweep_interval.is_zero() {
            return Err(Error::Config(
                "Epoch and sweep intervals must be greater than 0".to_string(),
            ));
        }

        Ok(())
    }
}

#[cfg(feature = "desktop-shims")]
fn provide_default_http_client() -> Result<Arc<dyn HttpClient>> {
    Ok(Arc::new(bridge_desktop::ReqwestHttpClient::new()))
}

#[cfg(not(feature = "desktop-shims"))]
fn provide_default_http_client() -> Result<Arc<dyn HttpClient>> {
    Err(Error::CapabilityMissing {
        capability: "HttpClient".to_string(),
        message: "No HTTP client implementation provided. \
                 Desktop: enable the 'desktop-shims' feature to use ReqwestHttpClient. \
                 Embedded players: inject the platform HTTP stack."
            .to_string(),
    })
}

#[cfg(feature = "desktop-shims")]
fn provide_default_file_system() -> Result<Arc<dyn FileSystemAccess>> {
    Ok(Arc::new(bridge_desktop::TokioFileSystem::new()))
}

#[cfg(not(feature = "desktop-shims"))]
fn provide_default_file_system() -> Result<Arc<dyn FileSystemAccess>> {
    Err(Error::CapabilityMissing {
        capability: "FileSystemAccess".to_string(),
        message: "No file system implementation provided. \
                 Desktop: enable the 'desktop-shims' feature to use TokioFileSystem."
            .to_string(),
    })
}

#[cfg(feature = "desktop-shims")]
fn provide_default_scheduler() -> Result<Arc<dyn Scheduler>> {
    Ok(Arc::new(bridge_desktop::TokioScheduler))
}

#[cfg(not(feature = "desktop-shims"))]
fn provide_default_scheduler() -> Result<Arc<dyn Scheduler>> {
    Err(Error::CapabilityMissing {
        capability: "Scheduler".to_string(),
        message: "No scheduler implementation provided. \
                 Desktop: enable the 'desktop-shims' feature to use TokioScheduler."
            .to_string(),
    })
}

#[cfg(feature = "desktop-shims")]
fn default_path(name: &str, _setter: &str) -> Result<PathBuf> {
    Ok(bridge_desktop::default_data_root().join(name))
}

#[cfg(not(feature = "desktop-shims"))]
fn default_path(_name: &str, setter: &str) -> Result<PathBuf> {
    Err(Error::Config(format!(
        "No platform data directory available. Use .{}() to set it.",
        setter
    )))
}

/// Builder for constructing [`CoreConfig`] instances.
#[derive(Default)]
pub struct CoreConfigBuilder {
    display_id: Option<String>,
    database_path: Option<PathBuf>,
    cache_dir: Option<PathBuf>,
    download_dir: Option<PathBuf>,
    credential_endpoint: Option<String>,
    direct_channel_id: Option<String>,
    http_client: Option<Arc<dyn HttpClient>>,
    file_system: Option<Arc<dyn FileSystemAccess>>,
    scheduler: Option<Arc<dyn Scheduler>>,
    download: Option<DownloadSettings>,
    expiration: Option<ExpirationSettings>,
}

impl CoreConfigBuilder {
    /// Sets the identity of this display endpoint (required).
    pub fn display_id(mut self, id: impl Into<String>) -> Self {
        self.display_id = Some(id.into());
        self
    }

    /// Sets the database path.
    ///
    /// # Examples
    ///
    /// ```
    /// use core_runtime::config::CoreConfig;
    ///
    /// let builder = CoreConfig::builder()
    ///     .database_path("/var/lib/display-sync/sync.db");
    /// ```
    pub fn database_path<P: Into<PathBuf>>(mut self, path: P) -> Self {
        self.database_path = Some(path.into());
        self
    }

    /// Sets the directory promoted files are served from.
    pub fn cache_dir<P: Into<PathBuf>>(mut self, path: P) -> Self {
        self.cache_dir = Some(path.into());
        self
    }

    /// Sets the staging directory for in-progress downloads.
    ///
    /// Must live on the same volume as the cache directory so promotion is a
    /// rename.
    pub fn download_dir<P: Into<PathBuf>>(mut self, path: P) -> Self {
        self.download_dir = Some(path.into());
        self
    }

    /// Sets the credential exchange endpoint (required).
    pub fn credential_endpoint(mut self, url: impl Into<String>) -> Self {
        self.credential_endpoint = Some(url.into());
        self
    }

    /// Sets the owner id delivered over the local direct channel.
    pub fn direct_channel_id(mut self, id: impl Into<String>) -> Self {
        self.direct_channel_id = Some(id.into());
        self
    }

    /// Sets the HTTP client implementation.
    ///
    /// If not provided, the desktop default (reqwest-based) is used when the
    /// `desktop-shims` feature is enabled.
    pub fn http_client(mut self, client: Arc<dyn HttpClient>) -> Self {
        self.http_client = Some(client);
        self
    }

    /// Sets the file system access implementation.
    pub fn file_system(mut self, fs: Arc<dyn FileSystemAccess>) -> Self {
        self.file_system = Some(fs);
        self
    }

    /// Sets the scheduler used for polling and retry delays.
    pub fn scheduler(mut self, scheduler: Arc<dyn Scheduler>) -> Self {
        self.scheduler = Some(scheduler);
        self
    }

    pub fn download_settings(mut self, settings: DownloadSettings) -> Self {
        self.download = Some(settings);
        self
    }

    pub fn expiration_settings(mut self, settings: ExpirationSettings) -> Self {
        self.expiration = Some(settings);
        self
    }

    /// Builds the final `CoreConfig` instance.
    ///
    /// # Returns
    ///
    /// Returns `Ok(CoreConfig)` on success, or an error if:
    /// - Display id or credential endpoint is missing
    /// - A bridge is missing and no platform default is available
    /// - Configuration values are invalid
    pub fn build(self) -> Result<CoreConfig> {
        let display_id = self.display_id.ok_or_else(|| {
            Error::Config("Display id is required. Use .display_id() to set it.".to_string())
        })?;

        let credential_endpoint = self.credential_endpoint.ok_or_else(|| {
            Error::Config(
                "Credential endpoint is required. Use .credential_endpoint() to set it."
                    .to_string(),
            )
        })?;

        let database_path = match self.database_path {
            Some(path) => path,
            None => default_path("sync.db", "database_path")?,
        };

        let cache_dir = match self.cache_dir {
            Some(path) => path,
            None => default_path("cache", "cache_dir")?,
        };

        let download_dir = match self.download_dir {
            Some(path) => path,
            None => default_path("downloads", "download_dir")?,
        };

        let http_client = match self.http_client {
            Some(client) => client,
            None => provide_default_http_client()?,
        };

        let file_system = match self.file_system {
            Some(fs) => fs,
            None => provide_default_file_system()?,
        };

        let scheduler = match self.scheduler {
            Some(scheduler) => scheduler,
            None => provide_default_scheduler()?,
        };

        let config = CoreConfig {
            display_id,
            database_path,
            cache_dir,
            download_dir,
            credential_endpoint,
            direct_channel_id: self.direct_channel_id,
            http_client,
            file_system,
            scheduler,
            download: self.download.unwrap_or_default(),
            expiration: self.expiration.unwrap_or_default(),
        };

        config.validate()?;

        Ok(config)
    }
}
