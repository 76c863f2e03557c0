//! # Host Bridge Traits
//!
//! Platform abstraction traits that the synchronization core depends on.
//!
//! ## Overview
//!
//! This crate defines the contract between the core and host-specific
//! implementations. The core never touches the network, the disk or the
//! clock directly; it goes through the traits below so a display player
//! build, a desktop build and the test suite can each plug in their own.
//!
//! ## Traits
//!
//! - [`HttpClient`](http::HttpClient) - Buffered and streaming HTTP exchanges
//! - [`FileSystemAccess`](storage::FileSystemAccess) - Staging, promotion, eviction, free space
//! - [`Scheduler`](background::Scheduler) - Sleep source for polling loops and retry delays
//! - [`LoggerSink`](log::LoggerSink) - Forward structured logs to host logging
//!
//! ## Fail-Fast Strategy
//!
//! The core fails fast with a descriptive error when a required capability is
//! missing:
//!
//! ```ignore
//! let http_client = config.http_client
//!     .ok_or_else(|| Error::CapabilityMissing {
//!         capability: "HttpClient".to_string(),
//!         message: "No HTTP client implementation provided. \
//!                  Desktop: enable the desktop-shims feature.".to_string(),
//!     })?;
//! ```
//!
//! ## Error Handling
//!
//! All bridge traits use [`BridgeError`](error::BridgeError). Implementations
//! convert platform errors into it and keep the failing path or URL in the
//! message.
//!
//! ## Thread Safety
//!
//! All bridge traits require `Send + Sync` so implementations can be shared
//! across the download loop, the sweeper and message handlers.

pub mod background;
pub mod error;
pub mod http;
pub mod log;
pub mod storage;

pub use error::BridgeError;

// Re-export commonly used types
pub use background::Scheduler;
pub use http::{HttpClient, HttpDownload, HttpMethod, HttpRequest, HttpResponse};
pub use log::{ConsoleLogger, LogEntry, LogLevel, LoggerSink};
pub use storage::{FileMetadata, FileSystemAccess};
