//! # Desktop Bridge Implementations
//!
//! Default implementations of bridge traits for desktop and Linux-based
//! display players.
//!
//! ## Overview
//!
//! - `HttpClient` using `reqwest`
//! - `FileSystemAccess` using `tokio::fs`, with free space from `statvfs`
//! - `Scheduler` using the Tokio timer
//!
//! ## Usage
//!
//! ```ignore
//! use bridge_desktop::{ReqwestHttpClient, TokioFileSystem, TokioScheduler};
//!
//! #[tokio::main]
//! async fn main() {
//!     let config = CoreConfig::builder()
//!         .display_id("display-42")
//!         .http_client(Arc::new(ReqwestHttpClient::new()))
//!         .file_system(Arc::new(TokioFileSystem::new()))
//!         .scheduler(Arc::new(TokioScheduler))
//!         .build()?;
//! }
//! ```

mod background;
mod filesystem;
mod http;

pub use background::TokioScheduler;
pub use filesystem::{default_data_root, TokioFileSystem};
pub use http::ReqwestHttpClient;
