//! # Display Sync Core
//!
//! Keeps a local cache of origin files in step with what local consumers
//! are watching.
//!
//! ## Overview
//!
//! - Consumers send `WATCH` for a path and receive `FILE-UPDATE` /
//!   `FILE-ERROR` notifications as its status changes
//! - The origin answers with `WATCH-RESULT` and pushes `MSFILEUPDATE`
//!   change sets; each carries a `lastChanged` cursor that only moves forward
//! - STALE entries are downloaded one path at a time, staged, and promoted
//!   atomically into the cache
//! - Paths nobody re-watches for a number of epochs are evicted
//!
//! ## Components
//!
//! - **Stores** (`repositories`): metadata, owners and watchlist ledger in SQLite
//! - **Broadcast Router** (`broadcast`): direct vs general channel delivery
//! - **Sync State Machine** (`state_machine`): applies inbound messages
//! - **File Fetcher** (`fetcher`): retrying download with disk admission
//! - **Download Queue** (`download_queue`): single-flight polling loop
//! - **Expiration Sweeper** (`expiration`): epoch ticker and eviction
//! - **Sync Service** (`service`): wiring and lifecycle

pub mod broadcast;
pub mod credentials;
pub mod download_queue;
pub mod error;
pub mod expiration;
pub mod fetcher;
pub mod messages;
pub mod models;
pub mod paths;
pub mod repositories;
pub mod service;
pub mod state_machine;

pub use broadcast::{BroadcastRouter, Delivery, MessageTransport};
pub use credentials::{CredentialProvider, HttpCredentialProvider};
pub use download_queue::{DownloadOutcome, DownloadQueue};
pub use error::{Result, SyncError};
pub use expiration::{is_expired, ExpirationSweeper, SweepReport};
pub use fetcher::{FetchOutcome, FileFetcher};
pub use messages::{InboundMessage, OutboundMessage, UpdateKind};
pub use models::{
    DownloadToken, FileEntry, FileStatus, LedgerState, OwnerEntry, TokenData, WatchlistEntry,
};
pub use paths::CacheLayout;
pub use repositories::{
    MetadataStore, OwnerRegistry, SqliteMetadataStore, SqliteOwnerRegistry,
    SqliteWatchlistLedger, Stores, WatchlistLedger,
};
pub use service::{SyncService, SyncServiceBuilder};
pub use state_machine::SyncStateMachine;
