//! # Sync Records
//!
//! Domain types persisted by the repositories and exchanged with the
//! state machine.
//!
//! ## Status lifecycle
//!
//! ```text
//! UNKNOWN ──WATCH-RESULT──> STALE ──download──> CURRENT
//!    ^                        |                    |
//!    └────download failed─────┘    MSFILEUPDATE ───┘ (back to STALE)
//! ```
//!
//! `DELETED` and `NOEXIST` are only ever broadcast; a deleted entry is
//! removed from storage rather than kept with that status.

use serde::{Deserialize, Serialize};
use std::str::FromStr;

use crate::error::{Result, SyncError};

// ============================================================================
// File Status
// ============================================================================

/// Local knowledge of a single storage path.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "UPPERCASE")]
pub enum FileStatus {
    /// Nothing known yet, or the last download failed
    Unknown,
    /// A newer version exists at the origin than what is cached
    Stale,
    /// Cached bytes match the latest known version
    Current,
    Deleted,
    /// The origin reports the path does not exist
    #[serde(rename = "NOEXIST")]
    NoExist,
}

impl FileStatus {
    pub const ALL: [FileStatus; 5] = [
        FileStatus::Unknown,
        FileStatus::Stale,
        FileStatus::Current,
        FileStatus::Deleted,
        FileStatus::NoExist,
    ];

    pub fn as_str(&self) -> &'static str {
        match self {
            FileStatus::Unknown => "UNKNOWN",
            FileStatus::Stale => "STALE",
            FileStatus::Current => "CURRENT",
            FileStatus::Deleted => "DELETED",
            FileStatus::NoExist => "NOEXIST",
        }
    }

    /// Whether the download queue should pick this entry up.
    pub fn needs_download(&self) -> bool {
        matches!(self, FileStatus::Stale | FileStatus::Unknown)
    }
}

impl FromStr for FileStatus {
    type Err = SyncError;

    fn from_str(s: &str) -> Result<Self> {
        match s.to_uppercase().as_str() {
            "UNKNOWN" => Ok(FileStatus::Unknown),
            "STALE" => Ok(FileStatus::Stale),
            "CURRENT" => Ok(FileStatus::Current),
            "DELETED" => Ok(FileStatus::Deleted),
            "NOEXIST" => Ok(FileStatus::NoExist),
            _ => Err(SyncError::InvalidStatus(s.to_string())),
        }
    }
}

impl std::fmt::Display for FileStatus {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        write!(f, "{}", self.as_str())
    }
}

// ============================================================================
// Download Token
// ============================================================================

/// Origin-issued credential, exchanged for a signed URL before each download.
///
/// Opaque to this crate apart from the fields checked on receipt.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct DownloadToken {
    pub hash: String,
    pub data: TokenData,
}

#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct TokenData {
    pub timestamp: i64,
    pub file_path: String,
    pub display_id: String,
}

impl DownloadToken {
    /// Reject tokens missing any field the credential exchange needs.
    pub fn validate(&self) -> Result<()> {
        if self.hash.is_empty() {
            return Err(SyncError::Validation("token hash is empty".to_string()));
        }
        if self.data.file_path.is_empty() {
            return Err(SyncError::Validation("token filePath is empty".to_string()));
        }
        if self.data.display_id.is_empty() {
            return Err(SyncError::Validation("token displayId is empty".to_string()));
        }
        Ok(())
    }
}

// ============================================================================
// Records
// ============================================================================

/// One row of the metadata store.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct FileEntry {
    pub file_path: String,
    pub status: FileStatus,
    /// Latest version known from the origin; `"0"` when unknown
    pub version: String,
    pub token: Option<DownloadToken>,
    /// Runtime sequence at the last WATCH; `0` means never watched
    pub watch_sequence: i64,
    /// Version of the bytes currently promoted into the cache
    pub cached_version: Option<String>,
    /// Version the token still refers to while `version` is demoted to `"0"`
    pub pending_version: Option<String>,
    /// Milliseconds since the Unix epoch
    pub updated_at: i64,
}

impl FileEntry {
    pub fn new(file_path: impl Into<String>, status: FileStatus, version: impl Into<String>) -> Self {
        Self {
            file_path: file_path.into(),
            status,
            version: version.into(),
            token: None,
            watch_sequence: 0,
            cached_version: None,
            pending_version: None,
            updated_at: now_millis(),
        }
    }

    pub fn with_token(mut self, token: DownloadToken) -> Self {
        self.token = Some(token);
        self
    }

    /// Version a download of this entry should produce.
    pub fn target_version(&self) -> &str {
        self.pending_version.as_deref().unwrap_or(self.version.as_str())
    }
}

/// Subscribers interested in a path.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct OwnerEntry {
    pub file_path: String,
    pub owners: Vec<String>,
}

impl OwnerEntry {
    pub fn contains(&self, owner: &str) -> bool {
        self.owners.iter().any(|o| o == owner)
    }
}

/// Last version of a path acknowledged to the origin.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct WatchlistEntry {
    pub file_path: String,
    pub version: String,
}

impl WatchlistEntry {
    pub fn new(file_path: impl Into<String>, version: impl Into<String>) -> Self {
        Self {
            file_path: file_path.into(),
            version: version.into(),
        }
    }
}

/// Singleton ledger bookkeeping.
#[derive(Debug, Clone, Default, PartialEq, Eq)]
pub struct LedgerState {
    /// Largest change marker received from the origin
    pub last_changed: Option<String>,
    /// Monotonic epoch counter driving expiration
    pub runtime_sequence: i64,
}

pub(crate) fn now_millis() -> i64 {
    chrono::Utc::now().timestamp_millis()
}
