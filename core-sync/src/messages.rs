//! # Protocol Messages
//!
//! Wire shapes of the messages exchanged with local consumers and the
//! remote origin. Both directions are internally tagged on `topic`.
//!
//! Inbound:
//! - `WATCH` from a local consumer
//! - `WATCH-RESULT` from the origin, answering a forwarded WATCH
//! - `MSFILEUPDATE` pushed by the origin on add/update/delete
//!
//! Outbound:
//! - `FILE-UPDATE` / `FILE-ERROR` towards local consumers
//! - `WATCHLIST-COMPARE` / `WATCH` towards the origin

use serde::{Deserialize, Deserializer, Serialize};

use crate::error::{Result, SyncError};
use crate::models::{DownloadToken, FileStatus, WatchlistEntry};

// ============================================================================
// Inbound
// ============================================================================

#[derive(Debug, Clone, PartialEq, Eq, Deserialize)]
#[serde(tag = "topic")]
pub enum InboundMessage {
    #[serde(rename = "WATCH")]
    Watch(WatchRequest),
    #[serde(rename = "WATCH-RESULT")]
    WatchResult(WatchResult),
    #[serde(rename = "MSFILEUPDATE")]
    FileUpdate(FileUpdateNotice),
}

impl InboundMessage {
    /// Parse a raw message. Anything malformed is a validation failure.
    pub fn from_json(raw: &str) -> Result<Self> {
        serde_json::from_str(raw).map_err(|e| SyncError::Validation(e.to_string()))
    }

    pub fn topic(&self) -> &'static str {
        match self {
            InboundMessage::Watch(_) => "WATCH",
            InboundMessage::WatchResult(_) => "WATCH-RESULT",
            InboundMessage::FileUpdate(_) => "MSFILEUPDATE",
        }
    }

    pub fn file_path(&self) -> &str {
        match self {
            InboundMessage::Watch(m) => &m.file_path,
            InboundMessage::WatchResult(m) => &m.file_path,
            InboundMessage::FileUpdate(m) => &m.file_path,
        }
    }
}

/// A local consumer asks to be kept informed about a path.
#[derive(Debug, Clone, PartialEq, Eq, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct WatchRequest {
    pub file_path: String,
    /// Consumer id, registered as an owner of the path
    pub from: String,
}

#[derive(Debug, Clone, PartialEq, Eq, Default, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct WatchResult {
    pub file_path: String,
    #[serde(default)]
    pub version: Option<String>,
    #[serde(default)]
    pub token: Option<DownloadToken>,
    /// Status code reported by the origin instead of a version, e.g. `NOEXIST`
    #[serde(default)]
    pub error_msg: Option<String>,
    #[serde(default)]
    pub folder_data: Option<Vec<FolderItem>>,
    #[serde(default, deserialize_with = "opaque_marker")]
    pub watchlist_last_changed: Option<String>,
}

#[derive(Debug, Clone, PartialEq, Eq, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct FolderItem {
    pub file_path: String,
    pub version: String,
    #[serde(default)]
    pub token: Option<DownloadToken>,
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum UpdateKind {
    Add,
    Update,
    Delete,
}

#[derive(Debug, Clone, PartialEq, Eq, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct FileUpdateNotice {
    #[serde(rename = "type")]
    pub kind: UpdateKind,
    pub file_path: String,
    #[serde(default)]
    pub version: Option<String>,
    #[serde(default)]
    pub token: Option<DownloadToken>,
    #[serde(default, deserialize_with = "opaque_marker")]
    pub watchlist_last_changed: Option<String>,
}

/// The origin sends change markers either as strings or as bare numbers.
fn opaque_marker<'de, D>(deserializer: D) -> std::result::Result<Option<String>, D::Error>
where
    D: Deserializer<'de>,
{
    #[derive(Deserialize)]
    #[serde(untagged)]
    enum Marker {
        Text(String),
        Number(serde_json::Number),
    }

    Ok(Option::<Marker>::deserialize(deserializer)?.map(|marker| match marker {
        Marker::Text(text) => text,
        Marker::Number(number) => number.to_string(),
    }))
}

// ============================================================================
// Outbound
// ============================================================================

#[derive(Debug, Clone, PartialEq, Eq, Serialize)]
#[serde(tag = "topic")]
pub enum OutboundMessage {
    #[serde(rename = "FILE-UPDATE")]
    FileUpdate(FileUpdatePayload),
    #[serde(rename = "FILE-ERROR")]
    FileError(FileErrorPayload),
    #[serde(rename = "WATCHLIST-COMPARE")]
    WatchlistCompare(WatchlistComparePayload),
    /// Forwarded to the origin; answered by `WATCH-RESULT`
    #[serde(rename = "WATCH")]
    RemoteWatch(RemoteWatchPayload),
}

impl OutboundMessage {
    pub fn topic(&self) -> &'static str {
        match self {
            OutboundMessage::FileUpdate(_) => "FILE-UPDATE",
            OutboundMessage::FileError(_) => "FILE-ERROR",
            OutboundMessage::WatchlistCompare(_) => "WATCHLIST-COMPARE",
            OutboundMessage::RemoteWatch(_) => "WATCH",
        }
    }

    /// Path the message is about, if it concerns a single path.
    pub fn file_path(&self) -> Option<&str> {
        match self {
            OutboundMessage::FileUpdate(p) => Some(&p.file_path),
            OutboundMessage::FileError(p) => Some(&p.file_path),
            OutboundMessage::RemoteWatch(p) => Some(&p.file_path),
            OutboundMessage::WatchlistCompare(_) => None,
        }
    }

    pub fn to_json(&self) -> Result<String> {
        Ok(serde_json::to_string(self)?)
    }
}

#[derive(Debug, Clone, PartialEq, Eq, Serialize)]
#[serde(rename_all = "camelCase")]
pub struct FileUpdatePayload {
    pub file_path: String,
    pub status: FileStatus,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub version: Option<String>,
    /// Local cache path of the promoted file
    #[serde(skip_serializing_if = "Option::is_none")]
    pub ospath: Option<String>,
    /// `file://` URL of the promoted file
    #[serde(skip_serializing_if = "Option::is_none")]
    pub osurl: Option<String>,
}

impl FileUpdatePayload {
    pub fn new(file_path: impl Into<String>, status: FileStatus) -> Self {
        Self {
            file_path: file_path.into(),
            status,
            version: None,
            ospath: None,
            osurl: None,
        }
    }

    pub fn with_version(mut self, version: impl Into<String>) -> Self {
        self.version = Some(version.into());
        self
    }
}

#[derive(Debug, Clone, PartialEq, Eq, Serialize)]
#[serde(rename_all = "camelCase")]
pub struct FileErrorPayload {
    pub file_path: String,
    pub msg: String,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub detail: Option<String>,
}

#[derive(Debug, Clone, PartialEq, Eq, Serialize)]
pub struct WatchlistComparePayload {
    pub watchlist: Vec<WatchlistEntry>,
}

#[derive(Debug, Clone, PartialEq, Eq, Serialize)]
#[serde(rename_all = "camelCase")]
pub struct RemoteWatchPayload {
    pub file_path: String,
    pub display_id: String,
}
