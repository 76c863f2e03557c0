use bridge_traits::BridgeError;
use thiserror::Error;

#[derive(Error, Debug)]
pub enum SyncError {
    /// Malformed inbound message; rejected before any mutation.
    #[error("Invalid message: {0}")]
    Validation(String),

    #[error("Invalid storage path: {0}")]
    InvalidPath(String),

    #[error("Invalid file status: {0}")]
    InvalidStatus(String),

    /// Connection, TLS, timeout or body read failure. Retried.
    #[error("Transport error: {0}")]
    Transport(String),

    #[error("Download failed after {attempts} attempts: {last_error}")]
    RetriesExhausted { attempts: u32, last_error: String },

    #[error("Insufficient disk space: {required} bytes required, {available} bytes available")]
    InsufficientDiskSpace { required: u64, available: u64 },

    #[error("Origin rejected the request with HTTP {status}")]
    Origin { status: u16 },

    #[error("Credential exchange failed: {0}")]
    Credential(String),

    /// Staging or promotion failure on the local volume.
    #[error("IO error: {0}")]
    Io(String),

    #[error("Database error: {0}")]
    Database(String),

    #[error("Serialization error: {0}")]
    Serialization(String),

    #[error("Configuration error: {0}")]
    Config(String),

    #[error("Bridge error: {0}")]
    Bridge(#[from] BridgeError),
}

impl SyncError {
    /// Map a failure of the HTTP bridge. Everything except a missing
    /// capability happened on the wire.
    pub fn transport(error: BridgeError) -> Self {
        match error {
            BridgeError::NotAvailable(_) => SyncError::Bridge(error),
            other => SyncError::Transport(other.to_string()),
        }
    }

    /// Map a failure of the file system bridge.
    pub fn io(error: BridgeError) -> Self {
        SyncError::Io(error.to_string())
    }

    /// Whether another attempt may succeed without anything changing locally.
    pub fn is_transient(&self) -> bool {
        matches!(self, SyncError::Transport(_))
    }

    /// Short human-readable summary used as the FILE-ERROR message.
    pub fn summary(&self) -> &'static str {
        match self {
            SyncError::Validation(_) | SyncError::InvalidPath(_) | SyncError::InvalidStatus(_) => {
                "Invalid request"
            }
            SyncError::Transport(_) | SyncError::RetriesExhausted { .. } => {
                "Could not reach origin"
            }
            SyncError::InsufficientDiskSpace { .. } => "Insufficient disk space",
            SyncError::Origin { .. } => "Origin refused the download",
            SyncError::Credential(_) => "Could not obtain download credentials",
            SyncError::Io(_) => "Could not write file to cache",
            SyncError::Database(_)
            | SyncError::Serialization(_)
            | SyncError::Config(_)
            | SyncError::Bridge(_) => "Internal error",
        }
    }

    /// Best-effort detail carried alongside [`summary`](Self::summary).
    pub fn detail(&self) -> String {
        self.to_string()
    }
}

impl From<core_runtime::Error> for SyncError {
    fn from(error: core_runtime::Error) -> Self {
        SyncError::Config(error.to_string())
    }
}

impl From<serde_json::Error> for SyncError {
    fn from(error: serde_json::Error) -> Self {
        SyncError::Serialization(error.to_string())
    }
}

pub type Result<T> = std::result::Result<T, SyncError>;
