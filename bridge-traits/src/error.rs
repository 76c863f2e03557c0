//! Failures reported by host bridges.
//!
//! The sync engine decides retry policy from the variant: a missing
//! capability is a configuration problem, while failed or timed out
//! operations on the network path count against the download retry budget.

use thiserror::Error;

#[derive(Error, Debug)]
pub enum BridgeError {
    /// The host cannot provide this capability at all (e.g. no streaming HTTP)
    #[error("Bridge capability not available: {0}")]
    NotAvailable(String),

    #[error("Bridge operation failed: {0}")]
    OperationFailed(String),

    /// A request to the origin or credential endpoint ran past its deadline
    #[error("Bridge operation timed out: {0}")]
    Timeout(String),

    /// Cache or staging file access
    #[error("IO error: {0}")]
    Io(#[from] std::io::Error),
}

pub type Result<T> = std::result::Result<T, BridgeError>;

#[cfg(test)]
mod tests {
    use super::*;
    use std::io::ErrorKind;

    #[test]
    fn test_io_errors_convert() {
        let error: BridgeError = std::io::Error::new(ErrorKind::PermissionDenied, "cache dir").into();
        assert!(matches!(error, BridgeError::Io(_)));
        assert_eq!(error.to_string(), "IO error: cache dir");
    }
}
