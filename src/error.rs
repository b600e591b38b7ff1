//! WolfElect Error Types

use serde::{Deserialize, Serialize};
use thiserror::Error;

/// Result type alias for WolfElect operations
pub type Result<T> = std::result::Result<T, Error>;

/// Errors reported by the coordination store and the client wrapper.
///
/// These travel over the wire unchanged, so the election engine can tell
/// "degrade and wait" from "give up" from "already gone" without looking
/// at strings.
#[derive(Error, Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub enum StoreError {
    #[error("No node: {0}")]
    NoNode(String),

    #[error("Node already exists: {0}")]
    NodeExists(String),

    #[error("Node has children: {0}")]
    NotEmpty(String),

    #[error("Bad version for {path}: expected {expected}, actual {actual}")]
    BadVersion { path: String, expected: i32, actual: i32 },

    #[error("Invalid argument: {0}")]
    InvalidArgument(String),

    #[error("Not authorized: {0}")]
    NoAuth(String),

    #[error("Ephemeral node cannot have children: {0}")]
    NoChildrenForEphemerals(String),

    #[error("Unexpected response to {0}")]
    UnexpectedResponse(String),

    #[error("Connection to the coordination store lost")]
    ConnectionLoss,

    #[error("Session expired")]
    SessionExpired,

    #[error("Connection closed")]
    Closed,
}

impl StoreError {
    /// Temporary unavailability: leadership becomes unknown, the stream lives on
    pub fn is_transient(&self) -> bool {
        matches!(self, StoreError::ConnectionLoss)
    }

    /// The session (and every ephemeral node it owned) is gone for good
    pub fn is_terminal(&self) -> bool {
        matches!(self, StoreError::SessionExpired | StoreError::Closed)
    }
}

/// WolfElect error types
#[derive(Error, Debug)]
pub enum Error {
    // Configuration errors
    #[error("Configuration error: {0}")]
    Config(String),

    #[error("Invalid configuration file: {0}")]
    ConfigParse(#[from] toml::de::Error),

    // Coordination store errors
    #[error("Coordination store error: {0}")]
    Store(#[from] StoreError),

    // Election errors
    #[error("Duplicate participant id '{0}' registered in election")]
    DuplicateParticipant(String),

    // Network errors
    #[error("Network error: {0}")]
    Network(String),

    #[error("Connection failed to {address}: {reason}")]
    ConnectionFailed { address: String, reason: String },

    #[error("Connection timeout to {0}")]
    ConnectionTimeout(String),

    #[error("Serialization error: {0}")]
    Serialization(#[from] bincode::Error),

    // I/O errors
    #[error("I/O error: {0}")]
    Io(#[from] std::io::Error),

    // Internal errors
    #[error("Internal error: {0}")]
    Internal(String),

    #[error("Operation cancelled")]
    Cancelled,

    #[error("Shutdown in progress")]
    ShuttingDown,
}

impl Error {
    /// Check if this error is retryable
    pub fn is_retryable(&self) -> bool {
        match self {
            Error::Store(e) => e.is_transient(),
            Error::ConnectionTimeout(_) | Error::Network(_) => true,
            _ => false,
        }
    }

    /// The store error behind this error, if any
    pub fn store_error(&self) -> Option<&StoreError> {
        match self {
            Error::Store(e) => Some(e),
            _ => None,
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_store_error_classification() {
        assert!(StoreError::ConnectionLoss.is_transient());
        assert!(!StoreError::ConnectionLoss.is_terminal());
        assert!(StoreError::SessionExpired.is_terminal());
        assert!(StoreError::Closed.is_terminal());

        let fatal = StoreError::NoAuth("/election".into());
        assert!(!fatal.is_transient());
        assert!(!fatal.is_terminal());
    }

    #[test]
    fn test_duplicate_message_names_id() {
        let err = Error::DuplicateParticipant("10.0.0.7:8080".into());
        assert!(err.to_string().contains("10.0.0.7:8080"));
        assert!(!err.is_retryable());
    }

    #[test]
    fn test_store_error_conversion() {
        let err: Error = StoreError::ConnectionLoss.into();
        assert!(err.is_retryable());
        assert_eq!(err.store_error(), Some(&StoreError::ConnectionLoss));
    }
}
