//! Storage error types.

use thiserror::Error;

/// Errors that can occur during registry operations.
#[derive(Debug, Error)]
pub enum StorageError {
    /// Entry not found.
    #[error("entry not found: {0}")]
    NotFound(String),

    /// A uniqueness constraint rejected the write (second active DEK for a
    /// scope, second audit entry claiming the same predecessor).
    #[error("entry already exists: {0}")]
    AlreadyExists(String),

    /// The backend could not be reached.
    #[error("connection failed: {0}")]
    ConnectionFailed(String),

    /// A query failed.
    #[error("query failed: {0}")]
    QueryFailed(String),

    /// A stored value could not be decoded.
    #[error("serialization error: {0}")]
    Serialization(String),

    /// Invalid input.
    #[error("invalid input: {0}")]
    InvalidInput(String),
}

impl StorageError {
    /// Returns `true` for failures a caller may retry (the backend was
    /// unreachable or busy).
    pub fn is_retryable(&self) -> bool {
        matches!(self, Self::ConnectionFailed(_))
    }
}
