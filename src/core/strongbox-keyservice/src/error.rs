//! Key service error types.

use thiserror::Error;

/// Errors returned by key service adapters and the fallback wrapper.
#[derive(Debug, Error)]
pub enum KeyServiceError {
    /// The service could not be reached.
    #[error("key service unavailable: {0}")]
    Unavailable(String),

    /// The service did not answer in time.
    #[error("key service timed out: {0}")]
    Timeout(String),

    /// The caller is not allowed to use the key.
    #[error("key service denied access: {0}")]
    Unauthorized(String),

    /// The named key does not exist in the service.
    #[error("key not found in key service: {0}")]
    KeyNotFound(String),

    /// Wrapped material or a service response could not be parsed.
    #[error("malformed key material: {0}")]
    Malformed(String),

    /// Local cryptographic failure.
    #[error("crypto error: {0}")]
    Crypto(#[from] strongbox_crypto::CryptoError),
}

impl KeyServiceError {
    /// Returns `true` for transient failures (outage, timeout).
    pub fn is_retryable(&self) -> bool {
        matches!(self, Self::Unavailable(_) | Self::Timeout(_))
    }
}
