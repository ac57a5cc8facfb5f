//! Envelope engine error types.

use std::time::Duration;

use thiserror::Error;

use strongbox_keyservice::KeyServiceError;
use strongbox_storage::StorageError;

/// Errors that can occur in the envelope engine.
///
/// The variants separate the three situations operators handle differently:
/// a key is unavailable (`KeyNotFound`, `Unwrap`, `Timeout`), data was
/// tampered with (`AuthenticationFailure`), or the service is misconfigured
/// (`Configuration`).
#[derive(Debug, Error)]
pub enum EnvelopeError {
    /// Missing or invalid configuration (e.g. no local secret for fallback mode).
    #[error("configuration error: {0}")]
    Configuration(String),

    /// A referenced KEK or DEK does not exist.
    #[error("key not found: {0}")]
    KeyNotFound(String),

    /// The key service (or fallback wrapper) failed to wrap a key.
    #[error("failed to wrap data key: {0}")]
    Wrap(#[source] KeyServiceError),

    /// The key service (or fallback wrapper) failed to unwrap a DEK.
    #[error("failed to unwrap data key {dek_id}: {source}")]
    Unwrap {
        /// DEK identifier.
        dek_id: String,
        /// Underlying failure.
        #[source]
        source: KeyServiceError,
    },

    /// The AEAD tag did not verify. Never retried.
    #[error("authentication failed: ciphertext, nonce or tag was altered")]
    AuthenticationFailure,

    /// Encryption could not obtain the plaintext of its DEK.
    #[error("encryption failed with data key {dek_id}: {source}")]
    Encryption {
        /// DEK identifier.
        dek_id: String,
        /// Underlying failure.
        #[source]
        source: Box<EnvelopeError>,
    },

    /// The envelope is structurally invalid (bad lengths, bad encoding).
    #[error("invalid envelope: {0}")]
    InvalidEnvelope(String),

    /// Invalid domain, tenant or key name.
    #[error("invalid input: {0}")]
    InvalidInput(String),

    /// Registry failure.
    #[error("storage error: {0}")]
    Storage(#[from] StorageError),

    /// An external call exceeded its deadline.
    #[error("{operation} timed out after {after:?}")]
    Timeout {
        /// Name of the bounded operation.
        operation: &'static str,
        /// Deadline that elapsed.
        after: Duration,
    },

    /// The audit chain could not be appended to. The engine logs and
    /// swallows this; it only reaches callers of [`crate::AuditChain`].
    #[error("audit write failed: {0}")]
    AuditWrite(String),

    /// Local cryptographic failure.
    #[error("crypto error: {0}")]
    Crypto(#[from] strongbox_crypto::CryptoError),
}

impl EnvelopeError {
    /// Returns `true` for transient failures a caller may retry: timeouts,
    /// key service outages and unreachable storage. Tampering, missing keys
    /// and misconfiguration are fatal.
    pub fn is_retryable(&self) -> bool {
        match self {
            Self::Timeout { .. } => true,
            Self::Wrap(e) | Self::Unwrap { source: e, .. } => e.is_retryable(),
            Self::Storage(e) => e.is_retryable(),
            Self::Encryption { source, .. } => source.is_retryable(),
            _ => false,
        }
    }
}
