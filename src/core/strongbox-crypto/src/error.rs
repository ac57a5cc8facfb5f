//! Cryptographic error types.

use thiserror::Error;

/// Errors that can occur during cryptographic operations.
#[derive(Debug, Error)]
pub enum CryptoError {
    /// Encryption failed.
    #[error("encryption failed: {0}")]
    EncryptionFailed(String),

    /// Decryption failed for a reason other than tag verification
    /// (bad padding, truncated input).
    #[error("decryption failed: {0}")]
    DecryptionFailed(String),

    /// The AEAD tag did not verify: ciphertext, nonce or tag were altered,
    /// or the wrong key was used.
    #[error("authentication failed")]
    AuthenticationFailed,

    /// Key derivation failed.
    #[error("key derivation failed: {0}")]
    DerivationFailed(String),

    /// Invalid key format or size.
    #[error("invalid key: {0}")]
    InvalidKey(String),

    /// Invalid input data.
    #[error("invalid input: {0}")]
    InvalidInput(String),
}
