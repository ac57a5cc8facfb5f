//! # Strongbox Crypto
//!
//! Cryptographic primitives shared by the Strongbox crates:
//! - Payload encryption (AES-256-GCM, detached nonce and tag)
//! - Local key wrapping (AES-256-CBC, used only in fallback mode)
//! - Key derivation (HKDF-SHA256)
//! - Digests and MACs (SHA-256, HMAC-SHA256)
//! - Zeroizing key types and secure random generation

#![forbid(unsafe_code)]
#![warn(missing_docs)]

pub mod aead;
pub mod cbc;
pub mod digest;
pub mod error;
pub mod kdf;
pub mod keys;
pub mod random;

pub use error::CryptoError;
pub use keys::{MasterKey, SymmetricKey};
