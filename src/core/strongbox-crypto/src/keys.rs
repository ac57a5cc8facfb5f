//! Key types with automatic memory zeroization.
//!
//! Both types redact their bytes in `Debug` output so they can sit inside
//! structs that are logged or printed.

use zeroize::{Zeroize, ZeroizeOnDrop};

use crate::aead::KEY_SIZE;
use crate::error::CryptoError;
use crate::random::generate_key;

fn copy_key(bytes: &[u8]) -> Result<[u8; KEY_SIZE], CryptoError> {
    if bytes.len() != KEY_SIZE {
        return Err(CryptoError::InvalidKey(format!(
            "expected {} bytes, got {}",
            KEY_SIZE,
            bytes.len()
        )));
    }

    let mut key = [0u8; KEY_SIZE];
    key.copy_from_slice(bytes);
    Ok(key)
}

/// A 256-bit symmetric key, e.g. the plaintext of a data encryption key.
#[derive(Clone, Zeroize, ZeroizeOnDrop)]
pub struct SymmetricKey {
    bytes: [u8; KEY_SIZE],
}

impl SymmetricKey {
    /// Generates a new random key.
    pub fn generate() -> Self {
        Self {
            bytes: *generate_key(),
        }
    }

    /// Creates a key from exactly 32 raw bytes.
    pub fn from_bytes(bytes: &[u8]) -> Result<Self, CryptoError> {
        Ok(Self {
            bytes: copy_key(bytes)?,
        })
    }

    /// Returns the raw key bytes.
    ///
    /// The returned slice borrows from `self` and is wiped when `self` drops.
    #[inline]
    pub fn as_bytes(&self) -> &[u8] {
        &self.bytes
    }
}

impl std::fmt::Debug for SymmetricKey {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("SymmetricKey")
            .field("bytes", &"[REDACTED]")
            .finish()
    }
}

/// Root key of the software key service. Per-key-name keys are derived from
/// it and it is never used to encrypt anything directly.
#[derive(Clone, Zeroize, ZeroizeOnDrop)]
pub struct MasterKey {
    bytes: [u8; KEY_SIZE],
}

impl MasterKey {
    /// Generates a new random master key.
    pub fn generate() -> Self {
        Self {
            bytes: *generate_key(),
        }
    }

    /// Creates a master key from exactly 32 raw bytes.
    pub fn from_bytes(bytes: &[u8]) -> Result<Self, CryptoError> {
        Ok(Self {
            bytes: copy_key(bytes)?,
        })
    }

    /// Parses a master key from 64 hex characters.
    pub fn from_hex(encoded: &str) -> Result<Self, CryptoError> {
        let decoded = zeroize::Zeroizing::new(
            hex::decode(encoded.trim())
                .map_err(|e| CryptoError::InvalidKey(format!("invalid hex: {e}")))?,
        );
        Self::from_bytes(&decoded)
    }

    /// Returns the raw key bytes.
    #[inline]
    pub fn as_bytes(&self) -> &[u8] {
        &self.bytes
    }
}

impl std::fmt::Debug for MasterKey {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("MasterKey")
            .field("bytes", &"[REDACTED]")
            .finish()
    }
}

#[cfg(test)]
#[allow(clippy::disallowed_methods)]
mod tests {
    use super::*;

    #[test]
    fn test_symmetric_key_from_bytes() {
        let bytes = [0x42u8; KEY_SIZE];
        let key = SymmetricKey::from_bytes(&bytes).unwrap();
        assert_eq!(key.as_bytes(), &bytes);
    }

    #[test]
    fn test_symmetric_key_invalid_length() {
        let result = SymmetricKey::from_bytes(&[0u8; 16]);
        assert!(matches!(result, Err(CryptoError::InvalidKey(_))));
    }

    #[test]
    fn test_debug_is_redacted() {
        let key = SymmetricKey::from_bytes(&[0x42u8; KEY_SIZE]).unwrap();
        let debug_str = format!("{:?}", key);
        assert!(debug_str.contains("[REDACTED]"));
        assert!(!debug_str.contains("66"));

        let master = MasterKey::generate();
        assert!(format!("{:?}", master).contains("[REDACTED]"));
    }

    #[test]
    fn test_master_key_from_hex() {
        let encoded = "11".repeat(KEY_SIZE);
        let key = MasterKey::from_hex(&encoded).unwrap();
        assert_eq!(key.as_bytes(), &[0x11u8; KEY_SIZE]);

        assert!(MasterKey::from_hex("zz").is_err());
        assert!(MasterKey::from_hex(&"11".repeat(16)).is_err());
    }

    #[test]
    fn test_generated_keys_are_unique() {
        assert_ne!(
            SymmetricKey::generate().as_bytes(),
            SymmetricKey::generate().as_bytes()
        );
    }
}
