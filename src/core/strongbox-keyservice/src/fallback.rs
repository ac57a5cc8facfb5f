//! Local fallback wrapping.
//!
//! When the key service is unreachable, DEKs are wrapped with AES-256-CBC
//! under `SHA-256(local secret)`. The stored form is the UTF-8 string
//! `{ivHex}:{encryptedHex}`, with a 16-byte IV.

use zeroize::Zeroizing;

use strongbox_crypto::{cbc, digest, SymmetricKey};

use crate::error::KeyServiceError;

/// Wrap algorithm tag of fallback-wrapped DEKs.
pub const FALLBACK_WRAP_ALGORITHM: &str = "aes-256-cbc-local";

/// Wraps keys with a key derived from a locally configured secret.
#[derive(Clone)]
pub struct FallbackWrapper {
    key: SymmetricKey,
}

impl FallbackWrapper {
    /// Derives the wrapping key from `secret`.
    ///
    /// Returns `None` for an empty secret.
    pub fn from_secret(secret: &str) -> Option<Self> {
        if secret.is_empty() {
            return None;
        }
        let hashed = Zeroizing::new(digest::sha256(secret.as_bytes()));
        let key = SymmetricKey::from_bytes(&*hashed).ok()?;
        Some(Self { key })
    }

    /// Wraps raw key bytes.
    pub fn wrap(&self, plaintext: &[u8]) -> Result<Vec<u8>, KeyServiceError> {
        let (iv, encrypted) = cbc::encrypt(self.key.as_bytes(), plaintext)?;
        Ok(format!("{}:{}", hex::encode(iv), hex::encode(encrypted)).into_bytes())
    }

    /// Unwraps material produced by [`FallbackWrapper::wrap`].
    pub fn unwrap(&self, wrapped: &[u8]) -> Result<Zeroizing<Vec<u8>>, KeyServiceError> {
        let text = std::str::from_utf8(wrapped)
            .map_err(|_| KeyServiceError::Malformed("fallback key is not UTF-8".into()))?;
        let (iv_hex, encrypted_hex) = text
            .split_once(':')
            .ok_or_else(|| KeyServiceError::Malformed("expected {iv}:{ciphertext}".into()))?;

        let iv = hex::decode(iv_hex)
            .map_err(|e| KeyServiceError::Malformed(format!("invalid iv hex: {e}")))?;
        let encrypted = hex::decode(encrypted_hex)
            .map_err(|e| KeyServiceError::Malformed(format!("invalid ciphertext hex: {e}")))?;

        Ok(cbc::decrypt(self.key.as_bytes(), &iv, &encrypted)?)
    }
}

impl std::fmt::Debug for FallbackWrapper {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("FallbackWrapper").finish_non_exhaustive()
    }
}

#[cfg(test)]
#[allow(clippy::disallowed_methods)]
mod tests {
    use super::*;

    #[test]
    fn test_empty_secret_rejected() {
        assert!(FallbackWrapper::from_secret("").is_none());
    }

    #[test]
    fn test_wrap_format() {
        let wrapper = FallbackWrapper::from_secret("local-secret").unwrap();
        let wrapped = String::from_utf8(wrapper.wrap(&[0x11u8; 32]).unwrap()).unwrap();

        let (iv, ct) = wrapped.split_once(':').unwrap();
        assert_eq!(iv.len(), 32);
        // 32-byte key plus a full PKCS#7 padding block
        assert_eq!(ct.len(), 96);
        assert!(wrapped
            .chars()
            .all(|c| c == ':' || c.is_ascii_digit() || ('a'..='f').contains(&c)));
    }

    #[test]
    fn test_roundtrip_across_instances() {
        let wrapped = FallbackWrapper::from_secret("local-secret")
            .unwrap()
            .wrap(&[0x22u8; 32])
            .unwrap();

        // Same secret, new process
        let unwrapped = FallbackWrapper::from_secret("local-secret")
            .unwrap()
            .unwrap(&wrapped)
            .unwrap();
        assert_eq!(&*unwrapped, &[0x22u8; 32]);
    }

    #[test]
    fn test_unwrap_rejects_malformed() {
        let wrapper = FallbackWrapper::from_secret("local-secret").unwrap();

        assert!(matches!(
            wrapper.unwrap(b"no-separator"),
            Err(KeyServiceError::Malformed(_))
        ));
        assert!(matches!(
            wrapper.unwrap(b"zz:00"),
            Err(KeyServiceError::Malformed(_))
        ));
        assert!(matches!(
            wrapper.unwrap(b"00112233:0011"),
            Err(KeyServiceError::Crypto(_))
        ));
    }

    #[test]
    fn test_debug_hides_key() {
        let wrapper = FallbackWrapper::from_secret("local-secret").unwrap();
        assert_eq!(format!("{:?}", wrapper), "FallbackWrapper { .. }");
    }
}
