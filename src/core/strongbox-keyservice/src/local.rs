//! Software key service.
//!
//! Each key name gets its own wrapping key and signing key, derived from the
//! master key with HKDF. Wrapped material has the form
//! `strongbox:v1:{base64(nonce || ciphertext || tag)}`, with the key name
//! bound as associated data so material cannot be unwrapped under another
//! name.

use std::sync::atomic::{AtomicBool, Ordering};

use async_trait::async_trait;
use base64::{engine::general_purpose::STANDARD as BASE64, Engine};
use tracing::debug;
use zeroize::Zeroizing;

use strongbox_crypto::{aead, digest, kdf, MasterKey};

use crate::error::KeyServiceError;
use crate::service::KeyService;

/// Wrap algorithm tag of [`LocalKeyService`].
pub const LOCAL_WRAP_ALGORITHM: &str = "strongbox-local-v1";

const WRAPPED_PREFIX: &str = "strongbox:v1:";

/// [`KeyService`] backed by a master key held in process memory.
pub struct LocalKeyService {
    master_key: MasterKey,
    available: AtomicBool,
}

impl LocalKeyService {
    /// Creates a service from a master key.
    pub fn new(master_key: MasterKey) -> Self {
        Self {
            master_key,
            available: AtomicBool::new(true),
        }
    }

    /// Marks the service as reachable or not. While unavailable every call
    /// fails with [`KeyServiceError::Unavailable`], which lets operators and
    /// tests exercise outage handling.
    pub fn set_available(&self, available: bool) {
        self.available.store(available, Ordering::SeqCst);
    }

    /// Verifies a signature produced by [`KeyService::sign`].
    pub fn verify(
        &self,
        key_name: &str,
        data: &[u8],
        signature: &[u8],
    ) -> Result<bool, KeyServiceError> {
        let key = self.derive(key_name, "sign")?;
        Ok(digest::verify_hmac_sha256(&*key, data, signature).is_ok())
    }

    fn ensure_available(&self) -> Result<(), KeyServiceError> {
        if self.available.load(Ordering::SeqCst) {
            Ok(())
        } else {
            Err(KeyServiceError::Unavailable(
                "local key service disabled".into(),
            ))
        }
    }

    fn derive(
        &self,
        key_name: &str,
        purpose: &str,
    ) -> Result<Zeroizing<[u8; aead::KEY_SIZE]>, KeyServiceError> {
        if key_name.is_empty() {
            return Err(KeyServiceError::KeyNotFound("empty key name".into()));
        }
        let info = format!("strongbox-kek-v1:{purpose}:{key_name}");
        Ok(kdf::derive_encryption_key(
            self.master_key.as_bytes(),
            info.as_bytes(),
        )?)
    }

    fn associated_data(key_name: &str) -> Vec<u8> {
        format!("strongbox-wrap:{key_name}").into_bytes()
    }
}

#[async_trait]
impl KeyService for LocalKeyService {
    async fn wrap(&self, key_name: &str, plaintext: &[u8]) -> Result<Vec<u8>, KeyServiceError> {
        self.ensure_available()?;

        let key = self.derive(key_name, "wrap")?;
        let blob = aead::encrypt(&*key, plaintext, &Self::associated_data(key_name))?;

        debug!(key_name = key_name, "Key wrapped");
        Ok(format!("{WRAPPED_PREFIX}{}", BASE64.encode(blob)).into_bytes())
    }

    async fn unwrap(
        &self,
        key_name: &str,
        wrapped: &[u8],
    ) -> Result<Zeroizing<Vec<u8>>, KeyServiceError> {
        self.ensure_available()?;

        let text = std::str::from_utf8(wrapped)
            .map_err(|_| KeyServiceError::Malformed("wrapped key is not UTF-8".into()))?;
        let encoded = text
            .strip_prefix(WRAPPED_PREFIX)
            .ok_or_else(|| KeyServiceError::Malformed("unknown wrapped key prefix".into()))?;
        let blob = BASE64
            .decode(encoded)
            .map_err(|e| KeyServiceError::Malformed(format!("invalid base64: {e}")))?;

        let key = self.derive(key_name, "wrap")?;
        let plaintext = aead::decrypt(&*key, &blob, &Self::associated_data(key_name))?;

        debug!(key_name = key_name, "Key unwrapped");
        Ok(plaintext)
    }

    async fn sign(&self, key_name: &str, data: &[u8]) -> Result<Vec<u8>, KeyServiceError> {
        self.ensure_available()?;

        let key = self.derive(key_name, "sign")?;
        Ok(digest::hmac_sha256(&*key, data)?)
    }

    async fn health_check(&self) -> Result<(), KeyServiceError> {
        self.ensure_available()
    }

    fn wrap_algorithm(&self) -> &str {
        LOCAL_WRAP_ALGORITHM
    }
}
