//! Key service trait definition.

use async_trait::async_trait;
use zeroize::Zeroizing;

use crate::error::KeyServiceError;

/// An external service holding master keys (KEKs) that never leave it.
///
/// Every method may fail with a transport or authorization error.
#[async_trait]
pub trait KeyService: Send + Sync {
    /// Wraps raw key bytes under the named master key.
    async fn wrap(&self, key_name: &str, plaintext: &[u8]) -> Result<Vec<u8>, KeyServiceError>;

    /// Unwraps material produced by [`KeyService::wrap`] with the same key name.
    async fn unwrap(
        &self,
        key_name: &str,
        wrapped: &[u8],
    ) -> Result<Zeroizing<Vec<u8>>, KeyServiceError>;

    /// Signs arbitrary bytes with the named key.
    async fn sign(&self, key_name: &str, data: &[u8]) -> Result<Vec<u8>, KeyServiceError>;

    /// Checks that the service is reachable.
    async fn health_check(&self) -> Result<(), KeyServiceError> {
        Ok(())
    }

    /// Tag stored on DEKs wrapped by this service.
    fn wrap_algorithm(&self) -> &str;
}
