//! Key derivation (HKDF-SHA256, RFC 5869).
//!
//! The software key service derives one wrapping key and one signing key per
//! key name from its master key, so no two key names share key material.

use hkdf::Hkdf;
use sha2::Sha256;
use zeroize::Zeroizing;

use crate::aead::KEY_SIZE;
use crate::error::CryptoError;

/// Derives `length` bytes of output key material with HKDF-SHA256.
pub fn derive_key(
    ikm: &[u8],
    salt: Option<&[u8]>,
    info: &[u8],
    length: usize,
) -> Result<Zeroizing<Vec<u8>>, CryptoError> {
    if length == 0 || length > 255 * 32 {
        return Err(CryptoError::InvalidInput(format!(
            "HKDF-SHA256 output length must be in 1..={}, got {}",
            255 * 32,
            length
        )));
    }

    let hkdf = Hkdf::<Sha256>::new(salt, ikm);
    let mut okm = Zeroizing::new(vec![0u8; length]);
    hkdf.expand(info, &mut okm)
        .map_err(|_| CryptoError::DerivationFailed("HKDF expansion failed".to_string()))?;

    Ok(okm)
}

/// Derives a 256-bit key bound to `context`.
pub fn derive_encryption_key(
    master_key: &[u8],
    context: &[u8],
) -> Result<Zeroizing<[u8; KEY_SIZE]>, CryptoError> {
    let derived = derive_key(master_key, None, context, KEY_SIZE)?;

    let mut key = Zeroizing::new([0u8; KEY_SIZE]);
    key.copy_from_slice(&derived);
    Ok(key)
}
