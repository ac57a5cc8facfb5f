//! AES-256-CBC with PKCS#7 padding.
//!
//! Only used to wrap data keys with a locally derived key when the external
//! key service is unreachable. It provides confidentiality but no integrity;
//! payloads are never encrypted with it.

use aes::Aes256;
use cbc::cipher::{block_padding::Pkcs7, BlockDecryptMut, BlockEncryptMut, KeyIvInit};
use zeroize::Zeroizing;

use crate::aead::KEY_SIZE;
use crate::error::CryptoError;
use crate::random::generate_bytes;

type Aes256CbcEnc = cbc::Encryptor<Aes256>;
type Aes256CbcDec = cbc::Decryptor<Aes256>;

/// Size of a CBC initialisation vector in bytes.
pub const IV_SIZE: usize = 16;

/// Encrypts `plaintext` under a fresh random IV.
///
/// Returns `(iv, ciphertext)`.
pub fn encrypt(key: &[u8], plaintext: &[u8]) -> Result<([u8; IV_SIZE], Vec<u8>), CryptoError> {
    if key.len() != KEY_SIZE {
        return Err(CryptoError::InvalidKey(format!(
            "expected {} bytes, got {}",
            KEY_SIZE,
            key.len()
        )));
    }

    let mut iv = [0u8; IV_SIZE];
    iv.copy_from_slice(&generate_bytes(IV_SIZE));

    let ciphertext = Aes256CbcEnc::new_from_slices(key, &iv)
        .map_err(|e| CryptoError::EncryptionFailed(e.to_string()))?
        .encrypt_padded_vec_mut::<Pkcs7>(plaintext);

    Ok((iv, ciphertext))
}

/// Decrypts a CBC ciphertext produced by [`encrypt`].
pub fn decrypt(
    key: &[u8],
    iv: &[u8],
    ciphertext: &[u8],
) -> Result<Zeroizing<Vec<u8>>, CryptoError> {
    if key.len() != KEY_SIZE {
        return Err(CryptoError::InvalidKey(format!(
            "expected {} bytes, got {}",
            KEY_SIZE,
            key.len()
        )));
    }
    if iv.len() != IV_SIZE {
        return Err(CryptoError::InvalidInput(format!(
            "iv must be {} bytes, got {}",
            IV_SIZE,
            iv.len()
        )));
    }
    if ciphertext.is_empty() || ciphertext.len() % IV_SIZE != 0 {
        return Err(CryptoError::InvalidInput(
            "ciphertext is not a whole number of blocks".to_string(),
        ));
    }

    let plaintext = Aes256CbcDec::new_from_slices(key, iv)
        .map_err(|e| CryptoError::DecryptionFailed(e.to_string()))?
        .decrypt_padded_vec_mut::<Pkcs7>(ciphertext)
        .map_err(|_| CryptoError::DecryptionFailed("invalid padding".to_string()))?;

    Ok(Zeroizing::new(plaintext))
}
