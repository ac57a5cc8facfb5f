//! AES-256-GCM authenticated encryption.
//!
//! Two layouts are supported:
//! - **Detached**: nonce, ciphertext and tag are returned separately. This is
//!   the payload format used by the envelope wire format.
//! - **Combined**: `nonce (12 bytes) || ciphertext || tag (16 bytes)`, used
//!   when a single opaque blob is needed (software key wrapping).

use aes_gcm::{
    aead::{Aead, AeadInPlace, KeyInit, Payload},
    Aes256Gcm, Nonce, Tag,
};
use zeroize::Zeroizing;

use crate::error::CryptoError;
use crate::random::generate_nonce;

/// Size of an AES-256 key in bytes.
pub const KEY_SIZE: usize = 32;

/// Size of a GCM nonce in bytes.
pub const NONCE_SIZE: usize = 12;

/// Size of a GCM authentication tag in bytes.
pub const TAG_SIZE: usize = 16;

/// Output of [`seal`]: the three parts of a detached AES-GCM encryption.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct SealedParts {
    /// Random nonce used for this encryption.
    pub nonce: [u8; NONCE_SIZE],
    /// Ciphertext, same length as the plaintext.
    pub ciphertext: Vec<u8>,
    /// Authentication tag.
    pub tag: [u8; TAG_SIZE],
}

fn cipher_for(key: &[u8]) -> Result<Aes256Gcm, CryptoError> {
    if key.len() != KEY_SIZE {
        return Err(CryptoError::InvalidKey(format!(
            "expected {} bytes, got {}",
            KEY_SIZE,
            key.len()
        )));
    }
    Aes256Gcm::new_from_slice(key).map_err(|e| CryptoError::InvalidKey(e.to_string()))
}

/// Encrypts `plaintext` under a fresh random nonce and returns the nonce,
/// ciphertext and tag separately.
pub fn seal(key: &[u8], plaintext: &[u8]) -> Result<SealedParts, CryptoError> {
    let cipher = cipher_for(key)?;
    let nonce = generate_nonce();

    let mut buffer = plaintext.to_vec();
    let tag = cipher
        .encrypt_in_place_detached(Nonce::from_slice(&nonce), b"", &mut buffer)
        .map_err(|e| CryptoError::EncryptionFailed(e.to_string()))?;

    let mut tag_bytes = [0u8; TAG_SIZE];
    tag_bytes.copy_from_slice(tag.as_slice());

    Ok(SealedParts {
        nonce,
        ciphertext: buffer,
        tag: tag_bytes,
    })
}

/// Decrypts a detached AES-GCM ciphertext.
///
/// # Errors
///
/// - [`CryptoError::InvalidInput`] if the nonce or tag has the wrong length.
/// - [`CryptoError::AuthenticationFailed`] if the tag does not verify.
pub fn open(
    key: &[u8],
    nonce: &[u8],
    ciphertext: &[u8],
    tag: &[u8],
) -> Result<Zeroizing<Vec<u8>>, CryptoError> {
    let cipher = cipher_for(key)?;

    if nonce.len() != NONCE_SIZE {
        return Err(CryptoError::InvalidInput(format!(
            "nonce must be {} bytes, got {}",
            NONCE_SIZE,
            nonce.len()
        )));
    }
    if tag.len() != TAG_SIZE {
        return Err(CryptoError::InvalidInput(format!(
            "tag must be {} bytes, got {}",
            TAG_SIZE,
            tag.len()
        )));
    }

    let mut buffer = Zeroizing::new(ciphertext.to_vec());
    cipher
        .decrypt_in_place_detached(
            Nonce::from_slice(nonce),
            b"",
            &mut *buffer,
            Tag::from_slice(tag),
        )
        .map_err(|_| CryptoError::AuthenticationFailed)?;

    Ok(buffer)
}

/// Encrypts into the combined layout `nonce || ciphertext || tag`, binding
/// `associated_data` into the tag.
pub fn encrypt(
    key: &[u8],
    plaintext: &[u8],
    associated_data: &[u8],
) -> Result<Vec<u8>, CryptoError> {
    let cipher = cipher_for(key)?;
    let nonce = generate_nonce();

    let ciphertext = cipher
        .encrypt(
            Nonce::from_slice(&nonce),
            Payload {
                msg: plaintext,
                aad: associated_data,
            },
        )
        .map_err(|e| CryptoError::EncryptionFailed(e.to_string()))?;

    let mut result = Vec::with_capacity(NONCE_SIZE + ciphertext.len());
    result.extend_from_slice(&nonce);
    result.extend_from_slice(&ciphertext);
    Ok(result)
}

/// Decrypts the combined layout produced by [`encrypt`].
pub fn decrypt(
    key: &[u8],
    blob: &[u8],
    associated_data: &[u8],
) -> Result<Zeroizing<Vec<u8>>, CryptoError> {
    let cipher = cipher_for(key)?;

    if blob.len() < NONCE_SIZE + TAG_SIZE {
        return Err(CryptoError::InvalidInput("ciphertext too short".to_string()));
    }

    let (nonce, encrypted) = blob.split_at(NONCE_SIZE);
    let plaintext = cipher
        .decrypt(
            Nonce::from_slice(nonce),
            Payload {
                msg: encrypted,
                aad: associated_data,
            },
        )
        .map_err(|_| CryptoError::AuthenticationFailed)?;

    Ok(Zeroizing::new(plaintext))
}
