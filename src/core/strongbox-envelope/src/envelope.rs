//! The `EncryptedData` envelope and its JSON wire format.

use serde::{Deserialize, Serialize};

use crate::error::EnvelopeError;

/// Ciphertext returned to callers.
///
/// The DEK identifier is the only link to the key; KEK rotation never
/// changes it. Serializes as
/// `{"ciphertext": b64, "dekId": "...", "iv": b64, "authTag": b64}`.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct EncryptedData {
    /// AES-256-GCM ciphertext (same length as the plaintext).
    #[serde(with = "base64_bytes")]
    pub ciphertext: Vec<u8>,
    /// Identifier of the DEK used.
    pub dek_id: String,
    /// 12-byte nonce.
    #[serde(with = "base64_bytes")]
    pub iv: Vec<u8>,
    /// 16-byte authentication tag.
    #[serde(with = "base64_bytes")]
    pub auth_tag: Vec<u8>,
}

impl EncryptedData {
    /// Serializes to the JSON wire format.
    pub fn to_json(&self) -> Result<String, EnvelopeError> {
        serde_json::to_string(self).map_err(|e| EnvelopeError::InvalidEnvelope(e.to_string()))
    }

    /// Parses the JSON wire format.
    pub fn from_json(json: &str) -> Result<Self, EnvelopeError> {
        serde_json::from_str(json).map_err(|e| EnvelopeError::InvalidEnvelope(e.to_string()))
    }
}

mod base64_bytes {
    use base64::{engine::general_purpose::STANDARD as BASE64, Engine};
    use serde::{Deserialize, Deserializer, Serializer};

    pub fn serialize<S: Serializer>(bytes: &[u8], serializer: S) -> Result<S::Ok, S::Error> {
        serializer.serialize_str(&BASE64.encode(bytes))
    }

    pub fn deserialize<'de, D: Deserializer<'de>>(deserializer: D) -> Result<Vec<u8>, D::Error> {
        let encoded = String::deserialize(deserializer)?;
        BASE64.decode(encoded).map_err(serde::de::Error::custom)
    }
}

#[cfg(test)]
#[allow(clippy::disallowed_methods)]
mod tests {
    use super::*;

    fn sample() -> EncryptedData {
        EncryptedData {
            ciphertext: b"hello".to_vec(),
            dek_id: "0f1e2d3c".into(),
            iv: vec![0u8; 12],
            auth_tag: vec![0xFFu8; 16],
        }
    }

    #[test]
    fn test_wire_format_field_names_and_encoding() {
        let json = sample().to_json().unwrap();
        assert_eq!(
            json,
            r#"{"ciphertext":"aGVsbG8=","dekId":"0f1e2d3c","iv":"AAAAAAAAAAAAAAAA","authTag":"/////////////////////w=="}"#
        );
    }

    #[test]
    fn test_parse_wire_format() {
        let parsed = EncryptedData::from_json(
            r#"{"authTag":"/////////////////////w==","iv":"AAAAAAAAAAAAAAAA","dekId":"0f1e2d3c","ciphertext":"aGVsbG8="}"#,
        )
        .unwrap();
        assert_eq!(parsed, sample());
    }

    #[test]
    fn test_parse_rejects_bad_base64() {
        let result = EncryptedData::from_json(
            r#"{"ciphertext":"***","dekId":"x","iv":"AAAAAAAAAAAAAAAA","authTag":"AA=="}"#,
        );
        assert!(matches!(result, Err(EnvelopeError::InvalidEnvelope(_))));

        let result = EncryptedData::from_json(r#"{"ciphertext":"aGVsbG8="}"#);
        assert!(matches!(result, Err(EnvelopeError::InvalidEnvelope(_))));
    }
}
