//! Registry record types.

use std::str::FromStr;

use serde::{Deserialize, Serialize};

use crate::error::StorageError;

/// Reserved KEK identifier stored on DEKs wrapped by the local fallback key.
pub const FALLBACK_KEK_ID: &str = "fallback-local-key";

/// Payload algorithm of every DEK.
pub const DEK_ALGORITHM: &str = "aes-256-gcm";

macro_rules! string_enum {
    ($ty:ident, $what:literal, { $($variant:ident => $text:literal),+ $(,)? }) => {
        impl $ty {
            /// Returns the stored string form.
            pub fn as_str(&self) -> &'static str {
                match self {
                    $(Self::$variant => $text,)+
                }
            }
        }

        impl std::fmt::Display for $ty {
            fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
                f.write_str(self.as_str())
            }
        }

        impl FromStr for $ty {
            type Err = StorageError;

            fn from_str(s: &str) -> Result<Self, Self::Err> {
                match s {
                    $($text => Ok(Self::$variant),)+
                    other => Err(StorageError::Serialization(format!(
                        concat!("unknown ", $what, ": {}"),
                        other
                    ))),
                }
            }
        }
    };
}

// ============================================================================
// KEK
// ============================================================================

/// Lifecycle status of a KEK.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum KekStatus {
    /// Used to wrap new DEKs. At most one KEK is active.
    Active,
    /// Kept to unwrap DEKs that have not been rotated yet.
    Retired,
}

string_enum!(KekStatus, "kek status", {
    Active => "active",
    Retired => "retired",
});

/// Metadata about a master key held by the key service.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct KekRecord {
    /// Registry identifier.
    pub id: String,
    /// Name of the key inside the key service.
    pub key_name: String,
    /// Lifecycle status.
    pub status: KekStatus,
    /// Creation timestamp (Unix seconds).
    pub created_at: u64,
}

// ============================================================================
// DEK
// ============================================================================

/// How a DEK's stored material was wrapped.
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum KeyWrapping {
    /// Wrapped by the key service under the KEK with this identifier.
    KeyService {
        /// Owning KEK identifier.
        kek_id: String,
    },
    /// Wrapped locally with the key derived from the configured secret.
    Fallback,
}

impl KeyWrapping {
    /// Decodes the `kek_id` column.
    pub fn from_kek_id(kek_id: &str) -> Self {
        if kek_id == FALLBACK_KEK_ID {
            Self::Fallback
        } else {
            Self::KeyService {
                kek_id: kek_id.to_string(),
            }
        }
    }

    /// Encodes as the `kek_id` column.
    pub fn kek_id(&self) -> &str {
        match self {
            Self::KeyService { kek_id } => kek_id,
            Self::Fallback => FALLBACK_KEK_ID,
        }
    }

    /// Returns `true` for locally wrapped DEKs.
    pub fn is_fallback(&self) -> bool {
        matches!(self, Self::Fallback)
    }
}

/// A data encryption key as persisted. Never holds plaintext key bytes.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct DekRecord {
    /// Identifier carried by every envelope encrypted under this DEK.
    pub id: String,
    /// Wrapping scheme and owning KEK.
    pub wrapping: KeyWrapping,
    /// Wrapped key material (opaque).
    pub wrapped_key: Vec<u8>,
    /// Tag describing how `wrapped_key` was produced.
    pub wrap_algorithm: String,
    /// Payload algorithm, always [`DEK_ALGORITHM`].
    pub algorithm: String,
    /// Logical partition, e.g. `documents`.
    pub domain: String,
    /// Optional tenant scope.
    pub tenant_id: Option<String>,
    /// Whether this is the DEK used for new encryptions in its scope.
    pub active: bool,
    /// Advisory usage counter.
    pub usage_count: u64,
    /// Last use (Unix seconds).
    pub last_used_at: Option<u64>,
    /// Creation timestamp (Unix seconds).
    pub created_at: u64,
    /// Last update timestamp (Unix seconds).
    pub updated_at: u64,
}

impl DekRecord {
    /// Returns `true` if this DEK belongs to the given scope.
    pub fn in_scope(&self, domain: &str, tenant_id: Option<&str>) -> bool {
        self.domain == domain && self.tenant_id.as_deref() == tenant_id
    }
}

// ============================================================================
// Audit
// ============================================================================

/// Audited operation.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum AuditOperation {
    /// Payload encryption.
    Encrypt,
    /// Payload decryption.
    Decrypt,
    /// Key creation.
    Create,
    /// Key rotation.
    Rotate,
}

string_enum!(AuditOperation, "audit operation", {
    Encrypt => "encrypt",
    Decrypt => "decrypt",
    Create => "create",
    Rotate => "rotate",
});

/// Kind of resource an audit entry refers to.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum ResourceType {
    /// A data encryption key.
    Dek,
    /// A key encryption key.
    Kek,
}

string_enum!(ResourceType, "resource type", {
    Dek => "dek",
    Kek => "kek",
});

/// Outcome recorded on an audit entry.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum AuditStatus {
    /// The operation completed.
    Success,
    /// The operation completed only partially or failed.
    Failure,
}

string_enum!(AuditStatus, "audit status", {
    Success => "success",
    Failure => "failure",
});

/// An audit entry ready to be appended. The registry assigns the sequence.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct NewAuditRecord {
    /// Operation.
    pub operation: AuditOperation,
    /// Resource kind.
    pub resource_type: ResourceType,
    /// Resource identifier (DEK or KEK id).
    pub resource_id: String,
    /// Actor identity.
    pub actor: String,
    /// Actor origin (IP address, service name).
    pub actor_origin: Option<String>,
    /// Timestamp (Unix seconds).
    pub timestamp: u64,
    /// Hex SHA-256 content hash of this entry.
    pub entry_hash: String,
    /// `entry_hash` of the preceding entry, `None` for the first entry.
    pub previous_hash: Option<String>,
    /// Base64 signature over `entry_hash`.
    pub signature: Option<String>,
    /// KEK identifier whose key signed `entry_hash`.
    pub signing_key_id: Option<String>,
    /// Canonical JSON metadata.
    pub metadata: String,
    /// Outcome.
    pub status: AuditStatus,
}

impl NewAuditRecord {
    /// Attaches the sequence number assigned by the registry.
    pub fn with_sequence(self, sequence: u64) -> AuditRecord {
        AuditRecord {
            sequence,
            operation: self.operation,
            resource_type: self.resource_type,
            resource_id: self.resource_id,
            actor: self.actor,
            actor_origin: self.actor_origin,
            timestamp: self.timestamp,
            entry_hash: self.entry_hash,
            previous_hash: self.previous_hash,
            signature: self.signature,
            signing_key_id: self.signing_key_id,
            metadata: self.metadata,
            status: self.status,
        }
    }
}

/// A stored audit entry.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct AuditRecord {
    /// Monotonic sequence number, starting at 1.
    pub sequence: u64,
    /// Operation.
    pub operation: AuditOperation,
    /// Resource kind.
    pub resource_type: ResourceType,
    /// Resource identifier.
    pub resource_id: String,
    /// Actor identity.
    pub actor: String,
    /// Actor origin.
    pub actor_origin: Option<String>,
    /// Timestamp (Unix seconds).
    pub timestamp: u64,
    /// Hex SHA-256 content hash.
    pub entry_hash: String,
    /// Hash of the preceding entry.
    pub previous_hash: Option<String>,
    /// Base64 signature over `entry_hash`.
    pub signature: Option<String>,
    /// Signing KEK identifier.
    pub signing_key_id: Option<String>,
    /// Canonical JSON metadata.
    pub metadata: String,
    /// Outcome.
    pub status: AuditStatus,
}

#[cfg(test)]
#[allow(clippy::disallowed_methods)]
mod tests {
    use super::*;

    #[test]
    fn test_wrapping_column_roundtrip() {
        let fallback = KeyWrapping::from_kek_id(FALLBACK_KEK_ID);
        assert!(fallback.is_fallback());
        assert_eq!(fallback.kek_id(), FALLBACK_KEK_ID);

        let service = KeyWrapping::from_kek_id("kek-1");
        assert_eq!(
            service,
            KeyWrapping::KeyService {
                kek_id: "kek-1".into()
            }
        );
        assert_eq!(service.kek_id(), "kek-1");
    }

    #[test]
    fn test_string_enums() {
        assert_eq!("retired".parse::<KekStatus>().unwrap(), KekStatus::Retired);
        assert_eq!(AuditOperation::Rotate.to_string(), "rotate");
        assert_eq!("kek".parse::<ResourceType>().unwrap(), ResourceType::Kek);
        assert!(matches!(
            "deleted".parse::<AuditStatus>(),
            Err(StorageError::Serialization(_))
        ));
    }

    #[test]
    fn test_dek_scope() {
        let dek = DekRecord {
            id: "d1".into(),
            wrapping: KeyWrapping::Fallback,
            wrapped_key: vec![1, 2, 3],
            wrap_algorithm: "aes-256-cbc".into(),
            algorithm: DEK_ALGORITHM.into(),
            domain: "documents".into(),
            tenant_id: Some("acme".into()),
            active: true,
            usage_count: 0,
            last_used_at: None,
            created_at: 1,
            updated_at: 1,
        };

        assert!(dek.in_scope("documents", Some("acme")));
        assert!(!dek.in_scope("documents", None));
        assert!(!dek.in_scope("email-credentials", Some("acme")));
    }
}
