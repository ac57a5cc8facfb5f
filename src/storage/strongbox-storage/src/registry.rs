//! Key registry trait definition.

use async_trait::async_trait;

use crate::error::StorageError;
use crate::model::{AuditRecord, DekRecord, KekRecord, KeyWrapping, NewAuditRecord};

/// Durable storage for KEK and DEK metadata and the audit log.
///
/// Implementations must enforce two uniqueness constraints and report
/// violations as [`StorageError::AlreadyExists`]:
/// - at most one active DEK per `(domain, tenant_id)`;
/// - at most one audit entry per `previous_hash` value (including `None`).
#[async_trait]
pub trait KeyRegistry: Send + Sync {
    /// Returns the active KEK, if any.
    async fn active_kek(&self) -> Result<Option<KekRecord>, StorageError>;

    /// Returns a KEK by identifier.
    async fn get_kek(&self, id: &str) -> Result<Option<KekRecord>, StorageError>;

    /// Inserts a KEK. An active KEK retires the previously active one
    /// atomically.
    async fn insert_kek(&self, kek: &KekRecord) -> Result<(), StorageError>;

    /// Returns the active DEK for a scope.
    async fn find_active_dek(
        &self,
        domain: &str,
        tenant_id: Option<&str>,
    ) -> Result<Option<DekRecord>, StorageError>;

    /// Returns a DEK by identifier, active or not.
    async fn get_dek(&self, id: &str) -> Result<Option<DekRecord>, StorageError>;

    /// Lists the active DEKs of a domain across all tenants.
    async fn list_active_deks(&self, domain: &str) -> Result<Vec<DekRecord>, StorageError>;

    /// Inserts a DEK.
    async fn insert_dek(&self, dek: &DekRecord) -> Result<(), StorageError>;

    /// Replaces a DEK's wrapped material and owning KEK.
    async fn update_dek_wrapping(
        &self,
        id: &str,
        wrapping: &KeyWrapping,
        wrapped_key: &[u8],
        wrap_algorithm: &str,
        updated_at: u64,
    ) -> Result<(), StorageError>;

    /// Increments a DEK's usage counter and sets its last-used time.
    ///
    /// Advisory: lost updates under concurrency are acceptable.
    async fn record_dek_usage(&self, id: &str, used_at: u64) -> Result<(), StorageError>;

    /// Returns the entry with the highest sequence number.
    async fn latest_audit_entry(&self) -> Result<Option<AuditRecord>, StorageError>;

    /// Appends an audit entry and returns it with its assigned sequence.
    async fn append_audit_entry(&self, entry: NewAuditRecord)
        -> Result<AuditRecord, StorageError>;

    /// Lists up to `limit` entries with `sequence > after`, in sequence order.
    async fn list_audit_entries(
        &self,
        after: u64,
        limit: usize,
    ) -> Result<Vec<AuditRecord>, StorageError>;
}
