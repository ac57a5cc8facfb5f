//! In-memory key registry.
//!
//! Enforces the same uniqueness rules as the durable backends, so engine
//! behaviour under concurrency can be tested without a database.

use std::collections::HashMap;

use async_trait::async_trait;
use tokio::sync::RwLock;

use crate::error::StorageError;
use crate::model::{AuditRecord, DekRecord, KekRecord, KekStatus, KeyWrapping, NewAuditRecord};
use crate::registry::KeyRegistry;

#[derive(Default)]
struct State {
    keks: Vec<KekRecord>,
    deks: HashMap<String, DekRecord>,
    audit: Vec<AuditRecord>,
}

/// Process-local [`KeyRegistry`]. Contents are lost on drop.
#[derive(Default)]
pub struct MemoryRegistry {
    state: RwLock<State>,
}

impl MemoryRegistry {
    /// Creates an empty registry.
    pub fn new() -> Self {
        Self::default()
    }

    /// Returns the number of DEKs (active or not).
    pub async fn dek_count(&self) -> usize {
        self.state.read().await.deks.len()
    }
}

#[async_trait]
impl KeyRegistry for MemoryRegistry {
    async fn active_kek(&self) -> Result<Option<KekRecord>, StorageError> {
        let state = self.state.read().await;
        Ok(state
            .keks
            .iter()
            .find(|k| k.status == KekStatus::Active)
            .cloned())
    }

    async fn get_kek(&self, id: &str) -> Result<Option<KekRecord>, StorageError> {
        let state = self.state.read().await;
        Ok(state.keks.iter().find(|k| k.id == id).cloned())
    }

    async fn insert_kek(&self, kek: &KekRecord) -> Result<(), StorageError> {
        let mut state = self.state.write().await;

        if state.keks.iter().any(|k| k.id == kek.id) {
            return Err(StorageError::AlreadyExists(format!("kek {}", kek.id)));
        }

        if kek.status == KekStatus::Active {
            for existing in state.keks.iter_mut() {
                existing.status = KekStatus::Retired;
            }
        }
        state.keks.push(kek.clone());
        Ok(())
    }

    async fn find_active_dek(
        &self,
        domain: &str,
        tenant_id: Option<&str>,
    ) -> Result<Option<DekRecord>, StorageError> {
        let state = self.state.read().await;
        Ok(state
            .deks
            .values()
            .find(|d| d.active && d.in_scope(domain, tenant_id))
            .cloned())
    }

    async fn get_dek(&self, id: &str) -> Result<Option<DekRecord>, StorageError> {
        Ok(self.state.read().await.deks.get(id).cloned())
    }

    async fn list_active_deks(&self, domain: &str) -> Result<Vec<DekRecord>, StorageError> {
        let state = self.state.read().await;
        let mut deks: Vec<DekRecord> = state
            .deks
            .values()
            .filter(|d| d.active && d.domain == domain)
            .cloned()
            .collect();
        deks.sort_by(|a, b| a.created_at.cmp(&b.created_at).then(a.id.cmp(&b.id)));
        Ok(deks)
    }

    async fn insert_dek(&self, dek: &DekRecord) -> Result<(), StorageError> {
        let mut state = self.state.write().await;

        if state.deks.contains_key(&dek.id) {
            return Err(StorageError::AlreadyExists(format!("dek {}", dek.id)));
        }
        if dek.active
            && state
                .deks
                .values()
                .any(|d| d.active && d.in_scope(&dek.domain, dek.tenant_id.as_deref()))
        {
            return Err(StorageError::AlreadyExists(format!(
                "active dek for domain {}",
                dek.domain
            )));
        }

        state.deks.insert(dek.id.clone(), dek.clone());
        Ok(())
    }

    async fn update_dek_wrapping(
        &self,
        id: &str,
        wrapping: &KeyWrapping,
        wrapped_key: &[u8],
        wrap_algorithm: &str,
        updated_at: u64,
    ) -> Result<(), StorageError> {
        let mut state = self.state.write().await;
        let dek = state
            .deks
            .get_mut(id)
            .ok_or_else(|| StorageError::NotFound(format!("dek {id}")))?;

        dek.wrapping = wrapping.clone();
        dek.wrapped_key = wrapped_key.to_vec();
        dek.wrap_algorithm = wrap_algorithm.to_string();
        dek.updated_at = updated_at;
        Ok(())
    }

    async fn record_dek_usage(&self, id: &str, used_at: u64) -> Result<(), StorageError> {
        let mut state = self.state.write().await;
        let dek = state
            .deks
            .get_mut(id)
            .ok_or_else(|| StorageError::NotFound(format!("dek {id}")))?;

        dek.usage_count += 1;
        dek.last_used_at = Some(used_at);
        Ok(())
    }

    async fn latest_audit_entry(&self) -> Result<Option<AuditRecord>, StorageError> {
        Ok(self.state.read().await.audit.last().cloned())
    }

    async fn append_audit_entry(
        &self,
        entry: NewAuditRecord,
    ) -> Result<AuditRecord, StorageError> {
        let mut state = self.state.write().await;

        if state
            .audit
            .iter()
            .any(|e| e.previous_hash == entry.previous_hash)
        {
            return Err(StorageError::AlreadyExists(
                "audit entry with the same predecessor".to_string(),
            ));
        }

        let sequence = state.audit.last().map(|e| e.sequence + 1).unwrap_or(1);
        let record = entry.with_sequence(sequence);
        state.audit.push(record.clone());
        Ok(record)
    }

    async fn list_audit_entries(
        &self,
        after: u64,
        limit: usize,
    ) -> Result<Vec<AuditRecord>, StorageError> {
        let state = self.state.read().await;
        Ok(state
            .audit
            .iter()
            .filter(|e| e.sequence > after)
            .take(limit)
            .cloned()
            .collect())
    }
}
