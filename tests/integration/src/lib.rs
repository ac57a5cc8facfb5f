//! Integration tests for Strongbox.
//!
//! These tests run the envelope engine against a real SQLite registry and the
//! software key service, covering the full key lifecycle.

// Allow unwrap() in tests - panics are acceptable for test assertions
#![allow(clippy::disallowed_methods)]

use std::sync::Arc;

use anyhow::{Context, Result};
use tempfile::TempDir;

use strongbox_crypto::MasterKey;
use strongbox_envelope::{EngineConfig, EnvelopeEngine};
use strongbox_keyservice::{KeyService, LocalKeyService};
use strongbox_storage_sqlite::SqliteRegistry;

/// Registry database name used by the harness.
pub const REGISTRY_NAME: &str = "strongbox";

/// Local secret configured on every engine built by the harness.
pub const LOCAL_SECRET: &str = "integration-local-secret";

// ============================================================================
// Test Environment
// ============================================================================

/// A data directory with a SQLite registry and a software key service.
///
/// The directory is deleted on drop.
pub struct TestEnv {
    data_dir: TempDir,
    master_key: [u8; 32],
    /// Shared registry handle.
    pub registry: Arc<SqliteRegistry>,
    /// Key service handed to service-mode engines.
    pub key_service: Arc<LocalKeyService>,
}

impl TestEnv {
    /// Creates a fresh environment.
    pub async fn new() -> Result<Self> {
        let data_dir = TempDir::new().context("Failed to create temp dir")?;
        let registry = SqliteRegistry::open(data_dir.path(), REGISTRY_NAME)
            .await
            .context("Failed to open registry")?;

        let master = MasterKey::generate();
        let mut master_key = [0u8; 32];
        master_key.copy_from_slice(master.as_bytes());

        Ok(Self {
            data_dir,
            master_key,
            registry: Arc::new(registry),
            key_service: Arc::new(LocalKeyService::new(master)),
        })
    }

    /// Engine backed by the key service.
    pub async fn engine(&self) -> Result<EnvelopeEngine> {
        Ok(EnvelopeEngine::new(
            self.registry.clone(),
            Some(self.key_service.clone() as Arc<dyn KeyService>),
            EngineConfig::new().with_local_secret(LOCAL_SECRET),
        )
        .await?)
    }

    /// Engine without key service, wrapping DEKs locally.
    pub async fn fallback_engine(&self) -> Result<EnvelopeEngine> {
        Ok(EnvelopeEngine::new(
            self.registry.clone(),
            None,
            EngineConfig::new().with_local_secret(LOCAL_SECRET),
        )
        .await?)
    }

    /// Engine on a second connection pool to the same database and a second
    /// key service instance with the same master key, as another process
    /// would have.
    pub async fn second_process_engine(&self) -> Result<EnvelopeEngine> {
        let registry = SqliteRegistry::open(self.data_dir.path(), REGISTRY_NAME).await?;
        let service = LocalKeyService::new(MasterKey::from_bytes(&self.master_key)?);

        Ok(EnvelopeEngine::new(
            Arc::new(registry),
            Some(Arc::new(service) as Arc<dyn KeyService>),
            EngineConfig::new().with_local_secret(LOCAL_SECRET),
        )
        .await?)
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use strongbox_envelope::{Actor, EncryptedData, EnvelopeError};
    use strongbox_storage::{KeyRegistry, KeyWrapping, FALLBACK_KEK_ID};

    #[tokio::test]
    async fn test_hello_world_roundtrip() {
        let env = TestEnv::new().await.unwrap();
        let engine = env.engine().await.unwrap();
        let alice = Actor::new("alice");

        let encrypted = engine
            .encrypt(b"hello world", "documents", None, Some(&alice))
            .await
            .unwrap();
        let json = encrypted.to_json().unwrap();
        assert!(json.contains("\"dekId\""));
        assert!(json.contains("\"authTag\""));

        let parsed = EncryptedData::from_json(&json).unwrap();
        let decrypted = engine.decrypt(&parsed, Some(&alice)).await.unwrap();
        assert_eq!(&*decrypted, b"hello world");

        let verification = engine.audit().verify().await.unwrap();
        assert!(verification.valid);
        assert_eq!(verification.entries_checked, 4);
    }

    #[tokio::test]
    async fn test_envelopes_survive_restart() {
        let env = TestEnv::new().await.unwrap();
        let encrypted = {
            let engine = env.engine().await.unwrap();
            engine
                .encrypt(b"persisted", "documents", Some("acme"), None)
                .await
                .unwrap()
        };

        let engine = env.second_process_engine().await.unwrap();
        assert_eq!(&*engine.decrypt(&encrypted, None).await.unwrap(), b"persisted");
        assert!(engine.audit().verify_contents().await.unwrap().valid);
    }

    #[tokio::test(flavor = "multi_thread", worker_threads = 4)]
    async fn test_concurrent_first_use_yields_one_dek() {
        let env = TestEnv::new().await.unwrap();
        let engine = Arc::new(env.engine().await.unwrap());

        let mut handles = Vec::new();
        for i in 0..16 {
            let engine = Arc::clone(&engine);
            handles.push(tokio::spawn(async move {
                engine
                    .encrypt(format!("payload {i}").as_bytes(), "documents", None, None)
                    .await
                    .unwrap()
                    .dek_id
            }));
        }

        let mut ids = Vec::new();
        for handle in handles {
            ids.push(handle.await.unwrap());
        }
        ids.sort();
        ids.dedup();

        assert_eq!(ids.len(), 1);
        assert_eq!(env.registry.list_active_deks("documents").await.unwrap().len(), 1);
        assert!(engine.audit().verify_contents().await.unwrap().valid);
    }

    #[tokio::test]
    async fn test_rotation_across_keks() {
        let env = TestEnv::new().await.unwrap();
        let engine = env.engine().await.unwrap();
        let admin = Actor::new("admin");

        let first = engine.create_kek("kek-2025", &admin).await.unwrap();
        let old_docs = engine
            .encrypt(b"old document", "documents", None, None)
            .await
            .unwrap();
        let old_tenant = engine
            .encrypt(b"tenant document", "documents", Some("acme"), None)
            .await
            .unwrap();
        let mail = engine
            .encrypt(b"smtp password", "email-credentials", None, None)
            .await
            .unwrap();

        let second = engine.create_kek("kek-2026", &admin).await.unwrap();
        let report = engine
            .rotate_deks_report("documents", &second.id, &admin)
            .await
            .unwrap();
        assert_eq!(report.count(), 2);
        assert!(report.is_complete());

        for dek in env.registry.list_active_deks("documents").await.unwrap() {
            assert_eq!(dek.wrapping, KeyWrapping::KeyService { kek_id: second.id.clone() });
        }
        let untouched = env.registry.get_dek(&mail.dek_id).await.unwrap().unwrap();
        assert_eq!(untouched.wrapping.kek_id(), first.id);

        // Fresh engine: nothing cached, every DEK is unwrapped from storage
        let engine = env.second_process_engine().await.unwrap();
        assert_eq!(&*engine.decrypt(&old_docs, None).await.unwrap(), b"old document");
        assert_eq!(
            &*engine.decrypt(&old_tenant, None).await.unwrap(),
            b"tenant document"
        );
        assert_eq!(&*engine.decrypt(&mail, None).await.unwrap(), b"smtp password");
    }

    #[tokio::test]
    async fn test_fallback_then_recovery() {
        let env = TestEnv::new().await.unwrap();

        let degraded = env.fallback_engine().await.unwrap();
        assert!(degraded.is_fallback_mode());
        let encrypted = degraded
            .encrypt(b"written in fallback", "documents", None, None)
            .await
            .unwrap();

        let dek = env.registry.get_dek(&encrypted.dek_id).await.unwrap().unwrap();
        assert_eq!(dek.wrapping.kek_id(), FALLBACK_KEK_ID);

        let engine = env.engine().await.unwrap();
        assert!(!engine.is_fallback_mode());
        let admin = Actor::new("admin");
        let kek = engine.create_kek("recovered", &admin).await.unwrap();
        assert_eq!(engine.rotate_deks("documents", &kek.id, &admin).await.unwrap(), 1);

        let dek = env.registry.get_dek(&encrypted.dek_id).await.unwrap().unwrap();
        assert!(!dek.wrapping.is_fallback());
        assert_eq!(
            &*engine.decrypt(&encrypted, None).await.unwrap(),
            b"written in fallback"
        );
    }

    #[tokio::test]
    async fn test_key_service_outage() {
        let env = TestEnv::new().await.unwrap();
        let engine = env.engine().await.unwrap();
        let encrypted = engine
            .encrypt(b"needs the kek", "documents", None, None)
            .await
            .unwrap();

        env.key_service.set_available(false);

        // Cached DEKs keep working during the outage
        assert_eq!(&*engine.decrypt(&encrypted, None).await.unwrap(), b"needs the kek");

        engine.cache().clear().await;
        let err = engine.decrypt(&encrypted, None).await.unwrap_err();
        assert!(matches!(err, EnvelopeError::Unwrap { .. }));
        assert!(err.is_retryable());

        env.key_service.set_available(true);
        assert_eq!(&*engine.decrypt(&encrypted, None).await.unwrap(), b"needs the kek");
    }

    #[tokio::test]
    async fn test_tampered_audit_chain_is_detected() {
        let env = TestEnv::new().await.unwrap();
        let engine = env.engine().await.unwrap();
        for _ in 0..3 {
            engine
                .encrypt(b"audited", "documents", None, None)
                .await
                .unwrap();
        }
        assert!(engine.audit().verify().await.unwrap().valid);

        let changed = env
            .registry
            .execute(
                "UPDATE audit_log SET entry_hash = ? WHERE sequence = 2",
                &["0000000000000000000000000000000000000000000000000000000000000000"],
            )
            .await
            .unwrap();
        assert_eq!(changed, 1);

        let linkage = engine.audit().verify().await.unwrap();
        assert!(!linkage.valid);
        assert_eq!(linkage.broken_at, Some(3));

        let contents = engine.audit().verify_contents().await.unwrap();
        assert_eq!(contents.broken_at, Some(2));
    }

    #[tokio::test]
    async fn test_edited_audit_content_is_detected() {
        let env = TestEnv::new().await.unwrap();
        let engine = env.engine().await.unwrap();
        engine
            .encrypt(b"audited", "documents", None, Some(&Actor::new("alice")))
            .await
            .unwrap();

        env.registry
            .execute(
                "UPDATE audit_log SET actor = ? WHERE operation = 'encrypt'",
                &["mallory"],
            )
            .await
            .unwrap();

        assert!(engine.audit().verify().await.unwrap().valid);
        let contents = engine.audit().verify_contents().await.unwrap();
        assert!(!contents.valid);
        assert_eq!(contents.broken_at, Some(3));
    }

    #[tokio::test(flavor = "multi_thread", worker_threads = 4)]
    async fn test_processes_sharing_one_chain_lose_no_entries() {
        let env = TestEnv::new().await.unwrap();
        let first = env.engine().await.unwrap();
        first.create_kek("shared", &Actor::new("admin")).await.unwrap();
        first.encrypt(b"warm-up", "documents", None, None).await.unwrap();

        let mut engines = vec![Arc::new(first)];
        for _ in 0..3 {
            engines.push(Arc::new(env.second_process_engine().await.unwrap()));
        }
        let before = engines[0].audit().entries().await.unwrap().len();

        let mut handles = Vec::new();
        for (i, engine) in engines.iter().cloned().enumerate() {
            handles.push(tokio::spawn(async move {
                for n in 0..25 {
                    engine
                        .encrypt(format!("{i}-{n}").as_bytes(), "documents", None, None)
                        .await
                        .unwrap();
                }
            }));
        }
        for handle in handles {
            handle.await.unwrap();
        }

        let entries = engines[1].audit().entries().await.unwrap();
        assert_eq!(entries.len(), before + 100);

        let verification = engines[2].audit().verify_contents().await.unwrap();
        assert!(verification.valid, "{}", verification.message);
        assert_eq!(verification.entries_checked as usize, before + 100);
    }
}
