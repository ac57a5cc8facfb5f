//! The envelope encryption engine.

use std::future::Future;
use std::sync::Arc;
use std::time::{SystemTime, UNIX_EPOCH};

use serde::Serialize;
use tokio::sync::Mutex;
use tracing::{debug, info, warn};
use zeroize::Zeroizing;

use strongbox_crypto::{aead, random, CryptoError, SymmetricKey};
use strongbox_keyservice::fallback::FALLBACK_WRAP_ALGORITHM;
use strongbox_keyservice::{FallbackWrapper, KeyService, KeyServiceError};
use strongbox_storage::{
    DekRecord, KekRecord, KekStatus, KeyRegistry, KeyWrapping, StorageError, DEK_ALGORITHM,
};

use crate::audit::{Actor, AuditChain, AuditEvent, AuditMetadata};
use crate::cache::DekCache;
use crate::config::EngineConfig;
use crate::envelope::EncryptedData;
use crate::error::EnvelopeError;
use crate::timeout::with_timeout;

/// Maximum length of a domain or tenant identifier.
const MAX_SCOPE_LEN: usize = 128;

fn now() -> u64 {
    SystemTime::now()
        .duration_since(UNIX_EPOCH)
        .map(|d| d.as_secs())
        .unwrap_or(0)
}

fn validate_domain(domain: &str) -> Result<(), EnvelopeError> {
    if domain.is_empty() || domain.len() > MAX_SCOPE_LEN {
        return Err(EnvelopeError::InvalidInput(format!(
            "domain must be 1-{MAX_SCOPE_LEN} characters"
        )));
    }
    if !domain
        .chars()
        .all(|c| c.is_ascii_alphanumeric() || c == '-' || c == '_')
    {
        return Err(EnvelopeError::InvalidInput(format!(
            "domain '{domain}' may only contain ASCII letters, digits, '-' and '_'"
        )));
    }
    Ok(())
}

fn validate_tenant(tenant_id: Option<&str>) -> Result<(), EnvelopeError> {
    let Some(tenant) = tenant_id else {
        return Ok(());
    };
    if tenant.is_empty() || tenant.chars().count() > MAX_SCOPE_LEN {
        return Err(EnvelopeError::InvalidInput(format!(
            "tenant must be 1-{MAX_SCOPE_LEN} characters"
        )));
    }
    if tenant.chars().any(char::is_control) {
        return Err(EnvelopeError::InvalidInput(
            "tenant must not contain control characters".into(),
        ));
    }
    Ok(())
}

// ============================================================================
// Rotation report
// ============================================================================

/// A DEK that could not be moved to the new KEK.
#[derive(Debug, Clone, PartialEq, Eq, Serialize)]
#[serde(rename_all = "camelCase")]
pub struct RotationFailure {
    /// DEK identifier.
    pub dek_id: String,
    /// Why rotation failed.
    pub reason: String,
}

/// Outcome of a domain rotation.
#[derive(Debug, Clone, Default, PartialEq, Eq, Serialize)]
#[serde(rename_all = "camelCase")]
pub struct RotationReport {
    /// DEKs now wrapped under the new KEK.
    pub rotated: Vec<String>,
    /// DEKs left on their previous wrapping.
    pub failed: Vec<RotationFailure>,
}

impl RotationReport {
    /// Number of DEKs rotated.
    pub fn count(&self) -> usize {
        self.rotated.len()
    }

    /// Returns `true` if every DEK was rotated.
    pub fn is_complete(&self) -> bool {
        self.failed.is_empty()
    }
}

// ============================================================================
// Engine
// ============================================================================

/// Envelope encryption engine.
///
/// Holds no key material except the DEK cache and, when configured, the
/// fallback wrapping key.
pub struct EnvelopeEngine {
    registry: Arc<dyn KeyRegistry>,
    /// `None` in fallback mode.
    key_service: Option<Arc<dyn KeyService>>,
    fallback: Option<FallbackWrapper>,
    cache: DekCache,
    audit: AuditChain,
    kek_init: Mutex<()>,
    config: EngineConfig,
}

impl EnvelopeEngine {
    /// Creates an engine.
    ///
    /// The key service is health-checked once. If it is absent or unhealthy
    /// the engine runs in fallback mode, which requires
    /// [`EngineConfig::local_secret`].
    ///
    /// # Errors
    ///
    /// [`EnvelopeError::Configuration`] when fallback mode is needed and no
    /// local secret is configured.
    pub async fn new(
        registry: Arc<dyn KeyRegistry>,
        key_service: Option<Arc<dyn KeyService>>,
        config: EngineConfig,
    ) -> Result<Self, EnvelopeError> {
        let fallback = config
            .local_secret
            .as_deref()
            .and_then(|secret| FallbackWrapper::from_secret(secret));

        let key_service = match key_service {
            Some(service) => {
                match with_timeout("health check", config.call_timeout, service.health_check())
                    .await
                {
                    Ok(Ok(())) => Some(service),
                    Ok(Err(e)) => {
                        warn!(error = %e, "Key service health check failed");
                        None
                    }
                    Err(e) => {
                        warn!(error = %e, "Key service health check failed");
                        None
                    }
                }
            }
            None => None,
        };

        match (&key_service, &fallback) {
            (None, None) => {
                return Err(EnvelopeError::Configuration(
                    "key service unavailable and no local secret configured for fallback mode"
                        .into(),
                ))
            }
            (None, Some(_)) => {
                warn!(
                    "Envelope engine running in FALLBACK mode: new DEKs are wrapped with a locally derived key"
                );
            }
            (Some(service), _) => {
                info!(
                    wrap_algorithm = service.wrap_algorithm(),
                    fallback_readable = fallback.is_some(),
                    "Envelope engine initialized"
                );
            }
        }

        let audit = AuditChain::new(
            Arc::clone(&registry),
            key_service.clone(),
            config.call_timeout,
        );

        Ok(Self {
            registry,
            key_service,
            fallback,
            cache: DekCache::new(config.cache_ttl),
            audit,
            kek_init: Mutex::new(()),
            config,
        })
    }

    /// Returns `true` when DEKs are wrapped locally instead of by the key service.
    pub fn is_fallback_mode(&self) -> bool {
        self.key_service.is_none()
    }

    /// The audit chain, for listing and verification.
    pub fn audit(&self) -> &AuditChain {
        &self.audit
    }

    /// The DEK cache.
    pub fn cache(&self) -> &DekCache {
        &self.cache
    }

    // ========================================================================
    // Payload operations
    // ========================================================================

    /// Encrypts `plaintext` with the active DEK of `(domain, tenant_id)`,
    /// creating the DEK on first use.
    ///
    /// # Errors
    ///
    /// [`EnvelopeError::Encryption`] if the DEK cannot be unwrapped, and any
    /// error from DEK provisioning.
    pub async fn encrypt(
        &self,
        plaintext: &[u8],
        domain: &str,
        tenant_id: Option<&str>,
        actor: Option<&Actor>,
    ) -> Result<EncryptedData, EnvelopeError> {
        validate_domain(domain)?;
        validate_tenant(tenant_id)?;
        let actor = actor.cloned().unwrap_or_else(Actor::system);

        let dek = self.resolve_dek(domain, tenant_id, &actor).await?;
        let key = self
            .dek_key(&dek)
            .await
            .map_err(|e| EnvelopeError::Encryption {
                dek_id: dek.id.clone(),
                source: Box::new(e),
            })?;

        let sealed = aead::seal(key.as_bytes(), plaintext)?;

        self.record_usage(&dek.id).await;
        self.record(AuditEvent::success(
            &dek.id,
            &actor,
            AuditMetadata::Encrypt {
                domain: domain.to_string(),
                tenant_id: tenant_id.map(String::from),
                plaintext_len: plaintext.len(),
            },
        ))
        .await;

        debug!(dek_id = %dek.id, domain = domain, "Payload encrypted");

        Ok(EncryptedData {
            ciphertext: sealed.ciphertext,
            dek_id: dek.id,
            iv: sealed.nonce.to_vec(),
            auth_tag: sealed.tag.to_vec(),
        })
    }

    /// Decrypts an envelope produced by [`EnvelopeEngine::encrypt`].
    ///
    /// # Errors
    ///
    /// - [`EnvelopeError::InvalidEnvelope`] for malformed nonce or tag lengths.
    /// - [`EnvelopeError::KeyNotFound`] if the DEK does not exist.
    /// - [`EnvelopeError::AuthenticationFailure`] if anything was altered.
    pub async fn decrypt(
        &self,
        data: &EncryptedData,
        actor: Option<&Actor>,
    ) -> Result<Zeroizing<Vec<u8>>, EnvelopeError> {
        if data.dek_id.is_empty() {
            return Err(EnvelopeError::InvalidEnvelope("missing DEK identifier".into()));
        }
        if data.iv.len() != aead::NONCE_SIZE {
            return Err(EnvelopeError::InvalidEnvelope(format!(
                "iv must be {} bytes, got {}",
                aead::NONCE_SIZE,
                data.iv.len()
            )));
        }
        if data.auth_tag.len() != aead::TAG_SIZE {
            return Err(EnvelopeError::InvalidEnvelope(format!(
                "auth tag must be {} bytes, got {}",
                aead::TAG_SIZE,
                data.auth_tag.len()
            )));
        }
        let actor = actor.cloned().unwrap_or_else(Actor::system);

        let dek = self
            .registry_call("dek lookup", self.registry.get_dek(&data.dek_id))
            .await?
            .ok_or_else(|| EnvelopeError::KeyNotFound(format!("data key {}", data.dek_id)))?;
        let key = self.dek_key(&dek).await?;

        let metadata = AuditMetadata::Decrypt {
            domain: dek.domain.clone(),
            tenant_id: dek.tenant_id.clone(),
        };

        let plaintext = match aead::open(key.as_bytes(), &data.iv, &data.ciphertext, &data.auth_tag)
        {
            Ok(plaintext) => plaintext,
            Err(CryptoError::AuthenticationFailed) => {
                warn!(dek_id = %dek.id, actor = %actor.id, "Envelope failed authentication");
                self.record(AuditEvent::success(&dek.id, &actor, metadata).failed())
                    .await;
                return Err(EnvelopeError::AuthenticationFailure);
            }
            Err(e) => return Err(e.into()),
        };

        self.record_usage(&dek.id).await;
        self.record(AuditEvent::success(&dek.id, &actor, metadata))
            .await;

        debug!(dek_id = %dek.id, "Payload decrypted");
        Ok(plaintext)
    }

    /// Encrypts a UTF-8 string.
    pub async fn encrypt_str(
        &self,
        plaintext: &str,
        domain: &str,
        tenant_id: Option<&str>,
        actor: Option<&Actor>,
    ) -> Result<EncryptedData, EnvelopeError> {
        self.encrypt(plaintext.as_bytes(), domain, tenant_id, actor)
            .await
    }

    /// Decrypts an envelope whose plaintext is UTF-8.
    pub async fn decrypt_to_string(
        &self,
        data: &EncryptedData,
        actor: Option<&Actor>,
    ) -> Result<String, EnvelopeError> {
        let plaintext = self.decrypt(data, actor).await?;
        String::from_utf8(plaintext.to_vec())
            .map_err(|_| EnvelopeError::InvalidInput("decrypted payload is not UTF-8".into()))
    }

    // ========================================================================
    // DEK lifecycle
    // ========================================================================

    /// Returns the active DEK of a scope, creating it if none exists.
    ///
    /// Concurrent first use from any number of callers yields one DEK.
    pub async fn get_or_create_dek(
        &self,
        domain: &str,
        tenant_id: Option<&str>,
    ) -> Result<DekRecord, EnvelopeError> {
        validate_domain(domain)?;
        validate_tenant(tenant_id)?;
        self.resolve_dek(domain, tenant_id, &Actor::system()).await
    }

    /// Lists the active DEKs of a domain across tenants.
    pub async fn list_deks(&self, domain: &str) -> Result<Vec<DekRecord>, EnvelopeError> {
        validate_domain(domain)?;
        self.registry_call("dek listing", self.registry.list_active_deks(domain))
            .await
    }

    async fn resolve_dek(
        &self,
        domain: &str,
        tenant_id: Option<&str>,
        actor: &Actor,
    ) -> Result<DekRecord, EnvelopeError> {
        if let Some(dek) = self
            .registry_call("dek lookup", self.registry.find_active_dek(domain, tenant_id))
            .await?
        {
            return Ok(dek);
        }

        let key = SymmetricKey::generate();
        let (wrapping, wrapped_key, wrap_algorithm) = self.wrap_new_dek(&key).await?;
        let created_at = now();

        let record = DekRecord {
            id: random::generate_id(),
            wrapping,
            wrapped_key,
            wrap_algorithm,
            algorithm: DEK_ALGORITHM.to_string(),
            domain: domain.to_string(),
            tenant_id: tenant_id.map(String::from),
            active: true,
            usage_count: 0,
            last_used_at: None,
            created_at,
            updated_at: created_at,
        };

        match self
            .registry_call("dek insert", self.registry.insert_dek(&record))
            .await
        {
            Ok(()) => {}
            Err(EnvelopeError::Storage(StorageError::AlreadyExists(_))) => {
                debug!(domain = domain, "Concurrent DEK creation detected; using existing DEK");
                return self
                    .registry_call("dek lookup", self.registry.find_active_dek(domain, tenant_id))
                    .await?
                    .ok_or_else(|| {
                        EnvelopeError::KeyNotFound(format!("active data key for domain {domain}"))
                    });
            }
            Err(e) => return Err(e),
        }

        self.cache.put(&record.id, key).await;

        info!(
            dek_id = %record.id,
            domain = domain,
            kek_id = record.wrapping.kek_id(),
            fallback = record.wrapping.is_fallback(),
            "DEK created"
        );
        self.record(AuditEvent::success(
            &record.id,
            actor,
            AuditMetadata::CreateDek {
                domain: domain.to_string(),
                tenant_id: tenant_id.map(String::from),
                kek_id: record.wrapping.kek_id().to_string(),
            },
        ))
        .await;

        Ok(record)
    }

    async fn wrap_new_dek(
        &self,
        key: &SymmetricKey,
    ) -> Result<(KeyWrapping, Vec<u8>, String), EnvelopeError> {
        let Some(service) = &self.key_service else {
            let wrapper = self.fallback_wrapper()?;
            let wrapped = wrapper.wrap(key.as_bytes()).map_err(EnvelopeError::Wrap)?;
            return Ok((
                KeyWrapping::Fallback,
                wrapped,
                FALLBACK_WRAP_ALGORITHM.to_string(),
            ));
        };

        let kek = self.ensure_active_kek().await?;
        let wrapped = with_timeout(
            "dek wrap",
            self.config.call_timeout,
            service.wrap(&kek.key_name, key.as_bytes()),
        )
        .await?
        .map_err(EnvelopeError::Wrap)?;

        Ok((
            KeyWrapping::KeyService { kek_id: kek.id },
            wrapped,
            service.wrap_algorithm().to_string(),
        ))
    }

    /// Plaintext of a DEK, from the cache or by unwrapping.
    async fn dek_key(&self, dek: &DekRecord) -> Result<SymmetricKey, EnvelopeError> {
        if let Some(key) = self.cache.get(&dek.id).await {
            return Ok(key);
        }

        let key = self.unwrap_dek(dek).await?;
        self.cache.put(&dek.id, key.clone()).await;
        Ok(key)
    }

    /// Unwraps stored DEK material, bypassing the cache.
    async fn unwrap_dek(&self, dek: &DekRecord) -> Result<SymmetricKey, EnvelopeError> {
        let plaintext = match &dek.wrapping {
            KeyWrapping::KeyService { kek_id } => {
                let service = self.key_service.as_ref().ok_or_else(|| EnvelopeError::Unwrap {
                    dek_id: dek.id.clone(),
                    source: KeyServiceError::Unavailable(
                        "engine is in fallback mode".to_string(),
                    ),
                })?;
                let kek = self
                    .registry_call("kek lookup", self.registry.get_kek(kek_id))
                    .await?
                    .ok_or_else(|| EnvelopeError::KeyNotFound(format!("key encryption key {kek_id}")))?;

                with_timeout(
                    "dek unwrap",
                    self.config.call_timeout,
                    service.unwrap(&kek.key_name, &dek.wrapped_key),
                )
                .await?
                .map_err(|source| EnvelopeError::Unwrap {
                    dek_id: dek.id.clone(),
                    source,
                })?
            }
            KeyWrapping::Fallback => self
                .fallback_wrapper()?
                .unwrap(&dek.wrapped_key)
                .map_err(|source| EnvelopeError::Unwrap {
                    dek_id: dek.id.clone(),
                    source,
                })?,
        };

        SymmetricKey::from_bytes(&plaintext).map_err(|e| EnvelopeError::Unwrap {
            dek_id: dek.id.clone(),
            source: KeyServiceError::Malformed(e.to_string()),
        })
    }

    fn fallback_wrapper(&self) -> Result<&FallbackWrapper, EnvelopeError> {
        self.fallback.as_ref().ok_or_else(|| {
            EnvelopeError::Configuration("no local secret configured for fallback wrapping".into())
        })
    }

    // ========================================================================
    // Rotation
    // ========================================================================

    /// Re-wraps every active DEK of `domain` under `new_kek_id` and returns
    /// how many were rotated. See [`EnvelopeEngine::rotate_deks_report`].
    pub async fn rotate_deks(
        &self,
        domain: &str,
        new_kek_id: &str,
        actor: &Actor,
    ) -> Result<usize, EnvelopeError> {
        Ok(self
            .rotate_deks_report(domain, new_kek_id, actor)
            .await?
            .count())
    }

    /// Re-wraps every active DEK of `domain` under `new_kek_id`.
    ///
    /// DEK identifiers and plaintext keys are unchanged, so existing
    /// ciphertexts stay decryptable. A DEK that fails to rotate keeps its
    /// previous wrapping and is listed in the report.
    ///
    /// # Errors
    ///
    /// - [`EnvelopeError::Configuration`] in fallback mode.
    /// - [`EnvelopeError::KeyNotFound`] if `new_kek_id` is not registered.
    /// - [`EnvelopeError::InvalidInput`] if `new_kek_id` is retired.
    pub async fn rotate_deks_report(
        &self,
        domain: &str,
        new_kek_id: &str,
        actor: &Actor,
    ) -> Result<RotationReport, EnvelopeError> {
        validate_domain(domain)?;
        let service = self.key_service.clone().ok_or_else(|| {
            EnvelopeError::Configuration(
                "DEK rotation requires the key service; engine is in fallback mode".into(),
            )
        })?;

        let new_kek = self
            .registry_call("kek lookup", self.registry.get_kek(new_kek_id))
            .await?
            .ok_or_else(|| EnvelopeError::KeyNotFound(format!("key encryption key {new_kek_id}")))?;
        if new_kek.status != KekStatus::Active {
            warn!(
                kek_id = %new_kek.id,
                status = %new_kek.status,
                "Refusing rotation onto inactive KEK"
            );
            return Err(EnvelopeError::InvalidInput(format!(
                "key encryption key {} is {}, rotation requires the active KEK",
                new_kek.id, new_kek.status
            )));
        }

        let deks = self
            .registry_call("dek listing", self.registry.list_active_deks(domain))
            .await?;

        let mut report = RotationReport::default();
        for dek in deks {
            match self.rotate_one(service.as_ref(), &dek, &new_kek).await {
                Ok(()) => {
                    debug!(dek_id = %dek.id, kek_id = %new_kek.id, "DEK rotated");
                    report.rotated.push(dek.id);
                }
                Err(e) => {
                    warn!(dek_id = %dek.id, error = %e, "DEK rotation failed");
                    report.failed.push(RotationFailure {
                        dek_id: dek.id,
                        reason: e.to_string(),
                    });
                }
            }
        }

        let event = AuditEvent::success(
            new_kek.id.clone(),
            actor,
            AuditMetadata::Rotate {
                domain: domain.to_string(),
                rotated: report.rotated.len(),
                failed: report.failed.iter().map(|f| f.dek_id.clone()).collect(),
            },
        );
        let event = if report.is_complete() {
            event
        } else {
            event.failed()
        };
        self.record(event).await;

        info!(
            domain = domain,
            kek_id = %new_kek.id,
            rotated = report.rotated.len(),
            failed = report.failed.len(),
            "DEK rotation finished"
        );

        Ok(report)
    }

    async fn rotate_one(
        &self,
        service: &dyn KeyService,
        dek: &DekRecord,
        new_kek: &KekRecord,
    ) -> Result<(), EnvelopeError> {
        let key = self.unwrap_dek(dek).await?;

        let wrapped = with_timeout(
            "dek wrap",
            self.config.call_timeout,
            service.wrap(&new_kek.key_name, key.as_bytes()),
        )
        .await?
        .map_err(EnvelopeError::Wrap)?;

        self.registry_call(
            "dek update",
            self.registry.update_dek_wrapping(
                &dek.id,
                &KeyWrapping::KeyService {
                    kek_id: new_kek.id.clone(),
                },
                &wrapped,
                service.wrap_algorithm(),
                now(),
            ),
        )
        .await?;

        self.cache.invalidate(&dek.id).await;
        Ok(())
    }

    // ========================================================================
    // KEK administration
    // ========================================================================

    /// Registers a new active KEK for `key_name`, retiring the previous one.
    ///
    /// The key service must be able to wrap under `key_name` first.
    pub async fn create_kek(
        &self,
        key_name: &str,
        actor: &Actor,
    ) -> Result<KekRecord, EnvelopeError> {
        let _guard = self.kek_init.lock().await;
        self.register_kek(key_name, actor).await
    }

    /// Returns the active KEK, if any.
    pub async fn active_kek(&self) -> Result<Option<KekRecord>, EnvelopeError> {
        self.registry_call("kek lookup", self.registry.active_kek())
            .await
    }

    async fn register_kek(
        &self,
        key_name: &str,
        actor: &Actor,
    ) -> Result<KekRecord, EnvelopeError> {
        let service = self.key_service.as_ref().ok_or_else(|| {
            EnvelopeError::Configuration(
                "cannot register a KEK while the engine is in fallback mode".into(),
            )
        })?;
        if key_name.trim().is_empty() {
            return Err(EnvelopeError::InvalidInput("KEK key name must not be empty".into()));
        }

        let probe = SymmetricKey::generate();
        with_timeout(
            "kek probe",
            self.config.call_timeout,
            service.wrap(key_name, probe.as_bytes()),
        )
        .await?
        .map_err(EnvelopeError::Wrap)?;

        let kek = KekRecord {
            id: random::generate_id(),
            key_name: key_name.to_string(),
            status: KekStatus::Active,
            created_at: now(),
        };
        self.registry_call("kek insert", self.registry.insert_kek(&kek))
            .await?;

        info!(kek_id = %kek.id, key_name = key_name, "KEK registered");
        self.record(AuditEvent::success(
            &kek.id,
            actor,
            AuditMetadata::CreateKek {
                key_name: key_name.to_string(),
            },
        ))
        .await;

        Ok(kek)
    }

    /// Returns the active KEK, registering the configured default key name
    /// when none exists yet.
    async fn ensure_active_kek(&self) -> Result<KekRecord, EnvelopeError> {
        if let Some(kek) = self.active_kek().await? {
            return Ok(kek);
        }

        let _guard = self.kek_init.lock().await;
        if let Some(kek) = self.active_kek().await? {
            return Ok(kek);
        }
        info!(
            key_name = %self.config.default_kek_name,
            "No active KEK; registering default"
        );
        self.register_kek(&self.config.default_kek_name, &Actor::system())
            .await
    }

    // ========================================================================
    // Helpers
    // ========================================================================

    async fn registry_call<T>(
        &self,
        operation: &'static str,
        fut: impl Future<Output = Result<T, StorageError>>,
    ) -> Result<T, EnvelopeError> {
        Ok(with_timeout(operation, self.config.call_timeout, fut).await??)
    }

    async fn record_usage(&self, dek_id: &str) {
        if let Err(e) = self
            .registry_call("usage update", self.registry.record_dek_usage(dek_id, now()))
            .await
        {
            warn!(dek_id = dek_id, error = %e, "Failed to record DEK usage");
        }
    }

    async fn record(&self, event: AuditEvent) {
        if let Err(e) = self.audit.append(event).await {
            warn!(error = %e, "Audit write failed; operation continues");
        }
    }
}

impl std::fmt::Debug for EnvelopeEngine {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("EnvelopeEngine")
            .field("fallback_mode", &self.is_fallback_mode())
            .field("config", &self.config)
            .finish_non_exhaustive()
    }
}
