//! Hash-chained audit log.
//!
//! Every entry stores the SHA-256 hash of its own canonical content and the
//! hash of its predecessor, so deleting, reordering or rewriting an entry
//! breaks the chain. When a key service is available, each entry hash is
//! also signed with the active KEK.
//!
//! Appends are serialized twice over: a process-local mutex orders writers in
//! this engine, and the registry rejects a second entry with the same
//! predecessor, which catches writers in other processes.

use std::sync::Arc;
use std::time::{Duration, SystemTime, UNIX_EPOCH};

use base64::{engine::general_purpose::STANDARD as BASE64, Engine};
use serde::{Deserialize, Serialize};
use tokio::sync::Mutex;
use tokio::time::{sleep, Instant};
use tracing::{debug, warn};

use strongbox_crypto::{digest, random};
use strongbox_keyservice::KeyService;
use strongbox_storage::{
    AuditOperation, AuditRecord, AuditStatus, KeyRegistry, NewAuditRecord, ResourceType,
    StorageError,
};

use crate::error::EnvelopeError;
use crate::timeout::with_timeout;

/// Number of entries fetched per page during verification.
const VERIFY_PAGE_SIZE: usize = 500;

/// Upper bound of the pause between append attempts when another writer took
/// the chain head first.
const APPEND_BACKOFF_MAX_MS: u64 = 20;

fn now() -> u64 {
    SystemTime::now()
        .duration_since(UNIX_EPOCH)
        .map(|d| d.as_secs())
        .unwrap_or(0)
}

/// Jittered pause before append attempt `attempt + 1`, growing with the
/// number of lost races.
fn append_backoff(attempt: u32) -> Duration {
    let ceiling = (u64::from(attempt) * 2).min(APPEND_BACKOFF_MAX_MS);
    let jitter = u64::from(random::generate_bytes(1)[0]) % (ceiling + 1);
    Duration::from_millis(jitter)
}

// ============================================================================
// Types
// ============================================================================

/// Who performed an operation.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct Actor {
    /// User or service identity.
    pub id: String,
    /// Origin such as an IP address or calling service.
    pub origin: Option<String>,
}

impl Actor {
    /// Creates an actor without origin.
    pub fn new(id: impl Into<String>) -> Self {
        Self {
            id: id.into(),
            origin: None,
        }
    }

    /// Sets the origin.
    pub fn with_origin(mut self, origin: impl Into<String>) -> Self {
        self.origin = Some(origin.into());
        self
    }

    /// The engine itself, used when callers do not identify themselves.
    pub fn system() -> Self {
        Self::new("system")
    }
}

/// Operation-specific details recorded on an entry.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
#[serde(tag = "event", rename_all = "snake_case")]
pub enum AuditMetadata {
    /// A payload was encrypted.
    Encrypt {
        /// Domain of the DEK.
        domain: String,
        /// Tenant of the DEK.
        tenant_id: Option<String>,
        /// Plaintext length in bytes.
        plaintext_len: usize,
    },
    /// A payload was decrypted, or failed authentication.
    Decrypt {
        /// Domain of the DEK.
        domain: String,
        /// Tenant of the DEK.
        tenant_id: Option<String>,
    },
    /// A DEK was provisioned.
    CreateDek {
        /// Domain of the DEK.
        domain: String,
        /// Tenant of the DEK.
        tenant_id: Option<String>,
        /// Wrapping KEK identifier, or the fallback identifier.
        kek_id: String,
    },
    /// A KEK was registered.
    CreateKek {
        /// Key name inside the key service.
        key_name: String,
    },
    /// The DEKs of a domain were re-wrapped under a new KEK. Recorded against
    /// the target KEK.
    Rotate {
        /// Domain whose DEKs were rotated.
        domain: String,
        /// DEKs re-wrapped.
        rotated: usize,
        /// DEKs left on their previous KEK.
        failed: Vec<String>,
    },
}

impl AuditMetadata {
    /// Operation recorded for this event.
    pub fn operation(&self) -> AuditOperation {
        match self {
            Self::Encrypt { .. } => AuditOperation::Encrypt,
            Self::Decrypt { .. } => AuditOperation::Decrypt,
            Self::CreateDek { .. } | Self::CreateKek { .. } => AuditOperation::Create,
            Self::Rotate { .. } => AuditOperation::Rotate,
        }
    }

    /// Resource kind recorded for this event.
    pub fn resource_type(&self) -> ResourceType {
        match self {
            Self::CreateKek { .. } | Self::Rotate { .. } => ResourceType::Kek,
            _ => ResourceType::Dek,
        }
    }
}

/// An event to append to the chain.
#[derive(Debug, Clone)]
pub struct AuditEvent {
    /// DEK or KEK identifier.
    pub resource_id: String,
    /// Who performed the operation.
    pub actor: Actor,
    /// Operation details.
    pub metadata: AuditMetadata,
    /// Outcome.
    pub status: AuditStatus,
}

impl AuditEvent {
    /// Creates a successful event.
    pub fn success(
        resource_id: impl Into<String>,
        actor: &Actor,
        metadata: AuditMetadata,
    ) -> Self {
        Self {
            resource_id: resource_id.into(),
            actor: actor.clone(),
            metadata,
            status: AuditStatus::Success,
        }
    }

    /// Marks the event as failed.
    pub fn failed(mut self) -> Self {
        self.status = AuditStatus::Failure;
        self
    }
}

/// Result of a chain verification.
#[derive(Debug, Clone, PartialEq, Eq, Serialize)]
#[serde(rename_all = "camelCase")]
pub struct ChainVerification {
    /// Whether the chain is intact.
    pub valid: bool,
    /// Sequence number of the first inconsistent entry.
    pub broken_at: Option<u64>,
    /// Entries examined.
    pub entries_checked: u64,
    /// Human-readable summary.
    pub message: String,
}

#[derive(Serialize)]
#[serde(rename_all = "camelCase")]
struct HashInput<'a> {
    operation: AuditOperation,
    resource_type: ResourceType,
    resource_id: &'a str,
    actor: &'a str,
    actor_origin: Option<&'a str>,
    timestamp: u64,
    previous_hash: Option<&'a str>,
    metadata: &'a str,
    status: AuditStatus,
}

/// Computes the content hash of an entry: hex SHA-256 over the canonical JSON
/// of its fields (the signature fields excluded).
pub fn compute_entry_hash(entry: &NewAuditRecord) -> Result<String, EnvelopeError> {
    let input = HashInput {
        operation: entry.operation,
        resource_type: entry.resource_type,
        resource_id: &entry.resource_id,
        actor: &entry.actor,
        actor_origin: entry.actor_origin.as_deref(),
        timestamp: entry.timestamp,
        previous_hash: entry.previous_hash.as_deref(),
        metadata: &entry.metadata,
        status: entry.status,
    };
    let canonical =
        serde_json::to_vec(&input).map_err(|e| EnvelopeError::AuditWrite(e.to_string()))?;
    Ok(digest::sha256_hex(&canonical))
}

fn stored_hash(entry: &AuditRecord) -> Result<String, EnvelopeError> {
    compute_entry_hash(&NewAuditRecord {
        operation: entry.operation,
        resource_type: entry.resource_type,
        resource_id: entry.resource_id.clone(),
        actor: entry.actor.clone(),
        actor_origin: entry.actor_origin.clone(),
        timestamp: entry.timestamp,
        entry_hash: String::new(),
        previous_hash: entry.previous_hash.clone(),
        signature: None,
        signing_key_id: None,
        metadata: entry.metadata.clone(),
        status: entry.status,
    })
}

// ============================================================================
// Verification
// ============================================================================

/// Incremental chain checker, fed one entry at a time in sequence order.
pub(crate) struct ChainVerifier {
    check_contents: bool,
    previous: Option<String>,
    checked: u64,
}

impl ChainVerifier {
    pub(crate) fn new(check_contents: bool) -> Self {
        Self {
            check_contents,
            previous: None,
            checked: 0,
        }
    }

    /// Checks one entry. Returns a description of the defect, if any.
    pub(crate) fn check(&mut self, entry: &AuditRecord) -> Option<String> {
        if self.checked == 0 && entry.previous_hash.is_some() {
            return Some(format!(
                "entry {} is the oldest entry but links to a predecessor",
                entry.sequence
            ));
        }
        if self.checked > 0 && entry.previous_hash != self.previous {
            return Some(format!(
                "entry {} does not link to the hash of entry {}",
                entry.sequence,
                entry.sequence.saturating_sub(1)
            ));
        }

        if self.check_contents {
            match stored_hash(entry) {
                Ok(hash) if hash == entry.entry_hash => {}
                Ok(_) => {
                    return Some(format!(
                        "entry {} content does not match its hash",
                        entry.sequence
                    ))
                }
                Err(e) => return Some(format!("entry {} cannot be hashed: {e}", entry.sequence)),
            }
        }

        self.previous = Some(entry.entry_hash.clone());
        self.checked += 1;
        None
    }

    pub(crate) fn finish(self) -> ChainVerification {
        ChainVerification {
            valid: true,
            broken_at: None,
            entries_checked: self.checked,
            message: format!("audit chain intact ({} entries)", self.checked),
        }
    }

    fn broken(&self, sequence: u64, message: String) -> ChainVerification {
        ChainVerification {
            valid: false,
            broken_at: Some(sequence),
            entries_checked: self.checked + 1,
            message,
        }
    }
}

// ============================================================================
// Chain
// ============================================================================

/// Append-only audit chain stored in a [`KeyRegistry`].
pub struct AuditChain {
    registry: Arc<dyn KeyRegistry>,
    signer: Option<Arc<dyn KeyService>>,
    call_timeout: Duration,
    writer: Mutex<()>,
}

impl AuditChain {
    /// Creates a chain. With a `signer`, entries are signed with the active
    /// KEK; without one they are stored unsigned.
    pub fn new(
        registry: Arc<dyn KeyRegistry>,
        signer: Option<Arc<dyn KeyService>>,
        call_timeout: Duration,
    ) -> Self {
        Self {
            registry,
            signer,
            call_timeout,
            writer: Mutex::new(()),
        }
    }

    /// Appends an event after the current chain head.
    ///
    /// Writers in other processes can take the head between the lookup and
    /// the insert. The append then re-reads the head and tries again until
    /// it lands or the call timeout elapses.
    ///
    /// # Errors
    ///
    /// Any failure is reported as [`EnvelopeError::AuditWrite`].
    pub async fn append(&self, event: AuditEvent) -> Result<AuditRecord, EnvelopeError> {
        let _guard = self.writer.lock().await;

        let deadline = Instant::now() + self.call_timeout;
        let mut attempt: u32 = 1;
        loop {
            match self.try_append(&event).await {
                Ok(record) => return Ok(record),
                Err(EnvelopeError::Storage(StorageError::AlreadyExists(_))) => {
                    if Instant::now() >= deadline {
                        return Err(EnvelopeError::AuditWrite(format!(
                            "chain head still contended after {attempt} attempts"
                        )));
                    }
                    debug!(attempt, "Audit chain head moved; retrying append");
                    sleep(append_backoff(attempt)).await;
                    attempt = attempt.saturating_add(1);
                }
                Err(e @ EnvelopeError::AuditWrite(_)) => return Err(e),
                Err(e) => return Err(EnvelopeError::AuditWrite(e.to_string())),
            }
        }
    }

    async fn try_append(&self, event: &AuditEvent) -> Result<AuditRecord, EnvelopeError> {
        let head = with_timeout(
            "audit head lookup",
            self.call_timeout,
            self.registry.latest_audit_entry(),
        )
        .await??;

        let metadata = serde_json::to_string(&event.metadata)
            .map_err(|e| EnvelopeError::AuditWrite(e.to_string()))?;

        let mut record = NewAuditRecord {
            operation: event.metadata.operation(),
            resource_type: event.metadata.resource_type(),
            resource_id: event.resource_id.clone(),
            actor: event.actor.id.clone(),
            actor_origin: event.actor.origin.clone(),
            timestamp: now(),
            entry_hash: String::new(),
            previous_hash: head.map(|h| h.entry_hash),
            signature: None,
            signing_key_id: None,
            metadata,
            status: event.status,
        };
        record.entry_hash = compute_entry_hash(&record)?;

        if let Some((signature, kek_id)) = self.sign(&record.entry_hash).await {
            record.signature = Some(signature);
            record.signing_key_id = Some(kek_id);
        }

        let stored = with_timeout(
            "audit append",
            self.call_timeout,
            self.registry.append_audit_entry(record),
        )
        .await??;

        debug!(
            sequence = stored.sequence,
            operation = %stored.operation,
            resource_id = %stored.resource_id,
            "Audit entry appended"
        );
        Ok(stored)
    }

    /// Signs with the active KEK. Failures leave the entry unsigned.
    async fn sign(&self, entry_hash: &str) -> Option<(String, String)> {
        let signer = self.signer.as_ref()?;

        let kek = match with_timeout("kek lookup", self.call_timeout, self.registry.active_kek())
            .await
        {
            Ok(Ok(Some(kek))) => kek,
            Ok(Ok(None)) => return None,
            Ok(Err(e)) => {
                warn!(error = %e, "Cannot load active KEK; audit entry left unsigned");
                return None;
            }
            Err(e) => {
                warn!(error = %e, "Cannot load active KEK; audit entry left unsigned");
                return None;
            }
        };

        match with_timeout(
            "audit signing",
            self.call_timeout,
            signer.sign(&kek.key_name, entry_hash.as_bytes()),
        )
        .await
        {
            Ok(Ok(signature)) => Some((BASE64.encode(signature), kek.id)),
            Ok(Err(e)) => {
                warn!(error = %e, kek_id = %kek.id, "Audit signing failed; entry left unsigned");
                None
            }
            Err(e) => {
                warn!(error = %e, kek_id = %kek.id, "Audit signing failed; entry left unsigned");
                None
            }
        }
    }

    /// Verifies that every entry links to the hash stored on its predecessor.
    ///
    /// This detects deleted, inserted and reordered entries, and an entry
    /// whose stored hash was rewritten (its successor no longer links to it).
    pub async fn verify(&self) -> Result<ChainVerification, EnvelopeError> {
        self.walk(ChainVerifier::new(false)).await
    }

    /// Like [`AuditChain::verify`], and also recomputes each entry's hash
    /// from its content, so edited fields are reported at the edited entry.
    pub async fn verify_contents(&self) -> Result<ChainVerification, EnvelopeError> {
        self.walk(ChainVerifier::new(true)).await
    }

    async fn walk(&self, mut verifier: ChainVerifier) -> Result<ChainVerification, EnvelopeError> {
        let mut after = 0;
        loop {
            let page = with_timeout(
                "audit read",
                self.call_timeout,
                self.registry.list_audit_entries(after, VERIFY_PAGE_SIZE),
            )
            .await??;

            for entry in &page {
                if let Some(message) = verifier.check(entry) {
                    warn!(sequence = entry.sequence, reason = %message, "Audit chain broken");
                    return Ok(verifier.broken(entry.sequence, message));
                }
            }

            match page.last() {
                Some(last) if page.len() == VERIFY_PAGE_SIZE => after = last.sequence,
                _ => break,
            }
        }

        Ok(verifier.finish())
    }

    /// Returns all entries in sequence order.
    pub async fn entries(&self) -> Result<Vec<AuditRecord>, EnvelopeError> {
        let mut all = Vec::new();
        let mut after = 0;
        loop {
            let page = with_timeout(
                "audit read",
                self.call_timeout,
                self.registry.list_audit_entries(after, VERIFY_PAGE_SIZE),
            )
            .await??;
            let full = page.len() == VERIFY_PAGE_SIZE;
            if let Some(last) = page.last() {
                after = last.sequence;
            }
            all.extend(page);
            if !full {
                return Ok(all);
            }
        }
    }
}

impl std::fmt::Debug for AuditChain {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("AuditChain")
            .field("signed", &self.signer.is_some())
            .finish_non_exhaustive()
    }
}
