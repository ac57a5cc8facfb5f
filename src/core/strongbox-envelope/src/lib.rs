//! # Strongbox Envelope Engine
//!
//! Envelope encryption for tenant data: payloads are encrypted with
//! per-domain data encryption keys (DEKs), and DEKs are stored only wrapped
//! by a master key (KEK) held in an external key service.
//!
//! ## Features
//!
//! - Lazy, race-free DEK provisioning per `(domain, tenant)`
//! - AES-256-GCM payload encryption with a fresh nonce per call
//! - Time-bounded cache of unwrapped DEKs
//! - DEK rotation onto a new KEK without touching existing ciphertexts
//! - Degraded fallback mode when the key service is unreachable
//! - Hash-chained, optionally signed audit log with integrity verification
//!
//! ## Wire Format
//!
//! Envelopes serialize as
//! `{"ciphertext": b64, "dekId": "...", "iv": b64, "authTag": b64}`.

#![forbid(unsafe_code)]
#![warn(missing_docs)]

pub mod audit;
pub mod cache;
pub mod config;
pub mod engine;
pub mod envelope;
pub mod error;

mod timeout;

pub use audit::{Actor, AuditChain, AuditEvent, AuditMetadata, ChainVerification};
pub use cache::{DekCache, DEFAULT_CACHE_TTL};
pub use config::EngineConfig;
pub use engine::{EnvelopeEngine, RotationFailure, RotationReport};
pub use envelope::EncryptedData;
pub use error::EnvelopeError;
