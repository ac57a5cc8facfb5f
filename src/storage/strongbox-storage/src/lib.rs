//! # Strongbox Storage
//!
//! Key registry contract for the envelope engine.
//!
//! The registry persists KEK metadata, DEK metadata (wrapped material only)
//! and the append-only audit log. Backends:
//! - [`MemoryRegistry`]: process-local, for tests and embedding.
//! - `strongbox-storage-sqlite`: durable SQLite registry.

#![forbid(unsafe_code)]
#![warn(missing_docs)]

pub mod error;
pub mod memory;
pub mod model;
pub mod registry;

pub use error::StorageError;
pub use memory::MemoryRegistry;
pub use model::{
    AuditOperation, AuditRecord, AuditStatus, DekRecord, KekRecord, KekStatus, KeyWrapping,
    NewAuditRecord, ResourceType, DEK_ALGORITHM, FALLBACK_KEK_ID,
};
pub use registry::KeyRegistry;
