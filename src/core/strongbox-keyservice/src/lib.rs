//! # Strongbox Key Service
//!
//! Boundary to the HSM-backed key service that holds the KEKs.
//!
//! - [`KeyService`]: wrap/unwrap/sign contract implemented by adapters.
//! - [`LocalKeyService`]: software implementation deriving per-key-name keys
//!   from a master key. Suitable for development and tests; production
//!   deployments plug an HSM adapter in its place.
//! - [`FallbackWrapper`]: local-secret wrapping used when no key service is
//!   reachable.

#![forbid(unsafe_code)]
#![warn(missing_docs)]

pub mod error;
pub mod fallback;
pub mod local;
pub mod service;

pub use error::KeyServiceError;
pub use fallback::FallbackWrapper;
pub use local::LocalKeyService;
pub use service::KeyService;
