//! Engine configuration.

use std::time::Duration;

use zeroize::Zeroizing;

use crate::cache::DEFAULT_CACHE_TTL;

/// Default deadline for every key service and registry call.
pub const DEFAULT_CALL_TIMEOUT: Duration = Duration::from_secs(10);

/// Key service key name used when a KEK has to be registered lazily.
pub const DEFAULT_KEK_NAME: &str = "strongbox-master";

/// Configuration of an [`crate::EnvelopeEngine`].
#[derive(Clone)]
pub struct EngineConfig {
    /// Deadline applied to each external call.
    pub call_timeout: Duration,
    /// Lifetime of unwrapped DEKs in the cache.
    pub cache_ttl: Duration,
    /// Key name registered as KEK on first use when none is active.
    pub default_kek_name: String,
    /// Secret the fallback wrapping key is derived from. Required when the
    /// key service is unavailable at construction.
    pub local_secret: Option<Zeroizing<String>>,
}

impl Default for EngineConfig {
    fn default() -> Self {
        Self {
            call_timeout: DEFAULT_CALL_TIMEOUT,
            cache_ttl: DEFAULT_CACHE_TTL,
            default_kek_name: DEFAULT_KEK_NAME.to_string(),
            local_secret: None,
        }
    }
}

impl EngineConfig {
    /// Creates a configuration with defaults.
    pub fn new() -> Self {
        Self::default()
    }

    /// Sets the fallback local secret.
    pub fn with_local_secret(mut self, secret: impl Into<String>) -> Self {
        self.local_secret = Some(Zeroizing::new(secret.into()));
        self
    }

    /// Sets the external call deadline.
    pub fn with_call_timeout(mut self, timeout: Duration) -> Self {
        self.call_timeout = timeout;
        self
    }

    /// Sets the DEK cache lifetime.
    pub fn with_cache_ttl(mut self, ttl: Duration) -> Self {
        self.cache_ttl = ttl;
        self
    }

    /// Sets the key name used for lazily registered KEKs.
    pub fn with_default_kek_name(mut self, name: impl Into<String>) -> Self {
        self.default_kek_name = name.into();
        self
    }
}

impl std::fmt::Debug for EngineConfig {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("EngineConfig")
            .field("call_timeout", &self.call_timeout)
            .field("cache_ttl", &self.cache_ttl)
            .field("default_kek_name", &self.default_kek_name)
            .field(
                "local_secret",
                &self.local_secret.as_ref().map(|_| "[REDACTED]"),
            )
            .finish()
    }
}
