//! Time-bounded cache of unwrapped DEKs.
//!
//! Entries expire `ttl` after they were fetched; an expired entry is a miss
//! and the caller unwraps again. Two callers missing at the same time both
//! unwrap and both `put`; the last write wins, which is harmless because
//! they hold the same key.

use std::collections::HashMap;
use std::time::Duration;

use tokio::sync::RwLock;
use tokio::time::Instant;

use strongbox_crypto::SymmetricKey;

/// Default lifetime of a cached DEK.
pub const DEFAULT_CACHE_TTL: Duration = Duration::from_secs(5 * 60);

struct CachedDek {
    key: SymmetricKey,
    fetched_at: Instant,
}

/// Process-local DEK cache. Never persisted, never logged.
pub struct DekCache {
    entries: RwLock<HashMap<String, CachedDek>>,
    ttl: Duration,
}

impl DekCache {
    /// Creates an empty cache.
    pub fn new(ttl: Duration) -> Self {
        Self {
            entries: RwLock::new(HashMap::new()),
            ttl,
        }
    }

    /// Entry lifetime.
    pub fn ttl(&self) -> Duration {
        self.ttl
    }

    /// Returns the cached key if it was fetched less than `ttl` ago.
    pub async fn get(&self, dek_id: &str) -> Option<SymmetricKey> {
        let entries = self.entries.read().await;
        entries
            .get(dek_id)
            .filter(|entry| entry.fetched_at.elapsed() < self.ttl)
            .map(|entry| entry.key.clone())
    }

    /// Stores a key, replacing any previous entry and resetting its age.
    pub async fn put(&self, dek_id: &str, key: SymmetricKey) {
        let mut entries = self.entries.write().await;
        entries.insert(
            dek_id.to_string(),
            CachedDek {
                key,
                fetched_at: Instant::now(),
            },
        );
    }

    /// Removes one entry. Returns `true` if it was present.
    pub async fn invalidate(&self, dek_id: &str) -> bool {
        self.entries.write().await.remove(dek_id).is_some()
    }

    /// Removes every entry.
    pub async fn clear(&self) {
        self.entries.write().await.clear();
    }

    /// Drops expired entries and returns how many were removed.
    pub async fn purge_expired(&self) -> usize {
        let mut entries = self.entries.write().await;
        let before = entries.len();
        entries.retain(|_, entry| entry.fetched_at.elapsed() < self.ttl);
        before - entries.len()
    }

    /// Number of entries, expired or not.
    pub async fn len(&self) -> usize {
        self.entries.read().await.len()
    }

    /// Returns `true` if the cache holds no entries.
    pub async fn is_empty(&self) -> bool {
        self.entries.read().await.is_empty()
    }
}

impl Default for DekCache {
    fn default() -> Self {
        Self::new(DEFAULT_CACHE_TTL)
    }
}

impl std::fmt::Debug for DekCache {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("DekCache")
            .field("ttl", &self.ttl)
            .finish_non_exhaustive()
    }
}

#[cfg(test)]
#[allow(clippy::disallowed_methods)]
mod tests {
    use super::*;
    use std::sync::Arc;

    #[tokio::test(start_paused = true)]
    async fn test_entry_expires_after_ttl() {
        let cache = DekCache::default();
        let key = SymmetricKey::generate();
        cache.put("d1", key.clone()).await;

        tokio::time::advance(Duration::from_secs(299)).await;
        assert_eq!(cache.get("d1").await.unwrap().as_bytes(), key.as_bytes());

        tokio::time::advance(Duration::from_secs(1)).await;
        assert!(cache.get("d1").await.is_none());
    }

    #[tokio::test(start_paused = true)]
    async fn test_put_resets_age() {
        let cache = DekCache::new(Duration::from_secs(10));
        cache.put("d1", SymmetricKey::generate()).await;

        tokio::time::advance(Duration::from_secs(8)).await;
        cache.put("d1", SymmetricKey::generate()).await;
        tokio::time::advance(Duration::from_secs(8)).await;

        assert!(cache.get("d1").await.is_some());
    }

    #[tokio::test(start_paused = true)]
    async fn test_purge_expired() {
        let cache = DekCache::new(Duration::from_secs(10));
        cache.put("old", SymmetricKey::generate()).await;
        tokio::time::advance(Duration::from_secs(11)).await;
        cache.put("fresh", SymmetricKey::generate()).await;

        assert_eq!(cache.len().await, 2);
        assert_eq!(cache.purge_expired().await, 1);
        assert!(cache.get("fresh").await.is_some());
    }

    #[tokio::test]
    async fn test_invalidate_and_clear() {
        let cache = DekCache::default();
        cache.put("a", SymmetricKey::generate()).await;
        cache.put("b", SymmetricKey::generate()).await;

        assert!(cache.invalidate("a").await);
        assert!(!cache.invalidate("a").await);
        assert!(cache.get("a").await.is_none());
        assert!(cache.get("b").await.is_some());

        cache.clear().await;
        assert!(cache.is_empty().await);
    }

    #[tokio::test]
    async fn test_concurrent_access() {
        let cache = Arc::new(DekCache::default());
        let mut handles = Vec::new();

        for i in 0..32 {
            let cache = Arc::clone(&cache);
            handles.push(tokio::spawn(async move {
                let id = format!("dek-{}", i % 4);
                cache.put(&id, SymmetricKey::generate()).await;
                cache.get(&id).await.is_some()
            }));
        }

        for handle in handles {
            assert!(handle.await.unwrap());
        }
        assert_eq!(cache.len().await, 4);
    }

    #[test]
    fn test_debug_hides_keys() {
        let debug_str = format!("{:?}", DekCache::default());
        assert!(debug_str.starts_with("DekCache"));
        assert!(!debug_str.contains("entries"));
    }
}
