//! Signature deduplication
//!
//! Remembers every signature the pipeline has handled for a retention
//! window so nothing is forwarded downstream twice. The in-process map is
//! capped; when the cap pushes out an entry that is still inside its window,
//! the entry is spilled to the shared store for the rest of its lifetime.

use dashmap::mapref::entry::Entry;
use dashmap::DashMap;
use std::collections::VecDeque;
use std::sync::atomic::{AtomicU64, Ordering};
use std::sync::{Arc, Mutex};
use std::time::{Duration, Instant};
use tracing::{debug, warn};

use crate::cache::{keys, KvStore};
use crate::config::DedupConfig;
use crate::types::short;

/// Configuration for the dedup cache
#[derive(Debug, Clone)]
pub struct DedupCacheConfig {
    /// How long a signature is remembered
    pub retention: Duration,
    /// Maximum entries kept in process
    pub max_entries: usize,
}

impl Default for DedupCacheConfig {
    fn default() -> Self {
        Self {
            retention: Duration::from_secs(3600),
            max_entries: 100_000,
        }
    }
}

impl From<&DedupConfig> for DedupCacheConfig {
    fn from(config: &DedupConfig) -> Self {
        Self {
            retention: Duration::from_secs(config.retention_secs),
            max_entries: config.max_entries.max(1),
        }
    }
}

/// Insertion-ordered record used for eviction
struct SeenEntry {
    signature: String,
    seen_at: Instant,
}

/// Entry pushed out of the local map while still live
///
/// It stays in the local map until the store write finishes, so there is
/// no moment where neither side knows the signature.
struct Overflow {
    signature: String,
    seen_at: Instant,
    remaining: Duration,
}

/// Time-windowed, capped record of processed signatures
pub struct DedupCache {
    config: DedupCacheConfig,
    /// signature -> first-seen instant
    entries: DashMap<String, Instant>,
    /// Oldest first
    order: Mutex<VecDeque<SeenEntry>>,
    /// Spill target for capacity evictions
    store: Option<Arc<dyn KvStore>>,
    overflowed: AtomicU64,
}

impl DedupCache {
    /// Create a cache without overflow persistence
    pub fn new(config: DedupCacheConfig) -> Self {
        Self {
            entries: DashMap::with_capacity(config.max_entries.min(65_536)),
            order: Mutex::new(VecDeque::new()),
            store: None,
            overflowed: AtomicU64::new(0),
            config,
        }
    }

    /// Create a cache that spills capacity evictions into a shared store
    pub fn with_store(config: DedupCacheConfig, store: Arc<dyn KvStore>) -> Self {
        let mut cache = Self::new(config);
        cache.store = Some(store);
        cache
    }

    fn is_live(&self, seen_at: Instant) -> bool {
        seen_at.elapsed() < self.config.retention
    }

    /// Check the in-process map only
    pub fn seen_local(&self, signature: &str) -> bool {
        self.entries
            .get(signature)
            .map(|seen_at| self.is_live(*seen_at))
            .unwrap_or(false)
    }

    /// Has this signature been processed inside the retention window?
    ///
    /// A store failure counts as "not seen": we would rather process a
    /// signature twice than lose it.
    pub async fn seen(&self, signature: &str) -> bool {
        if self.seen_local(signature) {
            return true;
        }
        self.seen_in_store(signature).await
    }

    /// Record a signature as processed
    ///
    /// A signature that is already live keeps its first-seen instant.
    pub async fn mark_seen(&self, signature: &str) {
        let now = Instant::now();
        let inserted = match self.entries.entry(signature.to_string()) {
            Entry::Occupied(mut occupied) => {
                if self.is_live(*occupied.get()) {
                    false
                } else {
                    occupied.insert(now);
                    true
                }
            }
            Entry::Vacant(vacant) => {
                vacant.insert(now);
                true
            }
        };
        if inserted {
            self.record_order(signature, now).await;
        }
    }

    /// Atomically mark a signature, returning false if it was already seen
    ///
    /// Two loops racing on the same signature get exactly one `true`.
    pub async fn claim(&self, signature: &str) -> bool {
        let now = Instant::now();
        let claimed = match self.entries.entry(signature.to_string()) {
            Entry::Occupied(mut occupied) => {
                if self.is_live(*occupied.get()) {
                    false
                } else {
                    occupied.insert(now);
                    true
                }
            }
            Entry::Vacant(vacant) => {
                vacant.insert(now);
                true
            }
        };

        if !claimed {
            return false;
        }

        self.record_order(signature, now).await;

        // It may have been spilled by an earlier capacity eviction
        !self.seen_in_store(signature).await
    }

    /// Number of signatures held in process
    pub fn size(&self) -> usize {
        self.entries.len()
    }

    /// Number of live entries spilled to the store so far
    pub fn overflowed(&self) -> u64 {
        self.overflowed.load(Ordering::Relaxed)
    }

    /// Drop expired entries, returns how many were removed
    pub fn prune(&self) -> usize {
        let mut order = self.order.lock().unwrap_or_else(|e| e.into_inner());
        let before = self.entries.len();
        while let Some(front) = order.front() {
            if self.is_live(front.seen_at) {
                break;
            }
            if let Some(removed) = order.pop_front() {
                self.entries
                    .remove_if(&removed.signature, |_, seen_at| *seen_at == removed.seen_at);
            }
        }
        before.saturating_sub(self.entries.len())
    }

    /// Clear all local entries
    pub fn clear(&self) {
        self.entries.clear();
        self.order.lock().unwrap_or_else(|e| e.into_inner()).clear();
    }

    async fn record_order(&self, signature: &str, seen_at: Instant) {
        let overflow = {
            let mut order = self.order.lock().unwrap_or_else(|e| e.into_inner());
            order.push_back(SeenEntry {
                signature: signature.to_string(),
                seen_at,
            });
            self.evict_locked(&mut order)
        };

        // Store writes happen after the lock is released
        for entry in overflow {
            self.spill(entry).await;
        }
    }

    /// Evict expired entries and anything over capacity, oldest first
    fn evict_locked(&self, order: &mut VecDeque<SeenEntry>) -> Vec<Overflow> {
        let mut overflow = Vec::new();
        while let Some(front) = order.front() {
            let expired = !self.is_live(front.seen_at);
            let over_capacity = order.len() > self.config.max_entries;
            if !expired && !over_capacity {
                break;
            }
            let Some(removed) = order.pop_front() else {
                break;
            };
            let is_current = self
                .entries
                .get(&removed.signature)
                .map(|seen_at| *seen_at == removed.seen_at)
                .unwrap_or(false);

            if is_current && !expired && self.store.is_some() {
                // Removed locally once the store has it
                let remaining = self
                    .config
                    .retention
                    .saturating_sub(removed.seen_at.elapsed());
                overflow.push(Overflow {
                    signature: removed.signature,
                    seen_at: removed.seen_at,
                    remaining,
                });
            } else if is_current {
                self.entries
                    .remove_if(&removed.signature, |_, seen_at| *seen_at == removed.seen_at);
            }
        }
        overflow
    }

    async fn spill(&self, entry: Overflow) {
        let Some(store) = &self.store else {
            return;
        };
        let result = store
            .set(
                &keys::dedup(&entry.signature),
                "1".to_string(),
                Some(entry.remaining),
            )
            .await;

        match result {
            Ok(()) => {
                self.overflowed.fetch_add(1, Ordering::Relaxed);
                debug!(signature = %short(&entry.signature), "Spilled dedup entry to store");
            }
            Err(e) => {
                warn!(
                    signature = %short(&entry.signature),
                    error = %e,
                    "Dedup overflow write failed, signature may be reprocessed"
                );
            }
        }

        self.entries
            .remove_if(&entry.signature, |_, seen_at| *seen_at == entry.seen_at);
    }

    async fn seen_in_store(&self, signature: &str) -> bool {
        let Some(store) = &self.store else {
            return false;
        };
        match store.get(&keys::dedup(signature)).await {
            Ok(found) => found.is_some(),
            Err(e) => {
                warn!(
                    signature = %short(signature),
                    error = %e,
                    "Dedup store lookup failed, treating as unseen"
                );
                false
            }
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::cache::MemoryStore;

    fn config(retention_ms: u64, max_entries: usize) -> DedupCacheConfig {
        DedupCacheConfig {
            retention: Duration::from_millis(retention_ms),
            max_entries,
        }
    }

    #[tokio::test]
    async fn test_mark_then_seen() {
        let cache = DedupCache::new(config(60_000, 100));
        assert!(!cache.seen("sig1").await);

        cache.mark_seen("sig1").await;
        assert!(cache.seen("sig1").await);
        assert!(!cache.seen("sig2").await);
        assert_eq!(cache.size(), 1);
    }

    #[tokio::test]
    async fn test_entries_expire_after_retention() {
        let cache = DedupCache::new(config(30, 100));
        cache.mark_seen("sig1").await;
        assert!(cache.seen("sig1").await);

        tokio::time::sleep(Duration::from_millis(50)).await;
        assert!(!cache.seen("sig1").await);
        assert_eq!(cache.prune(), 1);
        assert_eq!(cache.size(), 0);
    }

    #[tokio::test]
    async fn test_claim_is_exclusive() {
        let cache = DedupCache::new(config(60_000, 100));
        assert!(cache.claim("sig1").await);
        assert!(!cache.claim("sig1").await);
        assert!(cache.seen("sig1").await);
    }

    #[tokio::test]
    async fn test_concurrent_claims_single_winner() {
        let cache = Arc::new(DedupCache::new(config(60_000, 1_000)));
        let mut handles = Vec::new();
        for _ in 0..16 {
            let cache = cache.clone();
            handles.push(tokio::spawn(async move { cache.claim("contested").await }));
        }

        let mut winners = 0;
        for handle in handles {
            if handle.await.unwrap() {
                winners += 1;
            }
        }
        assert_eq!(winners, 1);
    }

    #[tokio::test]
    async fn test_capacity_evicts_oldest_first() {
        let cache = DedupCache::new(config(60_000, 2));
        cache.mark_seen("a").await;
        cache.mark_seen("b").await;
        cache.mark_seen("c").await;

        assert_eq!(cache.size(), 2);
        assert!(!cache.seen_local("a"));
        assert!(cache.seen_local("b"));
        assert!(cache.seen_local("c"));
    }

    #[tokio::test]
    async fn test_overflow_spills_to_store() {
        let store = Arc::new(MemoryStore::new());
        let cache = DedupCache::with_store(config(60_000, 2), store.clone());
        cache.mark_seen("a").await;
        cache.mark_seen("b").await;
        cache.mark_seen("c").await;

        assert_eq!(cache.overflowed(), 1);
        assert!(!cache.seen_local("a"));
        // Still seen via the store
        assert!(cache.seen("a").await);
        assert!(!cache.claim("a").await);
    }

    /// Store whose writes for one key take a while to land
    struct SlowWrites {
        inner: MemoryStore,
        slow_key: String,
        delay: Duration,
    }

    #[async_trait::async_trait]
    impl KvStore for SlowWrites {
        async fn get(&self, key: &str) -> crate::error::Result<Option<String>> {
            self.inner.get(key).await
        }

        async fn set(
            &self,
            key: &str,
            value: String,
            ttl: Option<Duration>,
        ) -> crate::error::Result<()> {
            if key == self.slow_key {
                tokio::time::sleep(self.delay).await;
            }
            self.inner.set(key, value, ttl).await
        }

        async fn delete(&self, key: &str) -> crate::error::Result<()> {
            self.inner.delete(key).await
        }
    }

    #[tokio::test]
    async fn test_claim_during_spill_is_rejected() {
        let store = Arc::new(SlowWrites {
            inner: MemoryStore::new(),
            slow_key: keys::dedup("a"),
            delay: Duration::from_millis(50),
        });
        let cache = Arc::new(DedupCache::with_store(config(60_000, 1), store));
        assert!(cache.claim("a").await);

        // Claiming "b" pushes "a" out; its store write is still in flight
        let evicting = {
            let cache = cache.clone();
            tokio::spawn(async move { cache.claim("b").await })
        };
        tokio::time::sleep(Duration::from_millis(10)).await;

        assert!(!cache.claim("a").await);
        assert!(evicting.await.unwrap());
        assert_eq!(cache.overflowed(), 1);
        assert!(cache.seen("a").await);
    }

    #[tokio::test]
    async fn test_mark_seen_keeps_first_seen_instant() {
        let cache = DedupCache::new(config(60, 100));
        cache.mark_seen("sig1").await;
        tokio::time::sleep(Duration::from_millis(30)).await;
        cache.mark_seen("sig1").await;

        // Retention counts from the first mark
        tokio::time::sleep(Duration::from_millis(45)).await;
        assert!(!cache.seen("sig1").await);
        assert_eq!(cache.prune(), 1);
    }

    #[tokio::test]
    async fn test_store_outage_fails_open() {
        let store = Arc::new(MemoryStore::new());
        let cache = DedupCache::with_store(config(60_000, 1), store.clone());
        cache.mark_seen("a").await;
        cache.mark_seen("b").await;

        store.set_unavailable(true);
        // "a" only lives in the store, which is down: treated as unseen
        assert!(!cache.seen("a").await);
        // Local entries are unaffected
        assert!(cache.seen("b").await);
    }
}
