//! Shared key-value store with per-entry TTL
//!
//! The pipeline keeps three kinds of data in here: the premium balance
//! cache, per-feed ingestion checkpoints and dedup entries that overflowed
//! the in-process cache. Callers treat every store error as a miss.

use async_trait::async_trait;
use dashmap::DashMap;
use std::sync::atomic::{AtomicBool, AtomicU64, Ordering};
use std::time::{Duration, Instant};
use tracing::debug;

use crate::error::{Error, Result};

/// Key prefixes used by the pipeline
pub mod keys {
    pub fn balance(wallet: &str) -> String {
        format!("balance:{}", wallet)
    }

    pub fn checkpoint(feed: &str) -> String {
        format!("checkpoint:{}", feed)
    }

    pub fn dedup(signature: &str) -> String {
        format!("dedup:{}", signature)
    }
}

/// TTL-capable key-value store
#[async_trait]
pub trait KvStore: Send + Sync {
    /// Fetch a live value
    async fn get(&self, key: &str) -> Result<Option<String>>;

    /// Store a value; `None` means no expiry
    async fn set(&self, key: &str, value: String, ttl: Option<Duration>) -> Result<()>;

    /// Remove a value
    async fn delete(&self, key: &str) -> Result<()>;

    /// Drop expired entries, returns how many were removed
    async fn purge_expired(&self) -> Result<usize> {
        Ok(0)
    }
}

/// Entry in the memory store with TTL
#[derive(Clone)]
struct StoredValue {
    value: String,
    stored_at: Instant,
    ttl: Option<Duration>,
}

impl StoredValue {
    fn is_expired(&self) -> bool {
        self.ttl
            .map(|ttl| self.stored_at.elapsed() >= ttl)
            .unwrap_or(false)
    }
}

/// In-process store backed by a concurrent hashmap
#[derive(Default)]
pub struct MemoryStore {
    entries: DashMap<String, StoredValue>,
    /// Simulated outage switch, lets callers exercise their fail-open paths
    unavailable: AtomicBool,
    hits: AtomicU64,
    misses: AtomicU64,
}

impl MemoryStore {
    pub fn new() -> Self {
        Self::default()
    }

    /// Mark the store as unreachable (every call errors) or reachable again
    pub fn set_unavailable(&self, unavailable: bool) {
        self.unavailable.store(unavailable, Ordering::SeqCst);
    }

    pub fn len(&self) -> usize {
        self.entries.len()
    }

    pub fn is_empty(&self) -> bool {
        self.entries.is_empty()
    }

    pub fn hit_rate(&self) -> f64 {
        let hits = self.hits.load(Ordering::Relaxed);
        let total = hits + self.misses.load(Ordering::Relaxed);
        if total == 0 {
            0.0
        } else {
            hits as f64 / total as f64
        }
    }

    fn check_available(&self) -> Result<()> {
        if self.unavailable.load(Ordering::SeqCst) {
            return Err(Error::Store("memory store marked unavailable".to_string()));
        }
        Ok(())
    }
}

#[async_trait]
impl KvStore for MemoryStore {
    async fn get(&self, key: &str) -> Result<Option<String>> {
        self.check_available()?;

        if let Some(entry) = self.entries.get(key) {
            if !entry.is_expired() {
                self.hits.fetch_add(1, Ordering::Relaxed);
                return Ok(Some(entry.value.clone()));
            }
            drop(entry);
            self.entries.remove_if(key, |_, v| v.is_expired());
        }
        self.misses.fetch_add(1, Ordering::Relaxed);
        Ok(None)
    }

    async fn set(&self, key: &str, value: String, ttl: Option<Duration>) -> Result<()> {
        self.check_available()?;
        self.entries.insert(
            key.to_string(),
            StoredValue {
                value,
                stored_at: Instant::now(),
                ttl,
            },
        );
        Ok(())
    }

    async fn delete(&self, key: &str) -> Result<()> {
        self.check_available()?;
        self.entries.remove(key);
        Ok(())
    }

    async fn purge_expired(&self) -> Result<usize> {
        self.check_available()?;
        let before = self.entries.len();
        self.entries.retain(|_, v| !v.is_expired());
        let removed = before.saturating_sub(self.entries.len());
        if removed > 0 {
            debug!(removed, "Purged expired store entries");
        }
        Ok(removed)
    }
}
