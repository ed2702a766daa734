//! Signature ingestion loop
//!
//! One ingestor per tracked feed. Each tick fetches signatures newer than
//! the feed checkpoint, claims them in the dedup cache, resolves them to
//! swap events and offers those to the backpressure queue. The checkpoint
//! only moves after a tick got through the fetch, so a failed tick is
//! retried from the same place.

use async_trait::async_trait;
use std::sync::atomic::{AtomicBool, AtomicU64, Ordering};
use std::sync::Arc;
use tokio::sync::Mutex;
use tracing::{debug, error, info, warn};

use crate::cache::{keys, KvStore};
use crate::lifecycle::PeriodicTask;
use crate::stream::backpressure::{Admission, BackpressureQueue};
use crate::stream::dedup::DedupCache;
use crate::stream::source::{Checkpoint, SignatureSource};
use crate::types::{short, NormalizedSwapEvent};

/// Counters for one completed tick
#[derive(Debug, Clone, Default, PartialEq, Eq)]
pub struct TickReport {
    pub fetched: usize,
    pub duplicates: usize,
    pub parsed: usize,
    pub not_swaps: usize,
    pub parse_failures: usize,
    pub accepted: usize,
    pub dropped: usize,
}

/// What happened when `tick` was called
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum TickOutcome {
    Completed(TickReport),
    /// A previous tick of this ingestor was still running
    Skipped,
    /// Signature fetch failed; the checkpoint was left untouched
    Failed(String),
}

struct IngestorState {
    checkpoint: Checkpoint,
    checkpoint_loaded: bool,
    ticks: u64,
}

/// Recurring driver for one tracked-address feed
pub struct SignatureIngestor {
    feed: String,
    addresses: Vec<String>,
    source: Arc<dyn SignatureSource>,
    dedup: Arc<DedupCache>,
    queue: Arc<BackpressureQueue<NormalizedSwapEvent>>,
    store: Option<Arc<dyn KvStore>>,
    state: Mutex<IngestorState>,
    throttled: AtomicBool,
    failed_streak: AtomicU64,
}

impl SignatureIngestor {
    pub fn new(
        feed: impl Into<String>,
        addresses: Vec<String>,
        source: Arc<dyn SignatureSource>,
        dedup: Arc<DedupCache>,
        queue: Arc<BackpressureQueue<NormalizedSwapEvent>>,
    ) -> Self {
        Self {
            feed: feed.into(),
            addresses,
            source,
            dedup,
            queue,
            store: None,
            state: Mutex::new(IngestorState {
                checkpoint: Checkpoint::default(),
                checkpoint_loaded: false,
                ticks: 0,
            }),
            throttled: AtomicBool::new(false),
            failed_streak: AtomicU64::new(0),
        }
    }

    /// Persist checkpoints to a shared store so restarts resume in place
    pub fn with_store(mut self, store: Arc<dyn KvStore>) -> Self {
        self.store = Some(store);
        self
    }

    pub fn feed(&self) -> &str {
        &self.feed
    }

    pub fn addresses(&self) -> &[String] {
        &self.addresses
    }

    /// Scheduled ticks in a row whose fetch failed
    pub fn failed_streak(&self) -> u64 {
        self.failed_streak.load(Ordering::Relaxed)
    }

    /// Current checkpoint (waits for a running tick to finish)
    pub async fn checkpoint(&self) -> Checkpoint {
        self.state.lock().await.checkpoint.clone()
    }

    /// Run one ingestion pass
    pub async fn tick(&self) -> TickOutcome {
        // Never overlap with ourselves
        let Ok(mut state) = self.state.try_lock() else {
            debug!(feed = %self.feed, "Previous tick still running, skipping");
            return TickOutcome::Skipped;
        };

        if !state.checkpoint_loaded {
            if let Some(checkpoint) = self.load_checkpoint().await {
                info!(
                    feed = %self.feed,
                    addresses = checkpoint.len(),
                    "Resuming from stored checkpoint"
                );
                state.checkpoint = checkpoint;
            }
            state.checkpoint_loaded = true;
        }

        let signatures = match self
            .source
            .fetch_signatures(&self.addresses, &state.checkpoint)
            .await
        {
            Ok(signatures) => signatures,
            Err(e) => {
                error!(feed = %self.feed, error = %e, "Signature fetch failed, will retry next tick");
                return TickOutcome::Failed(e.to_string());
            }
        };

        let mut report = TickReport::default();
        let mut next = state.checkpoint.clone();

        // Sources return newest first; process oldest first
        for signature in signatures.iter().rev() {
            report.fetched += 1;

            if !self.dedup.claim(&signature.signature).await {
                report.duplicates += 1;
                next.advance(&signature.address, &signature.signature);
                continue;
            }

            // Claimed signatures stay seen whatever the parser says
            match self.source.parse_transaction(signature).await {
                Ok(Some(event)) => {
                    report.parsed += 1;
                    match self.queue.offer(event) {
                        Admission::Accepted => report.accepted += 1,
                        Admission::Dropped => report.dropped += 1,
                    }
                }
                Ok(None) => {
                    report.not_swaps += 1;
                }
                Err(e) => {
                    report.parse_failures += 1;
                    warn!(
                        feed = %self.feed,
                        signature = %short(&signature.signature),
                        error = %e,
                        "Failed to parse transaction, skipping"
                    );
                }
            }

            next.advance(&signature.address, &signature.signature);
        }

        state.checkpoint = next;
        state.ticks += 1;
        self.save_checkpoint(&state.checkpoint).await;

        if report.fetched > 0 {
            info!(
                feed = %self.feed,
                tick = state.ticks,
                fetched = report.fetched,
                duplicates = report.duplicates,
                accepted = report.accepted,
                dropped = report.dropped,
                parse_failures = report.parse_failures,
                "Ingestion tick complete"
            );
        } else {
            debug!(feed = %self.feed, tick = state.ticks, "No new signatures");
        }

        TickOutcome::Completed(report)
    }

    async fn load_checkpoint(&self) -> Option<Checkpoint> {
        let store = self.store.as_ref()?;
        match store.get(&keys::checkpoint(&self.feed)).await {
            Ok(Some(raw)) => match serde_json::from_str(&raw) {
                Ok(checkpoint) => Some(checkpoint),
                Err(e) => {
                    warn!(feed = %self.feed, error = %e, "Stored checkpoint unreadable, starting fresh");
                    None
                }
            },
            Ok(None) => None,
            Err(e) => {
                warn!(feed = %self.feed, error = %e, "Checkpoint store unavailable, starting fresh");
                None
            }
        }
    }

    async fn save_checkpoint(&self, checkpoint: &Checkpoint) {
        let Some(store) = &self.store else {
            return;
        };
        let raw = match serde_json::to_string(checkpoint) {
            Ok(raw) => raw,
            Err(e) => {
                warn!(feed = %self.feed, error = %e, "Failed to encode checkpoint");
                return;
            }
        };
        if let Err(e) = store.set(&keys::checkpoint(&self.feed), raw, None).await {
            warn!(feed = %self.feed, error = %e, "Failed to persist checkpoint");
        }
    }
}

#[async_trait]
impl PeriodicTask for SignatureIngestor {
    /// Scheduled entry point; polls at half cadence while the queue sheds load
    async fn run(&self) {
        if self.queue.is_in_backpressure() {
            if !self.throttled.fetch_xor(true, Ordering::Relaxed) {
                debug!(feed = %self.feed, "Queue in backpressure, skipping tick");
                return;
            }
        } else {
            self.throttled.store(false, Ordering::Relaxed);
        }
        match self.tick().await {
            TickOutcome::Completed(_) => {
                let streak = self.failed_streak.swap(0, Ordering::Relaxed);
                if streak > 0 {
                    info!(feed = %self.feed, failed_ticks = streak, "Signature fetch recovered");
                }
            }
            TickOutcome::Skipped => {}
            TickOutcome::Failed(reason) => {
                let streak = self.failed_streak.fetch_add(1, Ordering::Relaxed) + 1;
                warn!(
                    feed = %self.feed,
                    failed_ticks = streak,
                    reason = %reason,
                    "Scheduled tick failed, checkpoint held"
                );
            }
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::cache::MemoryStore;
    use crate::error::{Error, Result};
    use crate::stream::backpressure::QueueLimits;
    use crate::stream::dedup::DedupCacheConfig;
    use crate::types::{SwapSide, TransactionSignature};
    use chrono::Utc;
    use std::collections::{HashMap, HashSet};
    use std::time::Duration;

    #[derive(Default)]
    struct FakeSource {
        /// Returned on every fetch regardless of checkpoint
        signatures: std::sync::Mutex<Vec<TransactionSignature>>,
        failing: HashSet<String>,
        not_swaps: HashSet<String>,
        fail_fetch: AtomicBool,
        parse_delay: Option<Duration>,
        parse_calls: std::sync::Mutex<HashMap<String, u32>>,
        fetch_checkpoints: std::sync::Mutex<Vec<Checkpoint>>,
    }

    impl FakeSource {
        fn with_signatures(sigs: &[&str]) -> Self {
            let source = Self::default();
            // Newest first, like a real RPC
            *source.signatures.lock().unwrap() = sigs
                .iter()
                .rev()
                .map(|s| TransactionSignature::new(*s, "addr1"))
                .collect();
            source
        }

        fn parse_calls(&self, sig: &str) -> u32 {
            *self.parse_calls.lock().unwrap().get(sig).unwrap_or(&0)
        }
    }

    #[async_trait]
    impl SignatureSource for FakeSource {
        async fn fetch_signatures(
            &self,
            _addresses: &[String],
            since: &Checkpoint,
        ) -> Result<Vec<TransactionSignature>> {
            self.fetch_checkpoints.lock().unwrap().push(since.clone());
            if self.fail_fetch.load(Ordering::SeqCst) {
                return Err(Error::Rpc("connection reset".into()));
            }
            Ok(self.signatures.lock().unwrap().clone())
        }

        async fn parse_transaction(
            &self,
            signature: &TransactionSignature,
        ) -> Result<Option<NormalizedSwapEvent>> {
            *self
                .parse_calls
                .lock()
                .unwrap()
                .entry(signature.signature.clone())
                .or_insert(0) += 1;

            if let Some(delay) = self.parse_delay {
                tokio::time::sleep(delay).await;
            }
            if self.failing.contains(&signature.signature) {
                return Err(Error::Parse {
                    signature: signature.signature.clone(),
                    reason: "malformed".into(),
                });
            }
            if self.not_swaps.contains(&signature.signature) {
                return Ok(None);
            }
            Ok(Some(NormalizedSwapEvent {
                signature: signature.signature.clone(),
                wallet: signature.address.clone(),
                token_mint: "mint".into(),
                side: SwapSide::Buy,
                raw_amount: 1,
                decimals: 0,
                amount_usd: 100.0,
                timestamp: Utc::now(),
                source: "test".into(),
                market_cap_usd: None,
            }))
        }
    }

    fn build(
        source: Arc<FakeSource>,
        limits: QueueLimits,
    ) -> (
        SignatureIngestor,
        Arc<DedupCache>,
        Arc<BackpressureQueue<NormalizedSwapEvent>>,
    ) {
        let dedup = Arc::new(DedupCache::new(DedupCacheConfig::default()));
        let queue = Arc::new(BackpressureQueue::new(limits));
        let ingestor = SignatureIngestor::new(
            "whale",
            vec!["addr1".to_string()],
            source,
            dedup.clone(),
            queue.clone(),
        );
        (ingestor, dedup, queue)
    }

    fn roomy() -> QueueLimits {
        QueueLimits::new(100, 80, 40)
    }

    #[tokio::test]
    async fn test_tick_enqueues_new_signatures_once() {
        let source = Arc::new(FakeSource::with_signatures(&["s1", "s2", "s3"]));
        let (ingestor, dedup, queue) = build(source.clone(), roomy());

        let TickOutcome::Completed(report) = ingestor.tick().await else {
            panic!("tick should complete");
        };
        assert_eq!(report.fetched, 3);
        assert_eq!(report.accepted, 3);
        assert_eq!(queue.len(), 3);
        assert!(dedup.seen("s2").await);

        // Processed oldest first
        let order: Vec<String> = queue.drain(10).into_iter().map(|e| e.signature).collect();
        assert_eq!(order, vec!["s1", "s2", "s3"]);

        // Same signatures again: nothing forwarded
        let TickOutcome::Completed(report) = ingestor.tick().await else {
            panic!("tick should complete");
        };
        assert_eq!(report.duplicates, 3);
        assert_eq!(report.accepted, 0);
        assert!(queue.is_empty());
        assert_eq!(source.parse_calls("s1"), 1);
    }

    #[tokio::test]
    async fn test_parse_failure_marks_seen_without_retry() {
        let mut fake = FakeSource::with_signatures(&["good", "bad"]);
        fake.failing.insert("bad".to_string());
        let source = Arc::new(fake);
        let (ingestor, dedup, queue) = build(source.clone(), roomy());

        let TickOutcome::Completed(report) = ingestor.tick().await else {
            panic!("tick should complete");
        };
        assert_eq!(report.parse_failures, 1);
        assert_eq!(report.accepted, 1);
        assert!(dedup.seen("bad").await);

        ingestor.tick().await;
        assert_eq!(source.parse_calls("bad"), 1);
        assert_eq!(queue.len(), 1);
    }

    #[tokio::test]
    async fn test_non_swap_is_seen_but_not_enqueued() {
        let mut fake = FakeSource::with_signatures(&["transfer"]);
        fake.not_swaps.insert("transfer".to_string());
        let (ingestor, dedup, queue) = build(Arc::new(fake), roomy());

        let TickOutcome::Completed(report) = ingestor.tick().await else {
            panic!("tick should complete");
        };
        assert_eq!(report.not_swaps, 1);
        assert!(queue.is_empty());
        assert!(dedup.seen("transfer").await);
    }

    #[tokio::test]
    async fn test_fetch_failure_keeps_checkpoint() {
        let source = Arc::new(FakeSource::with_signatures(&["s1"]));
        let (ingestor, _dedup, _queue) = build(source.clone(), roomy());

        ingestor.tick().await;
        let after_first = ingestor.checkpoint().await;
        assert_eq!(after_first.cursor("addr1"), Some("s1"));

        source.fail_fetch.store(true, Ordering::SeqCst);
        assert!(matches!(ingestor.tick().await, TickOutcome::Failed(_)));
        assert_eq!(ingestor.checkpoint().await, after_first);

        // The retry starts from the same cursor
        source.fail_fetch.store(false, Ordering::SeqCst);
        ingestor.tick().await;
        let seen = source.fetch_checkpoints.lock().unwrap().clone();
        assert_eq!(seen[1], after_first);
        assert_eq!(seen[2], after_first);
    }

    #[tokio::test]
    async fn test_scheduled_run_tracks_failed_fetches() {
        let source = Arc::new(FakeSource::with_signatures(&["s1"]));
        let (ingestor, _dedup, queue) = build(source.clone(), roomy());

        source.fail_fetch.store(true, Ordering::SeqCst);
        ingestor.run().await;
        ingestor.run().await;
        assert_eq!(ingestor.failed_streak(), 2);
        assert!(queue.is_empty());

        source.fail_fetch.store(false, Ordering::SeqCst);
        ingestor.run().await;
        assert_eq!(ingestor.failed_streak(), 0);
        assert_eq!(queue.len(), 1);
    }

    #[tokio::test]
    async fn test_overlapping_tick_is_skipped() {
        let mut fake = FakeSource::with_signatures(&["slow"]);
        fake.parse_delay = Some(Duration::from_millis(150));
        let (ingestor, _dedup, _queue) = build(Arc::new(fake), roomy());
        let ingestor = Arc::new(ingestor);

        let running = {
            let ingestor = ingestor.clone();
            tokio::spawn(async move { ingestor.tick().await })
        };
        tokio::time::sleep(Duration::from_millis(30)).await;

        assert_eq!(ingestor.tick().await, TickOutcome::Skipped);
        assert!(matches!(
            running.await.unwrap(),
            TickOutcome::Completed(_)
        ));
    }

    #[tokio::test]
    async fn test_backpressure_drops_are_counted() {
        let source = Arc::new(FakeSource::with_signatures(&["a", "b", "c", "d"]));
        let (ingestor, _dedup, queue) = build(source, QueueLimits::new(10, 2, 1));

        let TickOutcome::Completed(report) = ingestor.tick().await else {
            panic!("tick should complete");
        };
        assert_eq!(report.accepted, 2);
        assert_eq!(report.dropped, 2);
        assert_eq!(queue.dropped_count(), 2);
        assert!(queue.is_in_backpressure());
    }

    #[tokio::test]
    async fn test_checkpoint_survives_restart() {
        let store: Arc<MemoryStore> = Arc::new(MemoryStore::new());
        let source = Arc::new(FakeSource::with_signatures(&["s1", "s2"]));

        let (ingestor, _, _) = build(source.clone(), roomy());
        let ingestor = ingestor.with_store(store.clone());
        ingestor.tick().await;

        let (restarted, _, _) = build(source.clone(), roomy());
        let restarted = restarted.with_store(store.clone());
        restarted.tick().await;

        let seen = source.fetch_checkpoints.lock().unwrap().clone();
        assert_eq!(seen.last().unwrap().cursor("addr1"), Some("s2"));
    }

    #[tokio::test]
    async fn test_store_outage_does_not_fail_tick() {
        let store: Arc<MemoryStore> = Arc::new(MemoryStore::new());
        store.set_unavailable(true);
        let source = Arc::new(FakeSource::with_signatures(&["s1"]));
        let (ingestor, _, queue) = build(source, roomy());
        let ingestor = ingestor.with_store(store);

        assert!(matches!(ingestor.tick().await, TickOutcome::Completed(_)));
        assert_eq!(queue.len(), 1);
    }

    #[tokio::test]
    async fn test_scheduled_run_halves_cadence_under_backpressure() {
        let source = Arc::new(FakeSource::default());
        let (ingestor, _, queue) = build(source.clone(), QueueLimits::new(10, 1, 0));
        queue.offer(NormalizedSwapEvent {
            signature: "filler".into(),
            wallet: "w".into(),
            token_mint: "m".into(),
            side: SwapSide::Buy,
            raw_amount: 1,
            decimals: 0,
            amount_usd: 1.0,
            timestamp: Utc::now(),
            source: "test".into(),
            market_cap_usd: None,
        });
        assert!(queue.is_in_backpressure());

        for _ in 0..4 {
            ingestor.run().await;
        }
        assert_eq!(source.fetch_checkpoints.lock().unwrap().len(), 2);

        queue.drain(10);
        for _ in 0..2 {
            ingestor.run().await;
        }
        assert_eq!(source.fetch_checkpoints.lock().unwrap().len(), 4);
    }
}
