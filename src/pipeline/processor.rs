//! Queue consumer and maintenance loops
//!
//! `EventProcessor` drains the backpressure queue, folds every event into
//! the cluster detector and runs the matcher over both the event and any
//! cluster it completed. Matches go out highest priority first; premium
//! subscriptions are only delivered when their owner passes the balance
//! check.

use async_trait::async_trait;
use chrono::Utc;
use std::collections::HashMap;
use std::sync::atomic::{AtomicU64, Ordering};
use std::sync::Arc;
use tracing::{debug, info, warn};

use crate::alert::{
    AlertMatch, AlertMatcher, ClusterDetector, ClusterThreshold, Notifier, Signal,
    SubscriptionStore,
};
use crate::cache::KvStore;
use crate::lifecycle::PeriodicTask;
use crate::premium::PremiumGate;
use crate::stream::{BackpressureQueue, DedupCache};
use crate::types::{short, NormalizedSwapEvent};

/// Counters for one drained batch
#[derive(Debug, Clone, Default, PartialEq, Eq)]
pub struct BatchReport {
    pub events: usize,
    pub clusters: usize,
    pub delivered: usize,
    pub premium_denied: usize,
}

/// Process-lifetime processor counters
#[derive(Debug, Clone, Default)]
pub struct ProcessorStats {
    pub events: u64,
    pub clusters: u64,
    pub delivered: u64,
    pub premium_denied: u64,
}

pub struct EventProcessor {
    queue: Arc<BackpressureQueue<NormalizedSwapEvent>>,
    detector: Arc<ClusterDetector>,
    matcher: AlertMatcher,
    subscriptions: Arc<dyn SubscriptionStore>,
    gate: Arc<PremiumGate>,
    notifier: Arc<dyn Notifier>,
    batch_size: usize,
    events: AtomicU64,
    clusters: AtomicU64,
    delivered: AtomicU64,
    premium_denied: AtomicU64,
}

impl EventProcessor {
    pub fn new(
        queue: Arc<BackpressureQueue<NormalizedSwapEvent>>,
        detector: Arc<ClusterDetector>,
        matcher: AlertMatcher,
        subscriptions: Arc<dyn SubscriptionStore>,
        gate: Arc<PremiumGate>,
        notifier: Arc<dyn Notifier>,
        batch_size: usize,
    ) -> Self {
        Self {
            queue,
            detector,
            matcher,
            subscriptions,
            gate,
            notifier,
            batch_size: batch_size.max(1),
            events: AtomicU64::new(0),
            clusters: AtomicU64::new(0),
            delivered: AtomicU64::new(0),
            premium_denied: AtomicU64::new(0),
        }
    }

    /// Drain and handle up to one batch
    pub async fn process_batch(&self) -> BatchReport {
        let batch = self.queue.drain(self.batch_size);
        let mut report = BatchReport::default();
        if batch.is_empty() {
            return report;
        }

        let subscriptions = match self.subscriptions.active_subscriptions().await {
            Ok(subscriptions) => subscriptions,
            Err(e) => {
                // Clusters still aggregate; matching resumes once the store is back
                warn!(error = %e, "Subscription store unavailable, alerts skipped for this batch");
                Vec::new()
            }
        };
        let thresholds = ClusterThreshold::from_subscriptions(&subscriptions);
        let mut premium_decisions: HashMap<String, bool> = HashMap::new();

        for event in &batch {
            report.events += 1;

            let mut matches = self.matcher.evaluate(Signal::Swap(event), &subscriptions);
            if let Some(cluster) = self.detector.observe(event, &thresholds) {
                report.clusters += 1;
                matches.extend(self.matcher.evaluate(Signal::Cluster(&cluster), &subscriptions));
            }
            matches.sort_by(|a, b| b.subscription.priority.cmp(&a.subscription.priority));

            for alert in matches {
                if self.premium_allowed(&alert, &mut premium_decisions).await {
                    self.notifier.deliver(alert).await;
                    report.delivered += 1;
                } else {
                    report.premium_denied += 1;
                }
            }
        }

        self.events.fetch_add(report.events as u64, Ordering::Relaxed);
        self.clusters.fetch_add(report.clusters as u64, Ordering::Relaxed);
        self.delivered.fetch_add(report.delivered as u64, Ordering::Relaxed);
        self.premium_denied
            .fetch_add(report.premium_denied as u64, Ordering::Relaxed);

        debug!(
            events = report.events,
            clusters = report.clusters,
            delivered = report.delivered,
            premium_denied = report.premium_denied,
            remaining = self.queue.len(),
            "Processed event batch"
        );
        report
    }

    async fn premium_allowed(
        &self,
        alert: &AlertMatch,
        decisions: &mut HashMap<String, bool>,
    ) -> bool {
        let subscription = &alert.subscription;
        if !subscription.premium {
            return true;
        }
        let Some(wallet) = subscription.owner_wallet.as_deref() else {
            debug!(subscription = %subscription.id, "Premium subscription without owner wallet");
            return false;
        };

        if let Some(allowed) = decisions.get(wallet) {
            return *allowed;
        }
        let access = self.gate.check_access(wallet).await;
        if !access.has_access {
            debug!(
                subscription = %subscription.id,
                wallet = %short(wallet),
                missing = access.difference.unwrap_or_default(),
                "Premium alert withheld"
            );
        }
        decisions.insert(wallet.to_string(), access.has_access);
        access.has_access
    }

    pub fn stats(&self) -> ProcessorStats {
        ProcessorStats {
            events: self.events.load(Ordering::Relaxed),
            clusters: self.clusters.load(Ordering::Relaxed),
            delivered: self.delivered.load(Ordering::Relaxed),
            premium_denied: self.premium_denied.load(Ordering::Relaxed),
        }
    }
}

#[async_trait]
impl PeriodicTask for EventProcessor {
    async fn run(&self) {
        // Keep going while batches come back full
        loop {
            let report = self.process_batch().await;
            if report.events < self.batch_size {
                break;
            }
        }
    }
}

/// Expires cluster windows and prunes dedup and store entries
pub struct MaintenanceSweeper {
    detector: Arc<ClusterDetector>,
    dedup: Arc<DedupCache>,
    store: Arc<dyn KvStore>,
}

impl MaintenanceSweeper {
    pub fn new(
        detector: Arc<ClusterDetector>,
        dedup: Arc<DedupCache>,
        store: Arc<dyn KvStore>,
    ) -> Self {
        Self {
            detector,
            dedup,
            store,
        }
    }

    pub async fn sweep(&self) {
        let windows = self.detector.expire(Utc::now());
        let signatures = self.dedup.prune();
        let stored = match self.store.purge_expired().await {
            Ok(purged) => purged,
            Err(e) => {
                warn!(error = %e, "Store purge failed");
                0
            }
        };

        if windows + signatures + stored > 0 {
            info!(windows, signatures, stored, "Maintenance sweep");
        }
    }
}

#[async_trait]
impl PeriodicTask for MaintenanceSweeper {
    async fn run(&self) {
        self.sweep().await;
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::alert::types::{AlphaStreamConfig, WhaleClusterConfig};
    use crate::alert::{AlertConfig, AlertPayload, AlertSubscription, ChannelNotifier, MemorySubscriptionStore};
    use crate::cache::MemoryStore;
    use crate::premium::oracle::fakes::FakeProvider;
    use crate::premium::BalanceOracle;
    use crate::stream::dedup::DedupCacheConfig;
    use crate::stream::QueueLimits;
    use crate::types::SwapSide;
    use solana_sdk::pubkey::Pubkey;
    use std::time::Duration;
    use tokio::sync::mpsc;

    struct Harness {
        queue: Arc<BackpressureQueue<NormalizedSwapEvent>>,
        subscriptions: Arc<MemorySubscriptionStore>,
        processor: EventProcessor,
        rx: mpsc::Receiver<AlertMatch>,
    }

    fn harness(premium_balance: u64) -> Harness {
        let queue = Arc::new(BackpressureQueue::new(QueueLimits::new(100, 80, 40)));
        let subscriptions = Arc::new(MemorySubscriptionStore::new());
        let gate = Arc::new(PremiumGate::new(
            Arc::new(BalanceOracle::new(
                vec![Arc::new(FakeProvider::ok("rpc", premium_balance, 6))],
                Duration::from_millis(100),
            )),
            Arc::new(MemoryStore::new()),
            Some(Pubkey::new_unique()),
            1.0,
            Duration::from_secs(60),
        ));
        let (notifier, rx) = ChannelNotifier::channel(64);
        let processor = EventProcessor::new(
            queue.clone(),
            Arc::new(ClusterDetector::new(15)),
            AlertMatcher::default(),
            subscriptions.clone(),
            gate,
            Arc::new(notifier),
            10,
        );
        Harness {
            queue,
            subscriptions,
            processor,
            rx,
        }
    }

    fn buy(wallet: &str, usd: f64) -> NormalizedSwapEvent {
        NormalizedSwapEvent {
            signature: format!("sig-{}", wallet),
            wallet: wallet.to_string(),
            token_mint: "MINT".into(),
            side: SwapSide::Buy,
            raw_amount: 1_000,
            decimals: 6,
            amount_usd: usd,
            timestamp: Utc::now(),
            source: "JUPITER".into(),
            market_cap_usd: None,
        }
    }

    fn drain(rx: &mut mpsc::Receiver<AlertMatch>) -> Vec<AlertMatch> {
        let mut out = Vec::new();
        while let Ok(alert) = rx.try_recv() {
            out.push(alert);
        }
        out
    }

    #[tokio::test]
    async fn test_dispatches_by_priority() {
        let mut h = harness(0);
        let low = AlertSubscription::new("u1", AlertConfig::AlphaStream(AlphaStreamConfig::default()))
            .with_priority(1);
        let high = AlertSubscription::new("u2", AlertConfig::AlphaStream(AlphaStreamConfig::default()))
            .with_priority(5);
        h.subscriptions.upsert(low.clone());
        h.subscriptions.upsert(high.clone());

        h.queue.offer(buy("w1", 100.0));
        let report = h.processor.process_batch().await;
        assert_eq!(report.events, 1);
        assert_eq!(report.delivered, 2);
        assert_eq!(h.queue.processed_count(), 1);

        let alerts = drain(&mut h.rx);
        assert_eq!(alerts[0].subscription.id, high.id);
        assert_eq!(alerts[1].subscription.id, low.id);
    }

    #[tokio::test]
    async fn test_premium_subscription_needs_balance() {
        let owner = Pubkey::new_unique().to_string();
        let sub = AlertSubscription::new("u1", AlertConfig::AlphaStream(AlphaStreamConfig::default()))
            .with_premium(owner.clone());

        // 0.5 tokens: denied
        let mut poor = harness(500_000);
        poor.subscriptions.upsert(sub.clone());
        poor.queue.offer(buy("w1", 100.0));
        let report = poor.processor.process_batch().await;
        assert_eq!(report.premium_denied, 1);
        assert!(drain(&mut poor.rx).is_empty());

        // 2 tokens: delivered
        let mut rich = harness(2_000_000);
        rich.subscriptions.upsert(sub);
        rich.queue.offer(buy("w1", 100.0));
        let report = rich.processor.process_batch().await;
        assert_eq!(report.delivered, 1);
        assert_eq!(drain(&mut rich.rx).len(), 1);
    }

    #[tokio::test]
    async fn test_cluster_alert_emitted_once_end_to_end() {
        let mut h = harness(0);
        let sub = AlertSubscription::new(
            "u1",
            AlertConfig::WhaleCluster(WhaleClusterConfig {
                min_cluster_size: 5,
                min_inflow_usd: 10_000.0,
                tokens: vec![],
            }),
        );
        h.subscriptions.upsert(sub.clone());

        for (i, usd) in [2_000.0, 2_000.0, 2_000.0, 2_000.0].iter().enumerate() {
            h.queue.offer(buy(&format!("whale{}", i), *usd));
        }
        h.processor.process_batch().await;
        assert!(drain(&mut h.rx).is_empty());

        h.queue.offer(buy("whale4", 4_000.0));
        h.queue.offer(buy("whale5", 9_000.0));
        let report = h.processor.process_batch().await;
        assert_eq!(report.clusters, 1);

        let alerts = drain(&mut h.rx);
        assert_eq!(alerts.len(), 1);
        match &alerts[0].payload {
            AlertPayload::Cluster { cluster } => {
                assert_eq!(cluster.count, 5);
                assert_eq!(cluster.total_volume_usd, 12_000.0);
            }
            other => panic!("unexpected payload {:?}", other),
        }
    }

    #[tokio::test]
    async fn test_run_drains_full_batches() {
        let h = harness(0);
        for i in 0..25 {
            h.queue.offer(buy(&format!("w{}", i), 1.0));
        }
        h.processor.run().await;
        assert!(h.queue.is_empty());
        assert_eq!(h.processor.stats().events, 25);
    }

    #[tokio::test]
    async fn test_sweeper_prunes() {
        let detector = Arc::new(ClusterDetector::new(15));
        let dedup = Arc::new(DedupCache::new(DedupCacheConfig {
            retention: Duration::from_millis(10),
            max_entries: 100,
        }));
        let store = Arc::new(MemoryStore::new());
        dedup.mark_seen("old").await;
        tokio::time::sleep(Duration::from_millis(20)).await;

        let sweeper = MaintenanceSweeper::new(detector, dedup.clone(), store);
        sweeper.run().await;
        assert_eq!(dedup.size(), 0);
    }
}
