//! Pipeline wiring
//!
//! Owns the shared components and the named background loops:
//! - `whale-signatures` / `kol-signatures`: one `SignatureIngestor` per feed
//! - `event-processor`: drains the queue into clusters, matching and delivery
//! - `cluster-windows`: expires cluster windows and prunes caches

pub mod processor;

use serde::Serialize;
use std::collections::{BTreeSet, HashMap};
use std::sync::Arc;
use std::time::Duration;
use tracing::{info, warn};

use crate::alert::{
    AlertMatcher, ClusterDetector, KolDirectory, LogNotifier, MemorySubscriptionStore, Notifier,
    SubscriptionStore, WebhookNotifier,
};
use crate::cache::{KvStore, MemoryStore};
use crate::config::{Config, FeedConfig};
use crate::error::{Error, Result};
use crate::lifecycle::{Activation, LifecycleStatus, ProcessLifecycleManager};
use crate::premium::{BalanceOracle, PremiumAccessResult, PremiumGate};
use crate::stream::{
    BackpressureQueue, DedupCache, DedupCacheConfig, HeliusSource, QueueLimits, SignatureIngestor,
    SignatureSource,
};
use crate::types::NormalizedSwapEvent;

pub use processor::{BatchReport, EventProcessor, MaintenanceSweeper, ProcessorStats};

pub const WHALE_FEED: &str = "whale";
pub const KOL_FEED: &str = "kol";

const EVENT_PROCESSOR: &str = "event-processor";
const CLUSTER_WINDOWS: &str = "cluster-windows";

/// Point-in-time pipeline counters
#[derive(Debug, Clone, PartialEq, Eq, Serialize)]
#[serde(rename_all = "camelCase")]
pub struct QueueStats {
    pub queue_size: usize,
    pub dedup_cache_size: usize,
    pub messages_processed: u64,
    pub messages_dropped: u64,
    pub is_in_backpressure: bool,
    pub is_shutting_down: bool,
}

/// External collaborators the pipeline runs against
pub struct PipelineDeps {
    pub source: Arc<dyn SignatureSource>,
    pub store: Arc<dyn KvStore>,
    pub subscriptions: Arc<dyn SubscriptionStore>,
    pub notifier: Arc<dyn Notifier>,
    pub oracle: Arc<BalanceOracle>,
    pub kols: Arc<KolDirectory>,
}

impl PipelineDeps {
    /// Production collaborators built from configuration
    pub fn from_config(config: &Config) -> Result<Self> {
        let subscriptions = match &config.alerts.subscriptions_path {
            Some(path) => MemorySubscriptionStore::load(path)?,
            None => {
                warn!("No alerts.subscriptions_path configured, starting with no subscriptions");
                MemorySubscriptionStore::new()
            }
        };

        let kols = match &config.alerts.kols_path {
            Some(path) => KolDirectory::load(path)?,
            None => KolDirectory::default(),
        };

        let notifier: Arc<dyn Notifier> = match &config.alerts.webhook_url {
            Some(url) => Arc::new(WebhookNotifier::new(url.clone())?),
            None => Arc::new(LogNotifier),
        };

        Ok(Self {
            source: Arc::new(HeliusSource::new(&config.helius)?),
            store: Arc::new(MemoryStore::new()),
            subscriptions: Arc::new(subscriptions),
            notifier,
            oracle: Arc::new(BalanceOracle::from_config(&config.rpc)),
            kols: Arc::new(kols),
        })
    }
}

struct Feed {
    process_id: String,
    enabled: bool,
    interval: Duration,
    ingestor: Arc<SignatureIngestor>,
}

/// The assembled ingestion-to-alert pipeline
pub struct Pipeline {
    dedup: Arc<DedupCache>,
    queue: Arc<BackpressureQueue<NormalizedSwapEvent>>,
    detector: Arc<ClusterDetector>,
    processor: Arc<EventProcessor>,
    sweeper: Arc<MaintenanceSweeper>,
    gate: Arc<PremiumGate>,
    lifecycle: Arc<ProcessLifecycleManager>,
    feeds: HashMap<String, Feed>,
    drain_interval: Duration,
    sweep_interval: Duration,
    shutdown_grace: Duration,
}

impl Pipeline {
    pub fn new(config: &Config, deps: PipelineDeps) -> Result<Self> {
        let dedup = Arc::new(DedupCache::with_store(
            DedupCacheConfig::from(&config.dedup),
            deps.store.clone(),
        ));
        let queue = Arc::new(BackpressureQueue::new(QueueLimits::from(&config.backpressure)));
        let detector = Arc::new(ClusterDetector::new(config.cluster.window_minutes));
        let gate = Arc::new(PremiumGate::from_config(
            &config.premium,
            deps.oracle.clone(),
            deps.store.clone(),
        )?);

        let processor = Arc::new(EventProcessor::new(
            queue.clone(),
            detector.clone(),
            AlertMatcher::new(deps.kols.clone()),
            deps.subscriptions.clone(),
            gate.clone(),
            deps.notifier.clone(),
            config.backpressure.drain_batch,
        ));
        let sweeper = Arc::new(MaintenanceSweeper::new(
            detector.clone(),
            dedup.clone(),
            deps.store.clone(),
        ));

        // KOL feed tracks configured addresses plus every known KOL wallet
        let kol_addresses: BTreeSet<String> = config
            .feeds
            .kol
            .addresses
            .iter()
            .cloned()
            .chain(deps.kols.addresses())
            .collect();

        let mut feeds = HashMap::new();
        for (name, feed_config, addresses) in [
            (WHALE_FEED, &config.feeds.whale, config.feeds.whale.addresses.clone()),
            (KOL_FEED, &config.feeds.kol, kol_addresses.into_iter().collect()),
        ] {
            feeds.insert(
                name.to_string(),
                Self::build_feed(name, feed_config, addresses, &deps, &dedup, &queue),
            );
        }

        Ok(Self {
            dedup,
            queue,
            detector,
            processor,
            sweeper,
            gate,
            lifecycle: Arc::new(ProcessLifecycleManager::new()),
            feeds,
            drain_interval: Duration::from_millis(config.backpressure.drain_interval_ms),
            sweep_interval: Duration::from_secs(config.cluster.sweep_interval_secs),
            shutdown_grace: Duration::from_secs(config.shutdown_grace_secs),
        })
    }

    fn build_feed(
        name: &str,
        config: &FeedConfig,
        addresses: Vec<String>,
        deps: &PipelineDeps,
        dedup: &Arc<DedupCache>,
        queue: &Arc<BackpressureQueue<NormalizedSwapEvent>>,
    ) -> Feed {
        let ingestor = SignatureIngestor::new(
            name,
            addresses,
            deps.source.clone(),
            dedup.clone(),
            queue.clone(),
        )
        .with_store(deps.store.clone());

        Feed {
            process_id: format!("{}-signatures", name),
            enabled: config.enabled,
            interval: Duration::from_secs(config.interval_secs),
            ingestor: Arc::new(ingestor),
        }
    }

    /// Start the processor, the sweeper and every enabled feed
    pub fn start(&self) -> Result<Vec<(String, Activation)>> {
        let mut started = vec![
            (
                EVENT_PROCESSOR.to_string(),
                self.lifecycle.register_interval(
                    EVENT_PROCESSOR,
                    "processor",
                    "Drains the event queue into clusters and alerts",
                    self.drain_interval,
                    self.processor.clone(),
                )?,
            ),
            (
                CLUSTER_WINDOWS.to_string(),
                self.lifecycle.register_interval(
                    CLUSTER_WINDOWS,
                    "maintenance",
                    "Expires cluster windows and prunes caches",
                    self.sweep_interval,
                    self.sweeper.clone(),
                )?,
            ),
        ];

        let mut names: Vec<&String> = self.feeds.keys().collect();
        names.sort();
        for name in names {
            let feed = &self.feeds[name];
            if !feed.enabled {
                info!(feed = %name, "Feed disabled");
                continue;
            }
            match self.start_feed(name) {
                Ok(activation) => started.push((feed.process_id.clone(), activation)),
                Err(Error::Config(reason)) => warn!(feed = %name, reason = %reason, "Feed not started"),
                Err(e) => return Err(e),
            }
        }

        Ok(started)
    }

    /// Start one named ingestion loop if it is not already running
    pub fn start_feed(&self, name: &str) -> Result<Activation> {
        let feed = self
            .feeds
            .get(name)
            .ok_or_else(|| Error::ProcessNotFound(name.to_string()))?;

        if feed.ingestor.addresses().is_empty() {
            return Err(Error::Config(format!("feed '{}' has no tracked addresses", name)));
        }

        let activation = self.lifecycle.register_interval(
            &feed.process_id,
            "ingestor",
            &format!(
                "Polls {} tracked {} wallets for new signatures",
                feed.ingestor.addresses().len(),
                name
            ),
            feed.interval,
            feed.ingestor.clone(),
        )?;

        if activation == Activation::AlreadyActive {
            info!(feed = %name, "Feed already active");
        }
        Ok(activation)
    }

    pub fn queue_stats(&self) -> QueueStats {
        QueueStats {
            queue_size: self.queue.len(),
            dedup_cache_size: self.dedup.size(),
            messages_processed: self.queue.processed_count(),
            messages_dropped: self.queue.dropped_count(),
            is_in_backpressure: self.queue.is_in_backpressure(),
            is_shutting_down: self.lifecycle.is_shutting_down(),
        }
    }

    pub fn process_status(&self) -> LifecycleStatus {
        self.lifecycle.get_status()
    }

    pub async fn check_access(&self, wallet: &str) -> PremiumAccessResult {
        self.gate.check_access(wallet).await
    }

    pub fn lifecycle(&self) -> &Arc<ProcessLifecycleManager> {
        &self.lifecycle
    }

    pub fn processor(&self) -> &Arc<EventProcessor> {
        &self.processor
    }

    pub fn detector(&self) -> &Arc<ClusterDetector> {
        &self.detector
    }

    /// Stop all loops, waiting for in-flight ticks, then flush the queue
    pub async fn shutdown(&self) {
        self.lifecycle.shutdown(self.shutdown_grace).await;

        // Events already admitted still get processed
        let mut flushed = 0;
        loop {
            let report = self.processor.process_batch().await;
            if report.events == 0 {
                break;
            }
            flushed += report.events;
        }
        if flushed > 0 {
            info!(events = flushed, "Flushed queued events on shutdown");
        }

        let stats = self.queue_stats();
        info!(
            processed = stats.messages_processed,
            dropped = stats.messages_dropped,
            "Pipeline stopped"
        );
    }
}
