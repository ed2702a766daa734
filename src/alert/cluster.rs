//! Whale cluster detection
//!
//! Groups buy events per token into fixed windows (timestamp truncated to
//! the window size) and tracks distinct buying wallets and USD inflow.
//! A window reports a subscription the first time both of its thresholds
//! are met; later events in that window keep growing the aggregate but do
//! not report the same subscription again. Windows are dropped once they
//! roll over, nothing is carried into the next one.

use chrono::{DateTime, TimeZone, Utc};
use dashmap::DashMap;
use std::collections::HashSet;
use std::sync::atomic::{AtomicU64, Ordering};
use tracing::{debug, info};

use crate::alert::types::{AlertConfig, AlertSubscription, ClusterResult};
use crate::types::{short, NormalizedSwapEvent};

/// Cluster thresholds taken from one WHALE_CLUSTER subscription
#[derive(Debug, Clone, PartialEq)]
pub struct ClusterThreshold {
    pub subscription_id: String,
    pub min_cluster_size: usize,
    pub min_inflow_usd: f64,
    /// Empty means any token
    pub tokens: Vec<String>,
}

impl ClusterThreshold {
    /// Thresholds of every active cluster subscription
    pub fn from_subscriptions(subscriptions: &[AlertSubscription]) -> Vec<Self> {
        subscriptions
            .iter()
            .filter(|s| s.active)
            .filter_map(|s| match &s.config {
                AlertConfig::WhaleCluster(c) => Some(Self {
                    subscription_id: s.id.clone(),
                    min_cluster_size: c.min_cluster_size,
                    min_inflow_usd: c.min_inflow_usd,
                    tokens: c.tokens.clone(),
                }),
                _ => None,
            })
            .collect()
    }

    fn applies_to(&self, mint: &str) -> bool {
        self.tokens.is_empty() || self.tokens.iter().any(|t| t == mint)
    }

    fn is_met(&self, count: usize, volume_usd: f64) -> bool {
        count >= self.min_cluster_size && volume_usd >= self.min_inflow_usd
    }
}

#[derive(Debug, Clone, PartialEq, Eq, Hash)]
struct WindowKey {
    mint: String,
    /// Unix seconds, aligned to the window size
    start: i64,
}

#[derive(Debug, Default)]
struct ClusterWindow {
    wallets: HashSet<String>,
    total_volume_usd: f64,
    last_update: Option<DateTime<Utc>>,
    emitted_for: HashSet<String>,
}

/// Cluster detector statistics
#[derive(Debug, Clone, Default)]
pub struct ClusterStats {
    pub active_windows: usize,
    pub buys_observed: u64,
    pub clusters_emitted: u64,
    pub windows_expired: u64,
}

/// Per-token windowed aggregation of buy activity
pub struct ClusterDetector {
    window_minutes: u32,
    windows: DashMap<WindowKey, ClusterWindow>,
    buys_observed: AtomicU64,
    clusters_emitted: AtomicU64,
    windows_expired: AtomicU64,
}

impl ClusterDetector {
    pub fn new(window_minutes: u32) -> Self {
        Self {
            window_minutes: window_minutes.max(1),
            windows: DashMap::new(),
            buys_observed: AtomicU64::new(0),
            clusters_emitted: AtomicU64::new(0),
            windows_expired: AtomicU64::new(0),
        }
    }

    pub fn window_minutes(&self) -> u32 {
        self.window_minutes
    }

    fn window_secs(&self) -> i64 {
        i64::from(self.window_minutes) * 60
    }

    /// Start of the window containing `at`
    pub fn window_start(&self, at: DateTime<Utc>) -> DateTime<Utc> {
        let start = self.align(at);
        Utc.timestamp_opt(start, 0).single().unwrap_or(at)
    }

    fn align(&self, at: DateTime<Utc>) -> i64 {
        let secs = at.timestamp();
        secs - secs.rem_euclid(self.window_secs())
    }

    /// Fold one event into its window
    ///
    /// Returns a result only when this event made at least one threshold
    /// true for the first time in the window.
    pub fn observe(
        &self,
        event: &NormalizedSwapEvent,
        thresholds: &[ClusterThreshold],
    ) -> Option<ClusterResult> {
        self.observe_at(event, thresholds, Utc::now())
    }

    fn observe_at(
        &self,
        event: &NormalizedSwapEvent,
        thresholds: &[ClusterThreshold],
        now: DateTime<Utc>,
    ) -> Option<ClusterResult> {
        if !event.is_buy() {
            return None;
        }

        let key = WindowKey {
            mint: event.token_mint.clone(),
            start: self.align(event.timestamp),
        };

        // A window that already rolled over is gone for good
        if key.start < self.align(now) - self.window_secs() {
            debug!(
                signature = %short(&event.signature),
                "Ignoring buy for an expired cluster window"
            );
            return None;
        }

        self.buys_observed.fetch_add(1, Ordering::Relaxed);

        // The entry guard keeps this key's update atomic
        let mut window = self.windows.entry(key.clone()).or_default();
        window.wallets.insert(event.wallet.clone());
        window.total_volume_usd += event.amount_usd;
        let last_update = window
            .last_update
            .map_or(event.timestamp, |prev| prev.max(event.timestamp));
        window.last_update = Some(last_update);

        let count = window.wallets.len();
        let volume = window.total_volume_usd;

        let mut newly_crossed = Vec::new();
        for threshold in thresholds {
            if threshold.applies_to(&key.mint)
                && threshold.is_met(count, volume)
                && window.emitted_for.insert(threshold.subscription_id.clone())
            {
                newly_crossed.push(threshold.subscription_id.clone());
            }
        }

        if newly_crossed.is_empty() {
            return None;
        }

        let result = ClusterResult {
            token_mint: key.mint.clone(),
            window_start: self.window_start(event.timestamp),
            count,
            total_volume_usd: volume,
            time_window_minutes: self.window_minutes,
            last_update,
            newly_crossed,
        };
        drop(window);

        self.clusters_emitted.fetch_add(1, Ordering::Relaxed);
        info!(
            mint = %short(&result.token_mint),
            wallets = result.count,
            volume_usd = result.total_volume_usd,
            subscriptions = result.newly_crossed.len(),
            "Whale cluster detected"
        );

        Some(result)
    }

    /// Current aggregate for a token at a point in time
    pub fn snapshot(&self, mint: &str, at: DateTime<Utc>) -> Option<ClusterResult> {
        let key = WindowKey {
            mint: mint.to_string(),
            start: self.align(at),
        };
        self.windows.get(&key).map(|window| ClusterResult {
            token_mint: key.mint.clone(),
            window_start: self.window_start(at),
            count: window.wallets.len(),
            total_volume_usd: window.total_volume_usd,
            time_window_minutes: self.window_minutes,
            last_update: window.last_update.unwrap_or(at),
            newly_crossed: Vec::new(),
        })
    }

    /// Drop every window that has rolled over
    ///
    /// The window just before the current one is kept so buys that arrive
    /// late still land in it; anything older is discarded.
    pub fn expire(&self, now: DateTime<Utc>) -> usize {
        let oldest_live = self.align(now) - self.window_secs();
        let before = self.windows.len();
        self.windows.retain(|key, _| key.start >= oldest_live);
        let removed = before.saturating_sub(self.windows.len());
        if removed > 0 {
            self.windows_expired
                .fetch_add(removed as u64, Ordering::Relaxed);
            debug!(removed, "Expired cluster windows");
        }
        removed
    }

    pub fn active_windows(&self) -> usize {
        self.windows.len()
    }

    pub fn stats(&self) -> ClusterStats {
        ClusterStats {
            active_windows: self.windows.len(),
            buys_observed: self.buys_observed.load(Ordering::Relaxed),
            clusters_emitted: self.clusters_emitted.load(Ordering::Relaxed),
            windows_expired: self.windows_expired.load(Ordering::Relaxed),
        }
    }
}

impl Default for ClusterDetector {
    fn default() -> Self {
        Self::new(15)
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::types::SwapSide;

    fn at(hour: u32, minute: u32) -> DateTime<Utc> {
        Utc.with_ymd_and_hms(2024, 5, 1, hour, minute, 0).unwrap()
    }

    fn buy(wallet: &str, mint: &str, usd: f64, ts: DateTime<Utc>) -> NormalizedSwapEvent {
        NormalizedSwapEvent {
            signature: format!("sig-{}-{}", wallet, usd),
            wallet: wallet.to_string(),
            token_mint: mint.to_string(),
            side: SwapSide::Buy,
            raw_amount: 1_000,
            decimals: 6,
            amount_usd: usd,
            timestamp: ts,
            source: "JUPITER".into(),
            market_cap_usd: None,
        }
    }

    fn threshold(id: &str, size: usize, inflow: f64) -> ClusterThreshold {
        ClusterThreshold {
            subscription_id: id.to_string(),
            min_cluster_size: size,
            min_inflow_usd: inflow,
            tokens: Vec::new(),
        }
    }

    #[test]
    fn test_window_alignment() {
        let detector = ClusterDetector::new(15);
        assert_eq!(detector.window_start(at(10, 14)), at(10, 0));
        assert_eq!(detector.window_start(at(10, 15)), at(10, 15));
        assert_eq!(detector.window_start(at(10, 29)), at(10, 15));
    }

    #[test]
    fn test_emits_once_when_thresholds_crossed() {
        let detector = ClusterDetector::new(15);
        let thresholds = vec![threshold("sub", 5, 10_000.0)];
        let now = at(10, 10);

        for i in 0..4 {
            let event = buy(&format!("w{}", i), "MINT", 2_000.0, at(10, i));
            assert!(detector.observe_at(&event, &thresholds, now).is_none());
        }

        let fifth = buy("w4", "MINT", 4_000.0, at(10, 5));
        let result = detector.observe_at(&fifth, &thresholds, now).unwrap();
        assert_eq!(result.count, 5);
        assert_eq!(result.total_volume_usd, 12_000.0);
        assert_eq!(result.time_window_minutes, 15);
        assert_eq!(result.newly_crossed, vec!["sub".to_string()]);

        // Aggregate keeps growing, no further emission
        let sixth = buy("w5", "MINT", 50_000.0, at(10, 6));
        assert!(detector.observe_at(&sixth, &thresholds, now).is_none());
        let snapshot = detector.snapshot("MINT", at(10, 6)).unwrap();
        assert_eq!(snapshot.count, 6);
        assert_eq!(snapshot.total_volume_usd, 62_000.0);
        assert_eq!(detector.stats().clusters_emitted, 1);
    }

    #[test]
    fn test_repeat_wallet_counts_once() {
        let detector = ClusterDetector::new(15);
        let thresholds = vec![threshold("sub", 2, 100.0)];
        let now = at(10, 5);

        assert!(detector
            .observe_at(&buy("w1", "MINT", 500.0, at(10, 1)), &thresholds, now)
            .is_none());
        assert!(detector
            .observe_at(&buy("w1", "MINT", 500.0, at(10, 2)), &thresholds, now)
            .is_none());

        let snapshot = detector.snapshot("MINT", at(10, 2)).unwrap();
        assert_eq!(snapshot.count, 1);
        assert_eq!(snapshot.total_volume_usd, 1_000.0);
    }

    #[test]
    fn test_sells_are_ignored() {
        let detector = ClusterDetector::new(15);
        let mut sell = buy("w1", "MINT", 5_000.0, at(10, 1));
        sell.side = SwapSide::Sell;
        assert!(detector
            .observe_at(&sell, &[threshold("sub", 1, 1.0)], at(10, 2))
            .is_none());
        assert_eq!(detector.active_windows(), 0);
    }

    #[test]
    fn test_each_subscription_triggers_independently() {
        let detector = ClusterDetector::new(15);
        let thresholds = vec![threshold("small", 2, 1_000.0), threshold("large", 3, 5_000.0)];
        let now = at(10, 10);

        detector.observe_at(&buy("w1", "MINT", 600.0, at(10, 1)), &thresholds, now);
        let first = detector
            .observe_at(&buy("w2", "MINT", 600.0, at(10, 2)), &thresholds, now)
            .unwrap();
        assert_eq!(first.newly_crossed, vec!["small".to_string()]);

        let second = detector
            .observe_at(&buy("w3", "MINT", 4_000.0, at(10, 3)), &thresholds, now)
            .unwrap();
        assert_eq!(second.newly_crossed, vec!["large".to_string()]);

        assert!(detector
            .observe_at(&buy("w4", "MINT", 4_000.0, at(10, 4)), &thresholds, now)
            .is_none());
    }

    #[test]
    fn test_windows_and_tokens_are_independent() {
        let detector = ClusterDetector::new(15);
        let thresholds = vec![threshold("sub", 2, 100.0)];
        let now = at(10, 20);

        detector.observe_at(&buy("w1", "A", 100.0, at(10, 1)), &thresholds, now);
        // Different token, same window
        assert!(detector
            .observe_at(&buy("w2", "B", 100.0, at(10, 2)), &thresholds, now)
            .is_none());
        // Same token, next window
        assert!(detector
            .observe_at(&buy("w2", "A", 100.0, at(10, 16)), &thresholds, now)
            .is_none());
        assert_eq!(detector.active_windows(), 3);
    }

    #[test]
    fn test_expire_hard_resets() {
        let detector = ClusterDetector::new(15);
        let thresholds = vec![threshold("sub", 2, 100.0)];

        detector.observe_at(&buy("w1", "MINT", 100.0, at(10, 1)), &thresholds, at(10, 2));
        detector.observe_at(&buy("w2", "MINT", 100.0, at(10, 20)), &thresholds, at(10, 20));

        // Previous window survives one rollover
        assert_eq!(detector.expire(at(10, 20)), 0);
        assert_eq!(detector.expire(at(10, 35)), 1);
        assert!(detector.snapshot("MINT", at(10, 1)).is_none());
        let current = detector.snapshot("MINT", at(10, 20)).unwrap();
        assert_eq!(current.count, 1);
    }

    #[test]
    fn test_stale_events_ignored() {
        let detector = ClusterDetector::new(15);
        let event = buy("w1", "MINT", 100.0, at(9, 0));
        assert!(detector
            .observe_at(&event, &[threshold("sub", 1, 1.0)], at(10, 0))
            .is_none());
        assert_eq!(detector.active_windows(), 0);
    }

    #[test]
    fn test_token_filter_applies() {
        let detector = ClusterDetector::new(15);
        let mut filtered = threshold("sub", 1, 1.0);
        filtered.tokens = vec!["OTHER".into()];
        assert!(detector
            .observe_at(&buy("w1", "MINT", 100.0, at(10, 1)), &[filtered], at(10, 2))
            .is_none());
    }

    #[test]
    fn test_thresholds_from_subscriptions() {
        use crate::alert::types::{AlphaStreamConfig, WhaleClusterConfig};

        let cluster = AlertSubscription::new(
            "u1",
            AlertConfig::WhaleCluster(WhaleClusterConfig {
                min_cluster_size: 5,
                min_inflow_usd: 10_000.0,
                tokens: vec![],
            }),
        );
        let mut inactive = cluster.clone();
        inactive.id = "inactive".into();
        inactive.active = false;
        let alpha = AlertSubscription::new("u1", AlertConfig::AlphaStream(AlphaStreamConfig::default()));

        let thresholds = ClusterThreshold::from_subscriptions(&[cluster.clone(), inactive, alpha]);
        assert_eq!(thresholds.len(), 1);
        assert_eq!(thresholds[0].subscription_id, cluster.id);
    }
}
