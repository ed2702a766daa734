//! Alert subscription matching
//!
//! Pure evaluation of a signal against the active subscriptions. Nothing
//! here delivers or records anything; the caller dispatches the matches.

use std::sync::Arc;

use crate::alert::types::{
    AlertConfig, AlertMatch, AlertPayload, AlertSubscription, AlphaStreamConfig, ClusterResult,
    KolActivityConfig, KolDirectory, KolProfile, KolProfileConfig, Signal, WhaleClusterConfig,
};
use crate::types::NormalizedSwapEvent;

/// Evaluates swaps and clusters against subscriptions
#[derive(Debug, Clone, Default)]
pub struct AlertMatcher {
    kols: Arc<KolDirectory>,
}

impl AlertMatcher {
    pub fn new(kols: Arc<KolDirectory>) -> Self {
        Self { kols }
    }

    pub fn kols(&self) -> &KolDirectory {
        &self.kols
    }

    /// Every active subscription the signal satisfies, highest priority first
    pub fn evaluate(
        &self,
        signal: Signal<'_>,
        subscriptions: &[AlertSubscription],
    ) -> Vec<AlertMatch> {
        let mut matches: Vec<AlertMatch> = subscriptions
            .iter()
            .filter(|s| s.active)
            .filter_map(|subscription| {
                self.match_one(signal, subscription)
                    .map(|payload| AlertMatch {
                        subscription: subscription.clone(),
                        payload,
                    })
            })
            .collect();

        // Stable, so equal priorities keep subscription order
        matches.sort_by(|a, b| b.subscription.priority.cmp(&a.subscription.priority));
        matches
    }

    fn match_one(
        &self,
        signal: Signal<'_>,
        subscription: &AlertSubscription,
    ) -> Option<AlertPayload> {
        match (&subscription.config, signal) {
            (AlertConfig::AlphaStream(config), Signal::Swap(event)) => {
                alpha_stream_matches(config, event).then(|| AlertPayload::Swap {
                    event: event.clone(),
                    kol: self.kols.lookup(&event.wallet).cloned(),
                })
            }
            (AlertConfig::WhaleCluster(config), Signal::Cluster(cluster)) => {
                whale_cluster_matches(config, &subscription.id, cluster).then(|| {
                    AlertPayload::Cluster {
                        cluster: cluster.clone(),
                    }
                })
            }
            (AlertConfig::KolActivity(config), Signal::Swap(event)) => {
                let kol = self.kols.lookup(&event.wallet)?;
                kol_activity_matches(config, kol, event).then(|| AlertPayload::Swap {
                    event: event.clone(),
                    kol: Some(kol.clone()),
                })
            }
            (AlertConfig::KolProfile(config), Signal::Swap(event)) => {
                let kol = self.kols.lookup(&event.wallet);
                kol_profile_matches(config, kol, event).then(|| AlertPayload::Swap {
                    event: event.clone(),
                    kol: kol.cloned(),
                })
            }
            // Signal kind does not apply to this alert type
            (AlertConfig::AlphaStream(_), Signal::Cluster(_))
            | (AlertConfig::WhaleCluster(_), Signal::Swap(_))
            | (AlertConfig::KolActivity(_), Signal::Cluster(_))
            | (AlertConfig::KolProfile(_), Signal::Cluster(_)) => None,
        }
    }
}

fn listed(filter: &[String], value: &str) -> bool {
    filter.is_empty() || filter.iter().any(|f| f == value)
}

/// Unknown market cap never satisfies configured bounds
fn within_market_cap(min: Option<f64>, max: Option<f64>, market_cap: Option<f64>) -> bool {
    if min.is_none() && max.is_none() {
        return true;
    }
    let Some(market_cap) = market_cap else {
        return false;
    };
    min.map_or(true, |min| market_cap >= min) && max.map_or(true, |max| market_cap <= max)
}

fn alpha_stream_matches(config: &AlphaStreamConfig, event: &NormalizedSwapEvent) -> bool {
    listed(&config.tokens, &event.token_mint)
        && listed(&config.wallets, &event.wallet)
        && config.min_amount.map_or(true, |min| event.amount_usd >= min)
}

fn whale_cluster_matches(
    config: &WhaleClusterConfig,
    subscription_id: &str,
    cluster: &ClusterResult,
) -> bool {
    cluster.newly_crossed.iter().any(|id| id == subscription_id)
        && cluster.count >= config.min_cluster_size
        && cluster.total_volume_usd >= config.min_inflow_usd
        && listed(&config.tokens, &cluster.token_mint)
}

fn kol_activity_matches(
    config: &KolActivityConfig,
    kol: &KolProfile,
    event: &NormalizedSwapEvent,
) -> bool {
    listed(&config.kol_ids, &kol.id)
        && config
            .min_hotness_score
            .map_or(true, |min| kol.hotness_score >= min)
        && within_market_cap(config.min_market_cap, config.max_market_cap, event.market_cap_usd)
}

fn kol_profile_matches(
    config: &KolProfileConfig,
    kol: Option<&KolProfile>,
    event: &NormalizedSwapEvent,
) -> bool {
    let by_address = config
        .kol_address
        .as_deref()
        .is_some_and(|address| address == event.wallet);
    let by_id = match (config.kol_id.as_deref(), kol) {
        (Some(id), Some(kol)) => kol.id == id,
        _ => false,
    };
    let by_username = match (config.kol_username.as_deref(), kol) {
        (Some(username), Some(kol)) => kol
            .username
            .trim_start_matches('@')
            .eq_ignore_ascii_case(username.trim_start_matches('@')),
        _ => false,
    };

    if !(by_address || by_id || by_username) {
        return false;
    }

    let hot_enough = match (config.min_hotness_score, kol) {
        (None, _) => true,
        (Some(min), Some(kol)) => kol.hotness_score >= min,
        (Some(_), None) => false,
    };

    hot_enough
        && within_market_cap(config.min_market_cap, config.max_market_cap, event.market_cap_usd)
}
