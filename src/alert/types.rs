//! Alert subscription model and KOL directory

use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};
use std::collections::HashMap;
use std::path::Path;

use crate::error::{Error, Result};
use crate::types::NormalizedSwapEvent;

/// Alert categories a user can subscribe to
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "SCREAMING_SNAKE_CASE")]
pub enum AlertType {
    AlphaStream,
    WhaleCluster,
    KolActivity,
    KolProfile,
}

impl std::fmt::Display for AlertType {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        let name = match self {
            AlertType::AlphaStream => "ALPHA_STREAM",
            AlertType::WhaleCluster => "WHALE_CLUSTER",
            AlertType::KolActivity => "KOL_ACTIVITY",
            AlertType::KolProfile => "KOL_PROFILE",
        };
        write!(f, "{}", name)
    }
}

/// Type-specific subscription settings, tagged by alert type
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(tag = "type", rename_all = "SCREAMING_SNAKE_CASE")]
pub enum AlertConfig {
    AlphaStream(AlphaStreamConfig),
    WhaleCluster(WhaleClusterConfig),
    KolActivity(KolActivityConfig),
    KolProfile(KolProfileConfig),
}

impl AlertConfig {
    pub fn alert_type(&self) -> AlertType {
        match self {
            AlertConfig::AlphaStream(_) => AlertType::AlphaStream,
            AlertConfig::WhaleCluster(_) => AlertType::WhaleCluster,
            AlertConfig::KolActivity(_) => AlertType::KolActivity,
            AlertConfig::KolProfile(_) => AlertType::KolProfile,
        }
    }
}

/// Swaps by any tracked wallet, filtered by token, wallet and size
#[derive(Debug, Clone, Default, PartialEq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct AlphaStreamConfig {
    /// Empty means any token
    #[serde(default)]
    pub tokens: Vec<String>,
    /// Empty means any wallet
    #[serde(default)]
    pub wallets: Vec<String>,
    /// Minimum USD amount
    #[serde(default)]
    pub min_amount: Option<f64>,
}

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct WhaleClusterConfig {
    pub min_cluster_size: usize,
    #[serde(rename = "minInflowUSD")]
    pub min_inflow_usd: f64,
    #[serde(default)]
    pub tokens: Vec<String>,
}

/// Trades by any known KOL
#[derive(Debug, Clone, Default, PartialEq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct KolActivityConfig {
    /// Restrict to these KOL ids, empty means all
    #[serde(default)]
    pub kol_ids: Vec<String>,
    #[serde(default)]
    pub min_hotness_score: Option<f64>,
    #[serde(default)]
    pub min_market_cap: Option<f64>,
    #[serde(default)]
    pub max_market_cap: Option<f64>,
}

/// Trades by one specific KOL, identified by id, address or username
#[derive(Debug, Clone, Default, PartialEq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct KolProfileConfig {
    #[serde(default)]
    pub kol_id: Option<String>,
    #[serde(default)]
    pub kol_address: Option<String>,
    #[serde(default)]
    pub kol_username: Option<String>,
    #[serde(default)]
    pub min_hotness_score: Option<f64>,
    #[serde(default)]
    pub min_market_cap: Option<f64>,
    #[serde(default)]
    pub max_market_cap: Option<f64>,
}

/// A user-owned alert configuration
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct AlertSubscription {
    pub id: String,
    pub user_id: String,
    /// Higher is delivered first
    #[serde(default)]
    pub priority: i32,
    #[serde(default = "default_active")]
    pub active: bool,
    /// Requires the owner to pass the premium balance check
    #[serde(default)]
    pub premium: bool,
    /// Wallet checked by the premium gate
    #[serde(default)]
    pub owner_wallet: Option<String>,
    #[serde(default)]
    pub name: Option<String>,
    pub config: AlertConfig,
    #[serde(default = "Utc::now")]
    pub created_at: DateTime<Utc>,
}

fn default_active() -> bool {
    true
}

impl AlertSubscription {
    pub fn new(user_id: impl Into<String>, config: AlertConfig) -> Self {
        Self {
            id: uuid::Uuid::new_v4().to_string(),
            user_id: user_id.into(),
            priority: 0,
            active: true,
            premium: false,
            owner_wallet: None,
            name: None,
            config,
            created_at: Utc::now(),
        }
    }

    pub fn with_priority(mut self, priority: i32) -> Self {
        self.priority = priority;
        self
    }

    /// Mark as premium, gated on the given wallet's balance
    pub fn with_premium(mut self, owner_wallet: impl Into<String>) -> Self {
        self.premium = true;
        self.owner_wallet = Some(owner_wallet.into());
        self
    }

    pub fn alert_type(&self) -> AlertType {
        self.config.alert_type()
    }
}

/// Known influencer wallet
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct KolProfile {
    pub id: String,
    pub address: String,
    pub username: String,
    #[serde(default)]
    pub hotness_score: f64,
}

/// Address-indexed KOL lookup
#[derive(Debug, Clone, Default)]
pub struct KolDirectory {
    by_address: HashMap<String, KolProfile>,
}

impl KolDirectory {
    pub fn new(profiles: Vec<KolProfile>) -> Self {
        Self {
            by_address: profiles
                .into_iter()
                .map(|p| (p.address.clone(), p))
                .collect(),
        }
    }

    /// Load a JSON array of profiles
    pub fn load(path: impl AsRef<Path>) -> Result<Self> {
        let path = path.as_ref();
        let raw = std::fs::read_to_string(path)
            .map_err(|e| Error::Io(format!("{}: {}", path.display(), e)))?;
        let profiles: Vec<KolProfile> = serde_json::from_str(&raw)
            .map_err(|e| Error::Deserialization(format!("{}: {}", path.display(), e)))?;
        Ok(Self::new(profiles))
    }

    pub fn lookup(&self, address: &str) -> Option<&KolProfile> {
        self.by_address.get(address)
    }

    /// Addresses for the KOL ingestion feed
    pub fn addresses(&self) -> Vec<String> {
        self.by_address.keys().cloned().collect()
    }

    pub fn len(&self) -> usize {
        self.by_address.len()
    }

    pub fn is_empty(&self) -> bool {
        self.by_address.is_empty()
    }
}

/// Aggregate of coordinated buying for one token window
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct ClusterResult {
    pub token_mint: String,
    pub window_start: DateTime<Utc>,
    /// Distinct buying wallets
    pub count: usize,
    #[serde(rename = "totalVolumeUSD")]
    pub total_volume_usd: f64,
    pub time_window_minutes: u32,
    pub last_update: DateTime<Utc>,
    /// Subscriptions whose thresholds this update crossed for the first time
    #[serde(skip)]
    pub newly_crossed: Vec<String>,
}

/// Input to the matcher
#[derive(Debug, Clone, Copy)]
pub enum Signal<'a> {
    Swap(&'a NormalizedSwapEvent),
    Cluster(&'a ClusterResult),
}

/// What a subscription matched on
#[derive(Debug, Clone, PartialEq, Serialize)]
#[serde(tag = "kind", rename_all = "snake_case")]
pub enum AlertPayload {
    Swap {
        event: NormalizedSwapEvent,
        #[serde(skip_serializing_if = "Option::is_none")]
        kol: Option<KolProfile>,
    },
    Cluster {
        cluster: ClusterResult,
    },
}

impl AlertPayload {
    pub fn token_mint(&self) -> &str {
        match self {
            AlertPayload::Swap { event, .. } => &event.token_mint,
            AlertPayload::Cluster { cluster } => &cluster.token_mint,
        }
    }
}

/// A subscription paired with the payload it matched
#[derive(Debug, Clone, PartialEq, Serialize)]
#[serde(rename_all = "camelCase")]
pub struct AlertMatch {
    pub subscription: AlertSubscription,
    pub payload: AlertPayload,
}
