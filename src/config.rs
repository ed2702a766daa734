//! Configuration loading and validation

use anyhow::{Context, Result};
use serde::Deserialize;
use std::path::Path;

use crate::types::parse_address;

/// Main configuration structure
#[derive(Debug, Clone, Deserialize)]
pub struct Config {
    #[serde(default)]
    pub rpc: RpcConfig,
    #[serde(default)]
    pub helius: HeliusConfig,
    #[serde(default)]
    pub feeds: FeedsConfig,
    #[serde(default)]
    pub dedup: DedupConfig,
    #[serde(default)]
    pub backpressure: BackpressureConfig,
    #[serde(default)]
    pub cluster: ClusterConfig,
    #[serde(default)]
    pub premium: PremiumConfig,
    #[serde(default)]
    pub alerts: AlertsConfig,
    /// Seconds of shutdown wait before slow in-flight ticks are reported
    #[serde(default = "default_shutdown_grace_secs")]
    pub shutdown_grace_secs: u64,
}

/// Balance RPC endpoints, tried in order
#[derive(Debug, Clone, Deserialize)]
pub struct RpcConfig {
    #[serde(default = "default_rpc_endpoint")]
    pub primary_endpoint: String,
    #[serde(default)]
    pub fallback_endpoints: Vec<String>,
    #[serde(default = "default_timeout_ms")]
    pub timeout_ms: u64,
}

#[derive(Debug, Clone, Deserialize)]
pub struct HeliusConfig {
    #[serde(default = "default_helius_api_key")]
    pub api_key: String,
    #[serde(default = "default_helius_rest_url")]
    pub rest_base_url: String,
    #[serde(default = "default_helius_rpc_url")]
    pub rpc_url: String,
    /// Page size for signature history requests; ticks page back to the checkpoint
    #[serde(default = "default_signature_limit")]
    pub signature_limit: usize,
    /// Fixed SOL/USD rate for pricing SOL legs of swaps
    ///
    /// Not refreshed at runtime. Set it through `RADAR__HELIUS__SOL_PRICE_USD`
    /// and restart when the market moves; USD volumes and thresholds drift with it.
    #[serde(default = "default_sol_price_usd")]
    pub sol_price_usd: f64,
    #[serde(default = "default_timeout_ms")]
    pub timeout_ms: u64,
}

#[derive(Debug, Clone, Deserialize, Default)]
pub struct FeedsConfig {
    #[serde(default)]
    pub whale: FeedConfig,
    #[serde(default)]
    pub kol: FeedConfig,
}

/// One tracked-address polling loop
#[derive(Debug, Clone, Deserialize)]
pub struct FeedConfig {
    #[serde(default = "default_true")]
    pub enabled: bool,
    #[serde(default)]
    pub addresses: Vec<String>,
    #[serde(default = "default_feed_interval_secs")]
    pub interval_secs: u64,
}

#[derive(Debug, Clone, Deserialize)]
pub struct DedupConfig {
    #[serde(default = "default_dedup_retention_secs")]
    pub retention_secs: u64,
    #[serde(default = "default_dedup_max_entries")]
    pub max_entries: usize,
}

#[derive(Debug, Clone, Deserialize)]
pub struct BackpressureConfig {
    #[serde(default = "default_queue_capacity")]
    pub capacity: usize,
    #[serde(default = "default_high_water_mark")]
    pub high_water_mark: usize,
    #[serde(default = "default_low_water_mark")]
    pub low_water_mark: usize,
    #[serde(default = "default_drain_interval_ms")]
    pub drain_interval_ms: u64,
    #[serde(default = "default_drain_batch")]
    pub drain_batch: usize,
}

#[derive(Debug, Clone, Deserialize)]
pub struct ClusterConfig {
    #[serde(default = "default_window_minutes")]
    pub window_minutes: u32,
    #[serde(default = "default_sweep_interval_secs")]
    pub sweep_interval_secs: u64,
}

#[derive(Debug, Clone, Deserialize)]
pub struct PremiumConfig {
    /// Mint of the token that unlocks premium alerts
    #[serde(default)]
    pub token_mint: String,
    /// Balance (UI units) required for access
    #[serde(default = "default_required_balance")]
    pub required_balance: f64,
    #[serde(default = "default_balance_cache_ttl_secs")]
    pub cache_ttl_secs: u64,
}

#[derive(Debug, Clone, Deserialize, Default)]
pub struct AlertsConfig {
    /// JSON file of alert subscriptions loaded at startup
    #[serde(default)]
    pub subscriptions_path: Option<String>,
    /// JSON file of known KOL wallets
    #[serde(default)]
    pub kols_path: Option<String>,
    /// Deliver matches to this webhook instead of the log
    #[serde(default)]
    pub webhook_url: Option<String>,
}

// Default value functions
fn default_rpc_endpoint() -> String {
    std::env::var("RPC_ENDPOINT").unwrap_or_else(|_| "https://api.mainnet-beta.solana.com".into())
}

fn default_helius_api_key() -> String {
    std::env::var("HELIUS_API_KEY").unwrap_or_default()
}

fn default_helius_rest_url() -> String {
    "https://api.helius.xyz".into()
}

fn default_helius_rpc_url() -> String {
    "https://mainnet.helius-rpc.com".into()
}

fn default_timeout_ms() -> u64 {
    5000
}

fn default_signature_limit() -> usize {
    50
}

fn default_sol_price_usd() -> f64 {
    150.0
}

fn default_feed_interval_secs() -> u64 {
    10
}

fn default_dedup_retention_secs() -> u64 {
    3600
}

fn default_dedup_max_entries() -> usize {
    100_000
}

fn default_queue_capacity() -> usize {
    10_000
}

fn default_high_water_mark() -> usize {
    8_000
}

fn default_low_water_mark() -> usize {
    5_000
}

fn default_drain_interval_ms() -> u64 {
    250
}

fn default_drain_batch() -> usize {
    500
}

fn default_window_minutes() -> u32 {
    15
}

fn default_sweep_interval_secs() -> u64 {
    60
}

fn default_required_balance() -> f64 {
    1.0
}

fn default_balance_cache_ttl_secs() -> u64 {
    60
}

fn default_shutdown_grace_secs() -> u64 {
    30
}

fn default_true() -> bool {
    true
}

impl Default for RpcConfig {
    fn default() -> Self {
        Self {
            primary_endpoint: default_rpc_endpoint(),
            fallback_endpoints: Vec::new(),
            timeout_ms: default_timeout_ms(),
        }
    }
}

impl Default for HeliusConfig {
    fn default() -> Self {
        Self {
            api_key: default_helius_api_key(),
            rest_base_url: default_helius_rest_url(),
            rpc_url: default_helius_rpc_url(),
            signature_limit: default_signature_limit(),
            sol_price_usd: default_sol_price_usd(),
            timeout_ms: default_timeout_ms(),
        }
    }
}

impl Default for FeedConfig {
    fn default() -> Self {
        Self {
            enabled: true,
            addresses: Vec::new(),
            interval_secs: default_feed_interval_secs(),
        }
    }
}

impl Default for DedupConfig {
    fn default() -> Self {
        Self {
            retention_secs: default_dedup_retention_secs(),
            max_entries: default_dedup_max_entries(),
        }
    }
}

impl Default for BackpressureConfig {
    fn default() -> Self {
        Self {
            capacity: default_queue_capacity(),
            high_water_mark: default_high_water_mark(),
            low_water_mark: default_low_water_mark(),
            drain_interval_ms: default_drain_interval_ms(),
            drain_batch: default_drain_batch(),
        }
    }
}

impl Default for ClusterConfig {
    fn default() -> Self {
        Self {
            window_minutes: default_window_minutes(),
            sweep_interval_secs: default_sweep_interval_secs(),
        }
    }
}

impl Default for PremiumConfig {
    fn default() -> Self {
        Self {
            token_mint: String::new(),
            required_balance: default_required_balance(),
            cache_ttl_secs: default_balance_cache_ttl_secs(),
        }
    }
}

impl Default for Config {
    fn default() -> Self {
        Self {
            rpc: RpcConfig::default(),
            helius: HeliusConfig::default(),
            feeds: FeedsConfig::default(),
            dedup: DedupConfig::default(),
            backpressure: BackpressureConfig::default(),
            cluster: ClusterConfig::default(),
            premium: PremiumConfig::default(),
            alerts: AlertsConfig::default(),
            shutdown_grace_secs: default_shutdown_grace_secs(),
        }
    }
}

impl Config {
    /// Load configuration from file and environment variables
    pub fn load<P: AsRef<Path>>(path: P) -> Result<Self> {
        let path = path.as_ref();

        let settings = config::Config::builder()
            // Start with defaults
            .set_default("rpc.primary_endpoint", default_rpc_endpoint())?
            .set_default("rpc.timeout_ms", default_timeout_ms() as i64)?
            // Load from file if exists
            .add_source(config::File::from(path).required(false))
            // Override with environment variables (prefix RADAR_)
            .add_source(
                config::Environment::with_prefix("RADAR")
                    .separator("__")
                    .try_parsing(true),
            )
            .build()
            .context("Failed to build configuration")?;

        let config: Config = settings
            .try_deserialize()
            .context("Failed to deserialize configuration")?;

        // Validate configuration
        config.validate()?;

        Ok(config)
    }

    /// Validate configuration values
    pub fn validate(&self) -> Result<()> {
        let bp = &self.backpressure;
        if bp.capacity == 0 {
            anyhow::bail!("backpressure.capacity must be positive");
        }
        if bp.high_water_mark > bp.capacity {
            anyhow::bail!(
                "backpressure.high_water_mark ({}) cannot exceed capacity ({})",
                bp.high_water_mark,
                bp.capacity
            );
        }
        if bp.low_water_mark > bp.high_water_mark {
            anyhow::bail!(
                "backpressure.low_water_mark ({}) cannot exceed high_water_mark ({})",
                bp.low_water_mark,
                bp.high_water_mark
            );
        }
        if bp.drain_interval_ms == 0 || bp.drain_batch == 0 {
            anyhow::bail!("backpressure drain interval and batch must be positive");
        }

        if self.dedup.retention_secs == 0 || self.dedup.max_entries == 0 {
            anyhow::bail!("dedup retention and max_entries must be positive");
        }

        if self.cluster.window_minutes == 0 {
            anyhow::bail!("cluster.window_minutes must be positive");
        }
        if self.cluster.sweep_interval_secs == 0 {
            anyhow::bail!("cluster.sweep_interval_secs must be positive");
        }

        // NaN fails every comparison, so test for the valid range
        if !(self.premium.required_balance.is_finite() && self.premium.required_balance > 0.0) {
            anyhow::bail!(
                "premium.required_balance must be a positive number, got {}",
                self.premium.required_balance
            );
        }
        if !(self.helius.sol_price_usd.is_finite() && self.helius.sol_price_usd > 0.0) {
            anyhow::bail!(
                "helius.sol_price_usd must be a positive number, got {}",
                self.helius.sol_price_usd
            );
        }
        if !self.premium.token_mint.is_empty() {
            parse_address(&self.premium.token_mint)
                .with_context(|| "Invalid premium.token_mint".to_string())?;
        }

        for (name, feed) in [("whale", &self.feeds.whale), ("kol", &self.feeds.kol)] {
            if feed.interval_secs == 0 {
                anyhow::bail!("feeds.{}.interval_secs must be positive", name);
            }
            // Validate wallet addresses
            for address in &feed.addresses {
                parse_address(address)
                    .with_context(|| format!("Invalid address in feeds.{}", name))?;
            }
        }

        if self.rpc.timeout_ms == 0 {
            anyhow::bail!("rpc.timeout_ms must be positive");
        }

        if self.feeds.whale.enabled && self.helius.api_key.is_empty() {
            tracing::warn!("helius.api_key is empty - signature fetches will likely be rejected");
        }

        Ok(())
    }

    /// Get masked configuration for display (hide secrets)
    pub fn masked_display(&self) -> String {
        format!(
            r#"Configuration:
  RPC:
    primary: {}
    fallbacks: {}
    timeout: {}ms
  Helius:
    rest: {}
    api_key: {}
    signature_limit: {}
    sol_price_usd: {} (static)
  Feeds:
    whale: enabled={} addresses={} every {}s
    kol: enabled={} addresses={} every {}s
  Dedup:
    retention: {}s
    max_entries: {}
  Backpressure:
    capacity: {}
    high/low water: {}/{}
  Cluster:
    window: {}min
  Premium:
    token_mint: {}
    required_balance: {}
    cache_ttl: {}s
"#,
            mask_url(&self.rpc.primary_endpoint),
            self.rpc.fallback_endpoints.len(),
            self.rpc.timeout_ms,
            self.helius.rest_base_url,
            if self.helius.api_key.is_empty() {
                "(not set)"
            } else {
                "***"
            },
            self.helius.signature_limit,
            self.helius.sol_price_usd,
            self.feeds.whale.enabled,
            self.feeds.whale.addresses.len(),
            self.feeds.whale.interval_secs,
            self.feeds.kol.enabled,
            self.feeds.kol.addresses.len(),
            self.feeds.kol.interval_secs,
            self.dedup.retention_secs,
            self.dedup.max_entries,
            self.backpressure.capacity,
            self.backpressure.high_water_mark,
            self.backpressure.low_water_mark,
            self.cluster.window_minutes,
            if self.premium.token_mint.is_empty() {
                "(not set)"
            } else {
                self.premium.token_mint.as_str()
            },
            self.premium.required_balance,
            self.premium.cache_ttl_secs,
        )
    }
}

/// Mask URL for display (hide API keys in query params)
pub fn mask_url(url: &str) -> String {
    if let Some(idx) = url.find('?') {
        format!("{}?***", &url[..idx])
    } else {
        url.to_string()
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::io::Write;

    #[test]
    fn test_default_config() {
        let config = Config::default();
        assert_eq!(config.cluster.window_minutes, 15);
        assert_eq!(config.feeds.whale.interval_secs, 10);
        assert_eq!(config.premium.required_balance, 1.0);
        assert!(config.validate().is_ok());
    }

    #[test]
    fn test_watermark_validation() {
        let mut config = Config::default();
        config.backpressure.low_water_mark = 9_000;
        assert!(config.validate().is_err());

        let mut config = Config::default();
        config.backpressure.high_water_mark = config.backpressure.capacity + 1;
        assert!(config.validate().is_err());
    }

    #[test]
    fn test_non_finite_amounts_rejected() {
        for bad in [f64::NAN, f64::INFINITY, -1.0, 0.0] {
            let mut config = Config::default();
            config.premium.required_balance = bad;
            assert!(config.validate().is_err(), "required_balance {} accepted", bad);

            let mut config = Config::default();
            config.helius.sol_price_usd = bad;
            assert!(config.validate().is_err(), "sol_price_usd {} accepted", bad);
        }
    }

    #[test]
    fn test_invalid_feed_address() {
        let mut config = Config::default();
        config.feeds.kol.addresses.push("not-an-address".to_string());
        assert!(config.validate().is_err());
    }

    #[test]
    fn test_load_from_file() {
        let mut file = tempfile::Builder::new().suffix(".toml").tempfile().unwrap();
        writeln!(
            file,
            r#"
[backpressure]
capacity = 100
high_water_mark = 80
low_water_mark = 40

[cluster]
window_minutes = 5

[feeds.whale]
addresses = ["So11111111111111111111111111111111111111112"]
interval_secs = 3
"#
        )
        .unwrap();

        let config = Config::load(file.path()).unwrap();
        assert_eq!(config.backpressure.capacity, 100);
        assert_eq!(config.backpressure.low_water_mark, 40);
        assert_eq!(config.cluster.window_minutes, 5);
        assert_eq!(config.feeds.whale.addresses.len(), 1);
        assert_eq!(config.feeds.whale.interval_secs, 3);
        assert!(config.feeds.kol.enabled);
    }

    #[test]
    fn test_mask_url() {
        assert_eq!(
            mask_url("https://rpc.example.com?api-key=secret"),
            "https://rpc.example.com?***"
        );
        assert_eq!(mask_url("https://rpc.example.com"), "https://rpc.example.com");
    }
}
