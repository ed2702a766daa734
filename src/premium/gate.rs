//! Premium access gate
//!
//! A wallet has premium access when it holds at least the required amount
//! of the premium token. Balances are compared in raw integer units so the
//! boundary is exact: holding exactly the threshold grants access.

use serde::{Deserialize, Serialize};
use solana_sdk::pubkey::Pubkey;
use std::sync::Arc;
use std::time::Duration;
use tracing::{debug, info, warn};

use crate::cache::{keys, KvStore};
use crate::config::PremiumConfig;
use crate::error::Result;
use crate::premium::oracle::{BalanceOracle, RawBalance};
use crate::types::{parse_address, short};

/// Decimal places a balance difference is reported with
const DIFFERENCE_DECIMALS: i32 = 6;

/// Outcome of a premium balance check
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct PremiumAccessResult {
    pub has_access: bool,
    pub current_balance: f64,
    pub required_balance: f64,
    /// How much more is needed, only present when access is denied
    #[serde(skip_serializing_if = "Option::is_none")]
    pub difference: Option<f64>,
    /// Set when the balance could not be determined
    #[serde(skip_serializing_if = "Option::is_none")]
    pub error: Option<String>,
}

impl PremiumAccessResult {
    fn unavailable(required_balance: f64, error: String) -> Self {
        Self {
            has_access: false,
            current_balance: 0.0,
            required_balance,
            difference: Some(required_balance),
            error: Some(error),
        }
    }
}

/// Raw units needed to hold `threshold` UI units at `decimals`
fn required_raw(threshold: f64, decimals: u8) -> u128 {
    let scaled = threshold * 10f64.powi(i32::from(decimals));
    let nearest = scaled.round();
    // Absorb float noise such as 1.1 * 1e6 = 1100000.0000000002
    let raw = if (scaled - nearest).abs() < 1e-6 {
        nearest
    } else {
        scaled.ceil()
    };
    raw.max(0.0) as u128
}

fn round_to(value: f64, places: i32) -> f64 {
    let factor = 10f64.powi(places);
    (value * factor).round() / factor
}

/// Compare a raw balance against a UI-unit threshold
pub fn evaluate(balance: RawBalance, required_balance: f64) -> PremiumAccessResult {
    let required = required_raw(required_balance, balance.decimals);
    let held = u128::from(balance.amount);
    let has_access = held >= required;

    let difference = (!has_access).then(|| {
        let missing = (required - held) as f64 / 10f64.powi(i32::from(balance.decimals));
        round_to(missing, DIFFERENCE_DECIMALS)
    });

    PremiumAccessResult {
        has_access,
        current_balance: balance.ui_amount(),
        required_balance,
        difference,
        error: None,
    }
}

/// Cached balance check against the premium token
pub struct PremiumGate {
    oracle: Arc<BalanceOracle>,
    cache: Arc<dyn KvStore>,
    token_mint: Option<Pubkey>,
    required_balance: f64,
    cache_ttl: Duration,
}

impl PremiumGate {
    pub fn new(
        oracle: Arc<BalanceOracle>,
        cache: Arc<dyn KvStore>,
        token_mint: Option<Pubkey>,
        required_balance: f64,
        cache_ttl: Duration,
    ) -> Self {
        Self {
            oracle,
            cache,
            token_mint,
            required_balance,
            cache_ttl,
        }
    }

    pub fn from_config(
        config: &PremiumConfig,
        oracle: Arc<BalanceOracle>,
        cache: Arc<dyn KvStore>,
    ) -> Result<Self> {
        let token_mint = if config.token_mint.is_empty() {
            None
        } else {
            Some(parse_address(&config.token_mint)?)
        };
        Ok(Self::new(
            oracle,
            cache,
            token_mint,
            config.required_balance,
            Duration::from_secs(config.cache_ttl_secs),
        ))
    }

    pub fn required_balance(&self) -> f64 {
        self.required_balance
    }

    /// Decide whether `wallet` holds enough of the premium token
    ///
    /// Never fails: an unreadable balance is reported as a denial carrying
    /// an error marker.
    pub async fn check_access(&self, wallet: &str) -> PremiumAccessResult {
        let Some(mint) = self.token_mint else {
            return PremiumAccessResult::unavailable(
                self.required_balance,
                "premium token mint not configured".to_string(),
            );
        };
        let owner = match parse_address(wallet) {
            Ok(owner) => owner,
            Err(e) => return PremiumAccessResult::unavailable(self.required_balance, e.to_string()),
        };

        let balance = match self.cached_balance(wallet).await {
            Some(balance) => balance,
            None => match self.oracle.token_balance(&owner, &mint).await {
                Ok(balance) => {
                    self.store_balance(wallet, balance).await;
                    balance
                }
                Err(e) => {
                    warn!(wallet = %short(wallet), error = %e, "Premium balance unavailable, denying access");
                    return PremiumAccessResult::unavailable(self.required_balance, e.to_string());
                }
            },
        };

        let result = evaluate(balance, self.required_balance);
        info!(
            wallet = %short(wallet),
            balance = result.current_balance,
            required = result.required_balance,
            has_access = result.has_access,
            "Premium access checked"
        );
        result
    }

    async fn cached_balance(&self, wallet: &str) -> Option<RawBalance> {
        match self.cache.get(&keys::balance(wallet)).await {
            Ok(Some(raw)) => match serde_json::from_str(&raw) {
                Ok(balance) => {
                    debug!(wallet = %short(wallet), "Balance cache hit");
                    Some(balance)
                }
                Err(e) => {
                    warn!(wallet = %short(wallet), error = %e, "Corrupt balance cache entry");
                    None
                }
            },
            Ok(None) => None,
            Err(e) => {
                warn!(wallet = %short(wallet), error = %e, "Balance cache unavailable, querying chain");
                None
            }
        }
    }

    async fn store_balance(&self, wallet: &str, balance: RawBalance) {
        let raw = match serde_json::to_string(&balance) {
            Ok(raw) => raw,
            Err(e) => {
                warn!(error = %e, "Failed to encode balance");
                return;
            }
        };
        if let Err(e) = self
            .cache
            .set(&keys::balance(wallet), raw, Some(self.cache_ttl))
            .await
        {
            warn!(wallet = %short(wallet), error = %e, "Failed to cache balance");
        }
    }
}
