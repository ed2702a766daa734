//! Token balance lookups with provider fallback

use async_trait::async_trait;
use serde::{Deserialize, Serialize};
use solana_client::nonblocking::rpc_client::RpcClient;
use solana_sdk::pubkey::Pubkey;
use std::sync::Arc;
use std::time::{Duration, Instant};
use tracing::{debug, warn};

use crate::config::{mask_url, RpcConfig};
use crate::error::{Error, Result};

/// Raw on-chain token amount
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
pub struct RawBalance {
    pub amount: u64,
    pub decimals: u8,
}

impl RawBalance {
    /// Amount in UI units
    pub fn ui_amount(&self) -> f64 {
        self.amount as f64 / 10f64.powi(i32::from(self.decimals))
    }
}

/// Something that can report an SPL token balance
#[async_trait]
pub trait BalanceProvider: Send + Sync {
    fn name(&self) -> &str;

    /// Balance of `mint` held by `owner`; a missing token account is zero
    async fn token_balance(&self, owner: &Pubkey, mint: &Pubkey) -> Result<RawBalance>;

    /// Cheap reachability probe
    async fn health(&self) -> Result<()>;
}

/// Balance provider backed by a Solana JSON-RPC endpoint
pub struct RpcBalanceProvider {
    label: String,
    client: RpcClient,
}

impl RpcBalanceProvider {
    pub fn new(endpoint: &str, timeout: Duration) -> Self {
        Self {
            label: mask_url(endpoint),
            client: RpcClient::new_with_timeout(endpoint.to_string(), timeout),
        }
    }

    async fn mint_decimals(&self, mint: &Pubkey) -> Result<u8> {
        let supply = self.client.get_token_supply(mint).await?;
        Ok(supply.decimals)
    }
}

fn is_missing_account(error: &solana_client::client_error::ClientError) -> bool {
    let message = error.to_string();
    message.contains("could not find account") || message.contains("AccountNotFound")
}

#[async_trait]
impl BalanceProvider for RpcBalanceProvider {
    fn name(&self) -> &str {
        &self.label
    }

    async fn token_balance(&self, owner: &Pubkey, mint: &Pubkey) -> Result<RawBalance> {
        let ata = spl_associated_token_account::get_associated_token_address(owner, mint);

        match self.client.get_token_account_balance(&ata).await {
            Ok(balance) => {
                let amount = balance.amount.parse::<u64>().map_err(|e| {
                    Error::Rpc(format!("Unparseable token amount '{}': {}", balance.amount, e))
                })?;
                Ok(RawBalance {
                    amount,
                    decimals: balance.decimals,
                })
            }
            Err(e) if is_missing_account(&e) => {
                debug!(owner = %owner, "No token account, balance is zero");
                Ok(RawBalance {
                    amount: 0,
                    decimals: self.mint_decimals(mint).await?,
                })
            }
            Err(e) => Err(e.into()),
        }
    }

    async fn health(&self) -> Result<()> {
        self.client.get_slot().await?;
        Ok(())
    }
}

/// Outcome of probing one provider
#[derive(Debug, Clone)]
pub struct ProviderHealth {
    pub name: String,
    pub latency: Duration,
    pub error: Option<String>,
}

/// Queries providers in order, falling back on error or timeout
pub struct BalanceOracle {
    providers: Vec<Arc<dyn BalanceProvider>>,
    timeout: Duration,
}

impl BalanceOracle {
    pub fn new(providers: Vec<Arc<dyn BalanceProvider>>, timeout: Duration) -> Self {
        Self { providers, timeout }
    }

    /// Primary endpoint followed by the configured fallbacks
    pub fn from_config(config: &RpcConfig) -> Self {
        let timeout = Duration::from_millis(config.timeout_ms);
        let providers = std::iter::once(&config.primary_endpoint)
            .chain(config.fallback_endpoints.iter())
            .map(|endpoint| {
                Arc::new(RpcBalanceProvider::new(endpoint, timeout)) as Arc<dyn BalanceProvider>
            })
            .collect();
        Self::new(providers, timeout)
    }

    pub fn provider_count(&self) -> usize {
        self.providers.len()
    }

    pub async fn token_balance(&self, owner: &Pubkey, mint: &Pubkey) -> Result<RawBalance> {
        let mut failures = Vec::with_capacity(self.providers.len());

        for provider in &self.providers {
            match tokio::time::timeout(self.timeout, provider.token_balance(owner, mint)).await {
                Ok(Ok(balance)) => return Ok(balance),
                Ok(Err(e)) => {
                    warn!(provider = provider.name(), error = %e, "Balance query failed, trying next provider");
                    failures.push(format!("{}: {}", provider.name(), e));
                }
                Err(_) => {
                    let e = Error::RpcTimeout(self.timeout.as_millis() as u64);
                    warn!(provider = provider.name(), error = %e, "Balance query timed out, trying next provider");
                    failures.push(format!("{}: {}", provider.name(), e));
                }
            }
        }

        if failures.is_empty() {
            failures.push("no providers configured".to_string());
        }
        Err(Error::ProvidersExhausted(failures.join("; ")))
    }

    /// Probe every provider once
    pub async fn health(&self) -> Vec<ProviderHealth> {
        let mut report = Vec::with_capacity(self.providers.len());
        for provider in &self.providers {
            let started = Instant::now();
            let error = match tokio::time::timeout(self.timeout, provider.health()).await {
                Ok(Ok(())) => None,
                Ok(Err(e)) => Some(e.to_string()),
                Err(_) => Some(Error::RpcTimeout(self.timeout.as_millis() as u64).to_string()),
            };
            report.push(ProviderHealth {
                name: provider.name().to_string(),
                latency: started.elapsed(),
                error,
            });
        }
        report
    }
}


#[cfg(test)]
mod tests {
    use super::fakes::FakeProvider;
    use super::*;

    fn keys() -> (Pubkey, Pubkey) {
        (Pubkey::new_unique(), Pubkey::new_unique())
    }

    #[tokio::test]
    async fn test_primary_answers() {
        let primary = Arc::new(FakeProvider::ok("primary", 42, 6));
        let secondary = Arc::new(FakeProvider::ok("secondary", 7, 6));
        let oracle = BalanceOracle::new(
            vec![primary.clone(), secondary.clone()],
            Duration::from_millis(200),
        );

        let (owner, mint) = keys();
        let balance = oracle.token_balance(&owner, &mint).await.unwrap();
        assert_eq!(balance.amount, 42);
        assert_eq!(secondary.calls(), 0);
    }

    #[tokio::test]
    async fn test_falls_back_on_error() {
        let oracle = BalanceOracle::new(
            vec![
                Arc::new(FakeProvider::failing("primary")),
                Arc::new(FakeProvider::ok("secondary", 7, 6)),
            ],
            Duration::from_millis(200),
        );

        let (owner, mint) = keys();
        assert_eq!(oracle.token_balance(&owner, &mint).await.unwrap().amount, 7);
    }

    #[tokio::test]
    async fn test_falls_back_on_timeout() {
        let oracle = BalanceOracle::new(
            vec![
                Arc::new(FakeProvider::ok("primary", 1, 6).slow(Duration::from_millis(500))),
                Arc::new(FakeProvider::ok("secondary", 2, 6)),
            ],
            Duration::from_millis(50),
        );

        let (owner, mint) = keys();
        let started = Instant::now();
        assert_eq!(oracle.token_balance(&owner, &mint).await.unwrap().amount, 2);
        assert!(started.elapsed() < Duration::from_millis(400));
    }

    #[tokio::test]
    async fn test_all_providers_fail() {
        let oracle = BalanceOracle::new(
            vec![
                Arc::new(FakeProvider::failing("primary")),
                Arc::new(FakeProvider::failing("secondary")),
            ],
            Duration::from_millis(50),
        );

        let (owner, mint) = keys();
        match oracle.token_balance(&owner, &mint).await {
            Err(Error::ProvidersExhausted(reason)) => {
                assert!(reason.contains("primary"));
                assert!(reason.contains("secondary"));
            }
            other => panic!("expected exhaustion, got {:?}", other),
        }
    }

    #[tokio::test]
    async fn test_health_report() {
        let oracle = BalanceOracle::new(
            vec![
                Arc::new(FakeProvider::ok("up", 1, 6)),
                Arc::new(FakeProvider::failing("down")),
            ],
            Duration::from_millis(50),
        );
        let report = oracle.health().await;
        assert_eq!(report.len(), 2);
        assert!(report[0].error.is_none());
        assert!(report[1].error.is_some());
    }

    #[test]
    fn test_ui_amount() {
        let balance = RawBalance {
            amount: 2_000_000,
            decimals: 6,
        };
        assert_eq!(balance.ui_amount(), 2.0);
    }

    #[test]
    fn test_from_config_orders_providers() {
        let config = RpcConfig {
            primary_endpoint: "https://primary.example".into(),
            fallback_endpoints: vec!["https://fallback.example".into()],
            timeout_ms: 1_000,
        };
        let oracle = BalanceOracle::from_config(&config);
        assert_eq!(oracle.provider_count(), 2);
    }
}
