//! Signature discovery and transaction parsing
//!
//! The ingestor only talks to the [`SignatureSource`] trait. The Helius
//! implementation polls `getSignaturesForAddress` for every tracked address
//! and resolves signatures through the enhanced-transactions REST API.

use async_trait::async_trait;
use chrono::{DateTime, Utc};
use reqwest::Client;
use serde::{Deserialize, Serialize};
use std::collections::HashMap;
use std::future::Future;
use std::time::Duration;
use tracing::debug;

use crate::config::HeliusConfig;
use crate::error::{Error, Result};
use crate::types::{short, validate_signature, NormalizedSwapEvent, SwapSide, TransactionSignature};

/// Wrapped SOL mint
pub const WSOL_MINT: &str = "So11111111111111111111111111111111111111112";
/// USDC mint
pub const USDC_MINT: &str = "EPjFWdd5AufqSSqeM2qN1xzybapC8G4wEGGkZwyTDt1v";
/// USDT mint
pub const USDT_MINT: &str = "Es9vMFrzaCERmJfrF4H2FYD4KCoNkY11McCe8BenwNYB";

const LAMPORTS_PER_SOL: f64 = 1_000_000_000.0;

/// Newest processed signature per tracked address
#[derive(Debug, Clone, Default, PartialEq, Eq, Serialize, Deserialize)]
pub struct Checkpoint {
    cursors: HashMap<String, String>,
}

impl Checkpoint {
    /// Cursor for an address, if any signature has been processed for it
    pub fn cursor(&self, address: &str) -> Option<&str> {
        self.cursors.get(address).map(String::as_str)
    }

    /// Move an address cursor forward
    pub fn advance(&mut self, address: &str, signature: &str) {
        self.cursors
            .insert(address.to_string(), signature.to_string());
    }

    pub fn len(&self) -> usize {
        self.cursors.len()
    }

    pub fn is_empty(&self) -> bool {
        self.cursors.is_empty()
    }
}

/// RPC / parsing collaborator
#[async_trait]
pub trait SignatureSource: Send + Sync {
    /// Signatures newer than the checkpoint, newest first per address
    async fn fetch_signatures(
        &self,
        addresses: &[String],
        since: &Checkpoint,
    ) -> Result<Vec<TransactionSignature>>;

    /// Resolve a signature to a swap; `Ok(None)` when it is not a swap
    async fn parse_transaction(
        &self,
        signature: &TransactionSignature,
    ) -> Result<Option<NormalizedSwapEvent>>;
}

/// Helius-backed signature source
pub struct HeliusSource {
    client: Client,
    api_key: String,
    rest_base_url: String,
    rpc_url: String,
    signature_limit: usize,
    sol_price_usd: f64,
}

impl HeliusSource {
    /// Create a new Helius source
    pub fn new(config: &HeliusConfig) -> Result<Self> {
        let client = Client::builder()
            .timeout(Duration::from_millis(config.timeout_ms))
            .build()
            .map_err(|e| Error::Config(format!("Failed to create HTTP client: {}", e)))?;

        Ok(Self {
            client,
            api_key: config.api_key.clone(),
            rest_base_url: config.rest_base_url.trim_end_matches('/').to_string(),
            rpc_url: config.rpc_url.trim_end_matches('/').to_string(),
            signature_limit: config.signature_limit.max(1),
            sol_price_usd: config.sol_price_usd,
        })
    }

    /// Every signature newer than `until`, newest first
    ///
    /// Pages back with `before` until the cursor is reached. Without a
    /// cursor only the newest page is taken.
    async fn signatures_for_address(
        &self,
        address: &str,
        until: Option<&str>,
    ) -> Result<Vec<TransactionSignature>> {
        let infos = collect_pages(self.signature_limit, until, |before| {
            self.signature_page(address, until, before)
        })
        .await?;

        let discovered = infos
            .into_iter()
            .filter(|info| {
                if info.err.is_some() {
                    debug!(signature = %short(&info.signature), "Skipping failed transaction");
                    return false;
                }
                if let Err(e) = validate_signature(&info.signature) {
                    debug!(error = %e, "Skipping malformed signature");
                    return false;
                }
                true
            })
            .map(|info| {
                let block_time = info
                    .block_time
                    .and_then(|ts| DateTime::from_timestamp(ts, 0));
                TransactionSignature::new(info.signature, address).with_block_time(block_time)
            })
            .collect();

        Ok(discovered)
    }

    async fn signature_page(
        &self,
        address: &str,
        until: Option<&str>,
        before: Option<String>,
    ) -> Result<Vec<SignatureInfo>> {
        let mut options = serde_json::json!({ "limit": self.signature_limit });
        if let Some(until) = until {
            options["until"] = serde_json::Value::String(until.to_string());
        }
        if let Some(before) = before {
            options["before"] = serde_json::Value::String(before);
        }
        let request = serde_json::json!({
            "jsonrpc": "2.0",
            "id": "radar-signatures",
            "method": "getSignaturesForAddress",
            "params": [address, options]
        });

        let url = format!("{}/?api-key={}", self.rpc_url, self.api_key);
        let response = self
            .client
            .post(&url)
            .json(&request)
            .send()
            .await
            .map_err(|e| Error::Rpc(format!("Helius RPC request failed: {}", e)))?;

        if !response.status().is_success() {
            let status = response.status();
            let body = response.text().await.unwrap_or_default();
            return Err(Error::Rpc(format!("Helius RPC error {}: {}", status, body)));
        }

        let rpc_response: RpcResponse<Vec<SignatureInfo>> = response
            .json()
            .await
            .map_err(|e| Error::Deserialization(format!("Failed to parse RPC response: {}", e)))?;

        if let Some(error) = rpc_response.error {
            return Err(Error::Rpc(format!("Helius RPC error: {}", error.message)));
        }

        Ok(rpc_response.result.unwrap_or_default())
    }
}

/// Follow signature pages (newest first) until a short page
///
/// A failed page fails the whole walk so the caller keeps its cursor.
async fn collect_pages<F, Fut>(
    limit: usize,
    until: Option<&str>,
    mut fetch_page: F,
) -> Result<Vec<SignatureInfo>>
where
    F: FnMut(Option<String>) -> Fut,
    Fut: Future<Output = Result<Vec<SignatureInfo>>>,
{
    let mut all: Vec<SignatureInfo> = Vec::new();
    let mut before: Option<String> = None;
    let mut pages = 0usize;

    loop {
        let page = fetch_page(before.take()).await?;
        pages += 1;
        let full = page.len() >= limit;
        let oldest = page.last().map(|info| info.signature.clone());
        all.extend(page);

        if !full || until.is_none() {
            break;
        }
        match oldest {
            Some(signature) => before = Some(signature),
            None => break,
        }
    }

    if pages > 1 {
        debug!(pages, signatures = all.len(), "Paged back to checkpoint");
    }
    Ok(all)
}

#[async_trait]
impl SignatureSource for HeliusSource {
    async fn fetch_signatures(
        &self,
        addresses: &[String],
        since: &Checkpoint,
    ) -> Result<Vec<TransactionSignature>> {
        let mut all = Vec::new();
        for address in addresses {
            let batch = self
                .signatures_for_address(address, since.cursor(address))
                .await?;
            debug!(address = %short(address), count = batch.len(), "Fetched signatures");
            all.extend(batch);
        }
        Ok(all)
    }

    async fn parse_transaction(
        &self,
        signature: &TransactionSignature,
    ) -> Result<Option<NormalizedSwapEvent>> {
        let url = format!(
            "{}/v0/transactions?api-key={}",
            self.rest_base_url, self.api_key
        );
        let body = serde_json::json!({ "transactions": [signature.signature] });

        let response = self
            .client
            .post(&url)
            .json(&body)
            .send()
            .await
            .map_err(|e| Error::Parse {
                signature: signature.signature.clone(),
                reason: format!("request failed: {}", e),
            })?;

        if !response.status().is_success() {
            return Err(Error::Parse {
                signature: signature.signature.clone(),
                reason: format!("HTTP {}", response.status()),
            });
        }

        let transactions: Vec<EnhancedTransaction> =
            response.json().await.map_err(|e| Error::Parse {
                signature: signature.signature.clone(),
                reason: format!("bad response body: {}", e),
            })?;

        Ok(transactions
            .first()
            .and_then(|tx| swap_from_enhanced(tx, &signature.address, self.sol_price_usd)))
    }
}

/// Turn a Helius enhanced transaction into a swap by `wallet`
pub fn swap_from_enhanced(
    tx: &EnhancedTransaction,
    wallet: &str,
    sol_price_usd: f64,
) -> Option<NormalizedSwapEvent> {
    let swap = tx.events.swap.as_ref()?;

    let timestamp = tx
        .timestamp
        .and_then(|ts| DateTime::from_timestamp(ts, 0))
        .unwrap_or_else(Utc::now);

    let input_usd = quote_value_usd(swap.native_input.as_ref(), &swap.token_inputs, sol_price_usd);
    let output_usd =
        quote_value_usd(swap.native_output.as_ref(), &swap.token_outputs, sol_price_usd);

    // Buy: quote goes in, a non-quote token comes out
    if let Some(bought) = swap.token_outputs.iter().find(|t| !is_quote_mint(&t.mint)) {
        let raw_amount = bought.raw_token_amount.token_amount.parse().ok()?;
        return Some(NormalizedSwapEvent {
            signature: tx.signature.clone(),
            wallet: wallet.to_string(),
            token_mint: bought.mint.clone(),
            side: SwapSide::Buy,
            raw_amount,
            decimals: bought.raw_token_amount.decimals,
            amount_usd: input_usd,
            timestamp,
            source: tx.source.clone(),
            market_cap_usd: None,
        });
    }

    // Sell: a non-quote token goes in, quote comes out
    if let Some(sold) = swap.token_inputs.iter().find(|t| !is_quote_mint(&t.mint)) {
        let raw_amount = sold.raw_token_amount.token_amount.parse().ok()?;
        return Some(NormalizedSwapEvent {
            signature: tx.signature.clone(),
            wallet: wallet.to_string(),
            token_mint: sold.mint.clone(),
            side: SwapSide::Sell,
            raw_amount,
            decimals: sold.raw_token_amount.decimals,
            amount_usd: output_usd,
            timestamp,
            source: tx.source.clone(),
            market_cap_usd: None,
        });
    }

    None
}

fn is_quote_mint(mint: &str) -> bool {
    matches!(mint, WSOL_MINT | USDC_MINT | USDT_MINT)
}

/// USD value of the SOL / stablecoin legs on one side of a swap
fn quote_value_usd(native: Option<&NativeAmount>, tokens: &[TokenAmount], sol_price_usd: f64) -> f64 {
    let native_usd = native
        .and_then(|n| n.amount.parse::<u64>().ok())
        .map(|lamports| lamports as f64 / LAMPORTS_PER_SOL * sol_price_usd)
        .unwrap_or(0.0);

    let token_usd: f64 = tokens
        .iter()
        .filter_map(|t| {
            let raw: u64 = t.raw_token_amount.token_amount.parse().ok()?;
            let ui = raw as f64 / 10f64.powi(t.raw_token_amount.decimals as i32);
            match t.mint.as_str() {
                WSOL_MINT => Some(ui * sol_price_usd),
                USDC_MINT | USDT_MINT => Some(ui),
                _ => None,
            }
        })
        .sum();

    native_usd + token_usd
}

// Helius API response types

#[derive(Debug, Deserialize)]
struct RpcResponse<T> {
    result: Option<T>,
    error: Option<RpcError>,
}

#[derive(Debug, Deserialize)]
struct RpcError {
    message: String,
}

#[derive(Debug, Deserialize)]
#[serde(rename_all = "camelCase")]
struct SignatureInfo {
    signature: String,
    #[serde(default)]
    err: Option<serde_json::Value>,
    #[serde(default)]
    block_time: Option<i64>,
}

#[derive(Debug, Clone, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct EnhancedTransaction {
    pub signature: String,
    #[serde(default)]
    pub timestamp: Option<i64>,
    #[serde(default)]
    pub source: String,
    #[serde(rename = "type", default)]
    pub tx_type: String,
    #[serde(default)]
    pub events: EnhancedEvents,
}

#[derive(Debug, Clone, Default, Deserialize)]
pub struct EnhancedEvents {
    #[serde(default)]
    pub swap: Option<SwapEventData>,
}

#[derive(Debug, Clone, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct SwapEventData {
    #[serde(default)]
    pub native_input: Option<NativeAmount>,
    #[serde(default)]
    pub native_output: Option<NativeAmount>,
    #[serde(default)]
    pub token_inputs: Vec<TokenAmount>,
    #[serde(default)]
    pub token_outputs: Vec<TokenAmount>,
}

#[derive(Debug, Clone, Deserialize)]
pub struct NativeAmount {
    pub account: String,
    pub amount: String,
}

#[derive(Debug, Clone, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct TokenAmount {
    pub user_account: String,
    pub mint: String,
    pub raw_token_amount: RawTokenAmount,
}

#[derive(Debug, Clone, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct RawTokenAmount {
    pub token_amount: String,
    pub decimals: u8,
}
