//! Shared data model for the ingestion pipeline
//!
//! Signatures are discovered by polling tracked addresses; the external
//! parser turns each one into at most one [`NormalizedSwapEvent`]. Both are
//! immutable once created and are only ever read by the pipeline.

use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};
use solana_sdk::pubkey::Pubkey;
use std::fmt;
use std::str::FromStr;

use crate::error::{Error, Result};

/// Length in bytes of an ed25519 transaction signature
const SIGNATURE_LEN: usize = 64;

/// Opaque identifier of a chain transaction, as discovered for a tracked address
#[derive(Debug, Clone, PartialEq, Eq, Hash, Serialize, Deserialize)]
pub struct TransactionSignature {
    /// Base58 signature string
    pub signature: String,
    /// Tracked address whose history yielded this signature
    pub address: String,
    /// When we first saw it
    pub discovered_at: DateTime<Utc>,
    /// Block time reported by the RPC node, if any
    pub block_time: Option<DateTime<Utc>>,
}

impl TransactionSignature {
    pub fn new(signature: impl Into<String>, address: impl Into<String>) -> Self {
        Self {
            signature: signature.into(),
            address: address.into(),
            discovered_at: Utc::now(),
            block_time: None,
        }
    }

    pub fn with_block_time(mut self, block_time: Option<DateTime<Utc>>) -> Self {
        self.block_time = block_time;
        self
    }

    pub fn as_str(&self) -> &str {
        &self.signature
    }
}

impl fmt::Display for TransactionSignature {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "{}", short(&self.signature))
    }
}

/// Trade direction relative to the token being tracked
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum SwapSide {
    Buy,
    Sell,
}

impl SwapSide {
    pub fn is_buy(&self) -> bool {
        matches!(self, SwapSide::Buy)
    }
}

impl fmt::Display for SwapSide {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            SwapSide::Buy => write!(f, "buy"),
            SwapSide::Sell => write!(f, "sell"),
        }
    }
}

/// A parsed trade by a tracked wallet
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct NormalizedSwapEvent {
    pub signature: String,
    pub wallet: String,
    pub token_mint: String,
    pub side: SwapSide,
    /// Token amount in raw base units
    pub raw_amount: u64,
    pub decimals: u8,
    pub amount_usd: f64,
    pub timestamp: DateTime<Utc>,
    /// DEX / program that executed the swap
    pub source: String,
    /// Token market cap at trade time, when the parser could price it
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub market_cap_usd: Option<f64>,
}

impl NormalizedSwapEvent {
    /// Token amount in UI units
    pub fn ui_amount(&self) -> f64 {
        self.raw_amount as f64 / 10f64.powi(self.decimals as i32)
    }

    pub fn is_buy(&self) -> bool {
        self.side.is_buy()
    }
}

/// Validate a base58 account address
pub fn parse_address(address: &str) -> Result<Pubkey> {
    Pubkey::from_str(address).map_err(|e| Error::InvalidAddress(format!("{}: {}", address, e)))
}

/// Validate a base58 transaction signature
pub fn validate_signature(signature: &str) -> Result<()> {
    let bytes = bs58::decode(signature)
        .into_vec()
        .map_err(|e| Error::InvalidSignature(format!("{}: {}", short(signature), e)))?;
    if bytes.len() != SIGNATURE_LEN {
        return Err(Error::InvalidSignature(format!(
            "{}: expected {} bytes, got {}",
            short(signature),
            SIGNATURE_LEN,
            bytes.len()
        )));
    }
    Ok(())
}

/// Shorten an address or signature for log output
pub fn short(value: &str) -> &str {
    match value.char_indices().nth(8) {
        Some((idx, _)) => &value[..idx],
        None => value,
    }
}
