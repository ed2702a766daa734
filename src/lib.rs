//! Whale Radar Library
//!
//! Polls tracked wallets for swaps, deduplicates and buffers them, detects
//! whale buy clusters and matches everything against alert subscriptions,
//! gating premium alerts on a token balance.

pub mod alert;
pub mod cache;
pub mod cli;
pub mod config;
pub mod error;
pub mod lifecycle;
pub mod pipeline;
pub mod premium;
pub mod stream;
pub mod types;

// Re-export commonly used types
pub use config::Config;
pub use error::{Error, Result};
