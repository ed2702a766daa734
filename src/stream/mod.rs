//! Stream module - Signature ingestion for tracked wallets
//!
//! Flow per feed:
//! - `SignatureSource` lists new signatures and resolves them to swaps
//! - `DedupCache` makes sure each signature is forwarded at most once
//! - `BackpressureQueue` decouples ingestion from downstream processing

pub mod backpressure;
pub mod dedup;
pub mod ingestor;
pub mod source;

pub use backpressure::{Admission, BackpressureQueue, QueueLimits};
pub use dedup::{DedupCache, DedupCacheConfig};
pub use ingestor::{SignatureIngestor, TickOutcome, TickReport};
pub use source::{Checkpoint, HeliusSource, SignatureSource};
