//! CLI command implementations

use anyhow::Result;
use std::sync::Arc;
use tracing::{error, info};

use crate::cache::MemoryStore;
use crate::config::Config;
use crate::pipeline::{Pipeline, PipelineDeps};
use crate::premium::{BalanceOracle, PremiumGate};

/// Run the pipeline until Ctrl-C
pub async fn start(config: &Config) -> Result<()> {
    info!("Starting whale radar...");
    info!(
        "Whale feed: {} addresses, KOL feed: {} addresses, cluster window: {}m",
        config.feeds.whale.addresses.len(),
        config.feeds.kol.addresses.len(),
        config.cluster.window_minutes
    );

    let deps = PipelineDeps::from_config(config)?;
    info!(
        "Balance oracle: {} providers, KOL directory: {} profiles",
        deps.oracle.provider_count(),
        deps.kols.len()
    );

    let pipeline = Pipeline::new(config, deps)?;
    for (process, activation) in pipeline.start()? {
        info!(process = %process, activation = ?activation, "Process registered");
    }

    if let Err(e) = tokio::signal::ctrl_c().await {
        error!("Failed to listen for shutdown signal: {}", e);
    }
    info!("Received shutdown signal");

    pipeline.shutdown().await;

    let queue = pipeline.queue_stats();
    let processor = pipeline.processor().stats();
    info!(
        processed = queue.messages_processed,
        dropped = queue.messages_dropped,
        clusters = processor.clusters,
        delivered = processor.delivered,
        premium_denied = processor.premium_denied,
        "Final stats"
    );

    Ok(())
}

/// Check a wallet against the premium balance threshold
pub async fn check_access(config: &Config, wallet: &str) -> Result<()> {
    let oracle = Arc::new(BalanceOracle::from_config(&config.rpc));
    let gate = PremiumGate::from_config(&config.premium, oracle, Arc::new(MemoryStore::new()))?;

    let result = gate.check_access(wallet).await;
    println!("{}", serde_json::to_string_pretty(&result)?);
    Ok(())
}

/// Show current configuration
pub fn show_config(config: &Config) -> Result<()> {
    println!("{}", config.masked_display());
    Ok(())
}

/// Check balance provider health
pub async fn health(config: &Config) -> Result<()> {
    println!("\n=== SYSTEM HEALTH CHECK ===\n");

    let oracle = BalanceOracle::from_config(&config.rpc);
    let mut all_healthy = true;

    for provider in oracle.health().await {
        print!("RPC {}... ", provider.name);
        match provider.error {
            None => println!("OK ({}ms)", provider.latency.as_millis()),
            Some(e) => {
                println!("FAILED: {}", e);
                all_healthy = false;
            }
        }
    }

    print!("Helius API key... ");
    if config.helius.api_key.is_empty() {
        println!("MISSING");
        all_healthy = false;
    } else {
        println!("CONFIGURED");
    }

    print!("Premium token mint... ");
    if config.premium.token_mint.is_empty() {
        println!("NOT SET (premium checks deny)");
    } else {
        println!("{}", config.premium.token_mint);
    }

    println!();
    if all_healthy {
        println!("All systems healthy!");
    } else {
        println!("Some systems are unhealthy. Check the errors above.");
    }

    Ok(())
}
