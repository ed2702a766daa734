//! Whale Radar - tracked-wallet swap ingestion and alerting

use anyhow::Result;
use clap::{Parser, Subcommand};
use tracing::error;

use whale_radar::cli::commands;
use whale_radar::config::Config;

/// Whale Radar - whale cluster and KOL alerts for tracked wallets
#[derive(Parser)]
#[command(name = "radar")]
#[command(author, version, about, long_about = None)]
struct Cli {
    /// Path to config file
    #[arg(short, long, default_value = "radar.toml")]
    config: String,

    /// Emit logs as JSON
    #[arg(long, env = "RADAR_LOG_JSON")]
    json: bool,

    #[command(subcommand)]
    command: Commands,
}

#[derive(Subcommand)]
enum Commands {
    /// Start ingestion, cluster detection and alerting
    Start,

    /// Check whether a wallet holds enough of the premium token
    CheckAccess {
        /// Wallet address
        wallet: String,
    },

    /// Show current configuration (secrets masked)
    Config,

    /// Check system health (RPC providers, API keys)
    Health,
}

#[tokio::main]
async fn main() -> Result<()> {
    // Load environment variables from .env file
    dotenvy::dotenv().ok();

    let cli = Cli::parse();

    let filter = tracing_subscriber::EnvFilter::try_from_default_env()
        .unwrap_or_else(|_| tracing_subscriber::EnvFilter::new("whale_radar=info"));
    if cli.json {
        tracing_subscriber::fmt()
            .json()
            .with_env_filter(filter)
            .with_target(true)
            .init();
    } else {
        tracing_subscriber::fmt()
            .with_env_filter(filter)
            .with_target(true)
            .with_thread_ids(true)
            .with_file(true)
            .with_line_number(true)
            .init();
    }

    let config = match Config::load(&cli.config) {
        Ok(cfg) => cfg,
        Err(e) => {
            error!("Failed to load configuration: {:#}", e);
            std::process::exit(1);
        }
    };

    let result = match cli.command {
        Commands::Start => commands::start(&config).await,
        Commands::CheckAccess { wallet } => commands::check_access(&config, &wallet).await,
        Commands::Config => commands::show_config(&config),
        Commands::Health => commands::health(&config).await,
    };

    if let Err(e) = result {
        error!("Command failed: {:#}", e);
        std::process::exit(1);
    }

    Ok(())
}
