//! Threat Oracle CLI
//!
//! Runs the oracle service, replays event files offline and reads published
//! scores back from the chain.

use std::fs;
use std::path::{Path, PathBuf};
use std::sync::Arc;
use std::time::Duration;

use anyhow::{Context, Result};
use clap::{Parser, Subcommand};
use tracing::{info, warn};
use tracing_subscriber::EnvFilter;

use oracle_chain::{Address, ContractReader, ProviderLedger};
use oracle_core::{Aggregator, FeedEvent};
use oracle_runtime::{MemoryStorage, OracleConfig, OracleService};

#[derive(Parser)]
#[command(name = "threat-oracle")]
#[command(author, version, about = "Threat Oracle: multi-source risk aggregation and on-chain publishing", long_about = None)]
struct Cli {
    #[command(subcommand)]
    command: Commands,

    /// Verbosity level (0-3); RUST_LOG overrides it
    #[arg(short, long, default_value = "1", global = true)]
    verbose: u8,
}

#[derive(Subcommand)]
enum Commands {
    /// Run the oracle until Ctrl-C
    Run {
        /// Configuration file
        #[arg(short, long)]
        config: PathBuf,

        /// Publisher signing key (or set ORACLE_PRIVATE_KEY env var)
        #[arg(long, env = "ORACLE_PRIVATE_KEY", hide_env_values = true)]
        private_key: Option<String>,
    },

    /// Aggregate a JSON array of events offline and print the signals
    Simulate {
        /// File holding a JSON array of feed events
        #[arg(short, long)]
        events: PathBuf,

        /// Take aggregation settings and source weights from this config
        #[arg(short, long)]
        config: Option<PathBuf>,

        /// Only print signals at or above this score
        #[arg(long, default_value = "0")]
        min_score: u8,
    },

    /// Read a target's published score from the oracle contract
    Score {
        /// JSON-RPC endpoint
        #[arg(long, env = "ORACLE_RPC_URL")]
        rpc: String,

        /// ThreatOracle contract address
        #[arg(long)]
        contract: String,

        /// Target address to look up
        #[arg(short, long)]
        address: String,

        /// Request timeout in seconds
        #[arg(long, default_value = "30")]
        timeout: u64,
    },

    /// Validate a configuration file and print the effective settings
    CheckConfig {
        /// Configuration file
        #[arg(short, long)]
        config: PathBuf,
    },
}

#[tokio::main]
async fn main() -> Result<()> {
    let cli = Cli::parse();

    let default_level = match cli.verbose {
        0 => "error",
        1 => "info",
        2 => "debug",
        _ => "trace",
    };
    let filter = EnvFilter::try_from_default_env().unwrap_or_else(|_| EnvFilter::new(default_level));

    // Logs go to stderr so JSON output stays clean
    tracing_subscriber::fmt()
        .with_env_filter(filter)
        .with_target(false)
        .with_writer(std::io::stderr)
        .compact()
        .init();

    match cli.command {
        Commands::Run { config, private_key } => {
            run_service(&config, private_key).await?;
        }
        Commands::Simulate {
            events,
            config,
            min_score,
        } => {
            simulate(&events, config.as_deref(), min_score)?;
        }
        Commands::Score {
            rpc,
            contract,
            address,
            timeout,
        } => {
            read_score(&rpc, &contract, &address, timeout).await?;
        }
        Commands::CheckConfig { config } => {
            check_config(&config)?;
        }
    }

    Ok(())
}

fn load_config(path: &Path) -> Result<OracleConfig> {
    let config = OracleConfig::load(path).with_context(|| format!("Failed to load {}", path.display()))?;
    config
        .validate()
        .with_context(|| format!("Invalid configuration in {}", path.display()))?;
    Ok(config)
}

async fn run_service(config_path: &Path, private_key: Option<String>) -> Result<()> {
    let mut config = load_config(config_path)?;
    if let Some(key) = private_key {
        if config.publisher.is_some() {
            config.set_private_key(&key)?;
        } else {
            warn!("Ignoring private key: no [publisher] section in {}", config_path.display());
        }
    }

    let storage = Arc::new(MemoryStorage::new());
    let service = OracleService::new(config, storage)
        .await
        .context("Failed to create oracle service")?;
    service.start().await.context("Failed to start oracle service")?;

    info!("Oracle running, press Ctrl-C to stop");
    tokio::signal::ctrl_c().await.context("Failed to listen for Ctrl-C")?;

    service.stop().await;
    println!("{}", serde_json::to_string_pretty(&service.stats())?);
    Ok(())
}

fn simulate(events_path: &Path, config_path: Option<&Path>, min_score: u8) -> Result<()> {
    let config = match config_path {
        Some(path) => load_config(path)?,
        None => OracleConfig::default(),
    };

    let content =
        fs::read_to_string(events_path).with_context(|| format!("Failed to read {}", events_path.display()))?;
    let events: Vec<FeedEvent> = serde_json::from_str(&content)
        .with_context(|| format!("{} is not a JSON array of events", events_path.display()))?;

    let aggregator = Aggregator::with_weights(config.aggregation, config.source_weights);
    let count = events.len();
    let updated = aggregator.process_events(events);
    info!("Aggregated {} events into {} signals", count, updated.len());

    let signals = aggregator.get_all_signals(min_score);
    println!("{}", serde_json::to_string_pretty(&signals)?);
    Ok(())
}

async fn read_score(rpc: &str, contract: &str, address: &str, timeout_secs: u64) -> Result<()> {
    let contract: Address = contract
        .trim()
        .parse()
        .with_context(|| format!("Invalid contract address {}", contract))?;
    let target: Address = address
        .trim()
        .parse()
        .with_context(|| format!("Invalid target address {}", address))?;

    let ledger = ProviderLedger::new(rpc, Duration::from_secs(timeout_secs))?;
    let reader = ContractReader::new(Arc::new(ledger), contract);

    let score = reader.risk_score(target).await.context("getRiskScore call failed")?;
    let last_update = reader.last_update(target).await.context("getLastUpdate call failed")?;

    let report = serde_json::json!({
        "target": target.to_string(),
        "contract": contract.to_string(),
        "risk_score": score,
        "last_update": last_update.map(|t| t.to_rfc3339()),
    });
    println!("{}", serde_json::to_string_pretty(&report)?);
    Ok(())
}

fn check_config(path: &Path) -> Result<()> {
    let config = load_config(path)?;

    println!("✅ {} is valid", path.display());
    println!("   Feeds: {}", config.feeds.iter().filter(|f| f.enabled).count());
    match &config.publisher {
        Some(publisher) => println!(
            "   Publisher: contract {} on chain {}",
            publisher.contract_address, publisher.chain_id
        ),
        None => println!("   Publisher: none (read-only)"),
    }
    println!();
    print!("{}", config.to_toml_string()?);
    Ok(())
}
