//! Lodepool - Main Entry Point
//!
//! This file serves as the entry point for the lodepool mining pool
//! service. It parses command-line arguments, loads the layered
//! configuration, initializes logging, and wires the share store, the
//! upstream node client, the work distributor, the stratum server, and
//! the payout engine together.

use std::path::PathBuf;
use std::process;
use std::sync::Arc;

use clap::Parser;
use log::{error, info, warn};
use tokio::sync::{mpsc, watch};

use lodepool_consensus::{ConsensusParameters, DoubleSha256Kernel, HeaderHasher};
use lodepool_database::ShareStore;
use lodepool_payout::{PayoutConfig, PayoutEngine};
use lodepool_rpc::{NodeClient, TcpNodeClient};
use lodepool_stratum::{
    PeerPolicy, PoolConfig, StratumServer, SubmissionProcessor, WorkDistributor,
};

/// Command line arguments for lodepool
#[derive(Parser)]
#[clap(name = "lodepool")]
#[clap(about = "Mining pool coordination service for the Lodestone proof-of-work chain")]
struct Cli {
    /// Sets a custom config file
    #[clap(short, long, value_name = "FILE")]
    config: Option<PathBuf>,

    /// Stratum listen host
    #[clap(long)]
    host: Option<String>,

    /// Stratum listen port
    #[clap(long)]
    port: Option<u16>,

    /// Pool name, embedded in graffiti and payout memos
    #[clap(long)]
    name: Option<String>,

    /// Share-target difficulty
    #[clap(long)]
    difficulty: Option<u64>,

    /// Upstream node RPC address
    #[clap(long, value_name = "ADDR")]
    node: Option<String>,

    /// Share store location
    #[clap(long, value_name = "FILE")]
    database: Option<PathBuf>,

    /// Verbosity level (0-5)
    #[clap(short, long, default_value = "2")]
    verbosity: u8,
}

/// Initialize logging based on verbosity level
fn init_logging(verbosity: u8) {
    let log_level = match verbosity {
        0 => log::LevelFilter::Error,
        1 => log::LevelFilter::Warn,
        2 => log::LevelFilter::Info,
        3 => log::LevelFilter::Debug,
        _ => log::LevelFilter::Trace,
    };

    env_logger::Builder::new()
        .filter_level(log_level)
        .format_timestamp_millis()
        .init();
}

/// Load the pool configuration, layering an optional file over the
/// built-in defaults
fn load_config(path: Option<&PathBuf>) -> Result<PoolConfig, config::ConfigError> {
    let mut builder = config::Config::builder();
    if let Some(path) = path {
        builder = builder.add_source(config::File::from(path.clone()));
    }
    builder.build()?.try_deserialize()
}

/// Application entry point
#[tokio::main]
async fn main() {
    let cli = Cli::parse();
    init_logging(cli.verbosity);

    info!("Starting lodepool");

    let mut config = match load_config(cli.config.as_ref()) {
        Ok(config) => config,
        Err(e) => {
            error!("Failed to load configuration: {}", e);
            process::exit(1);
        }
    };

    // Command-line flags override the file.
    if let Some(host) = cli.host {
        config.pool_host = host;
    }
    if let Some(port) = cli.port {
        config.pool_port = port;
    }
    if let Some(name) = cli.name {
        config.pool_name = name;
    }
    if let Some(difficulty) = cli.difficulty {
        config.pool_difficulty = difficulty;
    }
    if let Some(node) = cli.node {
        config.node_address = node;
    }
    if let Some(database) = cli.database {
        config.database_path = database;
    }

    if let Err(e) = run(config).await {
        error!("lodepool failed: {}", e);
        process::exit(1);
    }

    info!("lodepool stopped");
}

async fn run(config: PoolConfig) -> Result<(), Box<dyn std::error::Error>> {
    let store = Arc::new(ShareStore::open(config.database_path.clone()).await?);
    let node: Arc<dyn NodeClient> = Arc::new(TcpNodeClient::new(config.node_address.clone()));

    let consensus_parameters = match node.get_consensus_parameters().await {
        Ok(parameters) => parameters,
        Err(e) => {
            warn!("Could not fetch consensus parameters, using defaults: {}", e);
            ConsensusParameters::default()
        }
    };

    let policy = Arc::new(PeerPolicy::new(
        config.pool_max_connections_per_ip,
        config.pool_banning,
    ));

    let (broadcast_tx, broadcast_rx) = mpsc::unbounded_channel();
    let distributor = Arc::new(WorkDistributor::new(consensus_parameters, broadcast_tx));

    let hasher: Arc<dyn HeaderHasher> = Arc::new(DoubleSha256Kernel);
    let processor = Arc::new(SubmissionProcessor::new(
        distributor.clone(),
        node.clone(),
        store.clone(),
        hasher,
        config.pool_target(),
    ));

    let payout_engine = Arc::new(PayoutEngine::new(
        store.clone(),
        node.clone(),
        PayoutConfig {
            pool_name: config.pool_name.clone(),
            account_name: config.pool_account_name.clone(),
            payout_period_duration: config.pool_payout_period_duration,
            transaction_expiration_delta: config.transaction_expiration_delta,
        },
    ));

    let server = StratumServer::new(
        config,
        policy,
        distributor.clone(),
        processor,
        store.clone(),
    )?;

    let (stop_tx, stop_rx) = watch::channel(false);
    let server_task = tokio::spawn(server.start(broadcast_rx, stop_rx.clone()));
    let distributor_task = tokio::spawn(distributor.run(node.clone(), stop_rx.clone()));
    let payout_task = tokio::spawn(payout_engine.run(stop_rx));

    tokio::signal::ctrl_c().await?;
    info!("Shutting down");
    let _ = stop_tx.send(true);

    // The server closes its sessions; the payout engine finishes its
    // current iteration before the store handle is dropped.
    server_task.await??;
    distributor_task.await?;
    payout_task.await?;

    Ok(())
}
