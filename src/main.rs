//! WolfMeta - Structural Metadata Replication
//!
//! Runs one cluster member replicating database create/drop and node
//! joins from the structural leader.

use std::path::PathBuf;
use std::sync::Arc;
use std::time::Duration;

use clap::{Parser, Subcommand};
use tokio::sync::mpsc;
use tracing_subscriber::{layer::SubscriberExt, util::SubscriberInitExt};

use wolfmeta::config::WolfMetaConfig;
use wolfmeta::error::{Error, Result};
use wolfmeta::lock::LocalLockManager;
use wolfmeta::network::{NetworkClient, NetworkServer, Outbox};
use wolfmeta::node::StructuralNode;
use wolfmeta::oplog::{OperationLog, PersistentOperationLog};
use wolfmeta::state::{ClusterContext, SqliteClusterContext};

/// WolfMeta - Structural Metadata Replication
#[derive(Parser)]
#[command(name = "wolfmeta")]
#[command(author, version, about, long_about = None)]
struct Cli {
    /// Path to configuration file
    #[arg(short, long, default_value = "wolfmeta.toml")]
    config: PathBuf,

    /// Log level (trace, debug, info, warn, error); overrides the config file
    #[arg(short, long)]
    log_level: Option<String>,

    #[command(subcommand)]
    command: Commands,
}

#[derive(Subcommand)]
enum Commands {
    /// Start the WolfMeta node
    Start,

    /// Initialize a new configuration file
    Init {
        /// Output path for configuration file
        #[arg(short, long, default_value = "wolfmeta.toml")]
        output: PathBuf,

        /// Node name
        #[arg(long, default_value = "node-1")]
        name: String,

        /// Address to bind for cluster communication
        #[arg(long, default_value = "0.0.0.0:2424")]
        bind_address: String,
    },

    /// Validate configuration file
    Validate,

    /// Show node information
    Info,
}

#[tokio::main]
async fn main() -> Result<()> {
    let cli = Cli::parse();

    match cli.command {
        Commands::Start => run_start(cli.config, cli.log_level).await,
        Commands::Init {
            output,
            name,
            bind_address,
        } => run_init(output, &name, &bind_address),
        Commands::Validate => run_validate(cli.config),
        Commands::Info => run_info(cli.config),
    }
}

/// Initialize logging
fn init_logging(level: &str, format: &str) {
    let env_filter = tracing_subscriber::EnvFilter::try_from_default_env()
        .unwrap_or_else(|_| level.into());

    let registry = tracing_subscriber::registry().with(env_filter);
    if format == "json" {
        registry.with(tracing_subscriber::fmt::layer().json()).init();
    } else {
        registry.with(tracing_subscriber::fmt::layer()).init();
    }
}

/// Start the WolfMeta node
async fn run_start(config_path: PathBuf, log_level: Option<String>) -> Result<()> {
    let config = match WolfMetaConfig::from_file(&config_path) {
        Ok(c) => c,
        Err(e) => {
            eprintln!("Failed to load configuration from {:?}: {}", config_path, e);
            return Err(e);
        }
    };
    let level = log_level.unwrap_or_else(|| config.logging.level.clone());
    init_logging(&level, &config.logging.format);

    let identity = config.identity();
    tracing::info!("Starting WolfMeta node {}", identity);

    // Operation log
    let oplog = match PersistentOperationLog::open(config.oplog_dir(), config.oplog.clone()) {
        Ok(log) => Arc::new(log),
        Err(e) => {
            tracing::error!("Failed to open operation log {:?}: {}", config.oplog_dir(), e);
            return Err(e);
        }
    };
    tracing::info!(
        "Operation log ready, last entry {:?}",
        oplog.last_persistent_log()
    );

    // Shared configuration
    let cluster = match SqliteClusterContext::open(&config.state_dir(), config.quorum()) {
        Ok(c) => Arc::new(c),
        Err(e) => {
            tracing::error!("Failed to open state in {:?}: {}", config.state_dir(), e);
            return Err(e);
        }
    };
    let shared = cluster.read_shared_configuration();
    tracing::info!(
        "State ready: {} nodes, {} databases, last update {:?}",
        shared.nodes().len(),
        shared.databases().len(),
        shared.last_update_id()
    );

    // Network
    let (outbox, outbound) = Outbox::new(identity.clone());
    let (incoming_tx, inbox) = mpsc::unbounded_channel();
    let server = Arc::new(NetworkServer::new(
        config.node.bind_address.clone(),
        incoming_tx,
    ));
    let server_task = {
        let server = Arc::clone(&server);
        tokio::spawn(async move {
            if let Err(e) = server.start().await {
                tracing::error!("Network server failed: {}", e);
            }
        })
    };

    let peers = config
        .peer_identities()
        .into_iter()
        .zip(config.cluster.peers.iter().map(|p| p.address.clone()));
    let (failures_tx, failures) = mpsc::unbounded_channel();
    let client = NetworkClient::new(peers, Duration::from_secs(5)).with_failure_reports(failures_tx);
    tokio::spawn(client.run(outbound));

    // Replication
    let (node, role_task) = StructuralNode::start(
        identity,
        config.leader_identity(),
        oplog,
        cluster,
        Arc::new(LocalLockManager::new()),
        outbox,
        config.replication(),
    )?;
    let dispatcher = node.spawn(inbox);
    node.watch_failures(failures);
    node.announce(&config.peer_identities()).await?;

    tracing::info!(
        "WolfMeta node running as {} (leader {})",
        if node.is_leader() { "leader" } else { "follower" },
        node.leader()
    );

    let outcome = tokio::select! {
        _ = tokio::signal::ctrl_c() => {
            tracing::info!("Received shutdown signal");
            Ok(())
        }
        result = role_task => match result {
            Ok(Ok(())) => Ok(()),
            Ok(Err(e)) => {
                tracing::error!("Replication stopped: {}", e);
                Err(e)
            }
            Err(e) => Err(Error::Internal(format!("replication task failed: {}", e))),
        },
    };

    server.stop();
    dispatcher.abort();
    let _ = server_task.await;

    tracing::info!("WolfMeta shutdown complete");
    outcome
}

/// Write a sample configuration file
fn run_init(output: PathBuf, name: &str, bind_address: &str) -> Result<()> {
    let config = WolfMetaConfig::sample(name, bind_address);
    let content = toml::to_string_pretty(&config)
        .map_err(|e| Error::Config(format!("cannot render configuration: {}", e)))?;

    std::fs::write(
        &output,
        format!("# WolfMeta Configuration\n# Generated configuration file\n\n{}", content),
    )?;
    println!("Configuration file created: {}", output.display());
    println!("Node id: {}", config.node.id);
    println!("\nAdd the other members under [[cluster.peers]] and set cluster.leader.");
    println!("Then start with: wolfmeta start --config {}", output.display());

    Ok(())
}

/// Validate configuration
fn run_validate(config_path: PathBuf) -> Result<()> {
    match WolfMetaConfig::from_file(&config_path) {
        Ok(config) => {
            println!("✓ Configuration is valid");
            println!("  Node: {}", config.identity());
            println!("  Bind Address: {}", config.node.bind_address);
            println!("  Leader: {}", config.cluster.leader);
            println!("  Peers: {}", config.cluster.peers.len());
            Ok(())
        }
        Err(e) => {
            eprintln!("✗ Configuration error: {}", e);
            Err(e)
        }
    }
}

/// Show node information
fn run_info(config_path: PathBuf) -> Result<()> {
    let config = WolfMetaConfig::from_file(&config_path)?;

    println!("WolfMeta Node Information");
    println!("=========================");
    println!();
    println!("Node ID:          {}", config.node.id);
    println!("Node Name:        {}", config.node.name);
    println!("Bind Address:     {}", config.node.bind_address);
    println!("Data Directory:   {}", config.node.data_dir.display());
    println!();
    println!("Cluster Configuration:");
    println!("  Leader:         {}", config.cluster.leader);
    println!("  Role:           {}", if config.is_leader() { "leader" } else { "follower" });
    match config.cluster.quorum {
        0 => println!("  Quorum:         majority ({})", config.quorum()),
        q => println!("  Quorum:         {}", q),
    }
    println!("  Op Timeout:     {} ms", config.cluster.operation_timeout_ms);
    println!("  Ping Interval:  {} ms", config.cluster.ping_interval_ms);
    println!("  Submit Timeout: {} ms", config.cluster.submit_timeout_ms);
    for peer in &config.cluster.peers {
        println!("  Peer:           {} ({}) at {}", peer.name, peer.id, peer.address);
    }
    println!();
    println!("Operation Log:");
    println!("  Directory:      {}", config.oplog_dir().display());
    println!("  Segment Size:   {} entries", config.oplog.entries_per_segment);
    println!("  Compression:    {}", config.oplog.compression);
    println!("  Fsync:          {}", config.oplog.fsync);

    Ok(())
}
