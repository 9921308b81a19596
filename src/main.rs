//! Thin binary wiring layer (§4.14): parses CLI flags, loads `NodeConfig`,
//! initializes logging, constructs the chain actor and network actor, and
//! drives a shutdown loop that drains in-flight writes before exiting.

mod config;
mod genesis;

use clap::{Args, Parser, Subcommand};
use config::NodeConfig;
use core::{ChainStore, Mempool, Writer};
use network::NetworkActor;
use shared::Address;
use std::path::PathBuf;
use tracing::{info, warn, Level};

#[derive(Parser)]
#[command(name = "aixon-node")]
#[command(about = "Proof-of-work blockchain full node")]
#[command(version)]
struct Cli {
    #[command(subcommand)]
    command: Option<Commands>,
}

#[derive(Subcommand)]
enum Commands {
    /// Run the full node: chain store, mempool, miner, and P2P substrate.
    Run(RunArgs),
    /// Peer registry operations.
    Peers(PeersArgs),
    /// Print version information.
    Version,
}

#[derive(Args)]
struct RunArgs {
    /// Path to a TOML config file; defaults are used for anything it omits.
    #[arg(short, long)]
    config: Option<PathBuf>,

    /// Overrides `data_dir` from the config file.
    #[arg(long)]
    data_dir: Option<PathBuf>,

    /// Overrides `p2p_port` from the config file.
    #[arg(long)]
    p2p_port: Option<u16>,

    /// Overrides `log_level` from the config file.
    #[arg(long)]
    log_level: Option<String>,

    /// Additional bootstrap peers (multiaddr form), appended to the config file's list.
    #[arg(short, long)]
    bootstrap: Vec<String>,

    /// Mine blocks to this address once the node is up.
    #[arg(long)]
    mine_to: Option<String>,
}

#[derive(Args)]
struct PeersArgs {
    #[command(subcommand)]
    action: PeersAction,
}

#[derive(Subcommand)]
enum PeersAction {
    /// Show network status. Requires a running node; this process has none
    /// of its own to query without one running, so it reports that.
    Status,
    /// List connected peers. Same caveat as `status`.
    List,
}

#[tokio::main]
async fn main() -> shared::Result<()> {
    let cli = Cli::parse();
    match cli.command {
        Some(Commands::Run(args)) => run_node(args).await,
        Some(Commands::Peers(args)) => {
            handle_peers(&args);
            Ok(())
        }
        Some(Commands::Version) | None => {
            show_version();
            Ok(())
        }
    }
}

fn init_tracing(log_level: &str) {
    let level = match log_level {
        "trace" => Level::TRACE,
        "debug" => Level::DEBUG,
        "warn" => Level::WARN,
        "error" => Level::ERROR,
        _ => Level::INFO,
    };
    tracing_subscriber::fmt().with_max_level(level).init();
}

async fn run_node(args: RunArgs) -> shared::Result<()> {
    let mut node_config = NodeConfig::load(args.config.as_deref())?;
    if let Some(data_dir) = args.data_dir {
        node_config.data_dir = data_dir;
    }
    if let Some(p2p_port) = args.p2p_port {
        node_config.p2p_port = p2p_port;
    }
    if let Some(log_level) = args.log_level {
        node_config.log_level = log_level;
    }
    node_config.bootstrap.extend(args.bootstrap);

    init_tracing(&node_config.log_level);
    info!(data_dir = %node_config.data_dir.display(), network = ?node_config.chain.network, "starting node");

    let persistence =
        core::ChainPersistence::open_with_options(&node_config.data_dir, node_config.persistence_options())?;

    let (chain, pending) = match persistence.load() {
        Ok(loaded) => loaded,
        Err(_) => {
            let genesis = genesis::load_or_default(
                node_config.genesis_file.as_deref(),
                node_config.chain.network,
                node_config.chain.initial_difficulty,
                node_config.chain.initial_reward,
            )?;
            let chain = ChainStore::new(genesis, node_config.chain.clone())?;
            (chain, Vec::new())
        }
    };
    info!(height = chain.height(), "chain store ready");

    let mut mempool = Mempool::new(node_config.chain.max_mempool, node_config.chain.validation_params());
    for tx in pending {
        if let Err(e) = mempool.admit(tx, chain.utxo(), &core::NoProtectedAddresses, &core::NoGovernanceSigner) {
            warn!(error = %e, "dropping a pending transaction that no longer admits after restart");
        }
    }

    let genesis_hash = chain.block_at(0).expect("chain store always has a genesis block").hash();
    let (writer, handle) = Writer::new(chain, mempool, Some(persistence));
    // The writer keeps an internal handle clone alive for the mining loop
    // to spawn from, so it can never observe every `WriterHandle` sender
    // dropped; only this explicit shutdown signal ends `run()`.
    let (writer_shutdown_tx, writer_shutdown_rx) = tokio::sync::oneshot::channel();
    let writer_task = tokio::spawn(writer.run(writer_shutdown_rx));

    let mut actor = NetworkActor::new(
        node_config.peer.clone(),
        handle.clone(),
        node_config.chain.network.network_id(),
        genesis_hash,
        node_config.bind_address,
        node_config.p2p_port,
    )?;

    let bootstrap_addrs: Vec<network::Multiaddr> = node_config
        .bootstrap
        .iter()
        .filter_map(|s| match s.parse() {
            Ok(addr) => Some(addr),
            Err(e) => {
                warn!(address = %s, error = %e, "ignoring unparsable bootstrap address");
                None
            }
        })
        .collect();
    actor.dial_bootstrap(&bootstrap_addrs);

    if let Some(address) = args.mine_to {
        let recipient = Address::decode(&address, node_config.chain.network)
            .map_err(|e| shared::ConfigError::Invalid { key: "mine_to", reason: e.to_string() })?;
        handle.request_mining_start(recipient).await;
        info!(%address, "mining started");
    }

    let (network_shutdown_tx, network_shutdown_rx) = tokio::sync::oneshot::channel();
    let network_task = tokio::spawn(actor.run(network_shutdown_rx));

    tokio::signal::ctrl_c()
        .await
        .map_err(|e| shared::ConfigError::Invalid { key: "signal", reason: e.to_string() })?;
    info!("shutdown requested, draining in-flight writes");
    let _ = network_shutdown_tx.send(());
    let _ = network_task.await;

    drop(handle);
    let _ = writer_shutdown_tx.send(());
    let _ = writer_task.await;
    info!("node stopped");
    Ok(())
}

fn handle_peers(args: &PeersArgs) {
    match args.action {
        PeersAction::Status => {
            println!("peer status is only available from within a running node process");
        }
        PeersAction::List => {
            println!("peer listing is only available from within a running node process");
        }
    }
}

fn show_version() {
    println!("aixon-node {}", env!("CARGO_PKG_VERSION"));
}
