//! Kestrel header-sync node binary.
//!
//! Seeds an in-memory chain with the network's genesis header, dials the
//! given peers over TCP, and runs a header-sync session until the header
//! queue is full or Ctrl+C stops it. The completed queue's range is
//! reported on exit; a persistent chain store would consume it from there.

use std::net::SocketAddr;
use std::process;
use std::sync::Arc;
use std::time::Duration;

use clap::Parser;
use kestrel_core::chain::{LocalChain, MemoryChain};
use kestrel_core::checkpoint::CheckpointSet;
use kestrel_core::constants::{Network, INITIAL_RATE_FLOOR};
use kestrel_core::genesis::genesis_header;
use kestrel_core::pow::Target;
use kestrel_network::{HeaderSyncSession, NetworkConfig, SyncConfig, TcpConnector};
use tracing::{error, info};

/// Kestrel header-sync node — fills the header skeleton block bodies hang from.
#[derive(Parser, Debug)]
#[command(
    name = "kestrel-node",
    version,
    about = "Headers-first synchronization against untrusted peers"
)]
struct Args {
    /// Peer address to sync from (host:port; repeatable)
    #[arg(long = "peer", required = true)]
    peers: Vec<String>,

    /// Connect to the public test network (testnet) instead of mainnet.
    #[arg(long, conflicts_with = "regtest")]
    testnet: bool,

    /// Run against a local regression-test network (regtest).
    #[arg(long, conflicts_with = "testnet")]
    regtest: bool,

    /// Initial per-peer throughput floor, headers per second
    #[arg(long, default_value_t = INITIAL_RATE_FLOOR)]
    floor: f64,

    /// Concurrent outbound sync attempts
    #[arg(long, default_value_t = 1)]
    parallel: usize,

    /// Response timeout per get-headers exchange, in seconds
    #[arg(long, default_value_t = 30)]
    response_timeout: u64,

    /// Log level (trace, debug, info, warn, error)
    #[arg(long, default_value = "info")]
    log_level: String,

    /// Log output format ("text" or "json")
    #[arg(long, default_value = "text")]
    log_format: String,
}

impl Args {
    fn network(&self) -> Network {
        if self.regtest {
            Network::Regtest
        } else if self.testnet {
            Network::Testnet
        } else {
            Network::Mainnet
        }
    }

    /// Parse peer addresses, appending the network's default port where
    /// none was given.
    fn resolve_peers(&self, network: Network) -> Result<Vec<SocketAddr>, String> {
        let mut out = Vec::with_capacity(self.peers.len());
        for peer in &self.peers {
            let parsed = peer
                .parse::<SocketAddr>()
                .or_else(|_| format!("{}:{}", peer, network.default_port()).parse());
            match parsed {
                Ok(addr) => out.push(addr),
                Err(err) => return Err(format!("invalid peer address '{peer}': {err}")),
            }
        }
        Ok(out)
    }
}

#[tokio::main]
async fn main() {
    let args = Args::parse();
    init_logging(&args.log_level, &args.log_format);

    let network = args.network();
    info!("Kestrel header-sync node v{}", env!("CARGO_PKG_VERSION"));
    info!("network: {:?}", network);

    let peers = match args.resolve_peers(network) {
        Ok(peers) => peers,
        Err(err) => {
            error!("{err}");
            process::exit(1);
        }
    };
    info!("peers: {:?}", peers);

    let genesis = genesis_header(network);
    info!("genesis: {}", genesis.hash());
    let chain = Arc::new(MemoryChain::new(genesis));

    let pow_limit = match Target::from_compact(network.pow_limit_bits()) {
        Ok(limit) => limit,
        Err(err) => {
            error!("invalid network PoW limit: {err}");
            process::exit(1);
        }
    };

    let checkpoints = CheckpointSet::for_network(network);
    info!(
        "checkpoints: {} configured, highest at {:?}",
        checkpoints.len(),
        checkpoints.highest().map(|cp| cp.height)
    );

    let connector = Arc::new(TcpConnector::new(
        NetworkConfig::for_network(network),
        peers,
    ));
    let sync_config = SyncConfig {
        initial_floor: args.floor,
        response_timeout: Duration::from_secs(args.response_timeout),
        parallel_outbound: args.parallel.max(1),
        ..SyncConfig::default()
    };

    let session = HeaderSyncSession::new(
        chain as Arc<dyn LocalChain>,
        connector,
        checkpoints,
        pow_limit,
        sync_config,
    );

    let (done_tx, done_rx) = tokio::sync::oneshot::channel();
    if let Err(err) = session.start(move |outcome| {
        let _ = done_tx.send(outcome);
    }) {
        error!("failed to start header sync: {err}");
        process::exit(1);
    }
    info!("header sync running (Ctrl+C to stop)");

    let shutdown_signal = async {
        tokio::signal::ctrl_c()
            .await
            .expect("failed to install Ctrl+C handler");
        info!("received Ctrl+C, stopping session...");
    };

    tokio::pin!(done_rx);
    let outcome = tokio::select! {
        outcome = &mut done_rx => outcome,
        _ = shutdown_signal => {
            session.stop();
            done_rx.await
        }
    };

    let queue = session.queue();
    match outcome {
        Ok(Ok(())) => {
            info!(
                "header sync complete: heights {:?}..={:?}, {} headers buffered, tip {:?}",
                queue.first_height(),
                queue.last_height(),
                queue.len(),
                queue.tail_height().and_then(|h| queue.hash_at(h)),
            );
        }
        Ok(Err(err)) => {
            error!("header sync ended without success: {err}");
            process::exit(1);
        }
        Err(_) => {
            error!("session ended without reporting an outcome");
            process::exit(1);
        }
    }
}

/// Initialize tracing subscriber with the given log level and output format.
///
/// Pass `format = "json"` for structured JSON output (suitable for log
/// aggregation pipelines). Any other value defaults to human-readable text.
fn init_logging(level_str: &str, format: &str) {
    use tracing_subscriber::filter::EnvFilter;
    use tracing_subscriber::fmt;
    use tracing_subscriber::prelude::*;

    let filter = EnvFilter::try_from_default_env().unwrap_or_else(|_| EnvFilter::new(level_str));

    if format == "json" {
        tracing_subscriber::registry()
            .with(filter)
            .with(fmt::layer().json())
            .init();
    } else {
        tracing_subscriber::registry()
            .with(filter)
            .with(fmt::layer().with_target(true).with_level(true))
            .init();
    }
}
