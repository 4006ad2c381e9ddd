//! Starts a single node over the production `TcpTransport`/`RocksStore`
//! pair, reading its tunables from a JSON config file (see
//! `raftkv::Config`'s `#[serde(default)]`, so a file only needs to override
//! what it changes) and its identity/peers from the command line.
//!
//! Run three of these against each other with the literal addresses from
//! spec.md §8 scenario 1 to watch a cluster elect a leader:
//!
//! ```sh
//! cargo run --example node --features rocksdb-store,tcp-transport,cli -- \
//!     --id /ip4/127.0.0.1/tcp/9101 \
//!     --peer /ip4/127.0.0.1/tcp/9102 --peer /ip4/127.0.0.1/tcp/9103 \
//!     --data-dir /tmp/raftkv-9101
//! ```

use std::net::SocketAddr;
use std::path::PathBuf;
use std::sync::Arc;

use clap::Parser;
use raftkv::transport::tcp::TcpTransport;
use raftkv::transport::tcp::TcpTransportConfig;
use raftkv::store::RocksStore;
use raftkv::Config;
use raftkv::Node;
use raftkv::NodeId;

#[derive(Parser, Debug)]
#[command(about = "Run a single raftkv node")]
struct Args {
    /// This node's own address, e.g. /ip4/127.0.0.1/tcp/9101.
    #[arg(long)]
    id: NodeId,

    /// A peer's address. Pass once per peer already known at startup;
    /// omit entirely for a node that will join an existing cluster via
    /// `Command::Join` instead.
    #[arg(long = "peer")]
    peers: Vec<NodeId>,

    /// Directory for the rocksdb-backed store.
    #[arg(long)]
    data_dir: PathBuf,

    /// Optional JSON file of `Config` overrides; defaults are spec.md §6's.
    #[arg(long)]
    config: Option<PathBuf>,
}

#[tokio::main]
async fn main() -> anyhow::Result<()> {
    tracing_subscriber::fmt::init();
    let args = Args::parse();

    let config = match &args.config {
        Some(path) => {
            let raw = std::fs::read_to_string(path)?;
            serde_json::from_str(&raw)?
        }
        None => Config::default(),
    };

    let store = Arc::new(RocksStore::open(&args.data_dir)?);
    if !args.peers.is_empty() {
        store.persist_peers(&args.peers).await?;
    }

    let bind_addr: SocketAddr = format!("0.0.0.0:{}", port_of(&args.id)?).parse()?;
    let local_id = args.id.clone();
    let transport = Arc::new(TcpTransport::new(
        local_id.clone(),
        TcpTransportConfig::default(),
        |peer: &NodeId| {
            peer.as_str()
                .trim_start_matches("/ip4/")
                .replacen("/tcp/", ":", 1)
                .parse()
                .map_err(|_| raftkv::TransportError::Malformed(format!("cannot resolve {peer}")))
        },
    ));

    let (node, inbound_tx) = Node::start(args.id.clone(), config, store, transport.clone()).await?;
    transport.listen(bind_addr, inbound_tx).await?;

    tracing::info!(id = %node.id(), %bind_addr, "node started");

    tokio::signal::ctrl_c().await?;
    tracing::info!("shutting down");
    node.stop().await;
    Ok(())
}

fn port_of(id: &NodeId) -> anyhow::Result<u16> {
    id.as_str()
        .rsplit('/')
        .next()
        .and_then(|p| p.parse().ok())
        .ok_or_else(|| anyhow::anyhow!("malformed node id {id}"))
}
