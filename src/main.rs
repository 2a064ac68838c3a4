//! Command-line DHT node.
//!
//! Server mode starts a long-running node that others bootstrap from; client
//! mode joins through a bootstrap peer, stores one value, reads it back and
//! exits.
//!
//! # Usage
//!
//! ```bash
//! kadmesh --mode server --port 8000 --addr-file server_node_addr.txt
//! kadmesh --mode client --bootstrap "$(cat server_node_addr.txt)" --key greeting --value hello
//! ```
//!
//! Peers are written as `ID@HOST:PORT`, where `ID` is the 64-character hex
//! node identifier.

use std::net::SocketAddr;
use std::path::PathBuf;
use std::str::FromStr;

use anyhow::{Context, Result};
use clap::{Parser, ValueEnum};
use tokio::net::TcpListener;
use tokio::time::{self, Duration};
use tracing::{info, warn};
use tracing_subscriber::{fmt, EnvFilter};

use kadmesh::{
    derive_node_id, hash_content, serve, Contact, DhtConfig, DhtNode, NodeId, StreamNetwork,
};

#[derive(Clone, Debug)]
struct BootstrapPeer {
    id: NodeId,
    addr: SocketAddr,
}

impl FromStr for BootstrapPeer {
    type Err = anyhow::Error;

    fn from_str(s: &str) -> Result<Self> {
        let (id_part, addr_part) = s
            .trim()
            .split_once('@')
            .context("bootstrap peer must include its ID (format: ID@IP:PORT)")?;

        let id_bytes = hex::decode(id_part).context("invalid hex node ID")?;
        let id: NodeId = id_bytes
            .try_into()
            .map_err(|_| anyhow::anyhow!("node ID must be 64 hex characters (32 bytes)"))?;
        let addr: SocketAddr = addr_part.parse().context("invalid socket address")?;

        Ok(BootstrapPeer { id, addr })
    }
}

impl From<BootstrapPeer> for Contact {
    fn from(peer: BootstrapPeer) -> Self {
        Contact::with_addr(peer.id, peer.addr.to_string())
    }
}

#[derive(Clone, Copy, Debug, PartialEq, Eq, ValueEnum)]
enum Mode {
    Server,
    Client,
}

#[derive(Parser, Debug)]
#[command(name = "kadmesh")]
#[command(author, version, about, long_about = None)]
struct Args {
    #[arg(long, value_enum, default_value = "server")]
    mode: Mode,

    /// Port to listen on; 0 picks a free one.
    #[arg(short, long, default_value = "0")]
    port: u16,

    #[arg(long, default_value = "127.0.0.1")]
    host: String,

    #[arg(short = 'B', long = "bootstrap", value_name = "PEER")]
    bootstrap: Vec<BootstrapPeer>,

    /// Write this node's `ID@HOST:PORT` to a file once listening.
    #[arg(long)]
    addr_file: Option<PathBuf>,

    /// Key to store in client mode (hashed into the keyspace).
    #[arg(long, default_value = "hello")]
    key: String,

    /// Value to store in client mode.
    #[arg(long, default_value = "world")]
    value: String,

    /// JSON file overriding the default DHT parameters.
    #[arg(long)]
    config: Option<PathBuf>,

    #[arg(short, long, default_value = "300")]
    telemetry_interval: u64,

    #[arg(short, long)]
    verbose: bool,
}

fn load_config(path: Option<&PathBuf>) -> Result<DhtConfig> {
    let Some(path) = path else {
        return Ok(DhtConfig::default());
    };
    let raw = std::fs::read_to_string(path)
        .with_context(|| format!("reading config {}", path.display()))?;
    serde_json::from_str(&raw).with_context(|| format!("parsing config {}", path.display()))
}

#[tokio::main]
async fn main() -> Result<()> {
    let args = Args::parse();

    let default_level = if args.verbose { "debug" } else { "info" };
    let filter =
        EnvFilter::try_from_default_env().unwrap_or_else(|_| EnvFilter::new(default_level));

    fmt()
        .with_env_filter(filter)
        .with_target(true)
        .with_thread_ids(false)
        .with_file(false)
        .with_line_number(false)
        .with_writer(std::io::stderr)
        .init();

    let config = load_config(args.config.as_ref())?;

    let listener = TcpListener::bind((args.host.as_str(), args.port))
        .await
        .with_context(|| format!("binding {}:{}", args.host, args.port))?;
    let local_addr = listener.local_addr()?.to_string();
    let node_id = derive_node_id(local_addr.as_bytes());
    let self_contact = Contact::with_addr(node_id, local_addr.clone());
    let advertised = format!("{}@{}", hex::encode(node_id), local_addr);

    let network = StreamNetwork::tcp(self_contact.clone());
    let node = DhtNode::new(node_id, self_contact, network, config);
    let server = tokio::spawn(serve(node.clone(), listener));

    let peers: Vec<Contact> = args.bootstrap.iter().cloned().map(Contact::from).collect();
    let report = node.bootstrap(&peers).await?;
    if !peers.is_empty() {
        let connected: Vec<String> = peers
            .iter()
            .flat_map(|peer| peer.addrs.iter().cloned())
            .collect();
        if report.reachable > 0 {
            info!("Connected to bootstrap nodes: [{}]", connected.join(", "));
        } else {
            warn!("Could not reach any bootstrap node: [{}]", connected.join(", "));
        }
    }

    let result = match args.mode {
        Mode::Server => run_server(&node, &args, &advertised).await,
        Mode::Client => run_client(&node, &args).await,
    };

    node.shutdown().await;
    if let Ok(Err(err)) = server.await {
        warn!(error = %err, "listener failed");
    }
    result
}

async fn run_server(
    node: &DhtNode<StreamNetwork<kadmesh::TcpDialer>>,
    args: &Args,
    advertised: &str,
) -> Result<()> {
    info!("DHT service started in server mode");
    info!("Node address: {advertised}");
    if let Some(path) = &args.addr_file {
        std::fs::write(path, advertised)
            .with_context(|| format!("writing {}", path.display()))?;
    }

    let mut interval = time::interval(Duration::from_secs(args.telemetry_interval.max(1)));
    interval.tick().await;

    // Graceful shutdown on Ctrl+C
    loop {
        tokio::select! {
            _ = tokio::signal::ctrl_c() => {
                info!("Received shutdown signal, exiting gracefully");
                return Ok(());
            }
            _ = interval.tick() => {
                let snapshot = node.telemetry_snapshot().await;
                info!(
                    state = ?snapshot.state,
                    routing_peers = snapshot.routing_peers,
                    buckets = snapshot.buckets,
                    stale_buckets = snapshot.stale_buckets,
                    stored_values = snapshot.stored_values,
                    provider_records = snapshot.provider_records,
                    k = snapshot.replication_factor,
                    alpha = snapshot.concurrency,
                    "telemetry snapshot"
                );
            }
        }
    }
}

async fn run_client(node: &DhtNode<StreamNetwork<kadmesh::TcpDialer>>, args: &Args) -> Result<()> {
    info!("Running in client mode");
    let key = hash_content(args.key.as_bytes());

    node.put_value(key, args.value.as_bytes().to_vec())
        .await
        .context("storing value")?;
    node.wait_for_replication().await;
    info!("Stored value '{}' with key: {}", args.value, hex::encode(key));

    match node.get_value(key).await.context("retrieving value")? {
        Some(value) => info!("Retrieved value: {}", String::from_utf8_lossy(&value)),
        None => warn!("Value for key {} not found", hex::encode(key)),
    }
    Ok(())
}
