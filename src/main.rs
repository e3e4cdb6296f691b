use clap::Parser;
use std::net::SocketAddr;
use std::path::PathBuf;
use tracing_subscriber::EnvFilter;

use raft_kv::config::{NodeConfig, PeerConfig, SnapshotConfig};
use raft_kv::error::RaftError;
use raft_kv::server::Server;
use raft_kv::shutdown::install_shutdown_handler;

#[derive(Parser, Debug)]
#[command(name = "raft-kv")]
#[command(version)]
#[command(about = "A replicated key-value store built on Raft consensus")]
#[command(propagate_version = true)]
struct Args {
    #[command(subcommand)]
    command: Commands,
}

#[derive(clap::Subcommand, Debug)]
enum Commands {
    /// Start a raft-kv server node
    Server(ServerArgs),
}

#[derive(Parser, Debug)]
struct ServerArgs {
    /// Node ID (unique identifier for this node)
    #[arg(long, default_value = "1")]
    node_id: u64,

    /// Port for Raft RPC traffic between nodes
    #[arg(long, default_value = "9090")]
    port: u16,

    /// Port for the HTTP key-value API (optional)
    #[arg(long)]
    http_port: Option<u16>,

    /// Peer addresses (comma-separated, format: "id:host:port[:http_port]")
    /// Example: "2:127.0.0.1:9091:8081,3:127.0.0.1:9092:8082"
    #[arg(long, default_value = "")]
    peers: String,

    /// Directory for snapshots, term/vote and the log. Everything stays in
    /// memory when unset.
    #[arg(long)]
    data_dir: Option<PathBuf>,

    /// Write snapshot files without gzip
    #[arg(long)]
    no_compress: bool,

    #[arg(long, default_value = "150")]
    election_timeout_min_ms: u64,

    #[arg(long, default_value = "300")]
    election_timeout_max_ms: u64,

    #[arg(long, default_value = "50")]
    heartbeat_interval_ms: u64,

    #[arg(long, default_value = "100")]
    rpc_timeout_ms: u64,

    /// Applied entries past the last snapshot that trigger compaction
    #[arg(long, default_value = "1000")]
    compaction_threshold: u64,

    /// Leader compaction interval in seconds
    #[arg(long, default_value = "600")]
    snapshot_interval_secs: u64,

    /// Number of snapshots kept on disk
    #[arg(long, default_value = "3")]
    snapshot_retain: usize,
}

/// Parse "id:host:port[:http_port]" entries. Any malformed entry is an
/// error: dropping a peer would silently shrink the quorum.
fn parse_peers(peers_str: &str) -> Result<Vec<PeerConfig>, RaftError> {
    if peers_str.trim().is_empty() {
        return Ok(Vec::new());
    }

    peers_str
        .split(',')
        .map(|peer| {
            let peer = peer.trim();
            let parts: Vec<&str> = peer.split(':').collect();
            let parsed = match parts.as_slice() {
                [id, host, port] if !host.is_empty() => id
                    .parse::<u64>()
                    .ok()
                    .zip(port.parse::<u16>().ok())
                    .map(|(node_id, port)| (node_id, *host, port, None)),
                [id, host, port, http_port] if !host.is_empty() => id
                    .parse::<u64>()
                    .ok()
                    .zip(port.parse::<u16>().ok())
                    .zip(http_port.parse::<u16>().ok())
                    .map(|((node_id, port), http_port)| (node_id, *host, port, Some(http_port))),
                _ => None,
            };

            let (node_id, host, port, http_port) = parsed.ok_or_else(|| {
                RaftError::Config(format!(
                    "invalid peer '{peer}', expected id:host:port[:http_port]"
                ))
            })?;
            Ok(PeerConfig {
                node_id,
                addr: format!("{}:{}", host, port),
                http_addr: http_port.map(|p| format!("{}:{}", host, p)),
            })
        })
        .collect()
}

fn build_config(args: ServerArgs) -> Result<NodeConfig, RaftError> {
    let listen_addr = SocketAddr::from(([0, 0, 0, 0], args.port));
    let http_addr = args
        .http_port
        .map(|p| SocketAddr::from(([0, 0, 0, 0], p)));

    Ok(NodeConfig {
        node_id: args.node_id,
        listen_addr,
        http_addr,
        peers: parse_peers(&args.peers)?,
        election_timeout_min_ms: args.election_timeout_min_ms,
        election_timeout_max_ms: args.election_timeout_max_ms,
        heartbeat_interval_ms: args.heartbeat_interval_ms,
        rpc_timeout_ms: args.rpc_timeout_ms,
        snapshot: SnapshotConfig {
            dir: args.data_dir,
            retain: args.snapshot_retain,
            interval_ms: args.snapshot_interval_secs.saturating_mul(1000),
            compaction_threshold: args.compaction_threshold,
            compress: !args.no_compress,
        },
        ..NodeConfig::default()
    })
}

async fn run_server(args: ServerArgs) -> Result<(), Box<dyn std::error::Error>> {
    tracing_subscriber::fmt()
        .with_env_filter(
            EnvFilter::try_from_default_env().unwrap_or_else(|_| EnvFilter::new("info")),
        )
        .init();

    let config = build_config(args)?;
    config.validate()?;

    tracing::info!(
        node_id = config.node_id,
        addr = %config.listen_addr,
        http_addr = ?config.http_addr,
        peers = config.peers.len(),
        snapshot_dir = ?config.snapshot.dir,
        "Starting raft-kv node"
    );

    let shutdown = install_shutdown_handler();
    let server = Server::new(config)?;
    server.run(shutdown).await?;

    tracing::info!("Node stopped");
    Ok(())
}

#[tokio::main]
async fn main() -> Result<(), Box<dyn std::error::Error>> {
    let args = Args::parse();

    match args.command {
        Commands::Server(server_args) => {
            run_server(server_args).await?;
        }
    }

    Ok(())
}
