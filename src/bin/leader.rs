//! Leader Node
//!
//! Runs a replikv leader: opens the WAL, replays it, serves the peer
//! protocol (replication range fetches, follower registration,
//! heartbeats), and runs the background tasks. The client-facing edge
//! embeds [`replikv::KvService`] out of process scope.
//!
//! ## Environment Variables
//!
//! | Variable | Default | Description |
//! |----------|---------|-------------|
//! | REPLIKV_NODE_ID | leader | Node identifier |
//! | REPLIKV_DATA_DIR | data/leader | Segment file directory |
//! | REPLIKV_LISTEN_ADDR | 127.0.0.1:9400 | Peer listener address |
//! | REPLIKV_ADVERTISE_URL | = listen addr | Address peers dial back |
//! | REPLIKV_PEERS | - | Comma-separated `id=host:port` follower list |
//! | REPLIKV_MAX_SEGMENT_SIZE | 1048576 | Segment roll threshold, bytes |
//! | REPLIKV_HEARTBEAT_INTERVAL | 10 | Heartbeat cadence, seconds |

#[cfg(not(target_env = "msvc"))]
use tikv_jemallocator::Jemalloc;

#[cfg(not(target_env = "msvc"))]
#[global_allocator]
static GLOBAL: Jemalloc = Jemalloc;

use replikv::cluster::transport::{serve, PeerHandler, TcpPeerTransport};
use replikv::storage::segment_store::LocalSegmentStore;
use replikv::{KvNode, NodeConfig, PeerConfig, Role, SystemClock};
use std::path::PathBuf;
use std::sync::Arc;
use tokio::net::TcpListener;
use tokio::signal;
use tracing::info;

struct Config {
    node: NodeConfig,
    listen_addr: String,
}

impl Config {
    fn from_env() -> Self {
        let listen_addr = std::env::var("REPLIKV_LISTEN_ADDR")
            .unwrap_or_else(|_| "127.0.0.1:9400".to_string());
        let node = NodeConfig {
            node_id: std::env::var("REPLIKV_NODE_ID").unwrap_or_else(|_| "leader".to_string()),
            role: Role::Leader,
            data_dir: std::env::var("REPLIKV_DATA_DIR")
                .map(PathBuf::from)
                .unwrap_or_else(|_| PathBuf::from("data/leader")),
            advertise_url: std::env::var("REPLIKV_ADVERTISE_URL")
                .unwrap_or_else(|_| listen_addr.clone()),
            peers: parse_peers(std::env::var("REPLIKV_PEERS").unwrap_or_default()),
            max_segment_size: env_u64("REPLIKV_MAX_SEGMENT_SIZE", 1024 * 1024),
            heartbeat_interval_secs: env_u64("REPLIKV_HEARTBEAT_INTERVAL", 10),
            heartbeat_timeout_secs: env_u64("REPLIKV_HEARTBEAT_INTERVAL", 10) * 3,
            ..NodeConfig::default()
        };
        Config { node, listen_addr }
    }
}

fn env_u64(name: &str, default: u64) -> u64 {
    std::env::var(name)
        .ok()
        .and_then(|s| s.parse().ok())
        .unwrap_or(default)
}

fn parse_peers(raw: String) -> Vec<PeerConfig> {
    raw.split(',')
        .filter(|part| !part.is_empty())
        .filter_map(|part| {
            let (id, url) = part.split_once('=')?;
            Some(PeerConfig {
                id: id.trim().to_string(),
                url: url.trim().to_string(),
            })
        })
        .collect()
}

#[tokio::main]
async fn main() {
    tracing_subscriber::fmt()
        .with_max_level(tracing::Level::INFO)
        .init();

    if let Err(e) = run().await {
        eprintln!("fatal: {}", e);
        std::process::exit(1);
    }
}

async fn run() -> Result<(), Box<dyn std::error::Error>> {
    let config = Config::from_env();
    info!(
        node_id = %config.node.node_id,
        data_dir = %config.node.data_dir.display(),
        peers = config.node.peers.len(),
        "starting leader"
    );

    let store = LocalSegmentStore::new(config.node.data_dir.clone())?;
    let transport = Arc::new(TcpPeerTransport::new(
        config.node.replication.request_timeout(),
    ));
    let node = KvNode::open(config.node, store, Arc::new(SystemClock::new()), transport)?;
    let tasks = Arc::clone(&node).spawn_tasks();

    let listener = TcpListener::bind(&config.listen_addr).await?;
    info!(addr = %config.listen_addr, "peer listener ready");
    let (server_shutdown, server_shutdown_rx) = tokio::sync::watch::channel(false);
    let handler: Arc<dyn PeerHandler> = node;
    let server = tokio::spawn(serve(listener, handler, server_shutdown_rx));

    signal::ctrl_c().await?;
    info!("shutting down");
    let _ = server_shutdown.send(true);
    tasks.shutdown().await;
    let _ = server.await;
    Ok(())
}
