//! Follower Node
//!
//! Runs a replikv follower: opens the WAL, replays it, registers with the
//! leader and catches up, then serves the peer protocol (replication
//! pushes, heartbeats) and runs the background tasks. Reads are served by
//! the embedded [`replikv::KvService`]; mutations belong to the leader.
//!
//! ## Environment Variables
//!
//! | Variable | Default | Description |
//! |----------|---------|-------------|
//! | REPLIKV_NODE_ID | follower-1 | Node identifier |
//! | REPLIKV_DATA_DIR | data/follower | Segment file directory |
//! | REPLIKV_LISTEN_ADDR | 127.0.0.1:9401 | Peer listener address |
//! | REPLIKV_ADVERTISE_URL | = listen addr | Address the leader dials back |
//! | REPLIKV_LEADER_URL | 127.0.0.1:9400 | Leader peer address |
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
            .unwrap_or_else(|_| "127.0.0.1:9401".to_string());
        let leader_url = std::env::var("REPLIKV_LEADER_URL")
            .unwrap_or_else(|_| "127.0.0.1:9400".to_string());
        let node = NodeConfig {
            node_id: std::env::var("REPLIKV_NODE_ID")
                .unwrap_or_else(|_| "follower-1".to_string()),
            role: Role::Follower {
                leader_url: leader_url.clone(),
            },
            data_dir: std::env::var("REPLIKV_DATA_DIR")
                .map(PathBuf::from)
                .unwrap_or_else(|_| PathBuf::from("data/follower")),
            advertise_url: std::env::var("REPLIKV_ADVERTISE_URL")
                .unwrap_or_else(|_| listen_addr.clone()),
            // The leader is the follower's one configured peer; it is
            // heartbeated and health-tracked like any other.
            peers: vec![PeerConfig {
                id: "leader".to_string(),
                url: leader_url,
            }],
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
        "starting follower"
    );

    let store = LocalSegmentStore::new(config.node.data_dir.clone())?;
    let transport = Arc::new(TcpPeerTransport::new(
        config.node.replication.request_timeout(),
    ));
    let node = KvNode::open(config.node, store, Arc::new(SystemClock::new()), transport)?;

    // Announce ourselves and pull anything missed while offline.
    node.start_replication().await;
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
