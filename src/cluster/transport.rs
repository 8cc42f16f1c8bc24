//! Peer Transport
//!
//! The replication and heartbeat wire protocol, abstracted behind the
//! [`PeerTransport`] trait so nodes can be wired directly in tests and over
//! TCP in deployment. The TCP implementation speaks length-prefixed JSON
//! frames: a big-endian u32 payload length followed by one serialized
//! request or response.
//!
//! Every outbound call carries a deadline; a timed-out push is a transient
//! failure the coordinator may retry.

use crate::storage::entry::LogEntry;
use async_trait::async_trait;
use bytes::{BufMut, BytesMut};
use parking_lot::RwLock;
use serde::{Deserialize, Serialize};
use std::collections::HashMap;
use std::sync::Arc;
use std::time::Duration;
use tokio::io::{AsyncReadExt, AsyncWriteExt};
use tokio::net::{TcpListener, TcpStream};
use tracing::{debug, warn};

/// Upper bound on a single frame; a range fetch of a large gap is the
/// biggest legitimate message.
const MAX_FRAME_BYTES: usize = 16 * 1024 * 1024;

/// Requests exchanged between nodes.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(tag = "type", rename_all = "snake_case")]
pub enum PeerRequest {
    /// Leader push of freshly appended entries.
    Replicate { entries: Vec<LogEntry> },
    /// Follower pull of the range `[from_id, to_id]` (unbounded above when
    /// `to_id` is None).
    FetchEntries { from_id: u64, to_id: Option<u64> },
    Heartbeat { server_id: String, timestamp_ms: u64 },
    RegisterFollower {
        id: String,
        url: String,
        last_applied_id: u64,
    },
}

/// Replication push acknowledgment.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum ReplicateAck {
    /// Entries appended and applied.
    Ok,
    /// Everything pushed was already known.
    Duplicate,
    /// A gap could not be filled; the follower remains behind.
    Gap,
}

/// Responses exchanged between nodes.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(tag = "type", rename_all = "snake_case")]
pub enum PeerResponse {
    Replicated {
        status: ReplicateAck,
        last_applied_id: u64,
    },
    Entries { entries: Vec<LogEntry> },
    /// Heartbeat ack; carries the receiver's last log id so a lagging
    /// follower can notice and bulk-fetch.
    HeartbeatAck { last_log_id: u64 },
    Registered { last_log_id: u64 },
    Error { message: String },
}

/// Error type for peer calls.
#[derive(Debug)]
pub enum TransportError {
    Io(std::io::Error),
    /// The deadline elapsed.
    Timeout,
    /// The peer is not reachable at all (no route, refused, not wired).
    Unreachable(String),
    /// A frame violated the protocol (oversized, bad JSON).
    Protocol(String),
    /// The peer answered with an error response.
    Rejected(String),
}

impl std::fmt::Display for TransportError {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        match self {
            TransportError::Io(e) => write!(f, "transport I/O error: {}", e),
            TransportError::Timeout => write!(f, "peer call timed out"),
            TransportError::Unreachable(url) => write!(f, "peer unreachable: {}", url),
            TransportError::Protocol(msg) => write!(f, "protocol error: {}", msg),
            TransportError::Rejected(msg) => write!(f, "peer rejected request: {}", msg),
        }
    }
}

impl std::error::Error for TransportError {}

impl From<std::io::Error> for TransportError {
    fn from(e: std::io::Error) -> Self {
        TransportError::Io(e)
    }
}

/// Client side of the peer protocol.
#[async_trait]
pub trait PeerTransport: Send + Sync {
    async fn send(&self, url: &str, request: PeerRequest) -> Result<PeerResponse, TransportError>;
}

/// Server side: a node's dispatch of one incoming request.
#[async_trait]
pub trait PeerHandler: Send + Sync {
    async fn handle(&self, request: PeerRequest) -> PeerResponse;
}

// ============================================================================
// TCP transport
// ============================================================================

/// TCP client opening one connection per call, in the original
/// request/response style.
#[derive(Debug, Clone)]
pub struct TcpPeerTransport {
    timeout: Duration,
}

impl TcpPeerTransport {
    pub fn new(timeout: Duration) -> Self {
        TcpPeerTransport { timeout }
    }

    async fn send_inner(url: &str, request: &PeerRequest) -> Result<PeerResponse, TransportError> {
        let mut stream = TcpStream::connect(url)
            .await
            .map_err(|_| TransportError::Unreachable(url.to_string()))?;

        let payload = serde_json::to_vec(request)
            .map_err(|e| TransportError::Protocol(e.to_string()))?;
        stream.write_all(&frame(&payload)).await?;

        let response = read_frame(&mut stream)
            .await?
            .ok_or_else(|| TransportError::Protocol("connection closed mid-response".to_string()))?;
        serde_json::from_slice(&response).map_err(|e| TransportError::Protocol(e.to_string()))
    }
}

#[async_trait]
impl PeerTransport for TcpPeerTransport {
    async fn send(&self, url: &str, request: PeerRequest) -> Result<PeerResponse, TransportError> {
        match tokio::time::timeout(self.timeout, Self::send_inner(url, &request)).await {
            Ok(result) => result,
            Err(_) => Err(TransportError::Timeout),
        }
    }
}

fn frame(payload: &[u8]) -> BytesMut {
    let mut framed = BytesMut::with_capacity(4 + payload.len());
    framed.put_u32(payload.len() as u32);
    framed.extend_from_slice(payload);
    framed
}

/// Read one length-prefixed frame. None on clean EOF before the header.
async fn read_frame(stream: &mut TcpStream) -> Result<Option<Vec<u8>>, TransportError> {
    let mut len_buf = [0u8; 4];
    match stream.read_exact(&mut len_buf).await {
        Ok(_) => {}
        Err(e) if e.kind() == std::io::ErrorKind::UnexpectedEof => return Ok(None),
        Err(e) => return Err(TransportError::Io(e)),
    }
    let len = u32::from_be_bytes(len_buf) as usize;
    if len > MAX_FRAME_BYTES {
        return Err(TransportError::Protocol(format!("frame too large: {} bytes", len)));
    }

    let mut payload = vec![0u8; len];
    stream.read_exact(&mut payload).await?;
    Ok(Some(payload))
}

/// Accept loop serving the peer protocol until shutdown. Each connection
/// handles frames sequentially on its own task.
pub async fn serve(
    listener: TcpListener,
    handler: Arc<dyn PeerHandler>,
    mut shutdown: tokio::sync::watch::Receiver<bool>,
) {
    loop {
        tokio::select! {
            _ = shutdown.changed() => {
                debug!("peer listener stopped");
                return;
            }
            accepted = listener.accept() => match accepted {
                Ok((stream, addr)) => {
                    debug!(%addr, "peer connection accepted");
                    let handler = Arc::clone(&handler);
                    tokio::spawn(async move {
                        if let Err(e) = handle_connection(stream, handler).await {
                            warn!(%addr, error = %e, "peer connection error");
                        }
                    });
                }
                Err(e) => {
                    warn!(error = %e, "failed to accept peer connection");
                }
            }
        }
    }
}

async fn handle_connection(
    mut stream: TcpStream,
    handler: Arc<dyn PeerHandler>,
) -> Result<(), TransportError> {
    while let Some(payload) = read_frame(&mut stream).await? {
        let response = match serde_json::from_slice::<PeerRequest>(&payload) {
            Ok(request) => handler.handle(request).await,
            Err(e) => PeerResponse::Error {
                message: format!("unparseable request: {}", e),
            },
        };
        let bytes = serde_json::to_vec(&response)
            .map_err(|e| TransportError::Protocol(e.to_string()))?;
        stream.write_all(&frame(&bytes)).await?;
    }
    Ok(())
}

// ============================================================================
// In-process transport - wires nodes directly, for tests and embedding
// ============================================================================

/// Transport that dispatches straight to registered handlers, no sockets.
#[derive(Clone, Default)]
pub struct InProcessTransport {
    peers: Arc<RwLock<HashMap<String, Arc<dyn PeerHandler>>>>,
}

impl InProcessTransport {
    pub fn new() -> Self {
        InProcessTransport::default()
    }

    pub fn register(&self, url: &str, handler: Arc<dyn PeerHandler>) {
        self.peers.write().insert(url.to_string(), handler);
    }

    /// Drop a peer, simulating it going unreachable.
    pub fn disconnect(&self, url: &str) {
        self.peers.write().remove(url);
    }
}

#[async_trait]
impl PeerTransport for InProcessTransport {
    async fn send(&self, url: &str, request: PeerRequest) -> Result<PeerResponse, TransportError> {
        let handler = self
            .peers
            .read()
            .get(url)
            .cloned()
            .ok_or_else(|| TransportError::Unreachable(url.to_string()))?;
        Ok(handler.handle(request).await)
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::storage::entry::{LogEntry, Operation};
    use serde_json::json;

    struct EchoHandler;

    #[async_trait]
    impl PeerHandler for EchoHandler {
        async fn handle(&self, request: PeerRequest) -> PeerResponse {
            match request {
                PeerRequest::Heartbeat { .. } => PeerResponse::HeartbeatAck { last_log_id: 42 },
                PeerRequest::FetchEntries { from_id, .. } => PeerResponse::Entries {
                    entries: vec![LogEntry::new(
                        from_id,
                        Operation::Set,
                        "k",
                        Some(json!("v")),
                        Some(1),
                        None,
                        None,
                    )],
                },
                _ => PeerResponse::Error {
                    message: "unexpected".to_string(),
                },
            }
        }
    }

    #[test]
    fn test_message_json_roundtrip() {
        let entry = LogEntry::new(1, Operation::Set, "k", Some(json!("v")), Some(1), None, None);
        let request = PeerRequest::Replicate {
            entries: vec![entry],
        };
        let json = serde_json::to_string(&request).unwrap();
        let back: PeerRequest = serde_json::from_str(&json).unwrap();
        assert_eq!(request, back);

        let response = PeerResponse::Replicated {
            status: ReplicateAck::Duplicate,
            last_applied_id: 7,
        };
        let json = serde_json::to_string(&response).unwrap();
        let back: PeerResponse = serde_json::from_str(&json).unwrap();
        assert_eq!(response, back);
    }

    #[tokio::test]
    async fn test_in_process_transport_dispatches() {
        let transport = InProcessTransport::new();
        transport.register("node-a", Arc::new(EchoHandler));

        let response = transport
            .send(
                "node-a",
                PeerRequest::Heartbeat {
                    server_id: "me".to_string(),
                    timestamp_ms: 1,
                },
            )
            .await
            .unwrap();
        assert_eq!(response, PeerResponse::HeartbeatAck { last_log_id: 42 });

        transport.disconnect("node-a");
        let err = transport
            .send(
                "node-a",
                PeerRequest::Heartbeat {
                    server_id: "me".to_string(),
                    timestamp_ms: 2,
                },
            )
            .await
            .unwrap_err();
        assert!(matches!(err, TransportError::Unreachable(_)));
    }

    #[tokio::test]
    async fn test_tcp_transport_roundtrip() {
        let listener = TcpListener::bind("127.0.0.1:0").await.unwrap();
        let addr = listener.local_addr().unwrap().to_string();
        let (shutdown_tx, shutdown_rx) = tokio::sync::watch::channel(false);
        tokio::spawn(serve(listener, Arc::new(EchoHandler), shutdown_rx));

        let transport = TcpPeerTransport::new(Duration::from_secs(2));
        let response = transport
            .send(
                &addr,
                PeerRequest::FetchEntries {
                    from_id: 3,
                    to_id: Some(3),
                },
            )
            .await
            .unwrap();
        match response {
            PeerResponse::Entries { entries } => {
                assert_eq!(entries.len(), 1);
                assert_eq!(entries[0].id, 3);
                assert!(entries[0].validate_crc());
            }
            other => panic!("unexpected response: {:?}", other),
        }

        let _ = shutdown_tx.send(true);
    }

    #[tokio::test]
    async fn test_tcp_transport_unreachable_peer() {
        let transport = TcpPeerTransport::new(Duration::from_millis(300));
        let err = transport
            .send(
                "127.0.0.1:1",
                PeerRequest::Heartbeat {
                    server_id: "me".to_string(),
                    timestamp_ms: 1,
                },
            )
            .await
            .unwrap_err();
        assert!(matches!(
            err,
            TransportError::Unreachable(_) | TransportError::Timeout
        ));
    }
}
