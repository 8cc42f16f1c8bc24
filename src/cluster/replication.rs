//! Replication Coordinator
//!
//! Leader side: after a local append, ship the entry to every healthy
//! follower. Down peers are skipped; a failed push to a healthy peer is
//! retried with bounded backoff and then dropped, because the follower
//! catches up by pulling. Client acknowledgments never wait on any of
//! this.
//!
//! Follower side: entries arrive by push or pull, are CRC-validated, and
//! apply strictly in id order. An entry beyond `last_id + 1` reveals a
//! gap, which the follower fills with a range fetch from the leader before
//! applying the pushed entry.

use crate::cluster::health::{ClusterHealth, PeerStatus};
use crate::cluster::transport::{
    PeerRequest, PeerResponse, PeerTransport, ReplicateAck, TransportError,
};
use crate::config::ReplicationConfig;
use crate::storage::entry::LogEntry;
use crate::storage::keyspace::Keyspace;
use crate::storage::segment_store::{SegmentStore, WalError};
use crate::storage::wal::SegmentedWal;
use ahash::AHashMap;
use parking_lot::RwLock;
use serde::Serialize;
use std::sync::atomic::{AtomicU64, Ordering};
use std::sync::Arc;
use tracing::{debug, info, warn};

/// Error type for replication operations.
#[derive(Debug)]
pub enum ReplicationError {
    Transport(TransportError),
    Wal(WalError),
    /// The peer answered with something the protocol does not allow here.
    UnexpectedResponse(String),
}

impl std::fmt::Display for ReplicationError {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        match self {
            ReplicationError::Transport(e) => write!(f, "replication transport error: {}", e),
            ReplicationError::Wal(e) => write!(f, "replication WAL error: {}", e),
            ReplicationError::UnexpectedResponse(msg) => {
                write!(f, "unexpected peer response: {}", msg)
            }
        }
    }
}

impl std::error::Error for ReplicationError {}

impl From<TransportError> for ReplicationError {
    fn from(e: TransportError) -> Self {
        ReplicationError::Transport(e)
    }
}

impl From<WalError> for ReplicationError {
    fn from(e: WalError) -> Self {
        ReplicationError::Wal(e)
    }
}

/// Leader-side view of one follower.
#[derive(Debug, Clone, PartialEq, Eq, Serialize)]
pub struct FollowerStatus {
    pub id: String,
    pub url: String,
    pub last_replicated_id: u64,
}

/// Leader-side shipper.
pub struct ReplicationCoordinator {
    inner: Arc<CoordinatorInner>,
}

struct CoordinatorInner {
    health: Arc<ClusterHealth>,
    transport: Arc<dyn PeerTransport>,
    config: ReplicationConfig,
    /// follower id -> highest id acknowledged by that follower
    replicated: RwLock<AHashMap<String, u64>>,
}

impl ReplicationCoordinator {
    pub fn new(
        health: Arc<ClusterHealth>,
        transport: Arc<dyn PeerTransport>,
        config: ReplicationConfig,
    ) -> Self {
        ReplicationCoordinator {
            inner: Arc::new(CoordinatorInner {
                health,
                transport,
                config,
                replicated: RwLock::new(AHashMap::new()),
            }),
        }
    }

    /// Record a follower announced by its registration handshake.
    pub fn register_follower(&self, id: &str, url: &str, last_applied_id: u64) {
        self.inner.health.register(id, url);
        self.inner.note_replicated(id, last_applied_id);
        info!(follower = %id, %url, last_applied_id, "follower registered");
    }

    /// Per-follower replication progress.
    pub fn follower_status(&self) -> Vec<FollowerStatus> {
        let replicated = self.inner.replicated.read();
        let mut rows: Vec<FollowerStatus> = replicated
            .iter()
            .map(|(id, last)| FollowerStatus {
                id: id.clone(),
                url: self.inner.health.url(id).unwrap_or_default(),
                last_replicated_id: *last,
            })
            .collect();
        rows.sort_by(|a, b| a.id.cmp(&b.id));
        rows
    }

    /// Fan a freshly appended entry out to every healthy follower. Returns
    /// immediately; pushes run on their own tasks.
    pub fn ship(&self, entry: &LogEntry) {
        for (peer_id, url) in self.inner.health.healthy_peers() {
            let inner = Arc::clone(&self.inner);
            let entry = entry.clone();
            tokio::spawn(async move {
                inner.push_with_retry(&peer_id, &url, entry).await;
            });
        }
    }
}

impl CoordinatorInner {
    async fn push_with_retry(&self, peer_id: &str, url: &str, entry: LogEntry) {
        let mut backoff = self.config.push_retry_backoff();
        for attempt in 1..=self.config.push_retry_limit {
            if self.health.status(peer_id) != Some(PeerStatus::Healthy) {
                debug!(peer = %peer_id, entry = entry.id, "peer no longer healthy, dropping push");
                return;
            }

            let request = PeerRequest::Replicate {
                entries: vec![entry.clone()],
            };
            match self.transport.send(url, request).await {
                Ok(PeerResponse::Replicated {
                    status,
                    last_applied_id,
                }) => {
                    self.note_replicated(peer_id, last_applied_id);
                    if status == ReplicateAck::Gap {
                        warn!(peer = %peer_id, entry = entry.id, "follower reported an unfilled gap");
                    }
                    return;
                }
                Ok(other) => {
                    warn!(peer = %peer_id, response = ?other, "unexpected push response");
                    return;
                }
                Err(e) => {
                    warn!(
                        peer = %peer_id,
                        entry = entry.id,
                        attempt,
                        error = %e,
                        "replication push failed"
                    );
                    if attempt < self.config.push_retry_limit {
                        tokio::time::sleep(backoff).await;
                        backoff *= 2;
                    }
                }
            }
        }
        warn!(
            peer = %peer_id,
            entry = entry.id,
            "push retries exhausted; follower will catch up via pull"
        );
    }

    fn note_replicated(&self, peer_id: &str, last_applied_id: u64) {
        self.replicated
            .write()
            .entry(peer_id.to_string())
            .and_modify(|last| *last = (*last).max(last_applied_id))
            .or_insert(last_applied_id);
    }
}

/// Follower-side receiver and puller.
pub struct ReplicationReceiver<S: SegmentStore> {
    wal: Arc<SegmentedWal<S>>,
    keyspace: Arc<Keyspace>,
    transport: Arc<dyn PeerTransport>,
    leader_url: String,
    lag_threshold: u64,
    /// Serializes every apply path (push, gap fill, bulk sync). Held across
    /// the gap fetch on purpose: nothing may interleave an apply.
    apply_lock: tokio::sync::Mutex<()>,
    rejected_records: AtomicU64,
}

impl<S: SegmentStore> ReplicationReceiver<S> {
    pub fn new(
        wal: Arc<SegmentedWal<S>>,
        keyspace: Arc<Keyspace>,
        transport: Arc<dyn PeerTransport>,
        leader_url: String,
        lag_threshold: u64,
    ) -> Self {
        ReplicationReceiver {
            wal,
            keyspace,
            transport,
            leader_url,
            lag_threshold,
            apply_lock: tokio::sync::Mutex::new(()),
            rejected_records: AtomicU64::new(0),
        }
    }

    /// Entries rejected for CRC or decode failures.
    pub fn rejected_records(&self) -> u64 {
        self.rejected_records.load(Ordering::Relaxed)
    }

    pub fn leader_url(&self) -> &str {
        &self.leader_url
    }

    /// Handle pushed entries. Returns the acknowledgment and the highest
    /// applied id.
    pub async fn receive(
        &self,
        mut entries: Vec<LogEntry>,
    ) -> Result<(ReplicateAck, u64), ReplicationError> {
        let _guard = self.apply_lock.lock().await;
        entries.sort_by_key(|e| e.id);

        let mut applied_any = false;
        let mut saw_duplicate = false;

        for entry in entries {
            if !entry.validate_crc() {
                self.rejected_records.fetch_add(1, Ordering::Relaxed);
                warn!(entry = entry.id, "rejecting replicated entry with invalid CRC");
                continue;
            }

            let last = self.wal.last_id().unwrap_or(0);
            if entry.id <= last {
                saw_duplicate = true;
                continue;
            }
            if entry.id > last + 1 {
                info!(
                    expected = last + 1,
                    got = entry.id,
                    "gap detected, fetching missing range from leader"
                );
                if let Err(e) = self.pull_range(last + 1, Some(entry.id - 1)).await {
                    warn!(error = %e, "gap fetch from leader failed");
                    return Ok((ReplicateAck::Gap, self.wal.last_id().unwrap_or(0)));
                }
                let filled_to = self.wal.last_id().unwrap_or(0);
                if entry.id != filled_to + 1 {
                    warn!(entry = entry.id, filled_to, "gap could not be filled");
                    return Ok((ReplicateAck::Gap, filled_to));
                }
            }

            self.apply_one(&entry)?;
            applied_any = true;
        }

        let last = self.wal.last_id().unwrap_or(0);
        let ack = if !applied_any && saw_duplicate {
            ReplicateAck::Duplicate
        } else {
            ReplicateAck::Ok
        };
        Ok((ack, last))
    }

    /// Announce this follower to the leader and catch up if behind.
    /// Returns the leader's last log id.
    pub async fn register_with_leader(
        &self,
        follower_id: &str,
        follower_url: &str,
    ) -> Result<u64, ReplicationError> {
        let last_applied_id = self.wal.last_id().unwrap_or(0);
        let request = PeerRequest::RegisterFollower {
            id: follower_id.to_string(),
            url: follower_url.to_string(),
            last_applied_id,
        };
        let response = self.transport.send(&self.leader_url, request).await?;
        match response {
            PeerResponse::Registered { last_log_id } => {
                info!(leader = %self.leader_url, last_log_id, "registered with leader");
                if last_log_id > last_applied_id {
                    self.sync_with_leader().await?;
                }
                Ok(last_log_id)
            }
            PeerResponse::Error { message } => Err(ReplicationError::Transport(
                TransportError::Rejected(message),
            )),
            other => Err(ReplicationError::UnexpectedResponse(format!("{:?}", other))),
        }
    }

    /// Bulk pull of everything the leader has past our last id.
    pub async fn sync_with_leader(&self) -> Result<u64, ReplicationError> {
        let _guard = self.apply_lock.lock().await;
        let from = self.wal.last_id().unwrap_or(0) + 1;
        self.pull_range(from, None).await?;
        Ok(self.wal.last_id().unwrap_or(0))
    }

    /// Bulk-fetch when a heartbeat ack reveals lag beyond the threshold.
    pub async fn maybe_catch_up(&self, leader_last_id: u64) -> Result<(), ReplicationError> {
        let local = self.wal.last_id().unwrap_or(0);
        if leader_last_id > local && leader_last_id - local >= self.lag_threshold {
            info!(
                local,
                leader = leader_last_id,
                "lag over threshold, bulk-fetching from leader"
            );
            self.sync_with_leader().await?;
        }
        Ok(())
    }

    /// Fetch `[from, to]` from the leader and apply in order. Stops at the
    /// first invalid record; the caller decides whether the result is
    /// enough. Must run under `apply_lock`.
    async fn pull_range(&self, from: u64, to: Option<u64>) -> Result<(), ReplicationError> {
        let request = PeerRequest::FetchEntries {
            from_id: from,
            to_id: to,
        };
        let response = self.transport.send(&self.leader_url, request).await?;
        let mut fetched = match response {
            PeerResponse::Entries { entries } => entries,
            PeerResponse::Error { message } => {
                return Err(ReplicationError::Transport(TransportError::Rejected(
                    message,
                )))
            }
            other => {
                return Err(ReplicationError::UnexpectedResponse(format!("{:?}", other)))
            }
        };
        fetched.sort_by_key(|e| e.id);

        for entry in fetched {
            if !entry.validate_crc() {
                self.rejected_records.fetch_add(1, Ordering::Relaxed);
                warn!(entry = entry.id, "stopping pull at entry with invalid CRC");
                break;
            }
            let last = self.wal.last_id().unwrap_or(0);
            if entry.id <= last {
                continue;
            }
            if entry.id != last + 1 {
                warn!(
                    expected = last + 1,
                    got = entry.id,
                    "leader range fetch is not contiguous, stopping pull"
                );
                break;
            }
            self.apply_one(&entry)?;
        }
        Ok(())
    }

    fn apply_one(&self, entry: &LogEntry) -> Result<(), ReplicationError> {
        self.wal.append_entry(entry)?;
        self.keyspace.apply_entry(entry);
        Ok(())
    }
}
