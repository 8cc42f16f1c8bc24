//! Cluster Health Table
//!
//! Tracks the last heartbeat received from every registered peer and
//! classifies each as healthy or down. A peer that has never sent a
//! heartbeat is down. Transitions are idempotent: down -> healthy happens
//! only on heartbeat receipt, healthy -> down only on a timeout sweep.

use crate::clock::Timestamp;
use ahash::AHashMap;
use parking_lot::RwLock;
use serde::Serialize;
use std::time::Duration;
use tracing::{info, warn};

/// Peer classification.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize)]
#[serde(rename_all = "lowercase")]
pub enum PeerStatus {
    Healthy,
    Down,
}

#[derive(Debug, Clone)]
struct PeerState {
    url: String,
    last_heartbeat: Option<Timestamp>,
    status: PeerStatus,
}

/// One row of the health table, as reported to callers.
#[derive(Debug, Clone, Serialize)]
pub struct PeerSnapshot {
    pub id: String,
    pub url: String,
    pub status: PeerStatus,
    pub last_heartbeat_ms: Option<u64>,
    pub seconds_since_last_heartbeat: Option<f64>,
}

/// The health table. Internally synchronized; send and receive paths are
/// independent.
pub struct ClusterHealth {
    peers: RwLock<AHashMap<String, PeerState>>,
    timeout: Duration,
}

impl ClusterHealth {
    pub fn new(timeout: Duration) -> Self {
        ClusterHealth {
            peers: RwLock::new(AHashMap::new()),
            timeout,
        }
    }

    /// Add a peer to the table. It stays down until its first heartbeat.
    /// Re-registering updates the url and keeps any heartbeat state.
    pub fn register(&self, peer_id: &str, url: &str) {
        let mut peers = self.peers.write();
        match peers.get_mut(peer_id) {
            Some(existing) => {
                existing.url = url.to_string();
            }
            None => {
                peers.insert(
                    peer_id.to_string(),
                    PeerState {
                        url: url.to_string(),
                        last_heartbeat: None,
                        status: PeerStatus::Down,
                    },
                );
                info!(peer = %peer_id, %url, "registered peer");
            }
        }
    }

    pub fn deregister(&self, peer_id: &str) {
        if self.peers.write().remove(peer_id).is_some() {
            info!(peer = %peer_id, "deregistered peer");
        }
    }

    /// Record a heartbeat. Returns false for peers not in the table.
    pub fn record_heartbeat(&self, peer_id: &str, now: Timestamp) -> bool {
        let mut peers = self.peers.write();
        let Some(peer) = peers.get_mut(peer_id) else {
            warn!(peer = %peer_id, "heartbeat from unknown peer");
            return false;
        };

        peer.last_heartbeat = Some(now);
        if peer.status != PeerStatus::Healthy {
            peer.status = PeerStatus::Healthy;
            info!(peer = %peer_id, "peer is now healthy");
        }
        true
    }

    /// Mark peers silent longer than the timeout as down. Already-down
    /// peers are left untouched.
    pub fn sweep(&self, now: Timestamp) {
        let mut peers = self.peers.write();
        for (peer_id, peer) in peers.iter_mut() {
            if peer.status == PeerStatus::Down {
                continue;
            }
            let overdue = match peer.last_heartbeat {
                Some(last) => now.since(last) > self.timeout,
                None => true,
            };
            if overdue {
                peer.status = PeerStatus::Down;
                let silence = peer
                    .last_heartbeat
                    .map(|last| now.since(last).as_secs_f64())
                    .unwrap_or(f64::INFINITY);
                warn!(peer = %peer_id, silence_secs = silence, "peer marked down");
            }
        }
    }

    pub fn status(&self, peer_id: &str) -> Option<PeerStatus> {
        self.peers.read().get(peer_id).map(|p| p.status)
    }

    pub fn url(&self, peer_id: &str) -> Option<String> {
        self.peers.read().get(peer_id).map(|p| p.url.clone())
    }

    /// Full table, with heartbeat ages computed against `now`.
    pub fn snapshot(&self, now: Timestamp) -> Vec<PeerSnapshot> {
        let peers = self.peers.read();
        let mut rows: Vec<PeerSnapshot> = peers
            .iter()
            .map(|(id, peer)| PeerSnapshot {
                id: id.clone(),
                url: peer.url.clone(),
                status: peer.status,
                last_heartbeat_ms: peer.last_heartbeat.map(|t| t.as_millis()),
                seconds_since_last_heartbeat: peer
                    .last_heartbeat
                    .map(|t| now.since(t).as_secs_f64()),
            })
            .collect();
        rows.sort_by(|a, b| a.id.cmp(&b.id));
        rows
    }

    /// `(id, url)` of every healthy peer.
    pub fn healthy_peers(&self) -> Vec<(String, String)> {
        self.peers
            .read()
            .iter()
            .filter(|(_, peer)| peer.status == PeerStatus::Healthy)
            .map(|(id, peer)| (id.clone(), peer.url.clone()))
            .collect()
    }

    /// `(id, url)` of every registered peer, down ones included. Heartbeat
    /// senders use this so a recovered peer is detected.
    pub fn all_peers(&self) -> Vec<(String, String)> {
        self.peers
            .read()
            .iter()
            .map(|(id, peer)| (id.clone(), peer.url.clone()))
            .collect()
    }
}
