//! Node Assembly
//!
//! `KvNode` wires the WAL, keyspace, dedup cache, health table, compactor,
//! and replication coordinator together, owns the write-path critical
//! section, and runs the background tasks (heartbeat send, health sweep,
//! dedup sweep, compaction loop) under one shutdown channel.
//!
//! Mutations hold the node write lock across check-version, WAL append,
//! and map update so the three steps appear atomic to every other
//! operation. The WAL append is local disk I/O and is allowed under the
//! lock; network calls never are: replication shipping happens after the
//! lock is released.

use crate::clock::Clock;
use crate::cluster::health::ClusterHealth;
use crate::cluster::replication::{ReplicationCoordinator, ReplicationReceiver};
use crate::cluster::transport::{
    PeerHandler, PeerRequest, PeerResponse, PeerTransport,
};
use crate::config::{NodeConfig, Role};
use crate::dedup::RequestCache;
use crate::storage::compaction::CompactionService;
use crate::storage::entry::{LogEntry, Operation};
use crate::storage::keyspace::{Keyspace, VersionCheck};
use crate::storage::segment_store::{SegmentStore, WalError};
use crate::storage::wal::SegmentedWal;
use async_trait::async_trait;
use parking_lot::Mutex;
use serde_json::Value;
use std::sync::Arc;
use tokio::sync::watch;
use tokio::task::JoinHandle;
use tracing::{debug, info, warn};

/// Outcome of a SET routed through the node.
#[derive(Debug, Clone, PartialEq)]
pub enum SetResult {
    Applied(LogEntry),
    Conflict { current_version: u64 },
}

/// Outcome of a DELETE routed through the node.
#[derive(Debug, Clone, PartialEq)]
pub enum DeleteResult {
    Applied(LogEntry),
    NotFound,
}

/// One replicated KV node: storage plus cluster plane.
pub struct KvNode<S: SegmentStore> {
    config: NodeConfig,
    clock: Arc<dyn Clock>,
    transport: Arc<dyn PeerTransport>,
    wal: Arc<SegmentedWal<S>>,
    keyspace: Arc<Keyspace>,
    dedup: Arc<RequestCache>,
    health: Arc<ClusterHealth>,
    compaction: Arc<CompactionService<S>>,
    coordinator: Arc<ReplicationCoordinator>,
    receiver: Option<ReplicationReceiver<S>>,
    /// Serializes check-version -> append -> apply across all mutations.
    write_lock: Mutex<()>,
}

impl<S: SegmentStore> KvNode<S> {
    /// Open the WAL in `store`, replay it into a fresh keyspace, and wire
    /// up the cluster components. Peers from the config are registered
    /// (and start out down until their first heartbeat).
    pub fn open(
        config: NodeConfig,
        store: S,
        clock: Arc<dyn Clock>,
        transport: Arc<dyn PeerTransport>,
    ) -> Result<Arc<Self>, WalError> {
        let wal = Arc::new(SegmentedWal::open(store, config.max_segment_size)?);

        let keyspace = Arc::new(Keyspace::new(config.max_history));
        let mut replayed = 0u64;
        for entry in wal.replay() {
            keyspace.apply_entry(&entry);
            replayed += 1;
        }
        info!(
            entries = replayed,
            skipped = wal.skipped_records(),
            last_id = wal.last_id().unwrap_or(0),
            keys = keyspace.len(),
            "replayed WAL into keyspace"
        );

        let health = Arc::new(ClusterHealth::new(config.heartbeat_timeout()));
        for peer in &config.peers {
            health.register(&peer.id, &peer.url);
        }

        let dedup = Arc::new(RequestCache::new(
            config.dedup_ttl(),
            config.dedup_max_entries,
        ));
        let compaction = Arc::new(CompactionService::new(
            Arc::clone(&wal),
            Arc::clone(&clock),
            &config.compaction,
        ));
        let coordinator = Arc::new(ReplicationCoordinator::new(
            Arc::clone(&health),
            Arc::clone(&transport),
            config.replication.clone(),
        ));
        let receiver = match &config.role {
            Role::Leader => None,
            Role::Follower { leader_url } => Some(ReplicationReceiver::new(
                Arc::clone(&wal),
                Arc::clone(&keyspace),
                Arc::clone(&transport),
                leader_url.clone(),
                config.replication.lag_threshold,
            )),
        };

        Ok(Arc::new(KvNode {
            config,
            clock,
            transport,
            wal,
            keyspace,
            dedup,
            health,
            compaction,
            coordinator,
            receiver,
            write_lock: Mutex::new(()),
        }))
    }

    /// SET with an optional expected-version precondition. On conflict
    /// nothing reaches the WAL.
    pub fn set(
        &self,
        key: &str,
        value: Value,
        expected_version: Option<u64>,
        client_id: Option<String>,
        request_id: Option<String>,
    ) -> Result<SetResult, WalError> {
        let _guard = self.write_lock.lock();
        let next_version = match self.keyspace.check_version(key, expected_version) {
            VersionCheck::Conflict { current_version } => {
                return Ok(SetResult::Conflict { current_version });
            }
            VersionCheck::Ok { next_version } => next_version,
        };

        let entry = self.wal.append(
            Operation::Set,
            key,
            Some(value.clone()),
            Some(next_version),
            client_id,
            request_id,
        )?;
        self.keyspace.apply_set(key, value, next_version);
        Ok(SetResult::Applied(entry))
    }

    /// DELETE. Absent keys produce no WAL entry.
    pub fn delete(
        &self,
        key: &str,
        client_id: Option<String>,
        request_id: Option<String>,
    ) -> Result<DeleteResult, WalError> {
        let _guard = self.write_lock.lock();
        if self.keyspace.latest_version(key).is_none() {
            return Ok(DeleteResult::NotFound);
        }

        let entry = self
            .wal
            .append(Operation::Delete, key, None, None, client_id, request_id)?;
        self.keyspace.delete(key);
        Ok(DeleteResult::Applied(entry))
    }

    pub fn config(&self) -> &NodeConfig {
        &self.config
    }

    pub fn is_leader(&self) -> bool {
        self.config.role.is_leader()
    }

    pub fn clock(&self) -> &Arc<dyn Clock> {
        &self.clock
    }

    pub fn wal(&self) -> &Arc<SegmentedWal<S>> {
        &self.wal
    }

    pub fn keyspace(&self) -> &Arc<Keyspace> {
        &self.keyspace
    }

    pub fn dedup(&self) -> &Arc<RequestCache> {
        &self.dedup
    }

    pub fn health(&self) -> &Arc<ClusterHealth> {
        &self.health
    }

    pub fn compaction(&self) -> &Arc<CompactionService<S>> {
        &self.compaction
    }

    pub fn coordinator(&self) -> &Arc<ReplicationCoordinator> {
        &self.coordinator
    }

    pub fn receiver(&self) -> Option<&ReplicationReceiver<S>> {
        self.receiver.as_ref()
    }

    /// Follower startup: announce ourselves to the leader and catch up on
    /// anything missed while offline. A failed registration is logged and
    /// tolerated; the heartbeat lag check recovers later.
    pub async fn start_replication(&self) {
        let Some(receiver) = &self.receiver else {
            return;
        };
        match receiver
            .register_with_leader(&self.config.node_id, &self.config.advertise_url)
            .await
        {
            Ok(leader_last) => {
                debug!(leader_last, "follower registration complete");
            }
            Err(e) => {
                warn!(error = %e, "failed to register with leader, continuing");
            }
        }
    }

    /// Spawn the node's background tasks. Shutting down the returned
    /// handle stops them all.
    pub fn spawn_tasks(self: Arc<Self>) -> NodeTasks {
        let (shutdown_tx, shutdown_rx) = watch::channel(false);
        let mut handles = Vec::new();

        handles.push(tokio::spawn(heartbeat_send_loop(
            Arc::clone(&self),
            shutdown_rx.clone(),
        )));
        handles.push(tokio::spawn(health_sweep_loop(
            Arc::clone(&self),
            shutdown_rx.clone(),
        )));
        handles.push(tokio::spawn(dedup_sweep_loop(
            Arc::clone(&self),
            shutdown_rx.clone(),
        )));
        handles.push(tokio::spawn(
            Arc::clone(&self.compaction).run_loop(shutdown_rx),
        ));

        NodeTasks {
            shutdown: shutdown_tx,
            handles,
        }
    }
}

/// Handle over a node's running background tasks.
pub struct NodeTasks {
    shutdown: watch::Sender<bool>,
    handles: Vec<JoinHandle<()>>,
}

impl NodeTasks {
    /// Signal all tasks to stop and wait for them.
    pub async fn shutdown(self) {
        let _ = self.shutdown.send(true);
        for handle in self.handles {
            let _ = handle.await;
        }
    }
}

#[async_trait]
impl<S: SegmentStore> PeerHandler for KvNode<S> {
    async fn handle(&self, request: PeerRequest) -> PeerResponse {
        match request {
            PeerRequest::Replicate { entries } => match &self.receiver {
                Some(receiver) => match receiver.receive(entries).await {
                    Ok((status, last_applied_id)) => PeerResponse::Replicated {
                        status,
                        last_applied_id,
                    },
                    Err(e) => PeerResponse::Error {
                        message: e.to_string(),
                    },
                },
                None => PeerResponse::Error {
                    message: "node does not accept replication pushes".to_string(),
                },
            },
            PeerRequest::FetchEntries { from_id, to_id } => PeerResponse::Entries {
                entries: self.wal.read_range(from_id, to_id),
            },
            PeerRequest::Heartbeat { server_id, .. } => {
                self.health.record_heartbeat(&server_id, self.clock.now());
                PeerResponse::HeartbeatAck {
                    last_log_id: self.wal.last_id().unwrap_or(0),
                }
            }
            PeerRequest::RegisterFollower {
                id,
                url,
                last_applied_id,
            } => {
                self.coordinator.register_follower(&id, &url, last_applied_id);
                PeerResponse::Registered {
                    last_log_id: self.wal.last_id().unwrap_or(0),
                }
            }
        }
    }
}

/// Emit heartbeats to every registered peer, down ones included so
/// recovery is detected. A follower also compares the leader's last log
/// id from the ack and bulk-fetches when it lags too far.
async fn heartbeat_send_loop<S: SegmentStore>(
    node: Arc<KvNode<S>>,
    mut shutdown: watch::Receiver<bool>,
) {
    let interval = node.config.heartbeat_interval();
    loop {
        tokio::select! {
            _ = tokio::time::sleep(interval) => {}
            _ = shutdown.changed() => return,
        }

        for (peer_id, url) in node.health.all_peers() {
            let node = Arc::clone(&node);
            tokio::spawn(async move {
                let request = PeerRequest::Heartbeat {
                    server_id: node.config.node_id.clone(),
                    timestamp_ms: node.clock.now().as_millis(),
                };
                match node.transport.send(&url, request).await {
                    Ok(PeerResponse::HeartbeatAck { last_log_id }) => {
                        debug!(peer = %peer_id, "heartbeat acknowledged");
                        if let Some(receiver) = &node.receiver {
                            if receiver.leader_url() == url {
                                if let Err(e) = receiver.maybe_catch_up(last_log_id).await {
                                    warn!(error = %e, "lag catch-up failed");
                                }
                            }
                        }
                    }
                    Ok(other) => {
                        warn!(peer = %peer_id, response = ?other, "unexpected heartbeat response");
                    }
                    Err(e) => {
                        debug!(peer = %peer_id, error = %e, "heartbeat send failed");
                    }
                }
            });
        }
    }
}

async fn health_sweep_loop<S: SegmentStore>(
    node: Arc<KvNode<S>>,
    mut shutdown: watch::Receiver<bool>,
) {
    let interval = node.config.heartbeat_interval();
    loop {
        tokio::select! {
            _ = tokio::time::sleep(interval) => {}
            _ = shutdown.changed() => return,
        }
        node.health.sweep(node.clock.now());
    }
}

async fn dedup_sweep_loop<S: SegmentStore>(
    node: Arc<KvNode<S>>,
    mut shutdown: watch::Receiver<bool>,
) {
    // A quarter of the TTL keeps expiry latency bounded without busy work.
    let interval = std::time::Duration::from_secs((node.config.dedup_ttl_secs / 4).max(1));
    loop {
        tokio::select! {
            _ = tokio::time::sleep(interval) => {}
            _ = shutdown.changed() => return,
        }
        node.dedup.sweep(node.clock.now());
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::clock::{ManualClock, Timestamp};
    use crate::cluster::transport::InProcessTransport;
    use crate::storage::segment_store::InMemorySegmentStore;
    use serde_json::json;

    fn leader_node() -> (InMemorySegmentStore, Arc<KvNode<InMemorySegmentStore>>) {
        let store = InMemorySegmentStore::new();
        let node = KvNode::open(
            NodeConfig {
                max_segment_size: 1024 * 1024,
                ..NodeConfig::test()
            },
            store.clone(),
            Arc::new(ManualClock::new(Timestamp::ZERO)),
            Arc::new(InProcessTransport::new()),
        )
        .unwrap();
        (store, node)
    }

    #[test]
    fn test_set_assigns_versions_and_ids() {
        let (_store, node) = leader_node();

        let SetResult::Applied(e1) = node.set("k", json!("a"), None, None, None).unwrap() else {
            panic!("expected applied");
        };
        let SetResult::Applied(e2) = node.set("k", json!("b"), None, None, None).unwrap() else {
            panic!("expected applied");
        };

        assert_eq!((e1.id, e1.version), (1, Some(1)));
        assert_eq!((e2.id, e2.version), (2, Some(2)));
        assert_eq!(node.keyspace().get("k", None), Some((json!("b"), 2)));
    }

    #[test]
    fn test_conflicting_set_leaves_no_trace_in_wal() {
        let (_store, node) = leader_node();
        node.set("config", json!("a"), None, None, None).unwrap();
        node.set("config", json!("b"), None, None, None).unwrap();

        let result = node.set("config", json!("c"), Some(1), None, None).unwrap();
        assert_eq!(result, SetResult::Conflict { current_version: 2 });
        assert_eq!(node.wal().last_id(), Some(2));
        assert_eq!(node.keyspace().get("config", None), Some((json!("b"), 2)));
    }

    #[test]
    fn test_delete_missing_key_appends_nothing() {
        let (_store, node) = leader_node();
        assert_eq!(
            node.delete("ghost", None, None).unwrap(),
            DeleteResult::NotFound
        );
        assert_eq!(node.wal().last_id(), None);
    }

    #[test]
    fn test_restart_reconstructs_keyspace() {
        let store = InMemorySegmentStore::new();
        let config = NodeConfig {
            max_segment_size: 200,
            ..NodeConfig::test()
        };
        {
            let node = KvNode::open(
                config.clone(),
                store.clone(),
                Arc::new(ManualClock::new(Timestamp::ZERO)),
                Arc::new(InProcessTransport::new()),
            )
            .unwrap();
            for i in 0..5 {
                node.set("counter", json!(i), None, None, None).unwrap();
            }
            node.set("other", json!("x"), None, None, None).unwrap();
            node.delete("other", None, None).unwrap();
        }

        let node = KvNode::open(
            config,
            store,
            Arc::new(ManualClock::new(Timestamp::ZERO)),
            Arc::new(InProcessTransport::new()),
        )
        .unwrap();
        assert_eq!(node.keyspace().get("counter", None), Some((json!(4), 5)));
        assert_eq!(node.keyspace().get("other", None), None);
        assert_eq!(node.wal().last_id(), Some(7));
        assert_eq!(node.keyspace().versions("counter"), Some(vec![1, 2, 3, 4, 5]));
    }

    #[tokio::test]
    async fn test_peer_handler_serves_ranges_and_heartbeats() {
        let (_store, node) = leader_node();
        for i in 1..=4 {
            node.set(&format!("k{}", i), json!(i), None, None, None)
                .unwrap();
        }

        let response = node
            .handle(PeerRequest::FetchEntries {
                from_id: 2,
                to_id: Some(3),
            })
            .await;
        match response {
            PeerResponse::Entries { entries } => {
                assert_eq!(entries.iter().map(|e| e.id).collect::<Vec<_>>(), vec![2, 3]);
            }
            other => panic!("unexpected: {:?}", other),
        }

        node.health().register("f1", "url-f1");
        let response = node
            .handle(PeerRequest::Heartbeat {
                server_id: "f1".to_string(),
                timestamp_ms: 123,
            })
            .await;
        assert_eq!(response, PeerResponse::HeartbeatAck { last_log_id: 4 });
        assert_eq!(
            node.health().status("f1"),
            Some(crate::cluster::health::PeerStatus::Healthy)
        );
    }

    #[tokio::test]
    async fn test_leader_rejects_replication_push() {
        let (_store, node) = leader_node();
        let response = node
            .handle(PeerRequest::Replicate { entries: vec![] })
            .await;
        assert!(matches!(response, PeerResponse::Error { .. }));
    }
}
