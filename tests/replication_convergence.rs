//! Replication Integration Tests
//!
//! Leader and follower nodes wired through the in-process transport,
//! exercising the full push / gap-fetch / bulk-pull paths end to end.
//! INVARIANT: after the leader's last write and no further writes, every
//! healthy follower's keyspace equals the leader's within bounded delay,
//! and entries apply on the follower strictly in id order.

use replikv::cluster::transport::{InProcessTransport, PeerHandler, PeerRequest};
use replikv::service::{KvService, PutRequest};
use replikv::storage::segment_store::InMemorySegmentStore;
use replikv::{KvNode, ManualClock, NodeConfig, Role, Timestamp};
use serde_json::json;
use std::sync::Arc;
use std::time::Duration;

const LEADER_URL: &str = "inproc://leader";
const FOLLOWER_URL: &str = "inproc://follower-1";

struct Cluster {
    transport: Arc<InProcessTransport>,
    leader: Arc<KvNode<InMemorySegmentStore>>,
    follower: Arc<KvNode<InMemorySegmentStore>>,
    follower_store: InMemorySegmentStore,
}

fn leader_config() -> NodeConfig {
    NodeConfig {
        node_id: "leader".to_string(),
        role: Role::Leader,
        advertise_url: LEADER_URL.to_string(),
        max_segment_size: 1024 * 1024,
        ..NodeConfig::test()
    }
}

fn follower_config() -> NodeConfig {
    NodeConfig {
        node_id: "follower-1".to_string(),
        role: Role::Follower {
            leader_url: LEADER_URL.to_string(),
        },
        advertise_url: FOLLOWER_URL.to_string(),
        max_segment_size: 1024 * 1024,
        ..NodeConfig::test()
    }
}

fn build_cluster() -> Cluster {
    let transport = Arc::new(InProcessTransport::new());
    let clock = Arc::new(ManualClock::new(Timestamp::from_millis(1_000)));

    let leader = KvNode::open(
        leader_config(),
        InMemorySegmentStore::new(),
        clock.clone(),
        transport.clone(),
    )
    .unwrap();

    let follower_store = InMemorySegmentStore::new();
    let follower = KvNode::open(
        follower_config(),
        follower_store.clone(),
        clock,
        transport.clone(),
    )
    .unwrap();

    transport.register(LEADER_URL, leader.clone());
    transport.register(FOLLOWER_URL, follower.clone());

    Cluster {
        transport,
        leader,
        follower,
        follower_store,
    }
}

/// Register the follower with the leader and deliver one heartbeat so the
/// leader classifies it healthy.
async fn join_cluster(cluster: &Cluster) {
    cluster.follower.start_replication().await;
    cluster
        .leader
        .handle(PeerRequest::Heartbeat {
            server_id: "follower-1".to_string(),
            timestamp_ms: 1_000,
        })
        .await;
}

async fn wait_until(mut condition: impl FnMut() -> bool) {
    for _ in 0..400 {
        if condition() {
            return;
        }
        tokio::time::sleep(Duration::from_millis(5)).await;
    }
    panic!("condition not reached in time");
}

fn assert_keyspaces_equal(
    a: &Arc<KvNode<InMemorySegmentStore>>,
    b: &Arc<KvNode<InMemorySegmentStore>>,
) {
    assert_eq!(a.keyspace().keys(), b.keyspace().keys());
    for key in a.keyspace().keys() {
        assert_eq!(
            a.keyspace().get(&key, None),
            b.keyspace().get(&key, None),
            "divergence on key {}",
            key
        );
    }
}

#[tokio::test]
async fn test_pushed_writes_converge_on_follower() {
    let cluster = build_cluster();
    join_cluster(&cluster).await;

    let service = KvService::new(cluster.leader.clone());
    for i in 0..10 {
        service
            .put(&format!("key{}", i), PutRequest::value(json!(i)))
            .await
            .unwrap();
    }
    service.delete("key3", None, None).await.unwrap();

    wait_until(|| cluster.follower.wal().last_id() == Some(11)).await;
    assert_keyspaces_equal(&cluster.leader, &cluster.follower);
    assert_eq!(cluster.follower.keyspace().get("key3", None), None);

    // Follower log has the same dense ids as the leader's
    let ids: Vec<u64> = cluster.follower.wal().replay().map(|e| e.id).collect();
    assert_eq!(ids, (1..=11).collect::<Vec<u64>>());
}

#[tokio::test]
async fn test_follower_fills_gap_before_applying_push() {
    let cluster = build_cluster();
    join_cluster(&cluster).await;

    // Leader appends 1..5 while pushes are effectively lost: the follower
    // is disconnected from the transport.
    cluster.transport.disconnect(FOLLOWER_URL);
    let service = KvService::new(cluster.leader.clone());
    for i in 1..=5 {
        service
            .put(&format!("k{}", i), PutRequest::value(json!(i)))
            .await
            .unwrap();
    }

    // Deliver entries 1..2 directly, as if those pushes had arrived
    let receiver = cluster.follower.receiver().unwrap();
    let first_two = cluster.leader.wal().read_range(1, Some(2));
    receiver.receive(first_two).await.unwrap();
    assert_eq!(cluster.follower.wal().last_id(), Some(2));

    // A push of entry 5 arrives: the follower must fetch 3..4 first and
    // apply 3, 4, 5 in order.
    let fifth = cluster.leader.wal().read_range(5, Some(5));
    let (_, last) = receiver.receive(fifth).await.unwrap();
    assert_eq!(last, 5);
    assert_eq!(cluster.follower.wal().last_id(), Some(5));
    assert_keyspaces_equal(&cluster.leader, &cluster.follower);
}

#[tokio::test]
async fn test_down_follower_catches_up_via_pull() {
    let cluster = build_cluster();
    // Never heartbeats: the leader sees it down and skips pushes
    cluster.follower.start_replication().await;

    let service = KvService::new(cluster.leader.clone());
    for i in 0..6 {
        service
            .put("counter", PutRequest::value(json!(i)))
            .await
            .unwrap();
    }
    tokio::time::sleep(Duration::from_millis(50)).await;
    assert_eq!(cluster.follower.wal().last_id(), None);

    // The pull path brings it level
    let receiver = cluster.follower.receiver().unwrap();
    let last = receiver.sync_with_leader().await.unwrap();
    assert_eq!(last, 6);
    assert_keyspaces_equal(&cluster.leader, &cluster.follower);
}

#[tokio::test]
async fn test_restarted_follower_recovers_and_resumes() {
    let cluster = build_cluster();
    join_cluster(&cluster).await;

    let service = KvService::new(cluster.leader.clone());
    for i in 0..4 {
        service
            .put(&format!("k{}", i), PutRequest::value(json!(i)))
            .await
            .unwrap();
    }
    wait_until(|| cluster.follower.wal().last_id() == Some(4)).await;

    // Stop the follower; the leader keeps writing
    cluster.transport.disconnect(FOLLOWER_URL);
    drop(cluster.follower);
    for i in 4..8 {
        service
            .put(&format!("k{}", i), PutRequest::value(json!(i)))
            .await
            .unwrap();
    }

    // Restart from the same store: WAL replay restores 1..4, registration
    // pulls 5..8
    let follower = KvNode::open(
        follower_config(),
        cluster.follower_store.clone(),
        Arc::new(ManualClock::new(Timestamp::from_millis(2_000))),
        cluster.transport.clone(),
    )
    .unwrap();
    assert_eq!(follower.wal().last_id(), Some(4));
    cluster.transport.register(FOLLOWER_URL, follower.clone());

    follower.start_replication().await;
    assert_eq!(follower.wal().last_id(), Some(8));
    assert_keyspaces_equal(&cluster.leader, &follower);
}

#[tokio::test]
async fn test_duplicate_push_is_acknowledged_not_reapplied() {
    let cluster = build_cluster();
    join_cluster(&cluster).await;

    let service = KvService::new(cluster.leader.clone());
    service.put("k", PutRequest::value(json!("v"))).await.unwrap();
    wait_until(|| cluster.follower.wal().last_id() == Some(1)).await;

    let receiver = cluster.follower.receiver().unwrap();
    let entry = cluster.leader.wal().read_range(1, Some(1));
    let (ack, last) = receiver.receive(entry).await.unwrap();
    assert_eq!(ack, replikv::cluster::transport::ReplicateAck::Duplicate);
    assert_eq!(last, 1);
    assert_eq!(cluster.follower.wal().replay().count(), 1);
}

#[tokio::test]
async fn test_heartbeat_lag_check_triggers_bulk_fetch() {
    let cluster = build_cluster();
    join_cluster(&cluster).await;
    cluster.transport.disconnect(FOLLOWER_URL);

    let service = KvService::new(cluster.leader.clone());
    // test config lag threshold is 4
    for i in 0..6 {
        service
            .put(&format!("k{}", i), PutRequest::value(json!(i)))
            .await
            .unwrap();
    }

    let receiver = cluster.follower.receiver().unwrap();
    receiver.maybe_catch_up(6).await.unwrap();
    assert_eq!(cluster.follower.wal().last_id(), Some(6));
    assert_keyspaces_equal(&cluster.leader, &cluster.follower);
}
