//! Cluster Plane
//!
//! Peer health tracking, the peer wire protocol, and the leader/follower
//! replication coordinator.

pub mod health;
pub mod replication;
pub mod transport;

pub use health::{ClusterHealth, PeerSnapshot, PeerStatus};
pub use replication::{
    FollowerStatus, ReplicationCoordinator, ReplicationError, ReplicationReceiver,
};
pub use transport::{
    serve, InProcessTransport, PeerHandler, PeerRequest, PeerResponse, PeerTransport,
    ReplicateAck, TcpPeerTransport, TransportError,
};
