//! Service Facade
//!
//! The stable request/response contract exposed to the external transport.
//! A thin mapper: parse identifiers, consult the dedup cache, route through
//! the keyspace and WAL, report status. Owns no state beyond the node
//! handle; the HTTP edge that frames these calls lives outside this crate.
//!
//! Identified requests (both `client_id` and `request_id` present) are
//! answered from the dedup cache when repeated, before any WAL id is
//! assigned. Unidentified requests bypass the cache entirely.

use crate::cluster::health::PeerSnapshot;
use crate::cluster::replication::FollowerStatus;
use crate::config::Role;
use crate::dedup::{DedupStats, RequestKey};
use crate::node::{DeleteResult, KvNode, SetResult};
use crate::storage::compaction::CompactionStatus;
use crate::storage::entry::Operation;
use crate::storage::segment_store::{SegmentStore, WalError};
use crate::storage::wal::SegmentMeta;
use serde::{Deserialize, Serialize};
use serde_json::Value;
use std::sync::Arc;
use tracing::info;

/// Error type for facade calls. Negative results (NotFound, version
/// conflicts, duplicates) are responses, not errors.
#[derive(Debug)]
pub enum ServiceError {
    /// Mutations are only accepted by the leader.
    NotLeader,
    Storage(WalError),
    Internal(String),
}

impl std::fmt::Display for ServiceError {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        match self {
            ServiceError::NotLeader => write!(f, "mutations must go to the leader"),
            ServiceError::Storage(e) => write!(f, "storage error: {}", e),
            ServiceError::Internal(msg) => write!(f, "internal error: {}", msg),
        }
    }
}

impl std::error::Error for ServiceError {}

impl From<WalError> for ServiceError {
    fn from(e: WalError) -> Self {
        ServiceError::Storage(e)
    }
}

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct PutRequest {
    pub value: Value,
    /// Expected current version; mismatch is a conflict.
    #[serde(default)]
    pub version: Option<u64>,
    #[serde(default)]
    pub client_id: Option<String>,
    #[serde(default)]
    pub request_id: Option<String>,
}

impl PutRequest {
    pub fn value(value: Value) -> Self {
        PutRequest {
            value,
            version: None,
            client_id: None,
            request_id: None,
        }
    }
}

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(tag = "status", rename_all = "lowercase")]
pub enum PutResponse {
    Ok { id: u64, key: String, version: u64 },
    Error { current_version: u64 },
}

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(untagged)]
pub enum GetResponse {
    Found {
        key: String,
        value: Value,
        version: u64,
    },
    NotFound {
        status: String,
        message: String,
    },
}

impl GetResponse {
    fn not_found(key: &str) -> Self {
        GetResponse::NotFound {
            status: "error".to_string(),
            message: format!("Key not found: {}", key),
        }
    }

    pub fn is_found(&self) -> bool {
        matches!(self, GetResponse::Found { .. })
    }
}

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(tag = "status", rename_all = "lowercase")]
pub enum DeleteResponse {
    Ok { id: u64 },
    Error { message: String },
}

#[derive(Debug, Clone, PartialEq, Serialize)]
pub struct HistoryEntry {
    pub version: u64,
    pub value: Value,
}

#[derive(Debug, Clone, Serialize)]
pub struct HistoryResponse {
    pub key: String,
    pub versions: Vec<u64>,
    pub history: Vec<HistoryEntry>,
}

#[derive(Debug, Clone, Serialize)]
pub struct VersionsResponse {
    pub key: String,
    pub versions: Vec<u64>,
    pub latest_version: u64,
}

#[derive(Debug, Clone, Serialize)]
pub struct KeysResponse {
    pub keys: Vec<String>,
    pub count: usize,
}

#[derive(Debug, Clone, Serialize)]
pub struct SegmentsResponse {
    pub segments: Vec<SegmentMeta>,
    pub total_segments: usize,
    pub max_segment_size: u64,
}

#[derive(Debug, Clone, Serialize)]
pub struct ClusterStatusResponse {
    pub node_id: String,
    pub role: String,
    pub leader_url: Option<String>,
    pub peers: Vec<PeerSnapshot>,
    /// Leader-side replication progress; empty on followers.
    pub followers: Vec<FollowerStatus>,
}

#[derive(Debug, Clone, Serialize)]
pub struct RequestStatusResponse {
    pub processed: bool,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub result: Option<Value>,
}

#[derive(Debug, Clone, Serialize)]
pub struct CompactionRunResponse {
    pub status: String,
    pub segments_compacted: usize,
    pub entries_removed: usize,
}

#[derive(Debug, Clone, Default, Deserialize)]
pub struct ConfigureCompactionRequest {
    pub enabled: Option<bool>,
    pub interval: Option<u64>,
}

#[derive(Debug, Clone, Serialize)]
pub struct ConfigureCompactionResponse {
    pub status: String,
    pub changes: Vec<String>,
}

/// The facade over one node.
pub struct KvService<S: SegmentStore> {
    node: Arc<KvNode<S>>,
}

impl<S: SegmentStore> KvService<S> {
    pub fn new(node: Arc<KvNode<S>>) -> Self {
        KvService { node }
    }

    pub fn node(&self) -> &Arc<KvNode<S>> {
        &self.node
    }

    /// PUT key. Leader only. Duplicate identified requests return the
    /// cached response without consuming a log id.
    pub async fn put(&self, key: &str, request: PutRequest) -> Result<PutResponse, ServiceError> {
        if !self.node.is_leader() {
            return Err(ServiceError::NotLeader);
        }

        let now = self.node.clock().now();
        let dedup_key = identified(&request.client_id, &request.request_id, Operation::Set);
        if let Some(cache_key) = &dedup_key {
            if let Some(cached) = self.node.dedup().lookup(cache_key, now) {
                return from_cached(cached);
            }
        }

        let response = match self.node.set(
            key,
            request.value,
            request.version,
            request.client_id.clone(),
            request.request_id.clone(),
        )? {
            SetResult::Applied(entry) => {
                info!(key, id = entry.id, "appended SET entry");
                let version = entry.version.unwrap_or(0);
                self.node.coordinator().ship(&entry);
                PutResponse::Ok {
                    id: entry.id,
                    key: key.to_string(),
                    version,
                }
            }
            SetResult::Conflict { current_version } => PutResponse::Error { current_version },
        };

        self.cache_response(dedup_key, &response, now)?;
        Ok(response)
    }

    /// GET key, current or historical version. Served by any node.
    pub fn get(
        &self,
        key: &str,
        version: Option<u64>,
        client_id: Option<String>,
        request_id: Option<String>,
    ) -> Result<GetResponse, ServiceError> {
        let now = self.node.clock().now();
        let dedup_key = identified(&client_id, &request_id, Operation::Get);
        if let Some(cache_key) = &dedup_key {
            if let Some(cached) = self.node.dedup().lookup(cache_key, now) {
                return from_cached(cached);
            }
        }

        let response = match self.node.keyspace().get(key, version) {
            Some((value, version)) => GetResponse::Found {
                key: key.to_string(),
                value,
                version,
            },
            None => GetResponse::not_found(key),
        };

        self.cache_response(dedup_key, &response, now)?;
        Ok(response)
    }

    /// DELETE key. Leader only.
    pub async fn delete(
        &self,
        key: &str,
        client_id: Option<String>,
        request_id: Option<String>,
    ) -> Result<DeleteResponse, ServiceError> {
        if !self.node.is_leader() {
            return Err(ServiceError::NotLeader);
        }

        let now = self.node.clock().now();
        let dedup_key = identified(&client_id, &request_id, Operation::Delete);
        if let Some(cache_key) = &dedup_key {
            if let Some(cached) = self.node.dedup().lookup(cache_key, now) {
                return from_cached(cached);
            }
        }

        let response = match self.node.delete(key, client_id, request_id)? {
            DeleteResult::Applied(entry) => {
                info!(key, id = entry.id, "appended DELETE entry");
                self.node.coordinator().ship(&entry);
                DeleteResponse::Ok { id: entry.id }
            }
            DeleteResult::NotFound => DeleteResponse::Error {
                message: format!("Key not found: {}", key),
            },
        };

        self.cache_response(dedup_key, &response, now)?;
        Ok(response)
    }

    /// Retained history for a key, or None if absent.
    pub fn history(&self, key: &str) -> Option<HistoryResponse> {
        let history = self.node.keyspace().history(key)?;
        Some(HistoryResponse {
            key: key.to_string(),
            versions: history.iter().map(|(v, _)| *v).collect(),
            history: history
                .into_iter()
                .map(|(version, value)| HistoryEntry { version, value })
                .collect(),
        })
    }

    /// Retained version numbers for a key, or None if absent.
    pub fn versions(&self, key: &str) -> Option<VersionsResponse> {
        let versions = self.node.keyspace().versions(key)?;
        let latest_version = *versions.last()?;
        Some(VersionsResponse {
            key: key.to_string(),
            versions,
            latest_version,
        })
    }

    pub fn keys(&self) -> KeysResponse {
        let keys = self.node.keyspace().keys();
        let count = keys.len();
        KeysResponse { keys, count }
    }

    pub fn segments(&self) -> Result<SegmentsResponse, ServiceError> {
        let segments = self.node.wal().segments()?;
        Ok(SegmentsResponse {
            total_segments: segments.len(),
            max_segment_size: self.node.wal().max_segment_size(),
            segments,
        })
    }

    pub fn dedup_stats(&self) -> DedupStats {
        self.node.dedup().stats()
    }

    /// Whether an identified request was already processed, and with what
    /// result. Without an operation there is nothing to match.
    pub fn request_status(
        &self,
        client_id: &str,
        request_id: &str,
        operation: Option<Operation>,
    ) -> RequestStatusResponse {
        let Some(operation) = operation else {
            return RequestStatusResponse {
                processed: false,
                result: None,
            };
        };
        let key = RequestKey::new(client_id, request_id, operation);
        match self.node.dedup().lookup(&key, self.node.clock().now()) {
            Some(result) => RequestStatusResponse {
                processed: true,
                result: Some(result),
            },
            None => RequestStatusResponse {
                processed: false,
                result: None,
            },
        }
    }

    pub fn cluster_status(&self) -> ClusterStatusResponse {
        let config = self.node.config();
        let (role, leader_url) = match &config.role {
            Role::Leader => ("leader".to_string(), None),
            Role::Follower { leader_url } => ("follower".to_string(), Some(leader_url.clone())),
        };
        ClusterStatusResponse {
            node_id: config.node_id.clone(),
            role,
            leader_url,
            peers: self.node.health().snapshot(self.node.clock().now()),
            followers: if config.role.is_leader() {
                self.node.coordinator().follower_status()
            } else {
                Vec::new()
            },
        }
    }

    /// Trigger a compaction run now (bypassing the spacing floor, never
    /// the single-flight guard).
    pub fn run_compaction(&self) -> Result<CompactionRunResponse, ServiceError> {
        let (segments_compacted, entries_removed) = self.node.compaction().run(true)?;
        Ok(CompactionRunResponse {
            status: "ok".to_string(),
            segments_compacted,
            entries_removed,
        })
    }

    pub fn compaction_status(&self) -> CompactionStatus {
        self.node.compaction().status()
    }

    pub fn configure_compaction(
        &self,
        request: ConfigureCompactionRequest,
    ) -> ConfigureCompactionResponse {
        let mut changes = Vec::new();
        if let Some(enabled) = request.enabled {
            self.node.compaction().set_enabled(enabled);
            changes.push(format!("enabled: {}", enabled));
        }
        if let Some(interval) = request.interval {
            let applied = self.node.compaction().set_interval(interval);
            changes.push(format!("interval: {}s", applied));
        }
        ConfigureCompactionResponse {
            status: "ok".to_string(),
            changes,
        }
    }

    fn cache_response<R: Serialize>(
        &self,
        dedup_key: Option<RequestKey>,
        response: &R,
        now: crate::clock::Timestamp,
    ) -> Result<(), ServiceError> {
        let Some(key) = dedup_key else {
            return Ok(());
        };
        let value =
            serde_json::to_value(response).map_err(|e| ServiceError::Internal(e.to_string()))?;
        self.node.dedup().record(key, value, now);
        Ok(())
    }
}

fn identified(
    client_id: &Option<String>,
    request_id: &Option<String>,
    operation: Operation,
) -> Option<RequestKey> {
    match (client_id, request_id) {
        (Some(client_id), Some(request_id)) => {
            Some(RequestKey::new(client_id.clone(), request_id.clone(), operation))
        }
        _ => None,
    }
}

fn from_cached<R: serde::de::DeserializeOwned>(cached: Value) -> Result<R, ServiceError> {
    serde_json::from_value(cached).map_err(|e| ServiceError::Internal(e.to_string()))
}
