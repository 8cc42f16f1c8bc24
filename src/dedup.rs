//! Idempotent Request Receiver
//!
//! Caches the response of every identified client request under
//! `(client_id, request_id, operation)`, making retries observationally
//! equivalent to a single execution. Distinct operations under the same
//! `(client_id, request_id)` are separate records.
//!
//! The cache is consulted before any WAL id is assigned, so duplicates
//! never burn ids. Entries expire after a TTL (evicted by a periodic
//! sweep) and the cache is size-bounded with oldest-first eviction.
//! Requests without both identifiers bypass the cache entirely; that
//! decision is the caller's, this type always receives full keys.

use crate::clock::Timestamp;
use crate::storage::entry::Operation;
use ahash::{AHashMap, AHashSet};
use parking_lot::Mutex;
use serde::Serialize;
use serde_json::Value;
use std::time::Duration;
use tracing::{info, warn};

/// Identity of one client request.
#[derive(Debug, Clone, PartialEq, Eq, Hash)]
pub struct RequestKey {
    pub client_id: String,
    pub request_id: String,
    pub operation: Operation,
}

impl RequestKey {
    pub fn new(client_id: impl Into<String>, request_id: impl Into<String>, operation: Operation) -> Self {
        RequestKey {
            client_id: client_id.into(),
            request_id: request_id.into(),
            operation,
        }
    }
}

/// Counters reported by `stats`.
#[derive(Debug, Clone, Default, PartialEq, Eq, Serialize)]
pub struct DedupStats {
    pub current_cache_size: usize,
    pub unique_request_ids: usize,
    pub total_client_count: usize,
    pub total_requests_cached: u64,
    pub total_duplicates_detected: u64,
    pub same_operation_duplicates: u64,
    pub different_operation_duplicates: u64,
    pub total_cache_cleanups: u64,
}

#[derive(Default)]
struct CacheInner {
    /// client_id -> (request_id, operation) -> (created_at, response)
    by_client: AHashMap<String, AHashMap<(String, Operation), (Timestamp, Value)>>,
    total_requests_cached: u64,
    total_duplicates_detected: u64,
    same_operation_duplicates: u64,
    different_operation_duplicates: u64,
    total_cache_cleanups: u64,
}

impl CacheInner {
    fn entry_count(&self) -> usize {
        self.by_client.values().map(|requests| requests.len()).sum()
    }
}

/// TTL + size bounded response cache.
pub struct RequestCache {
    inner: Mutex<CacheInner>,
    ttl: Duration,
    max_entries: usize,
}

impl RequestCache {
    pub fn new(ttl: Duration, max_entries: usize) -> Self {
        RequestCache {
            inner: Mutex::new(CacheInner::default()),
            ttl,
            max_entries,
        }
    }

    /// Cached response for an identical earlier request, if any. An entry
    /// past its TTL is a miss even before the sweep removes it. A live
    /// record under the same `(client, request)` but another operation is
    /// counted and logged, and still misses.
    pub fn lookup(&self, key: &RequestKey, now: Timestamp) -> Option<Value> {
        let mut inner = self.inner.lock();
        let requests = inner.by_client.get(&key.client_id)?;

        let cache_key = (key.request_id.clone(), key.operation);
        if let Some((created_at, response)) = requests.get(&cache_key) {
            if now.since(*created_at) > self.ttl {
                return None;
            }
            let response = response.clone();
            let age = now.since(*created_at);
            inner.total_duplicates_detected += 1;
            inner.same_operation_duplicates += 1;
            warn!(
                client_id = %key.client_id,
                request_id = %key.request_id,
                operation = %key.operation,
                age_secs = age.as_secs_f64(),
                "duplicate request detected, returning cached response"
            );
            return Some(response);
        }

        let different_op = inner
            .by_client
            .get(&key.client_id)
            .map(|requests| {
                requests
                    .keys()
                    .any(|(request_id, op)| request_id == &key.request_id && *op != key.operation)
            })
            .unwrap_or(false);
        if different_op {
            inner.different_operation_duplicates += 1;
            warn!(
                client_id = %key.client_id,
                request_id = %key.request_id,
                operation = %key.operation,
                "request id reused with a different operation"
            );
        }

        None
    }

    /// Store a response. Evicts oldest entries when the size bound is
    /// exceeded.
    pub fn record(&self, key: RequestKey, response: Value, now: Timestamp) {
        let mut inner = self.inner.lock();
        inner
            .by_client
            .entry(key.client_id)
            .or_default()
            .insert((key.request_id, key.operation), (now, response));
        inner.total_requests_cached += 1;

        if inner.entry_count() > self.max_entries {
            let excess = inner.entry_count() - self.max_entries;
            Self::evict_oldest(&mut inner, excess);
            inner.total_cache_cleanups += 1;
        }
    }

    /// Remove entries older than the TTL. Returns how many were evicted.
    pub fn sweep(&self, now: Timestamp) -> usize {
        let mut inner = self.inner.lock();
        let ttl = self.ttl;
        let mut evicted = 0;

        for requests in inner.by_client.values_mut() {
            let before = requests.len();
            requests.retain(|_, (created_at, _)| now.since(*created_at) <= ttl);
            evicted += before - requests.len();
        }
        inner.by_client.retain(|_, requests| !requests.is_empty());

        if evicted > 0 {
            inner.total_cache_cleanups += 1;
            info!(evicted, "swept expired dedup cache entries");
        }
        evicted
    }

    pub fn stats(&self) -> DedupStats {
        let inner = self.inner.lock();
        let mut unique_request_ids: AHashSet<&str> = AHashSet::new();
        for requests in inner.by_client.values() {
            for (request_id, _) in requests.keys() {
                unique_request_ids.insert(request_id.as_str());
            }
        }
        DedupStats {
            current_cache_size: inner.entry_count(),
            unique_request_ids: unique_request_ids.len(),
            total_client_count: inner.by_client.len(),
            total_requests_cached: inner.total_requests_cached,
            total_duplicates_detected: inner.total_duplicates_detected,
            same_operation_duplicates: inner.same_operation_duplicates,
            different_operation_duplicates: inner.different_operation_duplicates,
            total_cache_cleanups: inner.total_cache_cleanups,
        }
    }

    fn evict_oldest(inner: &mut CacheInner, count: usize) {
        let mut all: Vec<(Timestamp, String, (String, Operation))> = inner
            .by_client
            .iter()
            .flat_map(|(client_id, requests)| {
                requests.iter().map(move |(key, (created_at, _))| {
                    (*created_at, client_id.clone(), key.clone())
                })
            })
            .collect();
        all.sort_by(|a, b| a.0.cmp(&b.0));

        info!(count, "dedup cache over size bound, evicting oldest entries");
        for (_, client_id, key) in all.into_iter().take(count) {
            if let Some(requests) = inner.by_client.get_mut(&client_id) {
                requests.remove(&key);
                if requests.is_empty() {
                    inner.by_client.remove(&client_id);
                }
            }
        }
    }
}
