//! Versioned Keyspace
//!
//! In-memory map from key to current value, version, and a bounded history
//! of prior versions. Versions increase by exactly 1 per successful SET on
//! a live key. DELETE is terminal for a version chain: the key (and its
//! history) is removed, and a later SET starts again at version 1.
//!
//! The keyspace never touches the WAL. Mutating callers perform the
//! version check here, append to the WAL, then apply, under the node write
//! lock; replay and replication go through [`Keyspace::apply_entry`].

use crate::storage::entry::{LogEntry, Operation};
use ahash::AHashMap;
use parking_lot::RwLock;
use serde_json::Value;
use std::collections::VecDeque;

/// Current value and retained history for one key.
#[derive(Debug, Clone, PartialEq)]
pub struct VersionedValue {
    pub value: Value,
    pub version: u64,
    /// Prior `(version, value)` pairs, oldest first. Bounded by the
    /// keyspace's `max_history`.
    pub history: VecDeque<(u64, Value)>,
}

impl VersionedValue {
    fn new(value: Value, version: u64) -> Self {
        VersionedValue {
            value,
            version,
            history: VecDeque::new(),
        }
    }

    /// Value at a specific version, if still retained.
    fn value_at(&self, version: u64) -> Option<&Value> {
        if version == self.version {
            return Some(&self.value);
        }
        self.history
            .iter()
            .find(|(v, _)| *v == version)
            .map(|(_, value)| value)
    }

    /// Install a newer version, retiring the current value into history.
    /// Updates carrying an old version are ignored (replay is idempotent).
    fn update(&mut self, value: Value, version: u64, max_history: usize) {
        if version <= self.version {
            return;
        }
        let previous = std::mem::replace(&mut self.value, value);
        self.history.push_back((self.version, previous));
        self.version = version;
        if max_history > 0 {
            while self.history.len() > max_history {
                self.history.pop_front();
            }
        }
    }
}

/// Outcome of the pre-write version check.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum VersionCheck {
    /// The SET may proceed and will produce this version.
    Ok { next_version: u64 },
    /// The caller's expected version does not match; nothing was written.
    Conflict { current_version: u64 },
}

/// The in-memory keyspace.
pub struct Keyspace {
    map: RwLock<AHashMap<String, VersionedValue>>,
    /// Retained prior versions per key; 0 = unbounded.
    max_history: usize,
}

impl Keyspace {
    pub fn new(max_history: usize) -> Self {
        Keyspace {
            map: RwLock::new(AHashMap::new()),
            max_history,
        }
    }

    /// Check a SET precondition. Without an expectation the SET always
    /// proceeds at `current + 1` (1 for an absent key).
    pub fn check_version(&self, key: &str, expected: Option<u64>) -> VersionCheck {
        let map = self.map.read();
        let current = map.get(key).map(|v| v.version);
        match (expected, current) {
            (None, None) => VersionCheck::Ok { next_version: 1 },
            (None, Some(current)) => VersionCheck::Ok {
                next_version: current + 1,
            },
            (Some(expected), Some(current)) if expected == current => VersionCheck::Ok {
                next_version: current + 1,
            },
            (Some(_), Some(current)) => VersionCheck::Conflict {
                current_version: current,
            },
            // Expecting a version of an absent key can never match.
            (Some(_), None) => VersionCheck::Conflict { current_version: 0 },
        }
    }

    /// Install a SET at an explicit version.
    pub fn apply_set(&self, key: &str, value: Value, version: u64) {
        debug_assert!(version > 0, "Precondition: versions start at 1");

        let mut map = self.map.write();
        match map.get_mut(key) {
            Some(existing) => existing.update(value, version, self.max_history),
            None => {
                map.insert(key.to_string(), VersionedValue::new(value, version));
            }
        }
    }

    /// Remove a key. Returns false if it was absent.
    pub fn delete(&self, key: &str) -> bool {
        self.map.write().remove(key).is_some()
    }

    /// Apply one log entry; the replay and replication path. A SET without
    /// a recorded version falls back to `current + 1`.
    pub fn apply_entry(&self, entry: &LogEntry) {
        match entry.operation {
            Operation::Set => {
                let value = entry.value.clone().unwrap_or(Value::Null);
                let version = match entry.version {
                    Some(version) => version,
                    None => match self.latest_version(&entry.key) {
                        Some(current) => current + 1,
                        None => 1,
                    },
                };
                self.apply_set(&entry.key, value, version);
            }
            Operation::Delete => {
                self.delete(&entry.key);
            }
            Operation::Get => {}
        }
    }

    /// Current value and version, or a retained historical version.
    pub fn get(&self, key: &str, version: Option<u64>) -> Option<(Value, u64)> {
        let map = self.map.read();
        let entry = map.get(key)?;
        match version {
            None => Some((entry.value.clone(), entry.version)),
            Some(v) => entry.value_at(v).map(|value| (value.clone(), v)),
        }
    }

    /// All retained `(version, value)` pairs ascending, current last.
    pub fn history(&self, key: &str) -> Option<Vec<(u64, Value)>> {
        let map = self.map.read();
        let entry = map.get(key)?;
        let mut pairs: Vec<(u64, Value)> = entry.history.iter().cloned().collect();
        pairs.push((entry.version, entry.value.clone()));
        Some(pairs)
    }

    /// All retained version numbers ascending.
    pub fn versions(&self, key: &str) -> Option<Vec<u64>> {
        self.history(key)
            .map(|pairs| pairs.into_iter().map(|(v, _)| v).collect())
    }

    pub fn latest_version(&self, key: &str) -> Option<u64> {
        self.map.read().get(key).map(|v| v.version)
    }

    /// All live keys, sorted.
    pub fn keys(&self) -> Vec<String> {
        let mut keys: Vec<String> = self.map.read().keys().cloned().collect();
        keys.sort();
        keys
    }

    pub fn len(&self) -> usize {
        self.map.read().len()
    }

    pub fn is_empty(&self) -> bool {
        self.map.read().is_empty()
    }
}
