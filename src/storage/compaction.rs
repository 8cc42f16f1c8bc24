//! Log Compaction
//!
//! Rewrites the inactive segments down to the latest operation per key,
//! preserving each survivor's original id and CRC, then atomically swaps
//! the result in as segment 1 and renumbers the rest densely. The swap is
//! recorded in a manifest first, so a crash recovers to the post-swap
//! layout (see `storage::manifest`).
//!
//! Survivor rules, applied to the latest inactive operation per key:
//! - a SET superseded by any later operation on the key in the active
//!   segment is dropped (replay state is unchanged without it)
//! - a DELETE is dropped unless the key reappears in the active segment
//!
//! The compactor never touches the active segment and holds the WAL lock
//! only across the final swap. A single-flight guard keeps runs from
//! overlapping; a scheduled run also respects a minimum spacing floor.

use crate::clock::{Clock, Timestamp};
use crate::storage::entry::{LogEntry, Operation};
use crate::storage::manifest::SwapManifest;
use crate::storage::segment_store::{SegmentReader, SegmentStore, SegmentWriter, WalError};
use crate::storage::wal::{segment_name, SegmentedWal};
use ahash::AHashMap;
use parking_lot::Mutex;
use serde::Serialize;
use std::collections::VecDeque;
use std::sync::atomic::{AtomicBool, AtomicU64, Ordering};
use std::sync::Arc;
use tracing::{error, info, warn};

/// Staging file for the compacted output before the swap.
pub const COMPACTED_TMP: &str = "wal.log.compacted.tmp";

/// Retained compaction reports.
const HISTORY_LIMIT: usize = 10;
/// Floor for a configured compaction interval, seconds.
const MIN_CONFIGURABLE_INTERVAL_SECS: u64 = 60;

/// Result of one completed compaction run.
#[derive(Debug, Clone, PartialEq, Eq, Serialize)]
pub struct CompactionReport {
    pub timestamp_ms: u64,
    pub duration_ms: u64,
    pub segments_compacted: usize,
    pub entries_removed: usize,
}

/// Current scheduler state, as reported to callers.
#[derive(Debug, Clone, Serialize)]
pub struct CompactionStatus {
    pub enabled: bool,
    pub compaction_interval_seconds: u64,
    pub min_compaction_interval_seconds: u64,
    pub last_compaction_ms: Option<u64>,
    pub compaction_running: bool,
    pub compaction_history: Vec<CompactionReport>,
}

/// Periodic compaction with single-flight and spacing guarantees.
pub struct CompactionService<S: SegmentStore> {
    wal: Arc<SegmentedWal<S>>,
    clock: Arc<dyn Clock>,
    enabled: AtomicBool,
    interval_secs: AtomicU64,
    min_interval_secs: AtomicU64,
    running: AtomicBool,
    last_run: Mutex<Option<Timestamp>>,
    history: Mutex<VecDeque<CompactionReport>>,
}

impl<S: SegmentStore> CompactionService<S> {
    pub fn new(
        wal: Arc<SegmentedWal<S>>,
        clock: Arc<dyn Clock>,
        config: &crate::config::CompactionConfig,
    ) -> Self {
        CompactionService {
            wal,
            clock,
            enabled: AtomicBool::new(config.enabled),
            interval_secs: AtomicU64::new(config.interval_secs),
            min_interval_secs: AtomicU64::new(config.min_interval_secs),
            running: AtomicBool::new(false),
            last_run: Mutex::new(None),
            history: Mutex::new(VecDeque::new()),
        }
    }

    /// Run one compaction pass. `force` bypasses the minimum spacing floor
    /// but never the single-flight guard. Returns
    /// `(segments_compacted, entries_removed)`; a skipped run reports
    /// `(0, 0)`.
    pub fn run(&self, force: bool) -> Result<(usize, usize), WalError> {
        if self
            .running
            .compare_exchange(false, true, Ordering::SeqCst, Ordering::SeqCst)
            .is_err()
        {
            warn!("compaction already in progress, skipping");
            return Ok((0, 0));
        }

        let result = self.run_guarded(force);
        self.running.store(false, Ordering::SeqCst);
        result
    }

    fn run_guarded(&self, force: bool) -> Result<(usize, usize), WalError> {
        let now = self.clock.now();
        if !force {
            if let Some(last) = *self.last_run.lock() {
                let spacing = now.since(last).as_secs();
                let floor = self.min_interval_secs.load(Ordering::Relaxed);
                if spacing < floor {
                    info!(
                        seconds_since_last = spacing,
                        min_interval = floor,
                        "skipping compaction, last run too recent"
                    );
                    return Ok((0, 0));
                }
            }
        }

        info!("starting log compaction");
        let result = compact(&self.wal)?;
        let finished = self.clock.now();
        *self.last_run.lock() = Some(finished);

        let (segments_compacted, entries_removed) = result;
        let report = CompactionReport {
            timestamp_ms: finished.as_millis(),
            duration_ms: finished.since(now).as_millis() as u64,
            segments_compacted,
            entries_removed,
        };
        info!(
            segments_compacted,
            entries_removed,
            duration_ms = report.duration_ms,
            "compaction completed"
        );

        let mut history = self.history.lock();
        history.push_back(report);
        while history.len() > HISTORY_LIMIT {
            history.pop_front();
        }

        Ok(result)
    }

    pub fn status(&self) -> CompactionStatus {
        CompactionStatus {
            enabled: self.enabled.load(Ordering::Relaxed),
            compaction_interval_seconds: self.interval_secs.load(Ordering::Relaxed),
            min_compaction_interval_seconds: self.min_interval_secs.load(Ordering::Relaxed),
            last_compaction_ms: self.last_run.lock().map(|t| t.as_millis()),
            compaction_running: self.running.load(Ordering::Relaxed),
            compaction_history: self.history.lock().iter().cloned().collect(),
        }
    }

    pub fn is_enabled(&self) -> bool {
        self.enabled.load(Ordering::Relaxed)
    }

    pub fn set_enabled(&self, enabled: bool) -> bool {
        self.enabled.store(enabled, Ordering::Relaxed);
        enabled
    }

    /// Reconfigure the loop cadence. Values below the floor are clamped.
    pub fn set_interval(&self, interval_secs: u64) -> u64 {
        let clamped = interval_secs.max(MIN_CONFIGURABLE_INTERVAL_SECS);
        self.interval_secs.store(clamped, Ordering::Relaxed);
        clamped
    }

    pub fn interval_secs(&self) -> u64 {
        self.interval_secs.load(Ordering::Relaxed)
    }

    /// Background loop: sleep one interval, then run if enabled. The
    /// interval is re-read every cycle so reconfiguration takes effect
    /// without a restart.
    pub async fn run_loop(self: Arc<Self>, mut shutdown: tokio::sync::watch::Receiver<bool>) {
        loop {
            let interval = std::time::Duration::from_secs(self.interval_secs());
            tokio::select! {
                _ = tokio::time::sleep(interval) => {}
                _ = shutdown.changed() => {
                    info!("compaction loop stopped");
                    return;
                }
            }

            if !self.is_enabled() {
                continue;
            }
            if let Err(e) = self.run(false) {
                error!(error = %e, "compaction run failed");
            }
        }
    }
}

/// One compaction pass over the WAL's inactive segments. Returns
/// `(segments_compacted, entries_removed)`.
pub fn compact<S: SegmentStore>(wal: &SegmentedWal<S>) -> Result<(usize, usize), WalError> {
    let inactive = wal.inactive_segments()?;
    if inactive.is_empty() {
        return Ok((0, 0));
    }
    let (active_seq, active_name) = wal.active_segment();

    // Snapshot the inactive contents and the set of keys the active
    // segment mentions. Appends may continue while we read; they only add
    // operations later than anything snapshotted here.
    let mut entries = Vec::new();
    for (_, name) in &inactive {
        entries.extend(read_segment_entries(wal.store(), name));
    }
    entries.sort_by_key(|e| e.id);
    let total = entries.len();
    if total == 0 {
        return Ok((0, 0));
    }

    let active_keys: ahash::AHashSet<String> = read_segment_entries(wal.store(), &active_name)
        .into_iter()
        .map(|e| e.key)
        .collect();

    // Latest operation per key, then the active-segment drop rules.
    let mut latest: AHashMap<String, LogEntry> = AHashMap::new();
    for entry in entries {
        latest.insert(entry.key.clone(), entry);
    }
    let mut survivors: Vec<LogEntry> = latest
        .into_iter()
        .filter_map(|(key, entry)| {
            let in_active = active_keys.contains(&key);
            match entry.operation {
                Operation::Set if in_active => None,
                Operation::Delete if !in_active => None,
                _ => Some(entry),
            }
        })
        .collect();
    survivors.sort_by_key(|e| e.id);
    let entries_removed = total - survivors.len();

    // Stage the compacted segment, preserving original ids and CRCs.
    let mut writer = wal.store().create(COMPACTED_TMP)?;
    for entry in &survivors {
        debug_assert!(entry.validate_crc(), "Precondition: survivors carry valid CRCs");
        writer.append(&entry.encode())?;
    }
    writer.flush()?;
    drop(writer);

    // The compacted file becomes segment 1 and the active segment slides
    // down to 2; everything it replaced is deleted.
    let plan = SwapManifest {
        deletes: inactive.iter().map(|(_, name)| name.clone()).collect(),
        renames: vec![
            (COMPACTED_TMP.to_string(), segment_name(1)),
            (active_name, segment_name(2)),
        ],
    };

    if !wal.rename_sequence(&plan, active_seq)? {
        // The log rolled since the snapshot; drop the staged output and let
        // the next run recompute against the new layout.
        warn!("segment layout changed during compaction, discarding staged output");
        wal.store().delete(COMPACTED_TMP)?;
        return Ok((0, 0));
    }

    Ok((inactive.len(), entries_removed))
}

fn read_segment_entries<S: SegmentStore>(store: &S, name: &str) -> Vec<LogEntry> {
    let data = match store.open_read(name).and_then(|mut r| r.read_all()) {
        Ok(data) => data,
        Err(e) => {
            warn!(segment = %name, error = %e, "skipping unreadable segment during compaction");
            return Vec::new();
        }
    };
    let mut entries = Vec::new();
    for line in data.split_inclusive(|&b| b == b'\n') {
        match LogEntry::decode(line) {
            Ok(entry) => entries.push(entry),
            Err(e) => {
                warn!(segment = %name, error = %e, "skipping corrupt record during compaction");
            }
        }
    }
    entries
}
