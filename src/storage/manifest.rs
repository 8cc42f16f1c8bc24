//! Compaction Swap Manifest
//!
//! The compactor replaces inactive segments with a compacted file and
//! renumbers the rest. The whole swap is recorded in a manifest file before
//! any segment is touched, so a crash mid-swap is recoverable:
//!
//! 1. Write the swap plan to a temp file
//! 2. Rename temp to the manifest name (atomic on POSIX)
//! 3. Apply deletes, then renames
//! 4. Remove the manifest
//!
//! Every step is idempotent (deletes tolerate missing files, renames are
//! skipped when the source is gone), so on startup a leftover manifest is
//! simply replayed, landing the store in the post-swap configuration.

use crate::storage::segment_store::{SegmentStore, SegmentWriter, WalError};
use serde::{Deserialize, Serialize};
use tracing::{info, warn};

/// File name of a pending swap plan.
pub const SWAP_MANIFEST: &str = "wal.log.swap.manifest";
const SWAP_MANIFEST_TMP: &str = "wal.log.swap.manifest.tmp";

/// Error type for manifest operations.
#[derive(Debug)]
pub enum ManifestError {
    /// Underlying storage error
    Storage(WalError),
    /// JSON serialization/deserialization error
    Json(serde_json::Error),
}

impl std::fmt::Display for ManifestError {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        match self {
            ManifestError::Storage(e) => write!(f, "manifest storage error: {}", e),
            ManifestError::Json(e) => write!(f, "manifest JSON error: {}", e),
        }
    }
}

impl std::error::Error for ManifestError {}

impl From<WalError> for ManifestError {
    fn from(e: WalError) -> Self {
        ManifestError::Storage(e)
    }
}

impl From<serde_json::Error> for ManifestError {
    fn from(e: serde_json::Error) -> Self {
        ManifestError::Json(e)
    }
}

impl From<ManifestError> for WalError {
    fn from(e: ManifestError) -> Self {
        match e {
            ManifestError::Storage(e) => e,
            ManifestError::Json(e) => WalError::Corruption(format!("swap manifest: {}", e)),
        }
    }
}

/// A planned segment swap: deletes first, then renames in order.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct SwapManifest {
    /// Segment files superseded by the compacted output.
    pub deletes: Vec<String>,
    /// `(from, to)` renames establishing the dense post-swap numbering.
    pub renames: Vec<(String, String)>,
}

impl SwapManifest {
    /// Persist the plan durably before any segment is touched.
    pub fn write<S: SegmentStore>(&self, store: &S) -> Result<(), ManifestError> {
        let bytes = serde_json::to_vec(self)?;
        let mut writer = store.create(SWAP_MANIFEST_TMP)?;
        writer.append(&bytes)?;
        writer.flush()?;
        drop(writer);
        store.rename(SWAP_MANIFEST_TMP, SWAP_MANIFEST)?;
        Ok(())
    }

    /// Load a pending plan, if one exists.
    pub fn load<S: SegmentStore>(store: &S) -> Result<Option<SwapManifest>, ManifestError> {
        if !store.exists(SWAP_MANIFEST)? {
            return Ok(None);
        }
        let mut reader = store.open_read(SWAP_MANIFEST)?;
        let bytes = crate::storage::segment_store::SegmentReader::read_all(&mut reader)?;
        let manifest = serde_json::from_slice(&bytes)?;
        Ok(Some(manifest))
    }

    /// Execute the plan. Safe to call again after a partial execution.
    pub fn apply<S: SegmentStore>(&self, store: &S) -> Result<(), ManifestError> {
        for name in &self.deletes {
            store.delete(name)?;
        }
        for (from, to) in &self.renames {
            if store.exists(from)? {
                store.rename(from, to)?;
            }
        }
        Ok(())
    }

    /// Remove the persisted plan after a completed swap.
    pub fn clear<S: SegmentStore>(store: &S) -> Result<(), ManifestError> {
        store.delete(SWAP_MANIFEST)?;
        store.delete(SWAP_MANIFEST_TMP)?;
        Ok(())
    }
}

/// Roll forward a swap interrupted by a crash. Returns true if a pending
/// manifest was found and applied.
pub fn recover_pending_swap<S: SegmentStore>(store: &S) -> Result<bool, ManifestError> {
    // An orphaned temp file means the crash happened before the manifest
    // rename; the swap never started and the plan is void.
    if store.exists(SWAP_MANIFEST_TMP)? {
        warn!("discarding incomplete swap manifest temp file");
        store.delete(SWAP_MANIFEST_TMP)?;
    }

    match SwapManifest::load(store)? {
        None => Ok(false),
        Some(manifest) => {
            info!(
                deletes = manifest.deletes.len(),
                renames = manifest.renames.len(),
                "rolling forward interrupted segment swap"
            );
            manifest.apply(store)?;
            SwapManifest::clear(store)?;
            Ok(true)
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::storage::segment_store::InMemorySegmentStore;

    fn put_file(store: &InMemorySegmentStore, name: &str, data: &[u8]) {
        let mut w = store.create(name).unwrap();
        w.append(data).unwrap();
        w.flush().unwrap();
    }

    fn sample_plan() -> SwapManifest {
        SwapManifest {
            deletes: vec!["wal.log.segment.1".to_string(), "wal.log.segment.2".to_string()],
            renames: vec![
                ("wal.log.compacted.tmp".to_string(), "wal.log.segment.1".to_string()),
                ("wal.log.segment.3".to_string(), "wal.log.segment.2".to_string()),
            ],
        }
    }

    #[test]
    fn test_write_load_roundtrip() {
        let store = InMemorySegmentStore::new();
        let plan = sample_plan();
        plan.write(&store).unwrap();

        let loaded = SwapManifest::load(&store).unwrap().unwrap();
        assert_eq!(loaded, plan);
        assert!(!store.exists(SWAP_MANIFEST_TMP).unwrap());
    }

    #[test]
    fn test_apply_performs_full_swap() {
        let store = InMemorySegmentStore::new();
        put_file(&store, "wal.log.segment.1", b"old1");
        put_file(&store, "wal.log.segment.2", b"old2");
        put_file(&store, "wal.log.segment.3", b"active");
        put_file(&store, "wal.log.compacted.tmp", b"compacted");

        sample_plan().apply(&store).unwrap();

        assert_eq!(store.file_data("wal.log.segment.1").unwrap(), b"compacted");
        assert_eq!(store.file_data("wal.log.segment.2").unwrap(), b"active");
        assert!(!store.exists("wal.log.segment.3").unwrap());
        assert!(!store.exists("wal.log.compacted.tmp").unwrap());
    }

    #[test]
    fn test_apply_is_idempotent_after_partial_run() {
        let store = InMemorySegmentStore::new();
        put_file(&store, "wal.log.segment.1", b"old1");
        put_file(&store, "wal.log.segment.2", b"old2");
        put_file(&store, "wal.log.segment.3", b"active");
        put_file(&store, "wal.log.compacted.tmp", b"compacted");

        let plan = sample_plan();
        // Simulate a crash after the deletes and the first rename.
        store.delete("wal.log.segment.1").unwrap();
        store.delete("wal.log.segment.2").unwrap();
        store
            .rename("wal.log.compacted.tmp", "wal.log.segment.1")
            .unwrap();

        plan.apply(&store).unwrap();

        assert_eq!(store.file_data("wal.log.segment.1").unwrap(), b"compacted");
        assert_eq!(store.file_data("wal.log.segment.2").unwrap(), b"active");
        assert!(!store.exists("wal.log.segment.3").unwrap());
    }

    #[test]
    fn test_recover_pending_swap() {
        let store = InMemorySegmentStore::new();
        put_file(&store, "wal.log.segment.1", b"old1");
        put_file(&store, "wal.log.segment.2", b"old2");
        put_file(&store, "wal.log.segment.3", b"active");
        put_file(&store, "wal.log.compacted.tmp", b"compacted");
        sample_plan().write(&store).unwrap();

        assert!(recover_pending_swap(&store).unwrap());
        assert!(!store.exists(SWAP_MANIFEST).unwrap());
        assert_eq!(store.file_data("wal.log.segment.1").unwrap(), b"compacted");
        assert_eq!(store.file_data("wal.log.segment.2").unwrap(), b"active");

        // Nothing left to do on a second pass
        assert!(!recover_pending_swap(&store).unwrap());
    }

    #[test]
    fn test_recover_discards_orphaned_temp() {
        let store = InMemorySegmentStore::new();
        put_file(&store, SWAP_MANIFEST_TMP, b"{\"partial\":");

        assert!(!recover_pending_swap(&store).unwrap());
        assert!(!store.exists(SWAP_MANIFEST_TMP).unwrap());
    }
}
