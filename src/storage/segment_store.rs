//! Segment Storage Abstraction
//!
//! Trait-based file operations for WAL segments, so the same WAL and
//! compactor code runs against the local filesystem in production and an
//! in-memory store in tests (which can also simulate torn writes and
//! crashes).

use parking_lot::Mutex;
use std::collections::HashMap;
use std::io::{Error as IoError, ErrorKind, Write};
use std::path::PathBuf;
use std::sync::Arc;

/// Error type for WAL storage operations.
#[derive(Debug)]
pub enum WalError {
    /// I/O error
    Io(IoError),
    /// Corruption detected (CRC mismatch or unparseable record)
    Corruption(String),
    /// Segment file not found
    NotFound(String),
    /// Disk full
    DiskFull,
    /// Flush to durable storage failed
    FlushFailed(String),
    /// Partial write detected
    PartialWrite { expected: usize, actual: usize },
    /// Follower append out of sequence
    IdGap { expected: u64, got: u64 },
}

impl std::fmt::Display for WalError {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        match self {
            WalError::Io(e) => write!(f, "WAL I/O error: {}", e),
            WalError::Corruption(msg) => write!(f, "WAL corruption: {}", msg),
            WalError::NotFound(name) => write!(f, "segment not found: {}", name),
            WalError::DiskFull => write!(f, "WAL disk full"),
            WalError::FlushFailed(msg) => write!(f, "WAL flush failed: {}", msg),
            WalError::PartialWrite { expected, actual } => {
                write!(f, "partial write: expected {} bytes, wrote {}", expected, actual)
            }
            WalError::IdGap { expected, got } => {
                write!(f, "append out of sequence: expected id {}, got {}", expected, got)
            }
        }
    }
}

impl std::error::Error for WalError {}

impl From<IoError> for WalError {
    fn from(e: IoError) -> Self {
        match e.kind() {
            ErrorKind::NotFound => WalError::NotFound(e.to_string()),
            _ if e.to_string().contains("No space left") => WalError::DiskFull,
            _ => WalError::Io(e),
        }
    }
}

/// Writer handle for one segment file.
pub trait SegmentWriter: Send {
    /// Append bytes. Returns the file size after the write.
    fn append(&mut self, data: &[u8]) -> Result<u64, WalError>;
    /// Flush to durable storage.
    fn flush(&mut self) -> Result<(), WalError>;
    /// Current file size in bytes.
    fn size(&self) -> u64;
}

/// Reader handle for one segment file.
pub trait SegmentReader: Send {
    /// Read the entire file contents.
    fn read_all(&mut self) -> Result<Vec<u8>, WalError>;
}

/// Storage backend for segment files.
pub trait SegmentStore: Send + Sync + 'static {
    type Writer: SegmentWriter;
    type Reader: SegmentReader;

    /// Create a new empty file for writing (truncates an existing one).
    fn create(&self, name: &str) -> Result<Self::Writer, WalError>;
    /// Open a file for appending, creating it if absent.
    fn open_append(&self, name: &str) -> Result<Self::Writer, WalError>;
    /// Open an existing file for reading.
    fn open_read(&self, name: &str) -> Result<Self::Reader, WalError>;
    /// List all file names, sorted alphabetically.
    fn list(&self) -> Result<Vec<String>, WalError>;
    /// Size of a file in bytes.
    fn size_of(&self, name: &str) -> Result<u64, WalError>;
    /// Atomically rename a file. Replaces `to` if it exists.
    fn rename(&self, from: &str, to: &str) -> Result<(), WalError>;
    /// Delete a file. Deleting a missing file is not an error.
    fn delete(&self, name: &str) -> Result<(), WalError>;
    /// Check whether a file exists.
    fn exists(&self, name: &str) -> Result<bool, WalError>;
    /// Truncate a file to `len` bytes. Used for torn-tail repair.
    fn truncate(&self, name: &str, len: u64) -> Result<(), WalError>;
    /// Human-facing path for a file name, as reported in segment listings.
    fn display_path(&self, name: &str) -> String {
        name.to_string()
    }
}

// ============================================================================
// InMemorySegmentStore - for unit and integration tests
// ============================================================================

#[derive(Debug, Clone, Default)]
struct InMemoryFile {
    data: Vec<u8>,
    /// Position up to which data is flushed (durable).
    flushed_pos: usize,
}

/// In-memory store with crash-simulation hooks.
#[derive(Debug, Clone, Default)]
pub struct InMemorySegmentStore {
    files: Arc<Mutex<HashMap<String, InMemoryFile>>>,
}

impl InMemorySegmentStore {
    pub fn new() -> Self {
        InMemorySegmentStore::default()
    }

    /// Raw bytes of a file, for corruption/crash tests.
    pub fn file_data(&self, name: &str) -> Option<Vec<u8>> {
        self.files.lock().get(name).map(|f| f.data.clone())
    }

    /// Overwrite a file's raw bytes, for corruption tests.
    pub fn set_file_data(&self, name: &str, data: Vec<u8>) {
        if let Some(file) = self.files.lock().get_mut(name) {
            file.data = data;
        }
    }

    /// Truncate a file to simulate a torn trailing write.
    pub fn truncate_file(&self, name: &str, len: usize) {
        if let Some(file) = self.files.lock().get_mut(name) {
            file.data.truncate(len);
            if file.flushed_pos > len {
                file.flushed_pos = len;
            }
        }
    }

    /// Simulate a crash: unflushed bytes are lost.
    pub fn simulate_crash(&self) {
        for file in self.files.lock().values_mut() {
            let pos = file.flushed_pos;
            file.data.truncate(pos);
        }
    }

    pub fn file_count(&self) -> usize {
        self.files.lock().len()
    }
}

/// Writer into the in-memory store.
pub struct InMemorySegmentWriter {
    name: String,
    files: Arc<Mutex<HashMap<String, InMemoryFile>>>,
    current_size: u64,
}

impl SegmentWriter for InMemorySegmentWriter {
    fn append(&mut self, data: &[u8]) -> Result<u64, WalError> {
        let mut files = self.files.lock();
        let file = files
            .get_mut(&self.name)
            .ok_or_else(|| WalError::NotFound(self.name.clone()))?;
        file.data.extend_from_slice(data);
        self.current_size = file.data.len() as u64;
        Ok(self.current_size)
    }

    fn flush(&mut self) -> Result<(), WalError> {
        let mut files = self.files.lock();
        if let Some(file) = files.get_mut(&self.name) {
            file.flushed_pos = file.data.len();
        }
        Ok(())
    }

    fn size(&self) -> u64 {
        self.current_size
    }
}

/// Reader over a snapshot of an in-memory file.
pub struct InMemorySegmentReader {
    data: Vec<u8>,
}

impl SegmentReader for InMemorySegmentReader {
    fn read_all(&mut self) -> Result<Vec<u8>, WalError> {
        Ok(self.data.clone())
    }
}

impl SegmentStore for InMemorySegmentStore {
    type Writer = InMemorySegmentWriter;
    type Reader = InMemorySegmentReader;

    fn create(&self, name: &str) -> Result<Self::Writer, WalError> {
        debug_assert!(!name.is_empty(), "Precondition: name must not be empty");

        self.files
            .lock()
            .insert(name.to_string(), InMemoryFile::default());
        Ok(InMemorySegmentWriter {
            name: name.to_string(),
            files: Arc::clone(&self.files),
            current_size: 0,
        })
    }

    fn open_append(&self, name: &str) -> Result<Self::Writer, WalError> {
        let mut files = self.files.lock();
        let size = files
            .entry(name.to_string())
            .or_insert_with(InMemoryFile::default)
            .data
            .len() as u64;
        Ok(InMemorySegmentWriter {
            name: name.to_string(),
            files: Arc::clone(&self.files),
            current_size: size,
        })
    }

    fn open_read(&self, name: &str) -> Result<Self::Reader, WalError> {
        let files = self.files.lock();
        let file = files
            .get(name)
            .ok_or_else(|| WalError::NotFound(name.to_string()))?;
        Ok(InMemorySegmentReader {
            data: file.data.clone(),
        })
    }

    fn list(&self) -> Result<Vec<String>, WalError> {
        let mut names: Vec<String> = self.files.lock().keys().cloned().collect();
        names.sort();
        Ok(names)
    }

    fn size_of(&self, name: &str) -> Result<u64, WalError> {
        let files = self.files.lock();
        files
            .get(name)
            .map(|f| f.data.len() as u64)
            .ok_or_else(|| WalError::NotFound(name.to_string()))
    }

    fn rename(&self, from: &str, to: &str) -> Result<(), WalError> {
        let mut files = self.files.lock();
        let file = files
            .remove(from)
            .ok_or_else(|| WalError::NotFound(from.to_string()))?;
        files.insert(to.to_string(), file);
        Ok(())
    }

    fn delete(&self, name: &str) -> Result<(), WalError> {
        self.files.lock().remove(name);
        Ok(())
    }

    fn exists(&self, name: &str) -> Result<bool, WalError> {
        Ok(self.files.lock().contains_key(name))
    }

    fn truncate(&self, name: &str, len: u64) -> Result<(), WalError> {
        let mut files = self.files.lock();
        let file = files
            .get_mut(name)
            .ok_or_else(|| WalError::NotFound(name.to_string()))?;
        file.data.truncate(len as usize);
        if file.flushed_pos > len as usize {
            file.flushed_pos = len as usize;
        }
        Ok(())
    }
}

// ============================================================================
// LocalSegmentStore - production filesystem backend
// ============================================================================

/// Local filesystem store using std::fs + sync_all.
#[derive(Debug, Clone)]
pub struct LocalSegmentStore {
    dir: PathBuf,
}

impl LocalSegmentStore {
    /// Creates the directory if it does not exist.
    pub fn new(dir: PathBuf) -> Result<Self, WalError> {
        std::fs::create_dir_all(&dir)?;
        Ok(LocalSegmentStore { dir })
    }

    pub fn dir(&self) -> &PathBuf {
        &self.dir
    }

    fn file_path(&self, name: &str) -> PathBuf {
        self.dir.join(name)
    }
}

/// Writer over a local file.
pub struct LocalSegmentWriter {
    file: std::fs::File,
    current_size: u64,
}

impl SegmentWriter for LocalSegmentWriter {
    fn append(&mut self, data: &[u8]) -> Result<u64, WalError> {
        let written = self.file.write(data).map_err(WalError::Io)?;
        if written != data.len() {
            return Err(WalError::PartialWrite {
                expected: data.len(),
                actual: written,
            });
        }
        self.current_size = self
            .current_size
            .checked_add(written as u64)
            .expect("segment size overflow is unreachable");
        Ok(self.current_size)
    }

    fn flush(&mut self) -> Result<(), WalError> {
        self.file
            .sync_all()
            .map_err(|e| WalError::FlushFailed(e.to_string()))
    }

    fn size(&self) -> u64 {
        self.current_size
    }
}

/// Reader over a local file.
pub struct LocalSegmentReader {
    path: PathBuf,
}

impl SegmentReader for LocalSegmentReader {
    fn read_all(&mut self) -> Result<Vec<u8>, WalError> {
        std::fs::read(&self.path).map_err(WalError::Io)
    }
}

impl SegmentStore for LocalSegmentStore {
    type Writer = LocalSegmentWriter;
    type Reader = LocalSegmentReader;

    fn create(&self, name: &str) -> Result<Self::Writer, WalError> {
        debug_assert!(!name.is_empty(), "Precondition: name must not be empty");

        let file = std::fs::File::create(self.file_path(name)).map_err(WalError::Io)?;
        Ok(LocalSegmentWriter {
            file,
            current_size: 0,
        })
    }

    fn open_append(&self, name: &str) -> Result<Self::Writer, WalError> {
        let path = self.file_path(name);
        let file = std::fs::OpenOptions::new()
            .append(true)
            .create(true)
            .open(&path)
            .map_err(WalError::Io)?;
        let current_size = file.metadata().map_err(WalError::Io)?.len();
        Ok(LocalSegmentWriter { file, current_size })
    }

    fn open_read(&self, name: &str) -> Result<Self::Reader, WalError> {
        let path = self.file_path(name);
        if !path.exists() {
            return Err(WalError::NotFound(name.to_string()));
        }
        Ok(LocalSegmentReader { path })
    }

    fn list(&self) -> Result<Vec<String>, WalError> {
        let mut names = Vec::new();
        for entry in std::fs::read_dir(&self.dir).map_err(WalError::Io)? {
            let entry = entry.map_err(WalError::Io)?;
            if entry.path().is_file() {
                if let Some(name) = entry.file_name().to_str() {
                    names.push(name.to_string());
                }
            }
        }
        names.sort();
        Ok(names)
    }

    fn size_of(&self, name: &str) -> Result<u64, WalError> {
        std::fs::metadata(self.file_path(name))
            .map(|m| m.len())
            .map_err(WalError::from)
    }

    fn rename(&self, from: &str, to: &str) -> Result<(), WalError> {
        std::fs::rename(self.file_path(from), self.file_path(to)).map_err(WalError::from)
    }

    fn delete(&self, name: &str) -> Result<(), WalError> {
        match std::fs::remove_file(self.file_path(name)) {
            Ok(()) => Ok(()),
            Err(e) if e.kind() == ErrorKind::NotFound => Ok(()),
            Err(e) => Err(WalError::Io(e)),
        }
    }

    fn exists(&self, name: &str) -> Result<bool, WalError> {
        Ok(self.file_path(name).exists())
    }

    fn truncate(&self, name: &str, len: u64) -> Result<(), WalError> {
        let file = std::fs::OpenOptions::new()
            .write(true)
            .open(self.file_path(name))
            .map_err(WalError::from)?;
        file.set_len(len).map_err(WalError::Io)?;
        file.sync_all()
            .map_err(|e| WalError::FlushFailed(e.to_string()))
    }

    fn display_path(&self, name: &str) -> String {
        self.file_path(name).display().to_string()
    }
}
