//! Error types for hashdb
//!
//! This module defines the error hierarchy for:
//! - The growable memory-mapped multimap
//! - The ordered RocksDB cursor store
//! - The scan batch wire format and scan pipeline
//! - Worker threads
//! - Configuration, settings and source registry files
//!
//! Design philosophy:
//! - Use thiserror for structured error types in library code
//! - Keep retryable conditions (`Exhausted`) distinct from fatal ones
//! - Preserve error chains for debugging

use std::path::PathBuf;
use thiserror::Error;

/// Top-level error type for hashdb
#[derive(Error, Debug)]
pub enum HashDbError {
    /// Multimap errors
    #[error("Multimap error: {0}")]
    Store(#[from] StoreError),

    /// Ordered store errors
    #[error("Ordered store error: {0}")]
    Cursor(#[from] CursorError),

    /// Scan pipeline errors
    #[error("Scan error: {0}")]
    Scan(#[from] ScanError),

    /// Configuration errors
    #[error("Configuration error: {0}")]
    Config(#[from] ConfigError),

    /// Source registry could not be read or written
    #[error("Source registry '{path}': {reason}")]
    Sources { path: PathBuf, reason: String },

    /// Per-hash metadata could not be encoded or decoded
    #[error("Metadata JSON error: {0}")]
    Json(#[from] serde_json::Error),

    /// I/O errors (file operations, etc.)
    #[error("I/O error: {0}")]
    Io(#[from] std::io::Error),
}

/// Growable multimap errors
#[derive(Error, Debug)]
pub enum StoreError {
    /// Failed to open or create the backing file
    #[error("Failed to open '{path}': {source}")]
    Open {
        path: PathBuf,
        #[source]
        source: std::io::Error,
    },

    /// CreateNew on a path that already exists
    #[error("Path already exists: '{path}'")]
    AlreadyExists { path: PathBuf },

    /// OpenExisting or ReadOnly on a path that does not exist
    #[error("Path not found: '{path}'")]
    NotFound { path: PathBuf },

    /// Header or table layout is not what this handle expects
    #[error("Corrupt store '{path}': {reason}")]
    Corrupt { path: PathBuf, reason: String },

    /// Write attempted through a read-only handle
    #[error("Cannot {operation}: store is open read-only")]
    InvalidState { operation: &'static str },

    /// The slot table is full; the caller grows the segment and retries.
    /// Never returned from the public API.
    #[error("Slot table exhausted ({used} of {slots} slots in use)")]
    Exhausted { used: u64, slots: u64 },

    /// Growing would exceed the configured size cap
    #[error("Out of space: growing to {requested} bytes exceeds cap of {max} bytes")]
    OutOfSpace { requested: u64, max: u64 },

    /// I/O error on an open store
    #[error("I/O error: {0}")]
    Io(#[from] std::io::Error),
}

impl StoreError {
    /// Whether the condition is recovered internally by grow-and-retry
    pub fn is_retryable(&self) -> bool {
        matches!(self, StoreError::Exhausted { .. })
    }
}

/// Ordered store and cursor errors
#[derive(Error, Debug)]
pub enum CursorError {
    /// RocksDB operation failed
    #[error("RocksDB error: {0}")]
    Rocks(#[from] rocksdb::Error),

    /// Write attempted through a read-only handle
    #[error("Cannot {operation}: store is open read-only")]
    InvalidState { operation: &'static str },

    /// CreateNew on a path that already exists
    #[error("Path already exists: '{0}'")]
    AlreadyExists(PathBuf),

    /// OpenExisting or ReadOnly on a path that does not exist
    #[error("Path not found: '{0}'")]
    NotFound(PathBuf),

    /// Key length does not match the store's key width
    #[error("Key width mismatch: expected {expected} bytes, got {actual}")]
    KeyWidth { expected: usize, actual: usize },

    /// Stored data does not decode
    #[error("Invalid store format: {0}")]
    Corrupt(String),

    /// Dereference or advance of a cursor positioned at end
    #[error("Cursor has no current element")]
    NoCurrentElement,
}

/// Result type alias for CursorError
pub type CursorResult<T> = std::result::Result<T, CursorError>;

/// Scan batch decode/encode errors
#[derive(Error, Debug, Clone, PartialEq, Eq)]
pub enum WireError {
    /// Input ended in the middle of an element
    #[error("Unexpected end of data at offset {offset} of {len} while reading {field}")]
    Truncated {
        offset: usize,
        len: usize,
        field: &'static str,
    },

    /// Label does not fit the u16 length prefix
    #[error("Label of {0} bytes exceeds the 65535 byte limit")]
    LabelTooLong(usize),

    /// Match description does not fit the u32 length prefix
    #[error("Match description of {0} bytes exceeds the u32 limit")]
    MatchTooLong(usize),

    /// Hash passed to the encoder has the wrong width
    #[error("Hash width mismatch: expected {expected} bytes, got {actual}")]
    HashWidth { expected: usize, actual: usize },
}

/// Scan pipeline errors
#[derive(Error, Debug)]
pub enum ScanError {
    /// Unscanned queue stayed full; the batch is handed back
    #[error("Unscanned queue full ({depth} batches)")]
    QueueFull { depth: usize, batch: Vec<u8> },

    /// All workers are gone
    #[error("Scan queue disconnected")]
    Disconnected,

    /// Worker/concurrency errors
    #[error("Worker error: {0}")]
    Worker(#[from] WorkerError),

    /// Invalid pipeline configuration
    #[error("Configuration error: {0}")]
    Config(#[from] ConfigError),
}

impl ScanError {
    /// Recover the batch from a `QueueFull` error
    pub fn into_batch(self) -> Option<Vec<u8>> {
        match self {
            ScanError::QueueFull { batch, .. } => Some(batch),
            _ => None,
        }
    }
}

/// Worker thread errors
#[derive(Error, Debug)]
pub enum WorkerError {
    /// Worker panicked
    #[error("Worker {id} panicked: {message}")]
    Panicked { id: usize, message: String },

    /// Worker thread could not be started
    #[error("Failed to initialize worker {id}: {reason}")]
    InitFailed { id: usize, reason: String },
}

/// Configuration and settings errors
#[derive(Error, Debug)]
pub enum ConfigError {
    /// Invalid worker count
    #[error("Invalid worker count {count}: must be between 1 and {max}")]
    InvalidWorkerCount { count: usize, max: usize },

    /// Invalid queue depth
    #[error("Invalid queue depth {depth}: must be at least {min}")]
    InvalidQueueDepth { depth: usize, min: usize },

    /// Invalid batch size
    #[error("Invalid batch size {size}: must be between {min} and {max}")]
    InvalidBatchSize { size: usize, min: usize, max: usize },

    /// Hash width not supported by this build
    #[error("Unsupported hash size {0}: expected one of 16, 20, 32, 64")]
    UnsupportedHashSize(usize),

    /// Database opened with a different hash width than it was created with
    #[error("Hash size mismatch: database uses {stored} bytes, requested {requested}")]
    HashSizeMismatch { stored: usize, requested: usize },

    /// Settings file missing or unreadable
    #[error("Cannot read settings '{path}': {reason}")]
    InvalidSettings { path: PathBuf, reason: String },

    /// Database directory problems
    #[error("Invalid database path '{path}': {reason}")]
    InvalidDbPath { path: PathBuf, reason: String },
}

/// Result type alias for HashDbError
pub type Result<T> = std::result::Result<T, HashDbError>;

/// Result type alias for StoreError
pub type StoreResult<T> = std::result::Result<T, StoreError>;

/// Result type alias for ScanError
pub type ScanResult<T> = std::result::Result<T, ScanError>;

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_store_error_retryable() {
        let exhausted = StoreError::Exhausted { used: 3, slots: 4 };
        assert!(exhausted.is_retryable());

        let read_only = StoreError::InvalidState { operation: "insert" };
        assert!(!read_only.is_retryable());
        assert_eq!(
            read_only.to_string(),
            "Cannot insert: store is open read-only"
        );
    }

    #[test]
    fn test_error_conversion() {
        let store_err = StoreError::NotFound {
            path: "/missing".into(),
        };
        let top: HashDbError = store_err.into();
        assert!(matches!(top, HashDbError::Store(_)));
    }

    #[test]
    fn test_queue_full_returns_batch() {
        let err = ScanError::QueueFull {
            depth: 4,
            batch: vec![1, 2, 3],
        };
        assert_eq!(err.into_batch(), Some(vec![1, 2, 3]));
        assert_eq!(ScanError::Disconnected.into_batch(), None);
    }
}
