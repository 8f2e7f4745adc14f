//! hashdb - Forensic Block-Hash Database
//!
//! Stores very large numbers of fixed-width content-block hashes, each with
//! one or more source occurrences, and scans streams of hashes against them.
//!
//! # Features
//!
//! - **Growable Memory-Mapped Index**: An open-addressing multimap in a
//!   single file that rebuilds itself into a larger sibling file when it
//!   fills and renames it over the original, without losing entries.
//!
//! - **Ordered Cursor Store**: A RocksDB-backed sorted multiset with forward
//!   cursors for deterministic full-range export, plus per-hash entropy and
//!   labels.
//!
//! - **Concurrent Scanning**: A fixed worker pool between two bounded queues
//!   answers batched hash lookups, with cooperative shutdown.
//!
//! # Architecture
//!
//! ```text
//! ┌────────────┐   batches   ┌──────────────────────────────┐   results   ┌──────────┐
//! │  Producer  │ ──────────▶ │  ScanPipeline (N workers)    │ ──────────▶ │ Consumer │
//! └────────────┘             └──────────────┬───────────────┘             └──────────┘
//!                                           │ lookup()
//!                                           ▼
//!                            ┌──────────────────────────────┐
//!                            │  ScanManager                 │
//!                            │  GrowableMultiMap (mmap)     │
//!                            └──────────────────────────────┘
//!
//! ┌────────────┐  insert()   ┌──────────────────────────────┐  cursor     ┌──────────┐
//! │  Importer  │ ──────────▶ │  HashDatabase                │ ──────────▶ │ Exporter │
//! └────────────┘             │  multimap + ordered store    │             └──────────┘
//!                            └──────────────────────────────┘
//! ```
//!
//! # Example
//!
//! ```bash
//! hashdb create my.hdb --hash-size 16
//! hashdb import my.hdb blocks.tab -p
//! hashdb scan my.hdb hashes.txt -w 8
//! ```

pub mod config;
pub mod cursor;
pub mod db;
pub mod error;
pub mod multimap;
pub mod progress;
pub mod scan;
pub mod types;

pub use config::{CliArgs, DbSettings, ScanConfig, ScanMode};
pub use cursor::{Cursor, OrderedCursorStore, Position, Snapshot};
pub use db::HashDatabase;
pub use error::{HashDbError, Result};
pub use multimap::{GrowableMultiMap, InsertOutcome, MultiMapOptions};
pub use scan::{HashInfo, MultiMapScanManager, ScanManager, ScanPipeline};
pub use types::{BlockHash, FixedLayout, HashMetadata, OpenMode, Occurrence, SourceId};
