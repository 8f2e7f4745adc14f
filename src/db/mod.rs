//! Hash database directory
//!
//! A hash database is a directory holding both stores plus their settings:
//!
//! ```text
//! my.hdb/
//! ├── settings.json       DbSettings (hash size, map sizing)
//! ├── hash_map.mmap       GrowableMultiMap<BlockHash<W>, Occurrence>
//! ├── hash_store.rocks/   OrderedCursorStore, key width W, plus per-hash metadata
//! └── sources.json        SourceRegistry and per-source data
//! ```
//!
//! The multimap answers point lookups during scans; the ordered store gives
//! deterministic full-range iteration for export.

pub mod export;
pub mod import;
pub mod sources;

pub use export::export_ordered;
pub use import::{import_sources_tab, import_tab, ImportStats, SourceImportStats};
pub use sources::{SourceData, SourceName, SourceRegistry};

use crate::config::{DbSettings, ScanMode};
use crate::cursor::{OrderedCursorStore, Position};
use crate::error::{ConfigError, CursorError, Result};
use crate::multimap::{GrowableMultiMap, InsertOutcome, MultiMapOptions};
use crate::scan::MultiMapScanManager;
use crate::types::{BlockHash, HashMetadata, OpenMode, Occurrence};
use chrono::{DateTime, Utc};
use serde::Serialize;
use std::fs;
use std::path::{Path, PathBuf};
use tracing::info;

/// File names inside a database directory
pub const HASH_MAP_FILE: &str = "hash_map.mmap";
pub const HASH_STORE_DIR: &str = "hash_store.rocks";
pub const SOURCES_FILE: &str = "sources.json";

/// Summary for `hashdb stats`
#[derive(Debug, Clone, Serialize)]
pub struct DbStats {
    pub path: PathBuf,
    pub hash_size: usize,
    pub entries: u64,
    pub distinct_hashes: u64,
    pub sources: usize,
    pub map_bytes: u64,
    pub map_slots: u64,
    pub created_at: DateTime<Utc>,
}

/// Open hash database with `W`-byte block hashes
pub struct HashDatabase<const W: usize> {
    dir: PathBuf,
    settings: DbSettings,
    map: GrowableMultiMap<BlockHash<W>, Occurrence>,
    store: OrderedCursorStore,
    sources: SourceRegistry,
}

impl<const W: usize> HashDatabase<W> {
    /// Create a new database directory; `dir` must not exist
    pub fn create(dir: &Path, settings: DbSettings) -> Result<Self> {
        settings.validate()?;
        if settings.hash_size != W {
            return Err(ConfigError::HashSizeMismatch {
                stored: settings.hash_size,
                requested: W,
            }
            .into());
        }
        if dir.exists() {
            return Err(ConfigError::InvalidDbPath {
                path: dir.to_path_buf(),
                reason: "already exists".into(),
            }
            .into());
        }

        fs::create_dir_all(dir)?;
        settings.write(dir)?;

        let options = MultiMapOptions {
            initial_size: settings.initial_map_size,
            max_size: settings.max_map_size,
        };
        let map = GrowableMultiMap::open_with(dir.join(HASH_MAP_FILE), OpenMode::CreateNew, options)?;
        let store = OrderedCursorStore::open(dir.join(HASH_STORE_DIR), OpenMode::CreateNew, W)?;
        let mut sources = SourceRegistry::new(dir.join(SOURCES_FILE));
        sources.save()?;

        info!(path = %dir.display(), hash_size = W, "Created hash database");
        Ok(Self {
            dir: dir.to_path_buf(),
            settings,
            map,
            store,
            sources,
        })
    }

    /// Open an existing database directory
    pub fn open(dir: &Path, mode: OpenMode) -> Result<Self> {
        if mode == OpenMode::CreateNew {
            return Err(ConfigError::InvalidDbPath {
                path: dir.to_path_buf(),
                reason: "use create() for new databases".into(),
            }
            .into());
        }
        if !dir.is_dir() {
            return Err(ConfigError::InvalidDbPath {
                path: dir.to_path_buf(),
                reason: "not a database directory".into(),
            }
            .into());
        }

        let settings = DbSettings::read(dir)?;
        if settings.hash_size != W {
            return Err(ConfigError::HashSizeMismatch {
                stored: settings.hash_size,
                requested: W,
            }
            .into());
        }

        let options = MultiMapOptions {
            initial_size: settings.initial_map_size,
            max_size: settings.max_map_size,
        };
        let map = GrowableMultiMap::open_with(dir.join(HASH_MAP_FILE), mode, options)?;
        let store = OrderedCursorStore::open(dir.join(HASH_STORE_DIR), mode, W)?;
        let sources = SourceRegistry::load(dir.join(SOURCES_FILE))?;

        info!(
            path = %dir.display(),
            entries = map.size(),
            sources = sources.len(),
            read_only = !mode.is_writable(),
            "Opened hash database"
        );
        Ok(Self {
            dir: dir.to_path_buf(),
            settings,
            map,
            store,
            sources,
        })
    }

    /// Add one occurrence of `hash` to both stores.
    ///
    /// Returns false if the pair was already present. The ordered store is
    /// written first; if the multimap then fails, a pair that was new to the
    /// ordered store is removed again so both stores keep the same pairs.
    pub fn insert(&mut self, hash: BlockHash<W>, occurrence: Occurrence) -> Result<bool> {
        let value = occurrence.to_bytes();
        let new_in_store = self.store.insert(hash.as_bytes(), &value)?;

        match self.map.insert(hash, occurrence) {
            Ok(outcome) => Ok(outcome == InsertOutcome::Inserted),
            Err(e) => {
                if new_in_store {
                    self.store.erase(hash.as_bytes(), &value)?;
                }
                Err(e.into())
            }
        }
    }

    /// Replace the entropy and labels recorded for `hash`
    pub fn set_hash_metadata(&mut self, hash: &BlockHash<W>, metadata: &HashMetadata) -> Result<()> {
        let value = serde_json::to_vec(metadata)?;
        self.store.put_attributes(hash.as_bytes(), &value)?;
        Ok(())
    }

    /// Entropy and labels recorded for `hash`, if any
    pub fn hash_metadata(&self, hash: &BlockHash<W>) -> Result<Option<HashMetadata>> {
        match self.store.attributes(hash.as_bytes())? {
            Some(bytes) => Ok(Some(serde_json::from_slice(&bytes)?)),
            None => Ok(None),
        }
    }

    /// Id for a source name, allocating one if needed
    pub fn source_id(&mut self, name: &str) -> u64 {
        self.sources.get_or_insert(name)
    }

    pub fn dir(&self) -> &Path {
        &self.dir
    }

    pub fn settings(&self) -> &DbSettings {
        &self.settings
    }

    pub fn map(&self) -> &GrowableMultiMap<BlockHash<W>, Occurrence> {
        &self.map
    }

    pub fn store(&self) -> &OrderedCursorStore {
        &self.store
    }

    pub fn sources(&self) -> &SourceRegistry {
        &self.sources
    }

    pub fn sources_mut(&mut self) -> &mut SourceRegistry {
        &mut self.sources
    }

    pub fn is_read_only(&self) -> bool {
        self.map.is_read_only()
    }

    /// Gather statistics; walks the ordered store once
    pub fn stats(&self) -> Result<DbStats> {
        let snapshot = self.store.snapshot()?;
        let mut distinct = 0u64;
        let mut previous: Option<Vec<u8>> = None;

        for pair in snapshot.cursor(Position::Begin)? {
            let (key, _) = pair?;
            if previous.as_deref() != Some(key.as_slice()) {
                distinct += 1;
                previous = Some(key);
            }
        }

        Ok(DbStats {
            path: self.dir.clone(),
            hash_size: W,
            entries: self.map.size(),
            distinct_hashes: distinct,
            sources: self.sources.len(),
            map_bytes: self.map.mapped_len(),
            map_slots: self.map.capacity(),
            created_at: self.settings.created_at,
        })
    }

    /// Compact and flush everything
    pub fn close(mut self) -> Result<()> {
        if !self.is_read_only() {
            self.sources.save()?;
            self.store.flush()?;
        }
        self.map.close()?;
        info!(path = %self.dir.display(), "Closed hash database");
        Ok(())
    }

    /// Turn this database into a scan manager over its multimap, reading
    /// per-hash metadata from the ordered store
    pub fn into_scan_manager(mut self, mode: ScanMode) -> Result<MultiMapScanManager<W>> {
        if !self.is_read_only() {
            self.sources.save()?;
            self.store.flush()?;
        }
        Ok(MultiMapScanManager::new(self.map, mode).with_metadata(self.store))
    }
}

/// Decode an ordered-store value into an occurrence
pub(crate) fn decode_occurrence(value: &[u8]) -> std::result::Result<Occurrence, CursorError> {
    Occurrence::from_bytes(value).ok_or_else(|| {
        CursorError::Corrupt(format!(
            "stored occurrence is {} bytes, expected 24",
            value.len()
        ))
    })
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::error::{HashDbError, StoreError};
    use crate::scan::ScanManager;
    use tempfile::tempdir;

    #[test]
    fn test_create_insert_reopen() {
        let dir = tempdir().unwrap();
        let path = dir.path().join("db");

        let mut db = HashDatabase::<16>::create(&path, DbSettings::new(16)).unwrap();
        let source = db.source_id("disk.img");
        let hash = BlockHash([0x11; 16]);
        assert!(db.insert(hash, Occurrence::new(source, 0)).unwrap());
        assert!(!db.insert(hash, Occurrence::new(source, 0)).unwrap());
        assert!(db.insert(hash, Occurrence::new(source, 512)).unwrap());
        db.close().unwrap();

        let db = HashDatabase::<16>::open(&path, OpenMode::ReadOnly).unwrap();
        assert_eq!(db.map().count(&hash), 2);
        assert_eq!(db.sources().name(source), Some("disk.img"));

        let stats = db.stats().unwrap();
        assert_eq!(stats.entries, 2);
        assert_eq!(stats.distinct_hashes, 1);
        assert_eq!(stats.sources, 1);
    }

    #[test]
    fn test_hash_size_must_match() {
        let dir = tempdir().unwrap();
        let path = dir.path().join("db");

        HashDatabase::<20>::create(&path, DbSettings::new(20))
            .unwrap()
            .close()
            .unwrap();

        let err = HashDatabase::<16>::open(&path, OpenMode::ReadOnly).err().unwrap();
        assert!(matches!(
            err,
            HashDbError::Config(ConfigError::HashSizeMismatch {
                stored: 20,
                requested: 16
            })
        ));

        let err = HashDatabase::<16>::create(&dir.path().join("other"), DbSettings::new(20))
            .err()
            .unwrap();
        assert!(matches!(err, HashDbError::Config(_)));
    }

    #[test]
    fn test_create_refuses_existing_dir() {
        let dir = tempdir().unwrap();
        let err = HashDatabase::<16>::create(dir.path(), DbSettings::new(16))
            .err()
            .unwrap();
        assert!(matches!(
            err,
            HashDbError::Config(ConfigError::InvalidDbPath { .. })
        ));
    }

    #[test]
    fn test_failed_insert_leaves_stores_consistent() {
        let dir = tempdir().unwrap();
        let path = dir.path().join("db");

        // Room for a 16-slot table and no growth
        let table = 64 + 16 * (1 + 16 + 24);
        let settings = DbSettings {
            initial_map_size: table,
            max_map_size: Some(table),
            ..DbSettings::new(16)
        };
        let mut db = HashDatabase::<16>::create(&path, settings).unwrap();

        let mut failed = None;
        for n in 0..64u8 {
            let hash = BlockHash([n; 16]);
            let occurrence = Occurrence::new(1, u64::from(n));
            if let Err(e) = db.insert(hash, occurrence) {
                failed = Some((hash, occurrence, e));
                break;
            }
        }

        let (hash, occurrence, err) = failed.expect("the size cap must be hit");
        assert!(matches!(err, HashDbError::Store(StoreError::OutOfSpace { .. })));
        assert!(!db.map().contains(&hash, &occurrence));
        assert!(!db.store().contains(hash.as_bytes(), &occurrence.to_bytes()).unwrap());

        let stats = db.stats().unwrap();
        assert_eq!(stats.entries, stats.distinct_hashes);
        assert_eq!(stats.entries, db.map().size());
    }

    #[test]
    fn test_hash_metadata_reopen() {
        let dir = tempdir().unwrap();
        let path = dir.path().join("db");
        let hash = BlockHash([0x33; 16]);

        let mut db = HashDatabase::<16>::create(&path, DbSettings::new(16)).unwrap();
        assert_eq!(db.hash_metadata(&hash).unwrap(), None);
        db.insert(hash, Occurrence::new(1, 0)).unwrap();
        let metadata = HashMetadata {
            entropy: 3,
            block_label: "html".into(),
            ..HashMetadata::default()
        };
        db.set_hash_metadata(&hash, &metadata).unwrap();
        db.close().unwrap();

        let db = HashDatabase::<16>::open(&path, OpenMode::ReadOnly).unwrap();
        assert_eq!(db.hash_metadata(&hash).unwrap(), Some(metadata));
        // Metadata does not count as an entry
        assert_eq!(db.stats().unwrap().entries, 1);

        let manager = db.into_scan_manager(ScanMode::Count).unwrap();
        let info = manager.hash_info(hash.as_bytes()).unwrap();
        assert_eq!(info.entropy, 3);
        assert_eq!(info.block_label, "html");
    }

    #[test]
    fn test_into_scan_manager() {
        let dir = tempdir().unwrap();
        let path = dir.path().join("db");

        let mut db = HashDatabase::<16>::create(&path, DbSettings::new(16)).unwrap();
        db.insert(BlockHash([0xAA; 16]), Occurrence::new(1, 0)).unwrap();
        db.close().unwrap();

        let manager = HashDatabase::<16>::open(&path, OpenMode::ReadOnly)
            .unwrap()
            .into_scan_manager(ScanMode::Count)
            .unwrap();
        assert_eq!(manager.lookup(&[0xAA; 16]).as_deref(), Some(r#"{"count":1}"#));
    }
}
