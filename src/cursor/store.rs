//! Ordered duplicate-key store
//!
//! Wraps one RocksDB database. Writes go through the store handle; reads go
//! through a [`Snapshot`], which pins one consistent view and hands out
//! [`Cursor`]s that borrow it.

use crate::cursor::cursor::{Cursor, Position};
use crate::cursor::schema::{
    encode_composite, meta_keys, open_rocks_db, open_rocks_db_readonly, CF_HASH_DATA,
    CF_HASH_STORE, CF_METADATA,
};
use crate::error::{CursorError, CursorResult};
use crate::types::OpenMode;
use rocksdb::{ColumnFamily, DB};
use std::path::{Path, PathBuf};
use tracing::{debug, info};

/// Sorted multiset of `(key, value)` byte pairs with fixed-width keys
pub struct OrderedCursorStore {
    db: DB,
    path: PathBuf,
    key_width: usize,
    read_only: bool,
}

impl OrderedCursorStore {
    /// Open the store at `path`.
    ///
    /// `CreateNew` fails if `path` exists and records `key_width`; the other
    /// modes require an existing store created with the same key width.
    pub fn open<P: AsRef<Path>>(path: P, mode: OpenMode, key_width: usize) -> CursorResult<Self> {
        let path = path.as_ref();
        if key_width == 0 {
            return Err(CursorError::KeyWidth {
                expected: 1,
                actual: 0,
            });
        }

        let db = match mode {
            OpenMode::CreateNew => {
                if path.exists() {
                    return Err(CursorError::AlreadyExists(path.to_path_buf()));
                }
                let db = open_rocks_db(path)?;
                let cf = metadata_cf(&db)?;
                db.put_cf(cf, meta_keys::KEY_WIDTH, key_width.to_string())?;
                db.put_cf(cf, meta_keys::CREATED_AT, chrono::Utc::now().to_rfc3339())?;
                info!(path = %path.display(), key_width, "Created ordered store");
                db
            }
            OpenMode::OpenExisting | OpenMode::ReadOnly => {
                if !path.exists() {
                    return Err(CursorError::NotFound(path.to_path_buf()));
                }
                let db = if mode.is_writable() {
                    open_rocks_db(path)?
                } else {
                    open_rocks_db_readonly(path)?
                };

                let stored = read_key_width(&db)?;
                if stored != key_width {
                    return Err(CursorError::KeyWidth {
                        expected: stored,
                        actual: key_width,
                    });
                }
                debug!(
                    path = %path.display(),
                    key_width,
                    read_only = !mode.is_writable(),
                    "Opened ordered store"
                );
                db
            }
        };

        Ok(Self {
            db,
            path: path.to_path_buf(),
            key_width,
            read_only: !mode.is_writable(),
        })
    }

    pub fn key_width(&self) -> usize {
        self.key_width
    }

    pub fn path(&self) -> &Path {
        &self.path
    }

    pub fn is_read_only(&self) -> bool {
        self.read_only
    }

    /// Add a pair; returns false if it was already present
    pub fn insert(&self, key: &[u8], value: &[u8]) -> CursorResult<bool> {
        self.ensure_writable("insert")?;
        let composite = self.composite(key, value)?;
        let cf = self.cf()?;

        if self.db.get_pinned_cf(cf, &composite)?.is_some() {
            return Ok(false);
        }
        self.db.put_cf(cf, &composite, b"")?;
        Ok(true)
    }

    /// Remove a pair; returns false if it was not present
    pub fn erase(&self, key: &[u8], value: &[u8]) -> CursorResult<bool> {
        self.ensure_writable("erase")?;
        let composite = self.composite(key, value)?;
        let cf = self.cf()?;

        if self.db.get_pinned_cf(cf, &composite)?.is_none() {
            return Ok(false);
        }
        self.db.delete_cf(cf, &composite)?;
        Ok(true)
    }

    pub fn contains(&self, key: &[u8], value: &[u8]) -> CursorResult<bool> {
        let composite = self.composite(key, value)?;
        Ok(self.db.get_pinned_cf(self.cf()?, &composite)?.is_some())
    }

    /// Replace the attribute value stored for `key`
    pub fn put_attributes(&self, key: &[u8], value: &[u8]) -> CursorResult<()> {
        self.ensure_writable("put attributes")?;
        check_key_width(self.key_width, key)?;
        self.db.put_cf(self.attributes_cf()?, key, value)?;
        Ok(())
    }

    /// Attribute value stored for `key`, if any
    pub fn attributes(&self, key: &[u8]) -> CursorResult<Option<Vec<u8>>> {
        check_key_width(self.key_width, key)?;
        Ok(self.db.get_cf(self.attributes_cf()?, key)?)
    }

    /// Flush memtables to disk
    pub fn flush(&self) -> CursorResult<()> {
        if !self.read_only {
            self.db.flush_cf(self.cf()?)?;
            self.db.flush_cf(self.attributes_cf()?)?;
        }
        Ok(())
    }

    /// Pin a consistent read view
    pub fn snapshot(&self) -> CursorResult<Snapshot<'_>> {
        Ok(Snapshot {
            inner: self.db.snapshot(),
            cf: self.cf()?,
            key_width: self.key_width,
        })
    }

    fn cf(&self) -> CursorResult<&ColumnFamily> {
        self.db
            .cf_handle(CF_HASH_STORE)
            .ok_or_else(|| CursorError::Corrupt(format!("missing column family {CF_HASH_STORE}")))
    }

    fn attributes_cf(&self) -> CursorResult<&ColumnFamily> {
        self.db
            .cf_handle(CF_HASH_DATA)
            .ok_or_else(|| CursorError::Corrupt(format!("missing column family {CF_HASH_DATA}")))
    }

    fn composite(&self, key: &[u8], value: &[u8]) -> CursorResult<Vec<u8>> {
        check_key_width(self.key_width, key)?;
        Ok(encode_composite(key, value))
    }

    fn ensure_writable(&self, operation: &'static str) -> CursorResult<()> {
        if self.read_only {
            Err(CursorError::InvalidState { operation })
        } else {
            Ok(())
        }
    }
}

/// One consistent read view of an [`OrderedCursorStore`]
pub struct Snapshot<'a> {
    inner: rocksdb::Snapshot<'a>,
    cf: &'a ColumnFamily,
    key_width: usize,
}

impl<'a> Snapshot<'a> {
    /// Open a cursor at `position`. A lookup that finds nothing yields a
    /// cursor at end.
    pub fn cursor(&self, position: Position<'_>) -> CursorResult<Cursor<'_>> {
        let mut iter = self.inner.raw_iterator_cf(self.cf);

        let at_end = match position {
            Position::Begin => {
                iter.seek_to_first();
                false
            }
            Position::End => true,
            Position::LowerBound(key) => {
                check_key_width(self.key_width, key)?;
                iter.seek(key);
                false
            }
            Position::AtKeyValue(key, value) => {
                check_key_width(self.key_width, key)?;
                let composite = encode_composite(key, value);
                iter.seek(&composite);
                iter.key() != Some(composite.as_slice())
            }
        };
        iter.status()?;

        Ok(Cursor::new(iter, self.key_width, at_end))
    }

    pub fn key_width(&self) -> usize {
        self.key_width
    }
}

fn check_key_width(expected: usize, key: &[u8]) -> CursorResult<()> {
    if key.len() != expected {
        return Err(CursorError::KeyWidth {
            expected,
            actual: key.len(),
        });
    }
    Ok(())
}

fn metadata_cf(db: &DB) -> CursorResult<&ColumnFamily> {
    db.cf_handle(CF_METADATA)
        .ok_or_else(|| CursorError::Corrupt(format!("missing column family {CF_METADATA}")))
}

fn read_key_width(db: &DB) -> CursorResult<usize> {
    let raw = db
        .get_cf(metadata_cf(db)?, meta_keys::KEY_WIDTH)?
        .ok_or_else(|| CursorError::Corrupt("key width not recorded".into()))?;

    String::from_utf8_lossy(&raw)
        .parse()
        .map_err(|e| CursorError::Corrupt(format!("bad key width: {e}")))
}
