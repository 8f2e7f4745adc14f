//! Growable memory-mapped backing file
//!
//! A `Segment` owns one file and its mapping. A larger segment is built as a
//! new file next to the live one and moved over it with `persist_as()`;
//! `truncate()` shrinks in place and remaps. Callers only ever hold offsets,
//! never references, across either.

use crate::error::{StoreError, StoreResult};
use memmap2::{Mmap, MmapMut};
use std::fs::{self, File, OpenOptions};
use std::io::ErrorKind;
use std::path::{Path, PathBuf};
use tracing::{debug, info};

enum Mapping {
    ReadOnly(Mmap),
    Writable(MmapMut),
}

/// Memory-mapped region backing a multimap
pub struct Segment {
    path: PathBuf,
    file: File,
    map: Mapping,
    max_size: Option<u64>,
}

impl Segment {
    /// Create a new zero-filled segment of `initial_size` bytes.
    /// Fails if `path` already exists.
    pub fn create(path: &Path, initial_size: u64, max_size: Option<u64>) -> StoreResult<Self> {
        if let Some(max) = max_size {
            if initial_size > max {
                return Err(StoreError::OutOfSpace {
                    requested: initial_size,
                    max,
                });
            }
        }

        let file = OpenOptions::new()
            .read(true)
            .write(true)
            .create_new(true)
            .open(path)
            .map_err(|e| match e.kind() {
                ErrorKind::AlreadyExists => StoreError::AlreadyExists {
                    path: path.to_path_buf(),
                },
                _ => StoreError::Open {
                    path: path.to_path_buf(),
                    source: e,
                },
            })?;

        // Don't leave a half-initialized file behind
        let mapped = file.set_len(initial_size).and_then(|_| {
            // SAFETY: the file was just created by us and is not shared.
            unsafe { MmapMut::map_mut(&file) }
        });
        let map = match mapped {
            Ok(map) => map,
            Err(e) => {
                drop(file);
                let _ = std::fs::remove_file(path);
                return Err(StoreError::Open {
                    path: path.to_path_buf(),
                    source: e,
                });
            }
        };

        info!(path = %path.display(), size = initial_size, "Created segment");

        Ok(Self {
            path: path.to_path_buf(),
            file,
            map: Mapping::Writable(map),
            max_size,
        })
    }

    /// Open an existing segment
    pub fn open(path: &Path, writable: bool, max_size: Option<u64>) -> StoreResult<Self> {
        let file = OpenOptions::new()
            .read(true)
            .write(writable)
            .open(path)
            .map_err(|e| match e.kind() {
                ErrorKind::NotFound => StoreError::NotFound {
                    path: path.to_path_buf(),
                },
                _ => StoreError::Open {
                    path: path.to_path_buf(),
                    source: e,
                },
            })?;

        let open_err = |e: std::io::Error| StoreError::Open {
            path: path.to_path_buf(),
            source: e,
        };

        if file.metadata().map_err(open_err)?.len() == 0 {
            return Err(StoreError::Corrupt {
                path: path.to_path_buf(),
                reason: "file is empty".into(),
            });
        }

        // SAFETY: single-writer discipline; nobody truncates the file
        // underneath an open handle.
        let map = if writable {
            Mapping::Writable(unsafe { MmapMut::map_mut(&file) }.map_err(open_err)?)
        } else {
            Mapping::ReadOnly(unsafe { Mmap::map(&file) }.map_err(open_err)?)
        };

        debug!(path = %path.display(), writable, "Opened segment");

        Ok(Self {
            path: path.to_path_buf(),
            file,
            map,
            max_size,
        })
    }

    pub fn path(&self) -> &Path {
        &self.path
    }

    pub fn is_writable(&self) -> bool {
        matches!(self.map, Mapping::Writable(_))
    }

    /// Current mapped length in bytes
    pub fn len(&self) -> u64 {
        self.bytes().len() as u64
    }

    pub fn is_empty(&self) -> bool {
        self.len() == 0
    }

    pub fn bytes(&self) -> &[u8] {
        match &self.map {
            Mapping::ReadOnly(map) => map,
            Mapping::Writable(map) => map,
        }
    }

    pub fn bytes_mut(&mut self, operation: &'static str) -> StoreResult<&mut [u8]> {
        match &mut self.map {
            Mapping::ReadOnly(_) => Err(StoreError::InvalidState { operation }),
            Mapping::Writable(map) => Ok(map),
        }
    }

    /// Size cap this segment was opened with
    pub fn max_size(&self) -> Option<u64> {
        self.max_size
    }

    /// Flush and sync this segment, then rename its file to `target`,
    /// replacing whatever is there.
    ///
    /// The rename is atomic, so `target` holds either its old contents or
    /// the complete contents of this segment.
    pub fn persist_as(&mut self, target: &Path) -> StoreResult<()> {
        self.flush()?;
        self.file.sync_all()?;
        fs::rename(&self.path, target)?;

        debug!(from = %self.path.display(), to = %target.display(), "Persisted segment");
        self.path = target.to_path_buf();
        Ok(())
    }

    /// Shrink the file to `new_len` bytes and remap
    pub fn truncate(&mut self, new_len: u64) -> StoreResult<()> {
        if new_len >= self.len() {
            return Ok(());
        }
        self.resize(new_len, "truncate")
    }

    fn resize(&mut self, new_len: u64, operation: &'static str) -> StoreResult<()> {
        match &self.map {
            Mapping::ReadOnly(_) => return Err(StoreError::InvalidState { operation }),
            Mapping::Writable(map) => map.flush()?,
        }

        self.file.set_len(new_len)?;
        // SAFETY: see `open`; the old mapping is dropped on assignment and no
        // references into it survive this call because we hold `&mut self`.
        let map = unsafe { MmapMut::map_mut(&self.file) }?;
        self.map = Mapping::Writable(map);
        Ok(())
    }

    /// Flush dirty pages to disk (no-op for read-only segments)
    pub fn flush(&self) -> StoreResult<()> {
        if let Mapping::Writable(map) = &self.map {
            map.flush()?;
        }
        Ok(())
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use tempfile::tempdir;

    #[test]
    fn test_create_rejects_existing_path() {
        let dir = tempdir().unwrap();
        let path = dir.path().join("seg");

        let seg = Segment::create(&path, 4096, None).unwrap();
        assert_eq!(seg.len(), 4096);
        drop(seg);

        let err = Segment::create(&path, 4096, None).err().unwrap();
        assert!(matches!(err, StoreError::AlreadyExists { .. }));
    }

    #[test]
    fn test_open_missing_path() {
        let dir = tempdir().unwrap();
        let err = Segment::open(&dir.path().join("nope"), false, None)
            .err()
            .unwrap();
        assert!(matches!(err, StoreError::NotFound { .. }));
    }

    #[test]
    fn test_persist_as_replaces_target() {
        let dir = tempdir().unwrap();
        let live = dir.path().join("seg");
        let next = dir.path().join("seg.next");

        let mut old = Segment::create(&live, 1024, None).unwrap();
        old.bytes_mut("write").unwrap()[..3].copy_from_slice(b"old");

        let mut seg = Segment::create(&next, 2048, Some(4096)).unwrap();
        seg.bytes_mut("write").unwrap()[..3].copy_from_slice(b"new");
        seg.persist_as(&live).unwrap();

        assert_eq!(seg.path(), live.as_path());
        assert_eq!(seg.max_size(), Some(4096));
        assert!(!next.exists());
        drop(old);
        drop(seg);

        let reopened = Segment::open(&live, false, None).unwrap();
        assert_eq!(reopened.len(), 2048);
        assert_eq!(&reopened.bytes()[..3], b"new");
    }

    #[test]
    fn test_create_respects_cap() {
        let dir = tempdir().unwrap();
        let path = dir.path().join("seg");

        let err = Segment::create(&path, 1536, Some(1500)).err().unwrap();
        assert!(matches!(err, StoreError::OutOfSpace { requested: 1536, max: 1500 }));
        assert!(!path.exists());
    }

    #[test]
    fn test_read_only_rejects_writes() {
        let dir = tempdir().unwrap();
        let path = dir.path().join("seg");
        drop(Segment::create(&path, 1024, None).unwrap());

        let mut seg = Segment::open(&path, false, None).unwrap();
        assert!(!seg.is_writable());
        assert!(matches!(
            seg.bytes_mut("insert"),
            Err(StoreError::InvalidState { operation: "insert" })
        ));
        assert!(seg.truncate(10).is_err());
    }

    #[test]
    fn test_truncate() {
        let dir = tempdir().unwrap();
        let path = dir.path().join("seg");
        let mut seg = Segment::create(&path, 4096, None).unwrap();
        seg.truncate(100).unwrap();
        assert_eq!(seg.len(), 100);
        drop(seg);
        assert_eq!(std::fs::metadata(&path).unwrap().len(), 100);
    }
}
