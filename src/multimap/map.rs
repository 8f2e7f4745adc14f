//! Persistent open-addressing multimap over a growable segment
//!
//! # File layout
//!
//! ```text
//! Offset  Size  Field
//! ------  ----  -----
//!  0       8    magic ("HDBMMAP1")
//!  8       4    version
//! 12       4    key width (bytes)
//! 16       4    payload width (bytes)
//! 20       4    flags (bit 0: rebuild in progress)
//! 24       8    slot count
//! 32       8    live entries
//! 40       8    tombstones
//! 48      16    reserved
//! 64       ..   slots: tag(u8) | key | payload
//! ```
//!
//! Duplicate keys occupy separate slots along the same collision chain.
//! Erased slots become tombstones (or empty, when the chain ends right after
//! them) so chains stay intact.
//!
//! Growth and compaction build a complete new table in a sibling
//! `<file>.rebuild` and rename it over the live file. The sibling's header
//! carries the rebuild flag until every entry is copied, so a torn rebuild
//! is reported as `Corrupt` rather than read as a short table.

use crate::error::{StoreError, StoreResult};
use crate::multimap::segment::Segment;
use crate::types::{FixedLayout, OpenMode};
use bytemuck::{bytes_of, pod_read_unaligned};
use std::marker::PhantomData;
use std::fs;
use std::io::ErrorKind;
use std::mem::size_of;
use std::path::{Path, PathBuf};
use tracing::{debug, info, warn};
use xxhash_rust::xxh3::xxh3_64;

const MAGIC: [u8; 8] = *b"HDBMMAP1";
const VERSION: u32 = 1;
const HEADER_SIZE: u64 = 64;

const OFF_MAGIC: usize = 0;
const OFF_VERSION: usize = 8;
const OFF_KEY_WIDTH: usize = 12;
const OFF_PAYLOAD_WIDTH: usize = 16;
const OFF_FLAGS: usize = 20;
const OFF_SLOT_COUNT: usize = 24;
const OFF_LEN: usize = 32;
const OFF_TOMBSTONES: usize = 40;

const TAG_EMPTY: u8 = 0;
const TAG_OCCUPIED: u8 = 1;
const TAG_TOMBSTONE: u8 = 2;

const FLAG_REBUILDING: u32 = 1;

/// Smallest slot table ever created or compacted to
const MIN_SLOTS: u64 = 16;

/// Live + tombstone slots may fill at most 3/4 of the table
const LOAD_NUM: u64 = 3;
const LOAD_DEN: u64 = 4;

/// Default size of a freshly created backing file
pub const DEFAULT_INITIAL_SIZE: u64 = 100_000;

/// Tuning for a multimap handle
#[derive(Debug, Clone)]
pub struct MultiMapOptions {
    /// Backing file size for `CreateNew`
    pub initial_size: u64,

    /// Absolute cap on the backing file size (unbounded if `None`)
    pub max_size: Option<u64>,
}

impl Default for MultiMapOptions {
    fn default() -> Self {
        Self {
            initial_size: DEFAULT_INITIAL_SIZE,
            max_size: None,
        }
    }
}

/// Result of [`GrowableMultiMap::insert`]
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum InsertOutcome {
    Inserted,
    AlreadyExists,
}

/// Disk-backed key → multi-value map that grows its file on demand
///
/// Write methods take `&mut self`: one writer per handle, and iterators
/// returned by `range`/`iter` cannot be held across a write (and therefore
/// not across a grow).
pub struct GrowableMultiMap<K: FixedLayout, P: FixedLayout> {
    segment: Segment,
    slot_count: u64,
    len: u64,
    tombstones: u64,
    closed: bool,
    _marker: PhantomData<fn() -> (K, P)>,
}

impl<K: FixedLayout, P: FixedLayout> GrowableMultiMap<K, P> {
    /// Open with default options
    pub fn open<Q: AsRef<Path>>(path: Q, mode: OpenMode) -> StoreResult<Self> {
        Self::open_with(path, mode, MultiMapOptions::default())
    }

    /// Open or create the store at `path`
    pub fn open_with<Q: AsRef<Path>>(
        path: Q,
        mode: OpenMode,
        options: MultiMapOptions,
    ) -> StoreResult<Self> {
        let path = path.as_ref();

        match mode {
            OpenMode::CreateNew => {
                let slots = Self::slots_for_len(options.initial_size).max(MIN_SLOTS);
                let segment = Segment::create(path, Self::table_bytes(slots), options.max_size)?;
                let mut map = Self {
                    segment,
                    slot_count: slots,
                    len: 0,
                    tombstones: 0,
                    closed: false,
                    _marker: PhantomData,
                };
                map.write_header(0)?;

                info!(
                    path = %path.display(),
                    slots,
                    slot_size = Self::slot_size(),
                    "Created multimap"
                );
                Ok(map)
            }
            OpenMode::OpenExisting | OpenMode::ReadOnly => {
                let segment = Segment::open(path, mode.is_writable(), options.max_size)?;
                let (slot_count, len, tombstones) = Self::validate_header(&segment)?;

                info!(
                    path = %path.display(),
                    entries = len,
                    slots = slot_count,
                    read_only = !mode.is_writable(),
                    "Opened multimap"
                );
                Ok(Self {
                    segment,
                    slot_count,
                    len,
                    tombstones,
                    closed: false,
                    _marker: PhantomData,
                })
            }
        }
    }

    /// Insert a `(key, payload)` pair; inserting an existing pair is a no-op
    pub fn insert(&mut self, key: K, payload: P) -> StoreResult<InsertOutcome> {
        self.ensure_writable("insert")?;

        if self.find(&key, &payload).is_some() {
            return Ok(InsertOutcome::AlreadyExists);
        }

        loop {
            match self.try_insert(&key, &payload) {
                Ok(()) => return Ok(InsertOutcome::Inserted),
                Err(e) if e.is_retryable() => {
                    if self.tombstones > 0 && !self.over_load(self.len + 1) {
                        debug!(error = %e, tombstones = self.tombstones, "Reclaiming tombstones");
                        self.rehash(self.slot_count, self.segment.len())?;
                    } else {
                        debug!(error = %e, "Multimap full, growing");
                        self.grow()?;
                    }
                }
                Err(e) => return Err(e),
            }
        }
    }

    /// Remove one `(key, payload)` pair
    pub fn erase(&mut self, key: &K, payload: &P) -> StoreResult<bool> {
        self.ensure_writable("erase")?;

        match self.find(key, payload) {
            Some(slot) => {
                self.clear_slot(slot)?;
                self.len -= 1;
                self.write_counts()?;
                Ok(true)
            }
            None => Ok(false),
        }
    }

    /// Remove every pair with this key, returning how many were removed
    pub fn erase_all(&mut self, key: &K) -> StoreResult<u64> {
        self.ensure_writable("erase_all")?;

        let mut matches = Vec::new();
        for slot in self.chain(key) {
            match self.tag(slot) {
                TAG_EMPTY => break,
                TAG_OCCUPIED if self.read_key(slot) == *key => matches.push(slot),
                _ => {}
            }
        }

        // Back to front, so more slots can become empty instead of tombstones
        for &slot in matches.iter().rev() {
            self.clear_slot(slot)?;
        }
        self.len -= matches.len() as u64;
        self.write_counts()?;
        Ok(matches.len() as u64)
    }

    pub fn contains(&self, key: &K, payload: &P) -> bool {
        self.find(key, payload).is_some()
    }

    pub fn has_any(&self, key: &K) -> bool {
        self.range(key).next().is_some()
    }

    pub fn count(&self, key: &K) -> u64 {
        self.range(key).count() as u64
    }

    /// All payloads stored under `key`.
    ///
    /// Order is stable for the lifetime of this handle.
    pub fn range<'a>(&'a self, key: &K) -> Range<'a, K, P> {
        Range {
            map: self,
            key: *key,
            chain: self.chain(key),
        }
    }

    /// Every `(key, payload)` pair in slot order
    pub fn iter(&self) -> Iter<'_, K, P> {
        Iter { map: self, slot: 0 }
    }

    /// Total number of pairs
    pub fn size(&self) -> u64 {
        self.len
    }

    pub fn is_empty(&self) -> bool {
        self.len == 0
    }

    /// Number of slots in the current table
    pub fn capacity(&self) -> u64 {
        self.slot_count
    }

    /// Current backing file size in bytes
    pub fn mapped_len(&self) -> u64 {
        self.segment.len()
    }

    pub fn path(&self) -> &Path {
        self.segment.path()
    }

    pub fn is_read_only(&self) -> bool {
        !self.segment.is_writable()
    }

    /// Flush dirty pages to disk
    pub fn flush(&self) -> StoreResult<()> {
        self.segment.flush()
    }

    /// Compact (write mode) and flush, surfacing any error
    pub fn close(mut self) -> StoreResult<()> {
        self.finish()
    }

    fn finish(&mut self) -> StoreResult<()> {
        if self.closed {
            return Ok(());
        }
        self.closed = true;

        if self.segment.is_writable() {
            self.compact()?;
            self.segment.flush()?;
        }
        Ok(())
    }

    /// Shrink the table to the smallest size that holds the live entries
    fn compact(&mut self) -> StoreResult<()> {
        let target = (self.len * LOAD_DEN / LOAD_NUM + 1).max(MIN_SLOTS);

        if target < self.slot_count || self.tombstones > 0 {
            let slots = target.min(self.slot_count);
            self.rehash(slots, Self::table_bytes(slots))?;
        }
        self.segment.truncate(Self::table_bytes(self.slot_count))?;

        debug!(
            path = %self.segment.path().display(),
            entries = self.len,
            slots = self.slot_count,
            bytes = self.segment.len(),
            "Compacted multimap"
        );
        Ok(())
    }

    /// Rebuild into a file half again as large as the current one
    fn grow(&mut self) -> StoreResult<()> {
        let current = self.segment.len();
        let extra = (current / 2).max(Self::slot_size() as u64 * MIN_SLOTS);
        let new_len = current.saturating_add(extra);
        let new_slots = Self::slots_for_len(new_len);

        info!(
            path = %self.segment.path().display(),
            old_slots = self.slot_count,
            new_slots,
            entries = self.len,
            "Growing multimap"
        );
        self.rehash(new_slots, new_len)
    }

    /// Rebuild the slot table with `new_slots` slots in a `file_len` byte
    /// file, dropping tombstones.
    ///
    /// Entries stream from the live mapping into the sibling file; nothing
    /// is buffered on the heap. The live file is untouched until the rename,
    /// and fails with `Exhausted` up front if the new table is too small.
    fn rehash(&mut self, new_slots: u64, file_len: u64) -> StoreResult<()> {
        if self.len >= new_slots {
            return Err(StoreError::Exhausted {
                used: self.len,
                slots: new_slots,
            });
        }

        let scratch = rebuild_path(self.segment.path());
        remove_stale(&scratch)?;

        let segment = Segment::create(&scratch, file_len, self.segment.max_size())?;
        let mut fresh = Self {
            segment,
            slot_count: new_slots,
            len: 0,
            tombstones: 0,
            // Never compacted on drop
            closed: true,
            _marker: PhantomData,
        };

        let built = self
            .copy_into(&mut fresh)
            .and_then(|()| fresh.segment.persist_as(self.segment.path()));
        if let Err(e) = built {
            drop(fresh);
            if let Err(cleanup) = fs::remove_file(&scratch) {
                warn!(path = %scratch.display(), error = %cleanup, "Failed to remove rebuild file");
            }
            return Err(e);
        }

        std::mem::swap(&mut self.segment, &mut fresh.segment);
        self.slot_count = new_slots;
        self.len = fresh.len;
        self.tombstones = 0;
        Ok(())
    }

    /// Copy every live entry into `fresh`, flagging its header as
    /// rebuilding until the copy is complete
    fn copy_into(&self, fresh: &mut Self) -> StoreResult<()> {
        fresh.write_header(FLAG_REBUILDING)?;

        for (key, payload) in self.iter() {
            let slot = fresh
                .chain(&key)
                .find(|&slot| fresh.tag(slot) == TAG_EMPTY)
                .ok_or(StoreError::Exhausted {
                    used: fresh.len,
                    slots: fresh.slot_count,
                })?;
            fresh.write_slot(slot, &key, &payload)?;
            fresh.len += 1;
        }

        fresh.write_header(0)?;
        fresh.segment.flush()
    }

    fn try_insert(&mut self, key: &K, payload: &P) -> StoreResult<()> {
        let mut target = None;
        for slot in self.chain(key) {
            match self.tag(slot) {
                TAG_EMPTY => {
                    target = Some((slot, false));
                    break;
                }
                TAG_TOMBSTONE => {
                    target = Some((slot, true));
                    break;
                }
                _ => {}
            }
        }

        let used = self.len + self.tombstones;
        let (slot, reuses_tombstone) = target.ok_or(StoreError::Exhausted {
            used,
            slots: self.slot_count,
        })?;

        if !reuses_tombstone && self.over_load(used + 1) {
            return Err(StoreError::Exhausted {
                used,
                slots: self.slot_count,
            });
        }

        self.write_slot(slot, key, payload)?;
        self.len += 1;
        if reuses_tombstone {
            self.tombstones -= 1;
        }
        self.write_counts()
    }

    /// Whether `used` occupied slots exceed the load limit
    fn over_load(&self, used: u64) -> bool {
        used * LOAD_DEN > self.slot_count * LOAD_NUM
    }

    fn find(&self, key: &K, payload: &P) -> Option<u64> {
        for slot in self.chain(key) {
            match self.tag(slot) {
                TAG_EMPTY => return None,
                TAG_OCCUPIED
                    if self.read_key(slot) == *key && self.read_payload(slot) == *payload =>
                {
                    return Some(slot)
                }
                _ => {}
            }
        }
        None
    }

    fn clear_slot(&mut self, slot: u64) -> StoreResult<()> {
        let next = (slot + 1) % self.slot_count;
        let tag = if self.tag(next) == TAG_EMPTY {
            TAG_EMPTY
        } else {
            self.tombstones += 1;
            TAG_TOMBSTONE
        };
        let offset = self.slot_offset(slot);
        self.segment.bytes_mut("erase")?[offset] = tag;
        Ok(())
    }

    fn ensure_writable(&self, operation: &'static str) -> StoreResult<()> {
        if self.segment.is_writable() {
            Ok(())
        } else {
            Err(StoreError::InvalidState { operation })
        }
    }

    fn chain(&self, key: &K) -> SlotChain {
        SlotChain {
            next: xxh3_64(bytes_of(key)) % self.slot_count,
            remaining: self.slot_count,
            slots: self.slot_count,
        }
    }

    fn slot_size() -> usize {
        1 + size_of::<K>() + size_of::<P>()
    }

    fn table_bytes(slots: u64) -> u64 {
        HEADER_SIZE + slots * Self::slot_size() as u64
    }

    /// `table_bytes` for untrusted slot counts read from disk
    fn checked_table_bytes(slots: u64) -> Option<u64> {
        slots
            .checked_mul(Self::slot_size() as u64)?
            .checked_add(HEADER_SIZE)
    }

    fn slots_for_len(len: u64) -> u64 {
        len.saturating_sub(HEADER_SIZE) / Self::slot_size() as u64
    }

    fn slot_offset(&self, slot: u64) -> usize {
        (HEADER_SIZE + slot * Self::slot_size() as u64) as usize
    }

    fn tag(&self, slot: u64) -> u8 {
        self.segment.bytes()[self.slot_offset(slot)]
    }

    fn read_key(&self, slot: u64) -> K {
        let start = self.slot_offset(slot) + 1;
        pod_read_unaligned(&self.segment.bytes()[start..start + size_of::<K>()])
    }

    fn read_payload(&self, slot: u64) -> P {
        let start = self.slot_offset(slot) + 1 + size_of::<K>();
        pod_read_unaligned(&self.segment.bytes()[start..start + size_of::<P>()])
    }

    fn write_slot(&mut self, slot: u64, key: &K, payload: &P) -> StoreResult<()> {
        let offset = self.slot_offset(slot);
        let key_end = offset + 1 + size_of::<K>();
        let bytes = self.segment.bytes_mut("insert")?;

        bytes[offset] = TAG_OCCUPIED;
        bytes[offset + 1..key_end].copy_from_slice(bytes_of(key));
        bytes[key_end..key_end + size_of::<P>()].copy_from_slice(bytes_of(payload));
        Ok(())
    }

    fn write_header(&mut self, flags: u32) -> StoreResult<()> {
        let bytes = self.segment.bytes_mut("write header")?;
        bytes[OFF_MAGIC..OFF_MAGIC + 8].copy_from_slice(&MAGIC);
        bytes[OFF_VERSION..OFF_VERSION + 4].copy_from_slice(&VERSION.to_le_bytes());
        bytes[OFF_KEY_WIDTH..OFF_KEY_WIDTH + 4]
            .copy_from_slice(&(size_of::<K>() as u32).to_le_bytes());
        bytes[OFF_PAYLOAD_WIDTH..OFF_PAYLOAD_WIDTH + 4]
            .copy_from_slice(&(size_of::<P>() as u32).to_le_bytes());
        bytes[OFF_FLAGS..OFF_FLAGS + 4].copy_from_slice(&flags.to_le_bytes());
        write_u64(bytes, OFF_SLOT_COUNT, self.slot_count);
        self.write_counts()
    }

    fn write_counts(&mut self) -> StoreResult<()> {
        let (len, tombstones) = (self.len, self.tombstones);
        let bytes = self.segment.bytes_mut("write header")?;
        write_u64(bytes, OFF_LEN, len);
        write_u64(bytes, OFF_TOMBSTONES, tombstones);
        Ok(())
    }

    fn validate_header(segment: &Segment) -> StoreResult<(u64, u64, u64)> {
        let corrupt = |reason: String| StoreError::Corrupt {
            path: segment.path().to_path_buf(),
            reason,
        };

        let bytes = segment.bytes();
        if (bytes.len() as u64) < HEADER_SIZE {
            return Err(corrupt(format!("file is only {} bytes", bytes.len())));
        }
        if bytes[OFF_MAGIC..OFF_MAGIC + 8] != MAGIC {
            return Err(corrupt("bad magic".into()));
        }

        let version = read_u32(bytes, OFF_VERSION);
        if version != VERSION {
            return Err(corrupt(format!(
                "unsupported version {version} (expected {VERSION})"
            )));
        }

        let key_width = read_u32(bytes, OFF_KEY_WIDTH) as usize;
        let payload_width = read_u32(bytes, OFF_PAYLOAD_WIDTH) as usize;
        if key_width != size_of::<K>() || payload_width != size_of::<P>() {
            return Err(corrupt(format!(
                "entry layout is {key_width}+{payload_width} bytes, expected {}+{}",
                size_of::<K>(),
                size_of::<P>()
            )));
        }

        if read_u32(bytes, OFF_FLAGS) & FLAG_REBUILDING != 0 {
            return Err(corrupt("table rebuild did not complete".into()));
        }

        let slot_count = read_u64(bytes, OFF_SLOT_COUNT);
        let len = read_u64(bytes, OFF_LEN);
        let tombstones = read_u64(bytes, OFF_TOMBSTONES);

        let fits = Self::checked_table_bytes(slot_count).is_some_and(|end| end <= bytes.len() as u64);
        if slot_count == 0 || !fits {
            return Err(corrupt(format!(
                "{slot_count} slots do not fit in {} bytes",
                bytes.len()
            )));
        }
        if len.checked_add(tombstones).map_or(true, |used| used >= slot_count) {
            return Err(corrupt(format!(
                "{len} entries and {tombstones} tombstones in {slot_count} slots"
            )));
        }

        Ok((slot_count, len, tombstones))
    }
}

impl<K: FixedLayout, P: FixedLayout> Drop for GrowableMultiMap<K, P> {
    fn drop(&mut self) {
        if let Err(e) = self.finish() {
            warn!(
                path = %self.segment.path().display(),
                error = %e,
                "Failed to compact multimap on drop"
            );
        }
    }
}

/// Linear slot sequence over the whole table, starting at the home slot
struct SlotChain {
    next: u64,
    remaining: u64,
    slots: u64,
}

impl Iterator for SlotChain {
    type Item = u64;

    fn next(&mut self) -> Option<u64> {
        if self.remaining == 0 {
            return None;
        }
        let slot = self.next;
        self.next = (self.next + 1) % self.slots;
        self.remaining -= 1;
        Some(slot)
    }
}

/// Payloads stored under one key
pub struct Range<'a, K: FixedLayout, P: FixedLayout> {
    map: &'a GrowableMultiMap<K, P>,
    key: K,
    chain: SlotChain,
}

impl<K: FixedLayout, P: FixedLayout> Iterator for Range<'_, K, P> {
    type Item = P;

    fn next(&mut self) -> Option<P> {
        while let Some(slot) = self.chain.next() {
            match self.map.tag(slot) {
                TAG_EMPTY => {
                    self.chain.remaining = 0;
                    return None;
                }
                TAG_OCCUPIED if self.map.read_key(slot) == self.key => {
                    return Some(self.map.read_payload(slot))
                }
                _ => {}
            }
        }
        None
    }
}

/// Every pair in slot order
pub struct Iter<'a, K: FixedLayout, P: FixedLayout> {
    map: &'a GrowableMultiMap<K, P>,
    slot: u64,
}

impl<K: FixedLayout, P: FixedLayout> Iterator for Iter<'_, K, P> {
    type Item = (K, P);

    fn next(&mut self) -> Option<(K, P)> {
        while self.slot < self.map.slot_count {
            let slot = self.slot;
            self.slot += 1;
            if self.map.tag(slot) == TAG_OCCUPIED {
                return Some((self.map.read_key(slot), self.map.read_payload(slot)));
            }
        }
        None
    }
}

/// Sibling file a table is rebuilt into
fn rebuild_path(path: &Path) -> PathBuf {
    let mut name = path.as_os_str().to_owned();
    name.push(".rebuild");
    PathBuf::from(name)
}

/// Remove a rebuild file left behind by an interrupted process
fn remove_stale(path: &Path) -> StoreResult<()> {
    match fs::remove_file(path) {
        Ok(()) => {
            warn!(path = %path.display(), "Removed stale rebuild file");
            Ok(())
        }
        Err(e) if e.kind() == ErrorKind::NotFound => Ok(()),
        Err(e) => Err(e.into()),
    }
}

fn read_u32(bytes: &[u8], offset: usize) -> u32 {
    let mut buf = [0u8; 4];
    buf.copy_from_slice(&bytes[offset..offset + 4]);
    u32::from_le_bytes(buf)
}

fn read_u64(bytes: &[u8], offset: usize) -> u64 {
    let mut buf = [0u8; 8];
    buf.copy_from_slice(&bytes[offset..offset + 8]);
    u64::from_le_bytes(buf)
}

fn write_u64(bytes: &mut [u8], offset: usize, value: u64) {
    bytes[offset..offset + 8].copy_from_slice(&value.to_le_bytes());
}
