//! Core value types shared by the stores and the scan pipeline
//!
//! Everything that is written into a memory-mapped region must implement
//! [`FixedLayout`]: a plain-old-data value with no pointers and no heap
//! ownership, so it stays valid when the backing file is remapped.

use bytemuck::{Pod, Zeroable};
use serde::{Deserialize, Serialize};
use std::fmt;
use std::hash::Hash;

/// Dense identifier of a distinct source file
pub type SourceId = u64;

/// Contract for keys and payloads stored in a [`GrowableMultiMap`].
///
/// `Pod` guarantees a fixed size, no padding and no references, which is what
/// makes relocation on remap safe. The blanket impl means any suitable type
/// opts in automatically.
///
/// [`GrowableMultiMap`]: crate::multimap::GrowableMultiMap
pub trait FixedLayout: Pod + Eq + Hash + fmt::Debug + Send + Sync {}

impl<T> FixedLayout for T where T: Pod + Eq + Hash + fmt::Debug + Send + Sync {}

/// How a store is opened
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum OpenMode {
    /// Open an existing store; writes are rejected
    ReadOnly,
    /// Create a new store; fails if the path exists
    CreateNew,
    /// Open an existing store for reading and writing
    OpenExisting,
}

impl OpenMode {
    /// Whether handles opened in this mode accept writes
    pub fn is_writable(self) -> bool {
        !matches!(self, OpenMode::ReadOnly)
    }
}

/// Fixed-width block digest
///
/// The width is a property of the database, not of a single value, so it is
/// carried as a const parameter.
#[repr(transparent)]
#[derive(Clone, Copy, PartialEq, Eq, Hash, PartialOrd, Ord)]
pub struct BlockHash<const W: usize>(pub [u8; W]);

// SAFETY: a transparent wrapper around a byte array has no padding and
// every bit pattern is valid.
unsafe impl<const W: usize> Zeroable for BlockHash<W> {}
unsafe impl<const W: usize> Pod for BlockHash<W> {}

/// MD5-sized block hash
pub type Md5Hash = BlockHash<16>;

/// SHA-1-sized block hash
pub type Sha1Hash = BlockHash<20>;

impl<const W: usize> BlockHash<W> {
    /// Width of this hash type in bytes
    pub const WIDTH: usize = W;

    /// Build from a slice of exactly `W` bytes
    pub fn from_slice(bytes: &[u8]) -> Option<Self> {
        let array: [u8; W] = bytes.try_into().ok()?;
        Some(Self(array))
    }

    /// Parse a hex string of exactly `2 * W` digits
    pub fn from_hex(text: &str) -> Option<Self> {
        let mut array = [0u8; W];
        hex::decode_to_slice(text.trim(), &mut array).ok()?;
        Some(Self(array))
    }

    /// Lowercase hex rendering
    pub fn to_hex(&self) -> String {
        hex::encode(self.0)
    }

    pub fn as_bytes(&self) -> &[u8] {
        &self.0
    }
}

impl<const W: usize> fmt::Debug for BlockHash<W> {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "BlockHash({})", self.to_hex())
    }
}

impl<const W: usize> fmt::Display for BlockHash<W> {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(&self.to_hex())
    }
}

/// Where a block hash was seen
#[repr(C)]
#[derive(
    Debug, Clone, Copy, Default, PartialEq, Eq, Hash, PartialOrd, Ord, Pod, Zeroable, Serialize, Deserialize,
)]
pub struct Occurrence {
    /// Source file the block came from
    pub source_id: SourceId,

    /// Byte offset of the block within the source file
    pub file_offset: u64,

    /// Caller-defined metadata bits
    pub flags: u64,
}

impl Occurrence {
    pub fn new(source_id: SourceId, file_offset: u64) -> Self {
        Self {
            source_id,
            file_offset,
            flags: 0,
        }
    }

    pub fn with_flags(mut self, flags: u64) -> Self {
        self.flags = flags;
        self
    }

    /// Fixed 24-byte big-endian encoding used as an ordered-store value.
    /// Byte order matches field order, so values sort by source then offset.
    pub fn to_bytes(&self) -> [u8; 24] {
        let mut out = [0u8; 24];
        out[0..8].copy_from_slice(&self.source_id.to_be_bytes());
        out[8..16].copy_from_slice(&self.file_offset.to_be_bytes());
        out[16..24].copy_from_slice(&self.flags.to_be_bytes());
        out
    }

    /// Decode the encoding produced by [`Occurrence::to_bytes`]
    pub fn from_bytes(bytes: &[u8]) -> Option<Self> {
        if bytes.len() != 24 {
            return None;
        }
        let field = |range: std::ops::Range<usize>| {
            let mut buf = [0u8; 8];
            buf.copy_from_slice(&bytes[range]);
            u64::from_be_bytes(buf)
        };
        Some(Self {
            source_id: field(0..8),
            file_offset: field(8..16),
            flags: field(16..24),
        })
    }
}

/// Per-hash block classification recorded at import time.
///
/// One record per distinct hash; a later import replaces it.
#[derive(Debug, Clone, Default, PartialEq, Eq, Serialize, Deserialize)]
pub struct HashMetadata {
    /// Block entropy score (0 when unknown)
    #[serde(default)]
    pub entropy: u64,

    /// Free-form block classification, e.g. "txt"
    #[serde(default, skip_serializing_if = "String::is_empty")]
    pub block_label: String,

    /// Label set by a low-entropy classifier, e.g. "W" for whitespace
    #[serde(default, skip_serializing_if = "String::is_empty")]
    pub low_entropy_label: String,
}

impl HashMetadata {
    /// Whether nothing beyond the defaults is recorded
    pub fn is_empty(&self) -> bool {
        self.entropy == 0 && self.block_label.is_empty() && self.low_entropy_label.is_empty()
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_block_hash_hex() {
        let hash = Md5Hash::from_hex("00112233445566778899aabbccddeeff").unwrap();
        assert_eq!(hash.0[0], 0x00);
        assert_eq!(hash.0[15], 0xff);
        assert_eq!(hash.to_hex(), "00112233445566778899aabbccddeeff");

        // Wrong width
        assert!(Md5Hash::from_hex("0011").is_none());
        assert!(Md5Hash::from_hex("zz112233445566778899aabbccddeeff").is_none());
    }

    #[test]
    fn test_hash_metadata_json_skips_empty_labels() {
        let metadata = HashMetadata {
            entropy: 8,
            block_label: "txt".into(),
            ..HashMetadata::default()
        };
        let json = serde_json::to_string(&metadata).unwrap();
        assert_eq!(json, r#"{"entropy":8,"block_label":"txt"}"#);

        let back: HashMetadata = serde_json::from_str(r#"{"low_entropy_label":"W"}"#).unwrap();
        assert_eq!(back.entropy, 0);
        assert_eq!(back.low_entropy_label, "W");
        assert!(!back.is_empty());
        assert!(HashMetadata::default().is_empty());
    }

    #[test]
    fn test_block_hash_from_slice() {
        assert!(Sha1Hash::from_slice(&[0u8; 20]).is_some());
        assert!(Sha1Hash::from_slice(&[0u8; 16]).is_none());
    }

    #[test]
    fn test_occurrence_layout_has_no_padding() {
        assert_eq!(std::mem::size_of::<Occurrence>(), 24);
        assert_eq!(std::mem::size_of::<Md5Hash>(), 16);

        let occ = Occurrence::new(7, 4096).with_flags(3);
        let raw = bytemuck::bytes_of(&occ);
        let back: Occurrence = bytemuck::pod_read_unaligned(raw);
        assert_eq!(occ, back);
    }

    #[test]
    fn test_occurrence_bytes_sort_like_fields() {
        let a = Occurrence::new(1, 4096);
        let b = Occurrence::new(1, 8192);
        let c = Occurrence::new(2, 0);
        assert!(a.to_bytes() < b.to_bytes());
        assert!(b.to_bytes() < c.to_bytes());
        assert_eq!(Occurrence::from_bytes(&c.to_bytes()), Some(c));
        assert_eq!(Occurrence::from_bytes(&[0u8; 3]), None);
    }
}
