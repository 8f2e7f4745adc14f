//! Query interface used by scan workers

use crate::config::ScanMode;
use crate::cursor::OrderedCursorStore;
use crate::multimap::GrowableMultiMap;
use crate::types::{BlockHash, HashMetadata, Occurrence, SourceId};
use serde::Serialize;
use std::collections::BTreeMap;
use tracing::warn;

/// Upper bound on occurrences listed in one expanded match
pub const MAX_EXPANDED_OCCURRENCES: usize = 1_000;

/// Summary of everything stored for one hash
#[derive(Debug, Clone, Default, PartialEq, Eq, Serialize)]
pub struct HashInfo {
    /// Total occurrences
    pub count: u64,

    /// Occurrences per source
    pub sources: BTreeMap<SourceId, u64>,

    /// Block entropy score (0 when unknown)
    pub entropy: u64,

    pub block_label: String,

    pub low_entropy_label: String,
}

impl HashInfo {
    fn apply(&mut self, metadata: HashMetadata) {
        self.entropy = metadata.entropy;
        self.block_label = metadata.block_label;
        self.low_entropy_label = metadata.low_entropy_label;
    }
}

/// Read-only hash lookups shared by every scan worker.
///
/// Implementations must be safe to call concurrently from many threads.
pub trait ScanManager: Send + Sync {
    /// Width of the hashes this manager understands
    fn hash_width(&self) -> usize;

    /// Describe the matches for `hash`; `None` (or an empty string) when
    /// there are none
    fn lookup(&self, hash: &[u8]) -> Option<String>;

    /// Counts for `hash`, or `None` if it is not stored
    fn hash_info(&self, hash: &[u8]) -> Option<HashInfo>;
}

#[derive(Serialize)]
struct CountMatch {
    count: u64,
}

#[derive(Serialize)]
struct ExpandedMatch<'a> {
    count: u64,
    sources: &'a BTreeMap<SourceId, u64>,
    entropy: u64,
    #[serde(skip_serializing_if = "str::is_empty")]
    block_label: &'a str,
    #[serde(skip_serializing_if = "str::is_empty")]
    low_entropy_label: &'a str,
    occurrences: Vec<Occurrence>,
    truncated: bool,
}

/// [`ScanManager`] over a read-only multimap, with optional per-hash
/// metadata from an ordered store
pub struct MultiMapScanManager<const W: usize> {
    map: GrowableMultiMap<BlockHash<W>, Occurrence>,
    metadata: Option<OrderedCursorStore>,
    mode: ScanMode,
}

impl<const W: usize> MultiMapScanManager<W> {
    pub fn new(map: GrowableMultiMap<BlockHash<W>, Occurrence>, mode: ScanMode) -> Self {
        Self {
            map,
            metadata: None,
            mode,
        }
    }

    /// Read entropy and labels for matched hashes from `store`
    pub fn with_metadata(mut self, store: OrderedCursorStore) -> Self {
        self.metadata = Some(store);
        self
    }

    /// Metadata for `key`; unreadable records count as absent
    fn metadata(&self, key: &BlockHash<W>) -> Option<HashMetadata> {
        let store = self.metadata.as_ref()?;
        let bytes = match store.attributes(key.as_bytes()) {
            Ok(bytes) => bytes?,
            Err(e) => {
                warn!(hash = %key.to_hex(), error = %e, "Failed to read hash metadata");
                return None;
            }
        };
        match serde_json::from_slice(&bytes) {
            Ok(metadata) => Some(metadata),
            Err(e) => {
                warn!(hash = %key.to_hex(), error = %e, "Ignoring undecodable hash metadata");
                None
            }
        }
    }

    pub fn mode(&self) -> ScanMode {
        self.mode
    }

    pub fn map(&self) -> &GrowableMultiMap<BlockHash<W>, Occurrence> {
        &self.map
    }
}

impl<const W: usize> ScanManager for MultiMapScanManager<W> {
    fn hash_width(&self) -> usize {
        W
    }

    fn lookup(&self, hash: &[u8]) -> Option<String> {
        let key = BlockHash::<W>::from_slice(hash)?;

        let rendered = match self.mode {
            ScanMode::Count => {
                let count = self.map.count(&key);
                if count == 0 {
                    return None;
                }
                serde_json::to_string(&CountMatch { count })
            }
            ScanMode::Expanded => {
                let info = self.hash_info(hash)?;
                let mut occurrences: Vec<_> = self
                    .map
                    .range(&key)
                    .take(MAX_EXPANDED_OCCURRENCES + 1)
                    .collect();
                let truncated = occurrences.len() > MAX_EXPANDED_OCCURRENCES;
                occurrences.truncate(MAX_EXPANDED_OCCURRENCES);
                occurrences.sort();

                serde_json::to_string(&ExpandedMatch {
                    count: info.count,
                    sources: &info.sources,
                    entropy: info.entropy,
                    block_label: &info.block_label,
                    low_entropy_label: &info.low_entropy_label,
                    occurrences,
                    truncated,
                })
            }
        };

        // Plain data structs always serialize
        rendered.ok()
    }

    fn hash_info(&self, hash: &[u8]) -> Option<HashInfo> {
        let key = BlockHash::<W>::from_slice(hash)?;

        let mut info = HashInfo::default();
        for occurrence in self.map.range(&key) {
            info.count += 1;
            *info.sources.entry(occurrence.source_id).or_default() += 1;
        }
        if info.count == 0 {
            return None;
        }
        if let Some(metadata) = self.metadata(&key) {
            info.apply(metadata);
        }
        Some(info)
    }
}
