//! Growable memory-mapped multimap
//!
//! Two layers:
//! - `segment`: the backing file and its mapping, grown and remapped on demand
//! - `map`: an open-addressing table of `(key, payload)` pairs laid out in
//!   the segment, rebuilt in place whenever the segment grows

mod map;
mod segment;

pub use map::{GrowableMultiMap, InsertOutcome, Iter, MultiMapOptions, Range, DEFAULT_INITIAL_SIZE};
pub use segment::Segment;
