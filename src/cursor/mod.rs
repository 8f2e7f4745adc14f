//! Ordered cursor store
//!
//! A RocksDB-backed sorted multiset of `(key, value)` pairs with forward
//! cursors, used for deterministic full-range iteration.
//!
//! # Module Structure
//!
//! - `schema`: Column families, composite key encoding, open helpers
//! - `store`: `OrderedCursorStore` handle and `Snapshot` read views
//! - `cursor`: `Cursor` and its starting `Position`

#[allow(clippy::module_inception)]
mod cursor;
pub mod schema;
mod store;

pub use cursor::{Cursor, Position};
pub use store::{OrderedCursorStore, Snapshot};
