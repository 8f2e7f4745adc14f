//! Concurrent scan pipeline
//!
//! # Module Structure
//!
//! - `wire`: Request/result batch encoding
//! - `queue`: Bounded batch queues with statistics
//! - `worker`: Worker threads and shared scan counters
//! - `pipeline`: `ScanPipeline`, the public put/get front end
//! - `manager`: The `ScanManager` query trait and its multimap implementation

pub mod manager;
pub mod pipeline;
pub mod queue;
pub mod wire;
pub mod worker;

pub use manager::{HashInfo, MultiMapScanManager, ScanManager};
pub use pipeline::ScanPipeline;
pub use wire::{MatchDecoder, RequestBatch, RequestDecoder, ScanMatch, ScanRequest};
pub use worker::{ScanStats, ScanStatsSnapshot};
