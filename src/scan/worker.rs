//! Scan worker threads
//!
//! Each worker:
//! - Pulls request batches from the unscanned queue with a bounded wait
//! - Decodes the batch element by element and queries the scan manager
//! - Encodes matches into a result batch (possibly empty)
//! - Pushes the result batch to the scanned queue, retrying while it is full
//!
//! Workers exit when the shared `done` flag is set.

use crate::error::WorkerError;
use crate::scan::manager::ScanManager;
use crate::scan::queue::{BatchReceiver, BatchSender, PushError, Received};
use crate::scan::wire::{encode_match, RequestDecoder};
use serde::Serialize;
use std::sync::atomic::{AtomicBool, AtomicU64, Ordering};
use std::sync::Arc;
use std::thread::{self, JoinHandle};
use std::time::Duration;
use tracing::{debug, info, trace, warn};

/// Counters shared by all workers of one pipeline
#[derive(Debug, Default)]
pub struct ScanStats {
    /// Batches accepted by `put`
    pub batches_submitted: AtomicU64,

    /// Batches taken by `get`
    pub batches_delivered: AtomicU64,

    /// Request batches processed by workers
    pub batches_scanned: AtomicU64,

    /// Request elements decoded
    pub elements: AtomicU64,

    /// Elements with a non-empty match
    pub matches: AtomicU64,

    /// Batches cut short by a malformed element
    pub malformed: AtomicU64,

    /// Result batches dropped because shutdown began while the output
    /// queue was full
    pub dropped: AtomicU64,
}

impl ScanStats {
    fn record_batch(&self, elements: u64, matches: u64) {
        self.batches_scanned.fetch_add(1, Ordering::Relaxed);
        self.elements.fetch_add(elements, Ordering::Relaxed);
        self.matches.fetch_add(matches, Ordering::Relaxed);
    }

    fn record_malformed(&self) {
        self.malformed.fetch_add(1, Ordering::Relaxed);
    }

    fn record_dropped(&self) {
        self.dropped.fetch_add(1, Ordering::Relaxed);
    }

    /// Point-in-time copy of the counters
    pub fn snapshot(&self) -> ScanStatsSnapshot {
        ScanStatsSnapshot {
            batches_submitted: self.batches_submitted.load(Ordering::Relaxed),
            batches_delivered: self.batches_delivered.load(Ordering::Relaxed),
            batches_scanned: self.batches_scanned.load(Ordering::Relaxed),
            elements: self.elements.load(Ordering::Relaxed),
            matches: self.matches.load(Ordering::Relaxed),
            malformed: self.malformed.load(Ordering::Relaxed),
            dropped: self.dropped.load(Ordering::Relaxed),
        }
    }
}

/// Plain copy of [`ScanStats`]
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq, Serialize)]
pub struct ScanStatsSnapshot {
    pub batches_submitted: u64,
    pub batches_delivered: u64,
    pub batches_scanned: u64,
    pub elements: u64,
    pub matches: u64,
    pub malformed: u64,
    pub dropped: u64,
}

/// Everything a worker thread needs
pub(crate) struct WorkerContext {
    pub manager: Arc<dyn ScanManager>,
    pub unscanned: BatchReceiver,
    pub scanned: BatchSender,
    pub done: Arc<AtomicBool>,
    pub stats: Arc<ScanStats>,
    pub poll_interval: Duration,
}

/// A worker thread that scans request batches
pub struct Worker {
    id: usize,
    handle: Option<JoinHandle<()>>,
}

impl Worker {
    /// Spawn a new worker thread
    pub(crate) fn spawn(id: usize, context: WorkerContext) -> Result<Self, WorkerError> {
        let handle = thread::Builder::new()
            .name(format!("scan-{}", id))
            .spawn(move || worker_loop(id, context))
            .map_err(|e| WorkerError::InitFailed {
                id,
                reason: e.to_string(),
            })?;

        Ok(Self {
            id,
            handle: Some(handle),
        })
    }

    pub fn id(&self) -> usize {
        self.id
    }

    /// Wait for the worker to finish
    pub fn join(mut self) -> Result<(), WorkerError> {
        match self.handle.take() {
            Some(handle) => handle.join().map_err(|payload| WorkerError::Panicked {
                id: self.id,
                message: panic_message(payload.as_ref()),
            }),
            None => Ok(()),
        }
    }
}

fn panic_message(payload: &(dyn std::any::Any + Send)) -> String {
    if let Some(s) = payload.downcast_ref::<&str>() {
        (*s).to_string()
    } else if let Some(s) = payload.downcast_ref::<String>() {
        s.clone()
    } else {
        "Worker thread panicked".into()
    }
}

/// Main worker loop
fn worker_loop(id: usize, context: WorkerContext) {
    debug!(worker = id, "Scan worker starting");

    while !context.done.load(Ordering::Acquire) {
        let batch = match context.unscanned.recv_timeout(context.poll_interval) {
            Received::Batch(batch) => batch,
            // Timeout - check done and retry
            Received::Timeout => continue,
            Received::Disconnected => break,
        };

        let output = scan_batch(id, &batch, context.manager.as_ref(), &context.stats);
        push_output(id, output, &context);
    }

    debug!(worker = id, "Scan worker shutting down");
}

/// Scan one request batch into a result batch
fn scan_batch(id: usize, batch: &[u8], manager: &dyn ScanManager, stats: &ScanStats) -> Vec<u8> {
    let mut output = Vec::new();
    let mut elements = 0u64;
    let mut matches = 0u64;

    for element in RequestDecoder::new(batch, manager.hash_width()) {
        let request = match element {
            Ok(request) => request,
            Err(e) => {
                warn!(worker = id, error = %e, "Malformed scan batch, skipping remainder");
                stats.record_malformed();
                break;
            }
        };
        elements += 1;

        let description = match manager.lookup(request.hash) {
            Some(description) if !description.is_empty() => description,
            _ => continue,
        };

        match encode_match(&mut output, &request, description.as_bytes()) {
            Ok(()) => matches += 1,
            Err(e) => warn!(worker = id, error = %e, "Dropping unencodable match"),
        }
    }

    trace!(worker = id, elements, matches, bytes = output.len(), "Batch scanned");
    stats.record_batch(elements, matches);
    output
}

/// Push a result batch, retrying in bounded waits until it fits or
/// shutdown begins
fn push_output(id: usize, mut output: Vec<u8>, context: &WorkerContext) {
    loop {
        match context.scanned.send_timeout(output, context.poll_interval) {
            Ok(()) => return,
            Err(PushError::Full(batch)) => {
                if context.done.load(Ordering::Acquire) {
                    info!(worker = id, "Shutdown with full output queue, dropping result batch");
                    context.stats.record_dropped();
                    return;
                }
                output = batch;
            }
            Err(PushError::Disconnected(_)) => {
                context.stats.record_dropped();
                return;
            }
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::scan::manager::HashInfo;
    use crate::scan::wire::{MatchDecoder, RequestBatch};

    /// Matches any hash whose first byte is odd
    struct OddManager;

    impl ScanManager for OddManager {
        fn hash_width(&self) -> usize {
            2
        }

        fn lookup(&self, hash: &[u8]) -> Option<String> {
            (hash[0] % 2 == 1).then(|| format!("odd-{}", hash[0]))
        }

        fn hash_info(&self, _hash: &[u8]) -> Option<HashInfo> {
            None
        }
    }

    #[test]
    fn test_scan_batch_encodes_only_matches() {
        let stats = ScanStats::default();
        let mut batch = RequestBatch::new(2);
        batch.push(&[1, 0], b"a").unwrap();
        batch.push(&[2, 0], b"b").unwrap();
        batch.push(&[3, 0], b"c").unwrap();

        let output = scan_batch(0, &batch.into_bytes(), &OddManager, &stats);
        let matches: Vec<_> = MatchDecoder::new(&output, 2)
            .collect::<Result<_, _>>()
            .unwrap();

        assert_eq!(matches.len(), 2);
        assert_eq!(matches[0].label, b"a");
        assert_eq!(matches[0].description, b"odd-1");
        assert_eq!(matches[1].label, b"c");

        let snap = stats.snapshot();
        assert_eq!(snap.elements, 3);
        assert_eq!(snap.matches, 2);
        assert_eq!(snap.batches_scanned, 1);
    }

    #[test]
    fn test_scan_batch_stops_at_malformed_element() {
        let stats = ScanStats::default();
        let mut data = RequestBatch::new(2);
        data.push(&[1, 0], b"").unwrap();
        let mut data = data.into_bytes();
        data.push(0x05);

        let output = scan_batch(0, &data, &OddManager, &stats);
        assert_eq!(MatchDecoder::new(&output, 2).count(), 1);
        assert_eq!(stats.snapshot().malformed, 1);
        assert_eq!(stats.snapshot().elements, 1);
    }

    #[test]
    fn test_empty_batch_yields_empty_output() {
        let stats = ScanStats::default();
        let output = scan_batch(0, &[], &OddManager, &stats);
        assert!(output.is_empty());
        assert_eq!(stats.snapshot().batches_scanned, 1);
    }

    #[test]
    fn test_panic_message() {
        let payload: Box<dyn std::any::Any + Send> = Box::new("boom");
        assert_eq!(panic_message(payload.as_ref()), "boom");
        let payload: Box<dyn std::any::Any + Send> = Box::new(String::from("bang"));
        assert_eq!(panic_message(payload.as_ref()), "bang");
    }
}
