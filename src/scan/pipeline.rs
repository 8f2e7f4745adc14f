//! Concurrent scan pipeline
//!
//! ```text
//!  put() ──▶ [unscanned queue] ──▶ worker 1..N ──▶ [scanned queue] ──▶ get()
//!                                      │
//!                                      ▼
//!                                 ScanManager
//! ```
//!
//! Every submitted batch produces exactly one result batch, even when
//! nothing in it matched. Result batches come back in no particular order.

use crate::config::ScanConfig;
use crate::error::{ScanError, ScanResult, WorkerError};
use crate::scan::manager::ScanManager;
use crate::scan::queue::{BatchQueue, BatchReceiver, BatchSender, PushError, Received};
use crate::scan::worker::{ScanStats, ScanStatsSnapshot, Worker, WorkerContext};
use std::sync::atomic::{AtomicBool, Ordering};
use std::sync::Arc;
use std::time::Duration;
use tracing::{debug, error, info};

/// Fixed worker pool between two bounded batch queues
pub struct ScanPipeline {
    config: ScanConfig,
    unscanned: BatchQueue,
    scanned: BatchQueue,
    unscanned_tx: BatchSender,
    scanned_rx: BatchReceiver,
    workers: Vec<Worker>,
    done: Arc<AtomicBool>,
    stats: Arc<ScanStats>,
}

impl ScanPipeline {
    /// Validate `config` and start `config.worker_count` workers
    pub fn new(manager: Arc<dyn ScanManager>, config: ScanConfig) -> ScanResult<Self> {
        config.validate()?;

        let unscanned = BatchQueue::new(config.queue_depth);
        let scanned = BatchQueue::new(config.queue_depth);
        let done = Arc::new(AtomicBool::new(false));
        let stats = Arc::new(ScanStats::default());

        let mut pipeline = Self {
            unscanned_tx: unscanned.sender(),
            scanned_rx: scanned.receiver(),
            unscanned,
            scanned,
            workers: Vec::with_capacity(config.worker_count),
            done,
            stats,
            config,
        };

        for id in 0..pipeline.config.worker_count {
            let context = WorkerContext {
                manager: Arc::clone(&manager),
                unscanned: pipeline.unscanned.receiver(),
                scanned: pipeline.scanned.sender(),
                done: Arc::clone(&pipeline.done),
                stats: Arc::clone(&pipeline.stats),
                poll_interval: pipeline.config.poll_interval,
            };
            // On failure, drop stops the workers already started
            let worker = Worker::spawn(id, context)?;
            pipeline.workers.push(worker);
        }

        info!(
            workers = pipeline.workers.len(),
            queue_depth = pipeline.config.queue_depth,
            hash_width = manager.hash_width(),
            "Scan pipeline started"
        );
        Ok(pipeline)
    }

    /// Submit a request batch, waiting at most `put_timeout` for space.
    ///
    /// On timeout the batch is returned inside [`ScanError::QueueFull`].
    pub fn put(&self, batch: Vec<u8>) -> ScanResult<()> {
        let result = self.unscanned_tx.send_timeout(batch, self.config.put_timeout);
        self.accept(result)
    }

    /// Submit a request batch without waiting
    pub fn try_put(&self, batch: Vec<u8>) -> ScanResult<()> {
        let result = self.unscanned_tx.try_send(batch);
        self.accept(result)
    }

    fn accept(&self, result: Result<(), PushError>) -> ScanResult<()> {
        match result {
            Ok(()) => {
                self.stats.batches_submitted.fetch_add(1, Ordering::Relaxed);
                Ok(())
            }
            Err(PushError::Full(batch)) => Err(ScanError::QueueFull {
                depth: self.unscanned.depth(),
                batch,
            }),
            Err(PushError::Disconnected(_)) => Err(ScanError::Disconnected),
        }
    }

    /// Take one result batch if any is ready
    pub fn get(&self) -> Option<Vec<u8>> {
        let batch = self.scanned_rx.try_recv()?;
        self.stats.batches_delivered.fetch_add(1, Ordering::Relaxed);
        Some(batch)
    }

    /// Take one result batch, waiting at most `timeout`
    pub fn get_timeout(&self, timeout: Duration) -> Option<Vec<u8>> {
        match self.scanned_rx.recv_timeout(timeout) {
            Received::Batch(batch) => {
                self.stats.batches_delivered.fetch_add(1, Ordering::Relaxed);
                Some(batch)
            }
            _ => None,
        }
    }

    /// Whether every submitted batch has been handed back through `get`.
    ///
    /// Racy by nature; yields the CPU when the answer is no so callers can
    /// spin on it.
    pub fn is_empty(&self) -> bool {
        let stats = self.stats.snapshot();
        let empty = stats.batches_delivered + stats.dropped >= stats.batches_submitted
            && self.unscanned.is_empty()
            && self.scanned.is_empty();

        if !empty {
            std::thread::yield_now();
        }
        empty
    }

    /// Result batches waiting for `get`
    pub fn ready(&self) -> usize {
        self.scanned.len()
    }

    pub fn worker_count(&self) -> usize {
        self.workers.len()
    }

    pub fn config(&self) -> &ScanConfig {
        &self.config
    }

    pub fn stats(&self) -> ScanStatsSnapshot {
        self.stats.snapshot()
    }

    /// Signal workers to stop and wait for them, reporting panics
    pub fn shutdown(mut self) -> ScanResult<ScanStatsSnapshot> {
        self.stop()?;
        debug!(
            input_full = self.unscanned.stats().full_count(),
            output_full = self.scanned.stats().full_count(),
            "Scan queues drained"
        );
        Ok(self.stats.snapshot())
    }

    fn stop(&mut self) -> Result<(), WorkerError> {
        self.done.store(true, Ordering::Release);

        let mut first_error = None;
        for worker in self.workers.drain(..) {
            let id = worker.id();
            if let Err(e) = worker.join() {
                error!(worker = id, error = %e, "Scan worker failed");
                first_error.get_or_insert(e);
            }
        }

        match first_error {
            Some(e) => Err(e),
            None => Ok(()),
        }
    }
}

impl Drop for ScanPipeline {
    fn drop(&mut self) {
        // Errors were already logged by stop()
        let _ = self.stop();
    }
}
