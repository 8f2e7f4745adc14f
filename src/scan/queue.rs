//! Bounded batch queues
//!
//! The scan pipeline owns two of these: unscanned request batches flowing
//! to the workers and scanned result batches flowing back. Every wait is
//! bounded; when a queue stays full the sender gets its batch back.

use crossbeam_channel::{bounded, Receiver, RecvTimeoutError, SendTimeoutError, Sender, TrySendError};
use std::sync::atomic::{AtomicU64, Ordering};
use std::sync::Arc;
use std::time::Duration;

/// Why a batch could not be enqueued
#[derive(Debug)]
pub enum PushError {
    /// Queue stayed full; the batch is handed back
    Full(Vec<u8>),
    /// Every receiver is gone
    Disconnected(Vec<u8>),
}

impl PushError {
    pub fn into_batch(self) -> Vec<u8> {
        match self {
            PushError::Full(batch) | PushError::Disconnected(batch) => batch,
        }
    }
}

/// Statistics for one queue
#[derive(Debug, Default)]
pub struct QueueStats {
    /// Total batches enqueued
    pub enqueued: AtomicU64,

    /// Total batches dequeued
    pub dequeued: AtomicU64,

    /// Times a sender found the queue full
    pub full_events: AtomicU64,
}

impl QueueStats {
    pub fn enqueued(&self) -> u64 {
        self.enqueued.load(Ordering::Relaxed)
    }

    pub fn dequeued(&self) -> u64 {
        self.dequeued.load(Ordering::Relaxed)
    }

    pub fn full_count(&self) -> u64 {
        self.full_events.load(Ordering::Relaxed)
    }
}

/// Bounded MPMC queue of encoded batches
pub struct BatchQueue {
    sender: Sender<Vec<u8>>,
    receiver: Receiver<Vec<u8>>,
    depth: usize,
    stats: Arc<QueueStats>,
}

impl BatchQueue {
    /// Create a queue holding at most `depth` batches
    pub fn new(depth: usize) -> Self {
        let (sender, receiver) = bounded(depth);

        Self {
            sender,
            receiver,
            depth,
            stats: Arc::new(QueueStats::default()),
        }
    }

    /// Get a sender handle (clone for each producer)
    pub fn sender(&self) -> BatchSender {
        BatchSender {
            sender: self.sender.clone(),
            stats: Arc::clone(&self.stats),
        }
    }

    /// Get a receiver handle (clone for each consumer)
    pub fn receiver(&self) -> BatchReceiver {
        BatchReceiver {
            receiver: self.receiver.clone(),
            stats: Arc::clone(&self.stats),
        }
    }

    pub fn stats(&self) -> Arc<QueueStats> {
        Arc::clone(&self.stats)
    }

    pub fn is_empty(&self) -> bool {
        self.receiver.is_empty()
    }

    pub fn len(&self) -> usize {
        self.receiver.len()
    }

    /// Capacity in batches
    pub fn depth(&self) -> usize {
        self.depth
    }
}

/// Handle for sending batches
#[derive(Clone)]
pub struct BatchSender {
    sender: Sender<Vec<u8>>,
    stats: Arc<QueueStats>,
}

impl BatchSender {
    /// Enqueue without waiting
    pub fn try_send(&self, batch: Vec<u8>) -> Result<(), PushError> {
        match self.sender.try_send(batch) {
            Ok(()) => {
                self.stats.enqueued.fetch_add(1, Ordering::Relaxed);
                Ok(())
            }
            Err(TrySendError::Full(batch)) => {
                self.stats.full_events.fetch_add(1, Ordering::Relaxed);
                Err(PushError::Full(batch))
            }
            Err(TrySendError::Disconnected(batch)) => Err(PushError::Disconnected(batch)),
        }
    }

    /// Enqueue, waiting at most `timeout` for space
    pub fn send_timeout(&self, batch: Vec<u8>, timeout: Duration) -> Result<(), PushError> {
        match self.sender.send_timeout(batch, timeout) {
            Ok(()) => {
                self.stats.enqueued.fetch_add(1, Ordering::Relaxed);
                Ok(())
            }
            Err(SendTimeoutError::Timeout(batch)) => {
                self.stats.full_events.fetch_add(1, Ordering::Relaxed);
                Err(PushError::Full(batch))
            }
            Err(SendTimeoutError::Disconnected(batch)) => Err(PushError::Disconnected(batch)),
        }
    }
}

/// Handle for receiving batches
#[derive(Clone)]
pub struct BatchReceiver {
    receiver: Receiver<Vec<u8>>,
    stats: Arc<QueueStats>,
}

/// Outcome of a bounded receive
#[derive(Debug, PartialEq, Eq)]
pub enum Received {
    Batch(Vec<u8>),
    Timeout,
    Disconnected,
}

impl BatchReceiver {
    /// Try to receive a batch without blocking
    pub fn try_recv(&self) -> Option<Vec<u8>> {
        let batch = self.receiver.try_recv().ok()?;
        self.stats.dequeued.fetch_add(1, Ordering::Relaxed);
        Some(batch)
    }

    /// Receive with timeout
    pub fn recv_timeout(&self, timeout: Duration) -> Received {
        match self.receiver.recv_timeout(timeout) {
            Ok(batch) => {
                self.stats.dequeued.fetch_add(1, Ordering::Relaxed);
                Received::Batch(batch)
            }
            Err(RecvTimeoutError::Timeout) => Received::Timeout,
            Err(RecvTimeoutError::Disconnected) => Received::Disconnected,
        }
    }

    pub fn is_empty(&self) -> bool {
        self.receiver.is_empty()
    }

    pub fn len(&self) -> usize {
        self.receiver.len()
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_queue_basic() {
        let queue = BatchQueue::new(4);
        let tx = queue.sender();
        let rx = queue.receiver();

        assert!(queue.is_empty());
        tx.try_send(vec![1, 2, 3]).unwrap();
        assert_eq!(queue.len(), 1);

        assert_eq!(rx.try_recv(), Some(vec![1, 2, 3]));
        assert!(queue.is_empty());
        assert_eq!(queue.stats().enqueued(), 1);
        assert_eq!(queue.stats().dequeued(), 1);
    }

    #[test]
    fn test_full_queue_returns_batch() {
        let queue = BatchQueue::new(1);
        let tx = queue.sender();

        tx.try_send(vec![1]).unwrap();
        match tx.try_send(vec![2]) {
            Err(PushError::Full(batch)) => assert_eq!(batch, vec![2]),
            other => panic!("expected Full, got {other:?}"),
        }

        let err = tx
            .send_timeout(vec![3], Duration::from_millis(10))
            .unwrap_err();
        assert_eq!(err.into_batch(), vec![3]);
        assert_eq!(queue.stats().full_count(), 2);
    }

    #[test]
    fn test_recv_timeout_on_empty_queue() {
        let queue = BatchQueue::new(2);
        let rx = queue.receiver();
        assert_eq!(rx.recv_timeout(Duration::from_millis(10)), Received::Timeout);
        assert_eq!(rx.try_recv(), None);
    }
}
