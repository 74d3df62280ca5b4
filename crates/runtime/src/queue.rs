//! Bounded offload queue decoupling the hot path from ingestion.
//!
//! A single short mutual-exclusion region guards the deque; no operation
//! awaits while holding it, so the hot path never blocks on downstream
//! processing. Overflow drops the oldest pending job — the freshest
//! conversation matters most to the live session.

use parking_lot::Mutex;
use std::collections::VecDeque;
use std::sync::atomic::{AtomicU64, Ordering};
use tracing::{debug, warn};

use crate::types::OffloadJob;

/// Thread-safe bounded FIFO for offload jobs.
pub struct OffloadQueue {
    queue: Mutex<VecDeque<OffloadJob>>,
    max_size: usize,
    enqueued: AtomicU64,
    processed: AtomicU64,
    dropped: AtomicU64,
}

/// Snapshot of queue counters.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct QueueStats {
    pub current_size: usize,
    pub max_size: usize,
    pub enqueued_total: u64,
    pub processed_total: u64,
    pub dropped_total: u64,
}

impl OffloadQueue {
    pub fn new(max_size: usize) -> Self {
        Self {
            queue: Mutex::new(VecDeque::new()),
            max_size,
            enqueued: AtomicU64::new(0),
            processed: AtomicU64::new(0),
            dropped: AtomicU64::new(0),
        }
    }

    /// Non-blocking enqueue. On overflow the oldest job is dropped to make
    /// room; the new job is always accepted.
    pub fn enqueue(&self, job: OffloadJob) -> bool {
        let mut queue = self.queue.lock();
        if queue.len() >= self.max_size {
            if let Some(dropped) = queue.pop_front() {
                self.dropped.fetch_add(1, Ordering::Relaxed);
                warn!(
                    dropped_job_id = %dropped.job_id,
                    max_size = self.max_size,
                    "offload queue full, dropping oldest job"
                );
            }
        }
        debug!(job_id = %job.job_id, queue_size = queue.len() + 1, "queued offload job");
        queue.push_back(job);
        self.enqueued.fetch_add(1, Ordering::Relaxed);
        true
    }

    /// Retrieve a single job, or `None` when empty.
    pub fn dequeue(&self) -> Option<OffloadJob> {
        let job = self.queue.lock().pop_front();
        if job.is_some() {
            self.processed.fetch_add(1, Ordering::Relaxed);
        }
        job
    }

    /// Retrieve up to `batch_size` jobs in FIFO order.
    pub fn dequeue_batch(&self, batch_size: usize) -> Vec<OffloadJob> {
        let mut queue = self.queue.lock();
        let take = batch_size.min(queue.len());
        let batch: Vec<OffloadJob> = queue.drain(..take).collect();
        drop(queue);

        if !batch.is_empty() {
            self.processed.fetch_add(batch.len() as u64, Ordering::Relaxed);
            debug!(count = batch.len(), "dequeued offload batch");
        }
        batch
    }

    pub fn len(&self) -> usize {
        self.queue.lock().len()
    }

    pub fn is_empty(&self) -> bool {
        self.queue.lock().is_empty()
    }

    /// Drop all pending jobs, returning how many were cleared.
    pub fn clear(&self) -> usize {
        let mut queue = self.queue.lock();
        let count = queue.len();
        queue.clear();
        count
    }

    pub fn stats(&self) -> QueueStats {
        QueueStats {
            current_size: self.len(),
            max_size: self.max_size,
            enqueued_total: self.enqueued.load(Ordering::Relaxed),
            processed_total: self.processed.load(Ordering::Relaxed),
            dropped_total: self.dropped.load(Ordering::Relaxed),
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::types::JobMetadata;

    fn job(label: &str) -> OffloadJob {
        OffloadJob::create(label.to_string(), 10, 1, JobMetadata::default())
    }

    #[test]
    fn fifo_order_preserved() {
        let queue = OffloadQueue::new(10);
        queue.enqueue(job("a"));
        queue.enqueue(job("b"));
        queue.enqueue(job("c"));

        let batch = queue.dequeue_batch(2);
        assert_eq!(batch.len(), 2);
        assert_eq!(batch[0].chunk_text, "a");
        assert_eq!(batch[1].chunk_text, "b");
        assert_eq!(queue.dequeue().unwrap().chunk_text, "c");
        assert!(queue.dequeue().is_none());
    }

    #[test]
    fn overflow_drops_oldest() {
        let capacity = 3;
        let queue = OffloadQueue::new(capacity);
        for label in ["a", "b", "c", "d"] {
            queue.enqueue(job(label));
        }

        let stats = queue.stats();
        assert_eq!(stats.dropped_total, 1);
        assert_eq!(stats.current_size, capacity);
        assert_eq!(stats.enqueued_total, 4);

        // "a" was sacrificed; "b" is now the head
        assert_eq!(queue.dequeue().unwrap().chunk_text, "b");
    }

    #[test]
    fn dequeue_batch_caps_at_queue_length() {
        let queue = OffloadQueue::new(10);
        queue.enqueue(job("only"));
        let batch = queue.dequeue_batch(5);
        assert_eq!(batch.len(), 1);
        assert!(queue.is_empty());
    }

    #[test]
    fn clear_resets_pending_but_not_counters() {
        let queue = OffloadQueue::new(10);
        queue.enqueue(job("a"));
        queue.enqueue(job("b"));
        assert_eq!(queue.clear(), 2);
        assert!(queue.is_empty());
        assert_eq!(queue.stats().enqueued_total, 2);
    }
}
