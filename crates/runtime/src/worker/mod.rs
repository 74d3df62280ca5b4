//! The cold-path worker: background consumption of the offload queue.
//!
//! A long-lived batch loop drains the queue at its own pace, processing jobs
//! concurrently up to the configured worker count, plus a periodic sleep
//! cycle. The loop honors a pause flag during LLM generation so ingestion
//! never competes with the retrieval path for embedding/LLM capacity.

pub mod ingestion;
pub mod sleep_cycle;

pub use ingestion::{contextual_wrapper, extractive_summary, IngestionPipeline, JobOutcome};
pub use sleep_cycle::SleepCycle;

use futures::StreamExt;
use parking_lot::Mutex;
use std::sync::atomic::{AtomicBool, AtomicU64, Ordering};
use std::sync::Arc;
use std::time::Duration;
use tokio::task::JoinHandle;
use tracing::{debug, info, warn};

use crate::config::ColdPathConfig;
use crate::queue::OffloadQueue;

const PAUSE_POLL: Duration = Duration::from_millis(100);
const EMPTY_QUEUE_SLEEP: Duration = Duration::from_millis(500);
const ERROR_BACKOFF: Duration = Duration::from_secs(1);

/// Snapshot of worker counters.
#[derive(Debug, Clone, PartialEq)]
pub struct WorkerStats {
    pub is_running: bool,
    pub is_paused: bool,
    pub processed: u64,
    pub failed: u64,
}

struct WorkerShared {
    queue: Arc<OffloadQueue>,
    pipeline: Arc<IngestionPipeline>,
    sleep_cycle: Arc<SleepCycle>,
    config: ColdPathConfig,
    running: AtomicBool,
    paused: AtomicBool,
    processed: AtomicU64,
    failed: AtomicU64,
}

pub struct ColdPathWorker {
    shared: Arc<WorkerShared>,
    tasks: Mutex<Vec<JoinHandle<()>>>,
}

impl ColdPathWorker {
    pub fn new(
        queue: Arc<OffloadQueue>,
        pipeline: Arc<IngestionPipeline>,
        sleep_cycle: Arc<SleepCycle>,
        config: ColdPathConfig,
    ) -> Self {
        info!(workers = config.workers, "cold path worker initialized");
        Self {
            shared: Arc::new(WorkerShared {
                queue,
                pipeline,
                sleep_cycle,
                config,
                running: AtomicBool::new(false),
                paused: AtomicBool::new(false),
                processed: AtomicU64::new(0),
                failed: AtomicU64::new(0),
            }),
            tasks: Mutex::new(Vec::new()),
        }
    }

    /// Spawn the worker loop and the sleep-cycle loop.
    pub fn start(&self) {
        if self.shared.running.swap(true, Ordering::SeqCst) {
            warn!("cold path worker already running");
            return;
        }

        let worker = Arc::clone(&self.shared);
        let sleeper = Arc::clone(&self.shared);
        let mut tasks = self.tasks.lock();
        tasks.push(tokio::spawn(async move { worker_loop(worker).await }));
        tasks.push(tokio::spawn(async move { sleep_cycle_loop(sleeper).await }));
        info!("cold path worker started");
    }

    /// Stop consuming and cancel the background tasks.
    pub async fn stop(&self) {
        if !self.shared.running.swap(false, Ordering::SeqCst) {
            return;
        }
        let tasks: Vec<JoinHandle<()>> = self.tasks.lock().drain(..).collect();
        for task in tasks {
            task.abort();
            let _ = task.await;
        }
        info!("cold path worker stopped");
    }

    /// Pause processing (held during LLM generation).
    pub fn pause(&self) {
        self.shared.paused.store(true, Ordering::SeqCst);
        debug!("cold path worker paused");
    }

    pub fn resume(&self) {
        self.shared.paused.store(false, Ordering::SeqCst);
        debug!("cold path worker resumed");
    }

    /// Drain and process a single batch inline. Returns how many jobs were
    /// taken; useful for tests and manual triggering.
    pub async fn process_batch_once(&self) -> usize {
        let batch = self.shared.queue.dequeue_batch(self.shared.config.batch_size);
        let count = batch.len();
        if count > 0 {
            process_batch(&self.shared, batch).await;
        }
        count
    }

    pub fn stats(&self) -> WorkerStats {
        WorkerStats {
            is_running: self.shared.running.load(Ordering::SeqCst),
            is_paused: self.shared.paused.load(Ordering::SeqCst),
            processed: self.shared.processed.load(Ordering::SeqCst),
            failed: self.shared.failed.load(Ordering::SeqCst),
        }
    }
}

async fn worker_loop(shared: Arc<WorkerShared>) {
    info!("cold path worker loop started");
    while shared.running.load(Ordering::SeqCst) {
        if shared.paused.load(Ordering::SeqCst) {
            tokio::time::sleep(PAUSE_POLL).await;
            continue;
        }

        let batch = shared.queue.dequeue_batch(shared.config.batch_size);
        if batch.is_empty() {
            tokio::time::sleep(EMPTY_QUEUE_SLEEP).await;
            continue;
        }

        info!(count = batch.len(), "processing offload batch");
        process_batch(&shared, batch).await;
    }
    info!("cold path worker loop exited");
}

/// Process a batch with bounded concurrency, counting outcomes.
async fn process_batch(shared: &Arc<WorkerShared>, batch: Vec<crate::types::OffloadJob>) {
    futures::stream::iter(batch)
        .for_each_concurrent(shared.config.workers, |job| {
            let shared = Arc::clone(shared);
            async move {
                match shared.pipeline.process_job(&job).await {
                    Ok(outcome) if outcome.success => {
                        shared.processed.fetch_add(1, Ordering::Relaxed);
                    }
                    Ok(_) => {
                        shared.failed.fetch_add(1, Ordering::Relaxed);
                    }
                    Err(e) => {
                        warn!(job_id = %job.job_id, error = %e, "offload job failed");
                        shared.failed.fetch_add(1, Ordering::Relaxed);
                        tokio::time::sleep(ERROR_BACKOFF).await;
                    }
                }
            }
        })
        .await;

    debug!(
        processed = shared.processed.load(Ordering::Relaxed),
        failed = shared.failed.load(Ordering::Relaxed),
        "batch complete"
    );
}

async fn sleep_cycle_loop(shared: Arc<WorkerShared>) {
    info!("sleep cycle loop started");
    let interval = Duration::from_secs(shared.config.sleep_cycle_interval_secs);
    while shared.running.load(Ordering::SeqCst) {
        tokio::time::sleep(interval).await;
        if !shared.running.load(Ordering::SeqCst) {
            break;
        }
        if shared.paused.load(Ordering::SeqCst) {
            continue;
        }
        match shared.sleep_cycle.run_once().await {
            Ok(0) => {}
            Ok(created) => info!(created, "sleep cycle consolidated macro events"),
            // Back off one full interval by falling through to the sleep
            Err(e) => warn!(error = %e, "sleep cycle pass failed"),
        }
    }
    info!("sleep cycle loop exited");
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::embedding::HashEmbeddingService;
    use crate::extractor::Extractor;
    use crate::inference::{InferenceOptions, InferenceProvider};
    use crate::stores::memory::{MemoryGraphStore, MemoryKvStore, MemoryVectorIndex};
    use crate::stores::KvStore;
    use crate::types::{JobMetadata, MemoryError, Message, OffloadJob};
    use async_trait::async_trait;

    struct EmptyExtractionProvider;

    #[async_trait]
    impl InferenceProvider for EmptyExtractionProvider {
        async fn generate(
            &self,
            _messages: &[Message],
            _options: &InferenceOptions,
        ) -> Result<String, MemoryError> {
            Ok(r#"{"entities": [], "events": []}"#.to_string())
        }
    }

    fn build_worker() -> (ColdPathWorker, Arc<OffloadQueue>, Arc<MemoryKvStore>) {
        let queue = Arc::new(OffloadQueue::new(100));
        let kv = Arc::new(MemoryKvStore::new());
        let vectors = Arc::new(MemoryVectorIndex::new());
        let graph = Arc::new(MemoryGraphStore::new());
        let extractor = Arc::new(Extractor::new(Arc::new(EmptyExtractionProvider), 100));
        let embedder = Arc::new(HashEmbeddingService::new(32));

        let pipeline = Arc::new(IngestionPipeline::new(
            extractor.clone(),
            embedder.clone(),
            kv.clone(),
            vectors.clone(),
            graph.clone(),
        ));
        let sleep_cycle = Arc::new(SleepCycle::new(
            extractor,
            embedder,
            vectors,
            graph,
            ColdPathConfig::default(),
        ));
        (
            ColdPathWorker::new(queue.clone(), pipeline, sleep_cycle, ColdPathConfig::default()),
            queue,
            kv,
        )
    }

    #[tokio::test]
    async fn batch_processing_counts_successes() {
        let (worker, queue, kv) = build_worker();
        for i in 0..2 {
            queue.enqueue(OffloadJob::create(
                format!("user: message {i}"),
                10,
                1,
                JobMetadata::default(),
            ));
        }

        let taken = worker.process_batch_once().await;
        assert_eq!(taken, 2);
        let stats = worker.stats();
        assert_eq!(stats.processed, 2);
        assert_eq!(stats.failed, 0);
        assert_eq!(kv.chunk_count().await.unwrap(), 2);
    }

    #[tokio::test]
    async fn start_stop_is_idempotent() {
        let (worker, queue, _kv) = build_worker();
        worker.start();
        worker.start(); // second call is a no-op
        assert!(worker.stats().is_running);

        queue.enqueue(OffloadJob::create(
            "user: drain me".to_string(),
            5,
            1,
            JobMetadata::default(),
        ));
        // Give the loop a moment to drain
        tokio::time::sleep(Duration::from_millis(200)).await;

        worker.stop().await;
        worker.stop().await;
        assert!(!worker.stats().is_running);
        assert!(queue.is_empty());
    }

    #[tokio::test]
    async fn paused_worker_leaves_queue_alone() {
        let (worker, queue, _kv) = build_worker();
        worker.pause();
        worker.start();

        queue.enqueue(OffloadJob::create(
            "user: wait for me".to_string(),
            5,
            1,
            JobMetadata::default(),
        ));
        tokio::time::sleep(Duration::from_millis(300)).await;
        assert_eq!(queue.len(), 1, "paused worker must not consume");

        worker.resume();
        tokio::time::sleep(Duration::from_millis(300)).await;
        assert!(queue.is_empty(), "resumed worker drains the queue");

        worker.stop().await;
    }
}
