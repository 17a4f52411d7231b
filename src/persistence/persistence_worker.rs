//! Background flush loop with statum state machine
//!
//! One worker per [`BatchWriter`](super::BatchWriter). It drains the pending
//! queue into an in-memory batch and commits that batch once it is full or the
//! write interval has elapsed, whichever comes first.
//!
//! # State Machine
//!
//! ```text
//! Configured ──► Running ──► Draining ──► Stopped
//!                   │  ▲
//!                   └──┘ wait ≤ 1s for a record, flush when due
//! ```
//!
//! A failed flush puts the batch back at the head of the queue and pauses the
//! loop for [`RETRY_PAUSE`] before consuming again, so an unreachable backend is
//! not hammered while producers keep filling the bounded queue.

use statum::{machine, state};
use std::sync::atomic::{AtomicU64, Ordering};
use std::sync::Arc;
use std::time::Duration;
use tokio::sync::oneshot;
use tokio::time::Instant;
use tracing::{debug, error, info};

use super::batch_writer::BatchSettings;
use super::queue::PendingQueue;
use crate::record::Record;
use crate::storage::StorageBackend;

/// Upper bound on one wait for the next queued record
pub const POLL_TIMEOUT: Duration = Duration::from_secs(1);

/// Pause after a failed flush before the loop resumes
pub const RETRY_PAUSE: Duration = Duration::from_secs(1);

/// Flush counters shared between the worker and status readers
#[derive(Debug, Default)]
pub struct FlushStats {
    flushed_records: AtomicU64,
    flushed_batches: AtomicU64,
    failed_flushes: AtomicU64,
}

impl FlushStats {
    pub fn record_success(&self, records: usize) {
        self.flushed_records
            .fetch_add(records as u64, Ordering::Relaxed);
        self.flushed_batches.fetch_add(1, Ordering::Relaxed);
    }

    pub fn record_failure(&self) {
        self.failed_flushes.fetch_add(1, Ordering::Relaxed);
    }

    pub fn flushed_records(&self) -> u64 {
        self.flushed_records.load(Ordering::Relaxed)
    }

    pub fn flushed_batches(&self) -> u64 {
        self.flushed_batches.load(Ordering::Relaxed)
    }

    pub fn failed_flushes(&self) -> u64 {
        self.failed_flushes.load(Ordering::Relaxed)
    }
}

#[state]
#[derive(Debug, Clone)]
pub enum FlushState {
    Configured, // Queue and backend attached
    Running,    // Consuming and flushing
    Draining,   // Shutdown received, final flush pending
    Stopped,    // Done
}

#[machine]
pub struct FlushWorker<S: FlushState> {
    queue: Arc<PendingQueue>,
    backend: Arc<dyn StorageBackend>,
    batch_size: usize,
    write_interval: Duration,
    batch: Vec<Record>,
    last_flush: Instant,
    stats: Arc<FlushStats>,
}

impl<S: FlushState> FlushWorker<S> {
    pub fn batch_len(&self) -> usize {
        self.batch.len()
    }

    /// Commits the current batch. On failure the batch goes back to the head
    /// of the queue and the flush clock is left untouched.
    async fn flush(&mut self) -> bool {
        let batch = std::mem::take(&mut self.batch);
        match self.backend.write_batch(&batch).await {
            Ok(()) => {
                debug!("Flushed {} records to storage", batch.len());
                self.stats.record_success(batch.len());
                self.last_flush = Instant::now();
                true
            }
            Err(e) => {
                error!(
                    "Failed to flush batch of {} records, requeueing: {}",
                    batch.len(),
                    e
                );
                self.stats.record_failure();
                self.queue.requeue_front(batch);
                false
            }
        }
    }
}

impl FlushWorker<Configured> {
    pub fn create(
        queue: Arc<PendingQueue>,
        backend: Arc<dyn StorageBackend>,
        settings: &BatchSettings,
        stats: Arc<FlushStats>,
    ) -> Self {
        debug!(
            "Creating flush worker: batch size {}, interval {:?}",
            settings.batch_size, settings.write_interval
        );

        Self::new(
            queue,
            backend,
            settings.batch_size.max(1),
            settings.write_interval,
            Vec::with_capacity(settings.batch_size.max(1)),
            Instant::now(), // last_flush
            stats,
        )
    }

    pub fn start(mut self) -> FlushWorker<Running> {
        info!("Batch write service started ({})", self.backend.backend_type());
        self.last_flush = Instant::now();
        self.transition()
    }
}

impl FlushWorker<Running> {
    fn flush_due(&self) -> bool {
        !self.batch.is_empty()
            && (self.batch.len() >= self.batch_size
                || self.last_flush.elapsed() >= self.write_interval)
    }

    /// Main loop. Returns once the shutdown signal fires or its sender is dropped.
    pub async fn run_until_shutdown(
        mut self,
        mut shutdown_rx: oneshot::Receiver<()>,
    ) -> FlushWorker<Draining> {
        loop {
            tokio::select! {
                _ = &mut shutdown_rx => {
                    info!("Shutdown signal received for batch write service");
                    break;
                }

                next = tokio::time::timeout(POLL_TIMEOUT, self.queue.pop()) => {
                    if let Ok(record) = next {
                        self.batch.push(record);
                    }

                    if self.flush_due() && !self.flush().await {
                        tokio::select! {
                            _ = &mut shutdown_rx => {
                                info!("Shutdown signal received while waiting to retry");
                                break;
                            }
                            _ = tokio::time::sleep(RETRY_PAUSE) => {}
                        }
                    }
                }
            }
        }

        self.transition()
    }
}

impl FlushWorker<Draining> {
    /// Final flush of the in-memory batch. Records still in the queue stay there.
    pub async fn finish(mut self) -> FlushWorker<Stopped> {
        if !self.batch.is_empty() {
            let remaining = self.batch.len();
            if self.flush().await {
                info!("Flushed remaining {} records on shutdown", remaining);
            } else {
                error!("Failed to flush remaining {} records on shutdown", remaining);
            }
        }

        info!(
            "Batch write service stopped, {} records left pending",
            self.queue.len()
        );
        self.transition()
    }
}

impl FlushWorker<Stopped> {}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::persistence::test_support::RecordingBackend;
    use crate::persistence::OverflowPolicy;

    fn settings(batch_size: usize, interval_ms: u64) -> BatchSettings {
        BatchSettings {
            enabled: true,
            batch_size,
            write_interval: Duration::from_millis(interval_ms),
            queue_capacity: 100,
            overflow: OverflowPolicy::DropOldest,
        }
    }

    fn record(n: usize) -> Record {
        Record::from_subscription(&format!("sensor/d{}/v", n), b"{}")
    }

    fn spawn_worker(
        backend: Arc<RecordingBackend>,
        settings: BatchSettings,
    ) -> (
        Arc<PendingQueue>,
        oneshot::Sender<()>,
        tokio::task::JoinHandle<FlushWorker<Stopped>>,
    ) {
        let queue = Arc::new(PendingQueue::new(settings.queue_capacity, settings.overflow));
        let worker = FlushWorker::create(
            queue.clone(),
            backend,
            &settings,
            Arc::new(FlushStats::default()),
        )
        .start();
        let (tx, rx) = oneshot::channel();
        let handle = tokio::spawn(async move { worker.run_until_shutdown(rx).await.finish().await });
        (queue, tx, handle)
    }

    #[tokio::test(start_paused = true)]
    async fn flushes_when_batch_size_reached() {
        let backend = Arc::new(RecordingBackend::default());
        let (queue, tx, handle) = spawn_worker(backend.clone(), settings(3, 60_000));

        queue.push(record(1));
        queue.push(record(2));
        tokio::time::sleep(Duration::from_millis(100)).await;
        assert!(backend.batches().is_empty());

        queue.push(record(3));
        tokio::time::sleep(Duration::from_millis(10)).await;
        assert_eq!(backend.batch_sizes(), vec![3]);

        tx.send(()).unwrap();
        handle.await.unwrap();
    }

    #[tokio::test(start_paused = true)]
    async fn flushes_partial_batch_after_interval() {
        let backend = Arc::new(RecordingBackend::default());
        let (queue, tx, handle) = spawn_worker(backend.clone(), settings(100, 5_000));

        queue.push(record(1));
        tokio::time::sleep(Duration::from_millis(4_000)).await;
        assert!(backend.batches().is_empty());

        tokio::time::sleep(Duration::from_millis(2_500)).await;
        assert_eq!(backend.batch_sizes(), vec![1]);

        tx.send(()).unwrap();
        handle.await.unwrap();
    }

    #[tokio::test(start_paused = true)]
    async fn failed_batch_is_retried() {
        let backend = Arc::new(RecordingBackend::failing_times(1));
        let (queue, tx, handle) = spawn_worker(backend.clone(), settings(2, 60_000));

        queue.push(record(1));
        queue.push(record(2));
        tokio::time::sleep(Duration::from_millis(10)).await;
        assert_eq!(backend.attempts(), 1);
        assert!(backend.batches().is_empty());
        // requeued while the worker waits out the retry pause
        assert_eq!(queue.len(), 2);

        tokio::time::sleep(RETRY_PAUSE + Duration::from_millis(10)).await;
        let batches = backend.batches();
        assert_eq!(batches.len(), 1);
        let addresses: Vec<&str> = batches[0].iter().map(|r| r.address.as_str()).collect();
        assert_eq!(addresses, vec!["sensor/d1/v", "sensor/d2/v"]);

        tx.send(()).unwrap();
        handle.await.unwrap();
    }

    #[tokio::test(start_paused = true)]
    async fn shutdown_flushes_remaining_batch() {
        let backend = Arc::new(RecordingBackend::default());
        let (queue, tx, handle) = spawn_worker(backend.clone(), settings(10, 60_000));

        queue.push(record(1));
        queue.push(record(2));
        tokio::time::sleep(Duration::from_millis(10)).await;
        assert!(backend.batches().is_empty());

        tx.send(()).unwrap();
        let stopped = handle.await.unwrap();
        assert_eq!(stopped.batch_len(), 0);
        assert_eq!(backend.batch_sizes(), vec![2]);
    }

    #[test]
    fn stats_accumulate() {
        let stats = FlushStats::default();
        stats.record_success(3);
        stats.record_success(2);
        stats.record_failure();
        assert_eq!(stats.flushed_records(), 5);
        assert_eq!(stats.flushed_batches(), 2);
        assert_eq!(stats.failed_flushes(), 1);
    }
}
