//! Handle for the storage pipeline: the bounded queue, the flush worker task and
//! the shared backend.

use std::sync::Arc;
use std::time::Duration;
use tokio::sync::oneshot;
use tokio::task::JoinHandle;
use tracing::{debug, error, info, warn};

use super::persistence_worker::{FlushStats, FlushWorker};
use super::queue::{OverflowPolicy, PendingQueue, RecordSink};
use crate::config::StorageConfig;
use crate::record::Record;
use crate::status::StorageStatus;
use crate::storage::{StorageBackend, StorageError};

/// Time the worker gets for its final flush before it is aborted
pub const SHUTDOWN_GRACE: Duration = Duration::from_secs(10);

#[derive(Debug, Clone)]
pub struct BatchSettings {
    pub enabled: bool,
    pub batch_size: usize,
    pub write_interval: Duration,
    pub queue_capacity: usize,
    pub overflow: OverflowPolicy,
}

impl BatchSettings {
    pub fn from_config(config: &StorageConfig) -> Self {
        Self {
            enabled: config.enabled,
            batch_size: config.batch_size,
            write_interval: Duration::from_millis(config.write_interval_ms),
            queue_capacity: config.queue_capacity,
            overflow: config.overflow,
        }
    }
}

impl Default for BatchSettings {
    fn default() -> Self {
        Self::from_config(&StorageConfig::default())
    }
}

/// Owns the pending queue and the flush worker.
///
/// A disabled writer has neither backend nor worker: enqueueing is a no-op and
/// synchronous writes succeed without doing anything.
pub struct BatchWriter {
    queue: Arc<PendingQueue>,
    backend: Option<Arc<dyn StorageBackend>>,
    stats: Arc<FlushStats>,
    task_handle: Option<JoinHandle<()>>,
    shutdown_tx: Option<oneshot::Sender<()>>,
}

impl BatchWriter {
    /// Starts the flush worker. Must be called inside a tokio runtime.
    pub fn spawn(settings: BatchSettings, backend: Arc<dyn StorageBackend>) -> Self {
        if !settings.enabled {
            info!("Data storage is disabled");
            return Self::disabled();
        }

        let queue = Arc::new(PendingQueue::new(settings.queue_capacity, settings.overflow));
        let stats = Arc::new(FlushStats::default());

        let worker =
            FlushWorker::create(queue.clone(), backend.clone(), &settings, stats.clone()).start();
        let (shutdown_tx, shutdown_rx) = oneshot::channel();
        let task_handle = tokio::spawn(async move {
            let draining = worker.run_until_shutdown(shutdown_rx).await;
            draining.finish().await;
        });

        info!(
            "Using {} storage (batch size {}, interval {:?}, capacity {})",
            backend.backend_type(),
            settings.batch_size,
            settings.write_interval,
            settings.queue_capacity
        );

        Self {
            queue,
            backend: Some(backend),
            stats,
            task_handle: Some(task_handle),
            shutdown_tx: Some(shutdown_tx),
        }
    }

    pub fn disabled() -> Self {
        Self {
            queue: Arc::new(PendingQueue::new(1, OverflowPolicy::DropNewest)),
            backend: None,
            stats: Arc::new(FlushStats::default()),
            task_handle: None,
            shutdown_tx: None,
        }
    }

    pub fn is_enabled(&self) -> bool {
        self.backend.is_some()
    }

    /// Non-blocking append to the pending queue.
    pub fn enqueue(&self, record: Record) {
        if self.is_enabled() {
            debug!("Queued record for storage: {}", record);
            self.queue.push(record);
        }
    }

    /// Producer handle for the ingestion paths
    pub fn sink(&self) -> RecordSink {
        RecordSink::new(self.queue.clone(), self.is_enabled())
    }

    /// Writes one record straight through the backend, bypassing the queue.
    pub async fn store_sync(&self, record: &Record) -> Result<(), StorageError> {
        match &self.backend {
            Some(backend) => backend.store(record).await,
            None => Ok(()),
        }
    }

    /// Writes a caller-assembled batch straight through the backend.
    pub async fn store_batch(&self, records: &[Record]) -> Result<(), StorageError> {
        match &self.backend {
            Some(backend) if !records.is_empty() => backend.write_batch(records).await,
            _ => Ok(()),
        }
    }

    pub fn backend_type(&self) -> &'static str {
        self.backend
            .as_ref()
            .map(|b| b.backend_type())
            .unwrap_or("none")
    }

    pub async fn is_connected(&self) -> bool {
        match &self.backend {
            Some(backend) => backend.is_connected().await,
            None => false,
        }
    }

    pub fn pending(&self) -> usize {
        self.queue.len()
    }

    pub fn dropped(&self) -> u64 {
        self.queue.dropped()
    }

    pub fn stats(&self) -> &FlushStats {
        &self.stats
    }

    pub async fn status(&self) -> StorageStatus {
        StorageStatus {
            enabled: self.is_enabled(),
            backend_type: self.backend_type().to_string(),
            connected: self.is_connected().await,
            pending: self.pending(),
            dropped: self.dropped(),
            flushed: self.stats.flushed_records(),
            failed_flushes: self.stats.failed_flushes(),
        }
    }

    /// Stops the worker after its final flush, aborting it past [`SHUTDOWN_GRACE`].
    pub async fn shutdown(&mut self) {
        if let Some(tx) = self.shutdown_tx.take() {
            if tx.send(()).is_err() {
                warn!("Batch write task already terminated");
            }
        }

        let Some(mut handle) = self.task_handle.take() else {
            debug!("Batch writer already shut down");
            return;
        };

        match tokio::time::timeout(SHUTDOWN_GRACE, &mut handle).await {
            Ok(Ok(())) => debug!("Batch write task completed"),
            Ok(Err(e)) => error!("Batch write task panicked: {}", e),
            Err(_) => {
                warn!(
                    "Batch write task did not stop within {:?}, aborting",
                    SHUTDOWN_GRACE
                );
                handle.abort();
            }
        }

        let pending = self.queue.len();
        if pending > 0 {
            warn!("{} records were still pending at shutdown", pending);
        }
    }
}

impl Drop for BatchWriter {
    fn drop(&mut self) {
        if let Some(handle) = self.task_handle.take() {
            handle.abort();
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::persistence::test_support::RecordingBackend;
    use tracing_test::traced_test;

    fn settings(batch_size: usize) -> BatchSettings {
        BatchSettings {
            enabled: true,
            batch_size,
            write_interval: Duration::from_secs(60),
            queue_capacity: 1_000,
            overflow: OverflowPolicy::DropOldest,
        }
    }

    fn record(topic: &str) -> Record {
        Record::from_subscription(topic, br#"{"deviceId":"d","data":{"v":1}}"#)
    }

    #[tokio::test(start_paused = true)]
    async fn enqueued_records_reach_backend() {
        let backend = Arc::new(RecordingBackend::default());
        let mut writer = BatchWriter::spawn(settings(3), backend.clone());

        writer.enqueue(record("a/1"));
        writer.sink().enqueue(record("a/2"));
        writer.enqueue(record("a/3"));
        tokio::time::sleep(Duration::from_millis(10)).await;

        assert_eq!(backend.batch_sizes(), vec![3]);
        assert_eq!(writer.stats().flushed_records(), 3);
        assert_eq!(writer.pending(), 0);
        writer.shutdown().await;
    }

    #[tokio::test(start_paused = true)]
    async fn shutdown_performs_final_flush() {
        let backend = Arc::new(RecordingBackend::default());
        let mut writer = BatchWriter::spawn(settings(100), backend.clone());

        writer.enqueue(record("a/1"));
        tokio::time::sleep(Duration::from_millis(10)).await;
        assert!(backend.batches().is_empty());

        writer.shutdown().await;
        assert_eq!(backend.batch_sizes(), vec![1]);
    }

    #[tokio::test]
    async fn store_sync_bypasses_queue() {
        let backend = Arc::new(RecordingBackend::default());
        let mut writer = BatchWriter::spawn(settings(100), backend.clone());

        writer.store_sync(&record("sync/1")).await.unwrap();
        assert_eq!(backend.batch_sizes(), vec![1]);
        assert_eq!(writer.pending(), 0);
        writer.shutdown().await;
    }

    #[tokio::test]
    async fn store_sync_surfaces_backend_errors() {
        let backend = Arc::new(RecordingBackend::failing_times(1));
        let mut writer = BatchWriter::spawn(settings(100), backend.clone());

        assert!(writer.store_sync(&record("sync/1")).await.is_err());
        writer.shutdown().await;
    }

    #[tokio::test]
    async fn disabled_writer_is_inert() {
        let backend = Arc::new(RecordingBackend::default());
        let mut disabled = settings(1);
        disabled.enabled = false;
        let mut writer = BatchWriter::spawn(disabled, backend.clone());

        writer.enqueue(record("a/1"));
        writer.sink().enqueue(record("a/2"));
        writer.store_sync(&record("a/3")).await.unwrap();

        assert!(!writer.is_enabled());
        assert_eq!(writer.pending(), 0);
        assert_eq!(writer.backend_type(), "none");
        assert!(backend.batches().is_empty());

        let status = writer.status().await;
        assert!(!status.enabled);
        assert!(!status.connected);
        writer.shutdown().await;
    }

    #[tokio::test(start_paused = true)]
    #[traced_test]
    async fn failed_flush_is_logged_and_counted() {
        let backend = Arc::new(RecordingBackend::failing_times(1));
        let mut writer = BatchWriter::spawn(settings(1), backend.clone());

        writer.enqueue(record("a/1"));
        tokio::time::sleep(Duration::from_millis(1_500)).await;

        assert_eq!(writer.stats().failed_flushes(), 1);
        assert_eq!(backend.batch_sizes(), vec![1]);
        assert!(logs_contain("Failed to flush batch of 1 records"));
        writer.shutdown().await;
    }

    #[tokio::test]
    async fn status_reports_counters() {
        let backend = Arc::new(RecordingBackend::default());
        let mut writer = BatchWriter::spawn(settings(1), backend.clone());
        writer.store_batch(&[record("a/1"), record("a/2")]).await.unwrap();

        let status = writer.status().await;
        assert!(status.enabled);
        assert!(status.connected);
        assert_eq!(status.backend_type, "memory");
        writer.shutdown().await;
    }
}
