use async_trait::async_trait;
use std::sync::atomic::{AtomicBool, AtomicUsize, Ordering};
use std::sync::Mutex;

use crate::record::Record;
use crate::storage::{StorageBackend, StorageError};

/// In-memory backend that records every successful batch and can be told to
/// fail its first N writes.
#[derive(Debug, Default)]
pub struct RecordingBackend {
    batches: Mutex<Vec<Vec<Record>>>,
    attempts: AtomicUsize,
    fail_remaining: AtomicUsize,
    destroyed: AtomicBool,
    probe_hangs: AtomicBool,
    probes: AtomicUsize,
}

impl RecordingBackend {
    pub fn failing_times(n: usize) -> Self {
        Self {
            fail_remaining: AtomicUsize::new(n),
            ..Default::default()
        }
    }

    /// Backend whose `is_connected` probe never returns
    pub fn with_hanging_probe() -> Self {
        Self {
            probe_hangs: AtomicBool::new(true),
            ..Default::default()
        }
    }

    pub fn probes(&self) -> usize {
        self.probes.load(Ordering::SeqCst)
    }

    pub fn batches(&self) -> Vec<Vec<Record>> {
        self.batches.lock().unwrap().clone()
    }

    pub fn batch_sizes(&self) -> Vec<usize> {
        self.batches().iter().map(Vec::len).collect()
    }

    pub fn attempts(&self) -> usize {
        self.attempts.load(Ordering::SeqCst)
    }

    pub fn destroyed(&self) -> bool {
        self.destroyed.load(Ordering::SeqCst)
    }
}

#[async_trait]
impl StorageBackend for RecordingBackend {
    async fn initialize(&self) {}

    async fn destroy(&self) {
        self.destroyed.store(true, Ordering::SeqCst);
    }

    async fn store(&self, record: &Record) -> Result<(), StorageError> {
        self.write_batch(std::slice::from_ref(record)).await
    }

    async fn write_batch(&self, records: &[Record]) -> Result<(), StorageError> {
        self.attempts.fetch_add(1, Ordering::SeqCst);
        let failing = self
            .fail_remaining
            .fetch_update(Ordering::SeqCst, Ordering::SeqCst, |n| n.checked_sub(1))
            .is_ok();
        if failing {
            return Err(StorageError::Unavailable("simulated outage".to_string()));
        }
        self.batches.lock().unwrap().push(records.to_vec());
        Ok(())
    }

    async fn is_connected(&self) -> bool {
        self.probes.fetch_add(1, Ordering::SeqCst);
        if self.probe_hangs.load(Ordering::SeqCst) {
            std::future::pending::<()>().await;
        }
        self.fail_remaining.load(Ordering::SeqCst) == 0
    }

    fn backend_type(&self) -> &'static str {
        "memory"
    }
}
