//! Bounded FIFO between the ingestion side and the flush worker.
//!
//! Producers (transport tasks, broker callbacks) push without ever waiting.
//! The single consumer waits on a [`Notify`] for the next record. Failed
//! batches go back to the head of the queue.

use serde::{Deserialize, Serialize};
use std::collections::VecDeque;
use std::sync::atomic::{AtomicU64, Ordering};
use std::sync::{Mutex, MutexGuard};
use tokio::sync::Notify;
use tracing::warn;

use crate::record::Record;

/// What to throw away when the queue is full
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "kebab-case")]
pub enum OverflowPolicy {
    /// Evict the record at the head (the oldest pending one)
    #[default]
    DropOldest,
    /// Reject the record being added
    DropNewest,
}

#[derive(Debug)]
pub struct PendingQueue {
    records: Mutex<VecDeque<Record>>,
    notify: Notify,
    capacity: usize,
    policy: OverflowPolicy,
    dropped: AtomicU64,
}

impl PendingQueue {
    pub fn new(capacity: usize, policy: OverflowPolicy) -> Self {
        Self {
            records: Mutex::new(VecDeque::new()),
            notify: Notify::new(),
            capacity: capacity.max(1),
            policy,
            dropped: AtomicU64::new(0),
        }
    }

    // A poisoned lock only means a producer panicked mid-push; the deque is still usable.
    fn lock(&self) -> MutexGuard<'_, VecDeque<Record>> {
        self.records
            .lock()
            .unwrap_or_else(|poisoned| poisoned.into_inner())
    }

    /// Appends a record, applying the overflow policy when full.
    pub fn push(&self, record: Record) {
        {
            let mut records = self.lock();
            if records.len() >= self.capacity {
                match self.policy {
                    OverflowPolicy::DropOldest => {
                        records.pop_front();
                        records.push_back(record);
                    }
                    OverflowPolicy::DropNewest => {}
                }
                let total = self.dropped.fetch_add(1, Ordering::Relaxed) + 1;
                if total == 1 || total % 1000 == 0 {
                    warn!(
                        "Pending queue full ({} records), {} records dropped so far",
                        self.capacity, total
                    );
                }
            } else {
                records.push_back(record);
            }
        }
        self.notify.notify_one();
    }

    /// Puts a failed batch back at the head, keeping its internal order.
    pub fn requeue_front(&self, batch: Vec<Record>) {
        if batch.is_empty() {
            return;
        }
        let overflow = {
            let mut records = self.lock();
            for record in batch.into_iter().rev() {
                records.push_front(record);
            }
            let excess = records.len().saturating_sub(self.capacity);
            for _ in 0..excess {
                match self.policy {
                    OverflowPolicy::DropOldest => records.pop_front(),
                    OverflowPolicy::DropNewest => records.pop_back(),
                };
            }
            excess
        };

        if overflow > 0 {
            self.dropped.fetch_add(overflow as u64, Ordering::Relaxed);
            warn!(
                "Requeue exceeded queue capacity, dropped {} records ({:?})",
                overflow, self.policy
            );
        }
        self.notify.notify_one();
    }

    pub fn try_pop(&self) -> Option<Record> {
        self.lock().pop_front()
    }

    /// Waits until a record is available. Cancel-safe: a record is only
    /// removed when the future completes.
    pub async fn pop(&self) -> Record {
        loop {
            if let Some(record) = self.try_pop() {
                return record;
            }
            self.notify.notified().await;
        }
    }

    /// Removes everything currently pending.
    pub fn drain(&self) -> Vec<Record> {
        self.lock().drain(..).collect()
    }

    pub fn len(&self) -> usize {
        self.lock().len()
    }

    pub fn is_empty(&self) -> bool {
        self.lock().is_empty()
    }

    pub fn capacity(&self) -> usize {
        self.capacity
    }

    pub fn dropped(&self) -> u64 {
        self.dropped.load(Ordering::Relaxed)
    }
}

/// Producer handle given to the ingestion paths
#[derive(Debug, Clone)]
pub struct RecordSink {
    queue: std::sync::Arc<PendingQueue>,
    enabled: bool,
}

impl RecordSink {
    pub fn new(queue: std::sync::Arc<PendingQueue>, enabled: bool) -> Self {
        Self { queue, enabled }
    }

    /// Non-blocking; a disabled pipeline silently ignores the record.
    pub fn enqueue(&self, record: Record) {
        if !self.enabled {
            return;
        }
        self.queue.push(record);
    }

    pub fn is_enabled(&self) -> bool {
        self.enabled
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::sync::Arc;
    use std::time::Duration;

    fn record(address: &str) -> Record {
        Record::from_subscription(address, b"{}")
    }

    fn addresses(records: &[Record]) -> Vec<&str> {
        records.iter().map(|r| r.address.as_str()).collect()
    }

    #[test]
    fn drop_oldest_evicts_head() {
        let queue = PendingQueue::new(2, OverflowPolicy::DropOldest);
        queue.push(record("a"));
        queue.push(record("b"));
        queue.push(record("c"));
        assert_eq!(addresses(&queue.drain()), vec!["b", "c"]);
        assert_eq!(queue.dropped(), 1);
    }

    #[test]
    fn drop_newest_rejects_incoming() {
        let queue = PendingQueue::new(2, OverflowPolicy::DropNewest);
        queue.push(record("a"));
        queue.push(record("b"));
        queue.push(record("c"));
        assert_eq!(addresses(&queue.drain()), vec!["a", "b"]);
        assert_eq!(queue.dropped(), 1);
    }

    #[test]
    fn requeue_goes_to_head_in_order() {
        let queue = PendingQueue::new(10, OverflowPolicy::DropOldest);
        queue.push(record("newer"));
        queue.requeue_front(vec![record("x"), record("y")]);
        assert_eq!(addresses(&queue.drain()), vec!["x", "y", "newer"]);
    }

    #[test]
    fn requeue_over_capacity_applies_policy() {
        let queue = PendingQueue::new(3, OverflowPolicy::DropNewest);
        queue.push(record("n1"));
        queue.push(record("n2"));
        queue.requeue_front(vec![record("x"), record("y")]);
        assert_eq!(addresses(&queue.drain()), vec!["x", "y", "n1"]);
        assert_eq!(queue.dropped(), 1);
    }

    #[tokio::test]
    async fn pop_wakes_on_push() {
        let queue = Arc::new(PendingQueue::new(10, OverflowPolicy::DropOldest));
        let consumer = {
            let queue = queue.clone();
            tokio::spawn(async move { queue.pop().await })
        };
        tokio::time::sleep(Duration::from_millis(20)).await;
        queue.push(record("late"));

        let popped = tokio::time::timeout(Duration::from_secs(1), consumer)
            .await
            .unwrap()
            .unwrap();
        assert_eq!(popped.address, "late");
    }

    #[test]
    fn disabled_sink_is_noop() {
        let queue = Arc::new(PendingQueue::new(10, OverflowPolicy::DropOldest));
        RecordSink::new(queue.clone(), false).enqueue(record("a"));
        assert!(queue.is_empty());
        RecordSink::new(queue.clone(), true).enqueue(record("a"));
        assert_eq!(queue.len(), 1);
    }
}
