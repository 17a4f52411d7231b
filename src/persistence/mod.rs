//! # Persistence Module
//!
//! ## Why This Module Exists
//! Inbound MQTT traffic can arrive far faster than a storage backend accepts
//! writes, and backends fail. This module sits between the two: ingestion only
//! ever appends to a bounded queue, and a single background worker commits
//! records to storage in size- or time-triggered batches.
//!
//! ## Key Abstractions
//! - **PendingQueue**: bounded multi-producer / single-consumer FIFO with an
//!   explicit overflow policy
//! - **RecordSink**: cloneable producer handle handed to the MQTT client and the
//!   hosted broker adapter
//! - **FlushWorker**: statum state machine running the flush loop
//! - **BatchWriter**: owning handle with synchronous write, status and shutdown
//!
//! ## Delivery Guarantees
//! At-least-once. A failed batch is pushed back to the head of the queue and
//! retried, so a backend may see the same record twice. Ordering across a
//! failed-and-requeued batch is not guaranteed once the overflow policy trims.

pub mod batch_writer;
pub mod persistence_worker;
pub mod queue;

#[cfg(test)]
pub(crate) mod test_support;

pub use batch_writer::{BatchSettings, BatchWriter};
pub use persistence_worker::FlushStats;
pub use queue::{OverflowPolicy, PendingQueue, RecordSink};
