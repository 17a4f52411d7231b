//! # Storage Backends
//!
//! Sinks that the batch writer commits records into. Two backends exist, each
//! projecting the same [`Record`] onto a very different data model:
//!
//! ```text
//! storage/
//! ├── line_protocol.rs  - InfluxDB line protocol encoding
//! ├── influx.rs         - one point per numeric leaf of the payload's "data" object
//! └── redis.rs          - sorted-set log per stream + "latest" value cache
//! ```
//!
//! The backend in use is picked from configuration through the closed
//! [`Storage`] enum. The flush worker only sees the [`StorageBackend`] trait, so
//! tests can swap in an in-memory double.
//!
//! ## Failure Model
//!
//! Payloads that cannot be mapped (invalid JSON, missing fields) are skipped
//! inside the backend and count as delivered. Only transport or server-side
//! failures surface as [`StorageError`], which makes the batch writer requeue
//! the whole batch.

pub mod influx;
pub mod line_protocol;
pub mod redis;

use async_trait::async_trait;
use serde::{Deserialize, Serialize};
use std::fmt;

use crate::config::StorageConfig;
use crate::record::Record;

pub use self::influx::InfluxStorage;
pub use self::redis::RedisStorage;

#[derive(Debug, thiserror::Error)]
pub enum StorageError {
    #[error("HTTP error: {0}")]
    Http(#[from] reqwest::Error),

    #[error("Write rejected with status {status}: {body}")]
    Rejected { status: u16, body: String },

    #[error("Redis error: {0}")]
    Redis(#[from] ::redis::RedisError),

    #[error("Serialization error: {0}")]
    Serialization(#[from] serde_json::Error),

    #[error("Backend not initialized: {0}")]
    NotInitialized(String),

    #[error("Backend unavailable: {0}")]
    Unavailable(String),
}

/// Common capability set of every storage backend.
///
/// Implementations must tolerate concurrent calls: the flush worker and
/// synchronous `store` callers share one instance.
#[async_trait]
pub trait StorageBackend: Send + Sync {
    /// Opens connections. Failure is logged, never fatal; later writes retry.
    async fn initialize(&self);

    async fn destroy(&self);

    async fn store(&self, record: &Record) -> Result<(), StorageError>;

    async fn write_batch(&self, records: &[Record]) -> Result<(), StorageError>;

    /// Live probe against the backend, not a cached flag
    async fn is_connected(&self) -> bool;

    fn backend_type(&self) -> &'static str;
}

/// Selectable backend kinds
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum StorageKind {
    #[default]
    #[serde(alias = "influx")]
    InfluxDb,
    Redis,
}

impl fmt::Display for StorageKind {
    fn fmt(&self, f: &mut fmt::Formatter) -> fmt::Result {
        match self {
            StorageKind::InfluxDb => write!(f, "influxdb"),
            StorageKind::Redis => write!(f, "redis"),
        }
    }
}

/// The configured backend
pub enum Storage {
    Influx(InfluxStorage),
    Redis(RedisStorage),
}

impl Storage {
    pub fn from_config(config: &StorageConfig) -> Result<Self, StorageError> {
        match config.kind {
            StorageKind::InfluxDb => Ok(Storage::Influx(InfluxStorage::new(config.influx.clone())?)),
            StorageKind::Redis => Ok(Storage::Redis(RedisStorage::new(config.redis.clone())?)),
        }
    }

    pub fn kind(&self) -> StorageKind {
        match self {
            Storage::Influx(_) => StorageKind::InfluxDb,
            Storage::Redis(_) => StorageKind::Redis,
        }
    }
}

#[async_trait]
impl StorageBackend for Storage {
    async fn initialize(&self) {
        match self {
            Storage::Influx(backend) => backend.initialize().await,
            Storage::Redis(backend) => backend.initialize().await,
        }
    }

    async fn destroy(&self) {
        match self {
            Storage::Influx(backend) => backend.destroy().await,
            Storage::Redis(backend) => backend.destroy().await,
        }
    }

    async fn store(&self, record: &Record) -> Result<(), StorageError> {
        match self {
            Storage::Influx(backend) => backend.store(record).await,
            Storage::Redis(backend) => backend.store(record).await,
        }
    }

    async fn write_batch(&self, records: &[Record]) -> Result<(), StorageError> {
        match self {
            Storage::Influx(backend) => backend.write_batch(records).await,
            Storage::Redis(backend) => backend.write_batch(records).await,
        }
    }

    async fn is_connected(&self) -> bool {
        match self {
            Storage::Influx(backend) => backend.is_connected().await,
            Storage::Redis(backend) => backend.is_connected().await,
        }
    }

    fn backend_type(&self) -> &'static str {
        match self {
            Storage::Influx(backend) => backend.backend_type(),
            Storage::Redis(backend) => backend.backend_type(),
        }
    }
}
