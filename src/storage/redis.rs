//! Sorted-set + latest-value backend on Redis.
//!
//! Every stream `(protocol, device, address)` owns two keys:
//!
//! ```text
//! <prefix><protocol>:<device>:<address>          ZSET  member = record JSON, score = epoch ms
//! <prefix><protocol>:<device>:<address>:latest   STRING newest record JSON
//! ```
//!
//! A batch is first reduced to a [`KeyWrite`] plan per stream and then sent as a
//! single pipeline.

use async_trait::async_trait;
use redis::aio::{ConnectionManager, ConnectionManagerConfig};
use redis::IntoConnectionInfo;
use std::collections::BTreeMap;
use std::time::Duration;
use tokio::sync::Mutex;
use tracing::{debug, error, info, warn};

use super::{StorageBackend, StorageError};
use crate::config::RedisConfig;
use crate::record::Record;

const LATEST_SUFFIX: &str = ":latest";
/// Reconnect attempts the connection manager makes per dial
const CONNECT_RETRIES: usize = 1;

/// Writes for one composite key within a batch
#[derive(Debug, Clone, PartialEq)]
pub struct KeyWrite {
    pub log_key: String,
    pub latest_key: String,
    /// `(score, member)` pairs as `ZADD` expects them
    pub entries: Vec<(i64, String)>,
    /// JSON of the newest record in the group
    pub latest: String,
}

pub fn stream_key(prefix: &str, record: &Record) -> String {
    format!(
        "{}{}:{}:{}",
        prefix,
        record.protocol,
        record.device_or_unknown(),
        record.address
    )
}

/// Groups records by stream key. On equal timestamps the later record in the
/// batch becomes the latest value.
pub fn plan_batch(prefix: &str, records: &[Record]) -> Result<Vec<KeyWrite>, serde_json::Error> {
    let mut groups: BTreeMap<String, (Vec<(i64, String)>, i64, String)> = BTreeMap::new();

    for record in records {
        let json = serde_json::to_string(record)?;
        let score = record.timestamp.timestamp_millis();

        match groups.get_mut(&stream_key(prefix, record)) {
            Some((entries, newest, latest)) => {
                if score >= *newest {
                    *newest = score;
                    *latest = json.clone();
                }
                entries.push((score, json));
            }
            None => {
                groups.insert(
                    stream_key(prefix, record),
                    (vec![(score, json.clone())], score, json),
                );
            }
        }
    }

    Ok(groups
        .into_iter()
        .map(|(log_key, (entries, _, latest))| KeyWrite {
            latest_key: format!("{}{}", log_key, LATEST_SUFFIX),
            log_key,
            entries,
            latest,
        })
        .collect())
}

pub struct RedisStorage {
    client: redis::Client,
    config: RedisConfig,
    connection: Mutex<Option<ConnectionManager>>,
}

impl RedisStorage {
    pub fn new(config: RedisConfig) -> Result<Self, StorageError> {
        let mut info = config.url.as_str().into_connection_info()?;
        info.redis.db = config.database;
        let client = redis::Client::open(info)?;
        Ok(Self {
            client,
            config,
            connection: Mutex::new(None),
        })
    }

    fn manager_config(&self) -> ConnectionManagerConfig {
        ConnectionManagerConfig::new()
            .set_connection_timeout(Duration::from_millis(self.config.connection_timeout_ms))
            .set_response_timeout(Duration::from_millis(self.config.response_timeout_ms))
            .set_number_of_retries(CONNECT_RETRIES)
    }

    /// Shared connection, opened on first use if `initialize` could not.
    ///
    /// The lock is not held while dialing; if two callers race, the first
    /// stored connection wins and the other one is dropped.
    async fn connection(&self) -> Result<ConnectionManager, StorageError> {
        if let Some(conn) = self.connection.lock().await.as_ref() {
            return Ok(conn.clone());
        }

        let dialed = self
            .client
            .get_connection_manager_with_config(self.manager_config())
            .await?;

        let mut guard = self.connection.lock().await;
        Ok(guard.get_or_insert(dialed).clone())
    }

    fn ttl(&self) -> Option<i64> {
        if self.config.use_key_expiration && self.config.time_to_live_secs > 0 {
            Some(self.config.time_to_live_secs as i64)
        } else {
            None
        }
    }

    async fn execute(&self, plan: &[KeyWrite]) -> Result<(), StorageError> {
        if plan.is_empty() {
            return Ok(());
        }

        let ttl = self.ttl();
        let mut pipe = redis::pipe();
        for write in plan {
            pipe.zadd_multiple(&write.log_key, &write.entries).ignore();
            pipe.set(&write.latest_key, &write.latest).ignore();
            if let Some(ttl) = ttl {
                pipe.expire(&write.log_key, ttl).ignore();
                pipe.expire(&write.latest_key, ttl).ignore();
            }
        }

        let mut conn = self.connection().await?;
        let _: () = pipe.query_async(&mut conn).await?;
        Ok(())
    }
}

#[async_trait]
impl StorageBackend for RedisStorage {
    async fn initialize(&self) {
        info!("Initializing Redis storage at {}", self.config.url);
        match self.connection().await {
            Ok(_) => info!("Redis storage initialized successfully"),
            Err(e) => error!("Failed to connect to Redis, will retry on first write: {}", e),
        }
    }

    async fn destroy(&self) {
        info!("Closing Redis storage");
        self.connection.lock().await.take();
    }

    async fn store(&self, record: &Record) -> Result<(), StorageError> {
        let plan = plan_batch(&self.config.key_prefix, std::slice::from_ref(record))?;
        self.execute(&plan).await?;
        debug!("Stored record to Redis: {}", record);
        Ok(())
    }

    async fn write_batch(&self, records: &[Record]) -> Result<(), StorageError> {
        let plan = plan_batch(&self.config.key_prefix, records)?;
        self.execute(&plan).await?;
        debug!(
            "Stored {} records across {} keys to Redis",
            records.len(),
            plan.len()
        );
        Ok(())
    }

    async fn is_connected(&self) -> bool {
        let mut conn = match self.connection().await {
            Ok(conn) => conn,
            Err(e) => {
                warn!("Redis connection test failed: {}", e);
                return false;
            }
        };
        let pong: Result<String, redis::RedisError> = redis::cmd("PING").query_async(&mut conn).await;
        match pong {
            Ok(_) => true,
            Err(e) => {
                warn!("Redis connection test failed: {}", e);
                false
            }
        }
    }

    fn backend_type(&self) -> &'static str {
        "redis"
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use chrono::{TimeZone, Utc};

    fn record_at(topic: &str, payload: &str, millis: i64) -> Record {
        Record::from_subscription(topic, payload.as_bytes())
            .with_timestamp(Utc.timestamp_millis_opt(millis).unwrap())
    }

    #[test]
    fn key_is_prefixed_composite() {
        let record = record_at("sensor/d1/temp", "1", 0);
        assert_eq!(stream_key("protocol:", &record), "protocol:mqtt:d1:sensor/d1/temp");

        let broker = Record::from_broker("client-1", "plain", b"1");
        assert_eq!(stream_key("p:", &broker), "p:mqtt:unknown:plain");
    }

    #[test]
    fn same_stream_lands_in_one_log_with_newest_latest() {
        let older = record_at("sensor/d1/temp", "20", 1_000);
        let newer = record_at("sensor/d1/temp", "21", 2_000);

        // arrival order must not matter for the latest value
        let plan = plan_batch("protocol:", &[newer.clone(), older.clone()]).unwrap();

        assert_eq!(plan.len(), 1);
        let write = &plan[0];
        assert_eq!(write.log_key, "protocol:mqtt:d1:sensor/d1/temp");
        assert_eq!(write.latest_key, "protocol:mqtt:d1:sensor/d1/temp:latest");
        let scores: Vec<i64> = write.entries.iter().map(|(s, _)| *s).collect();
        assert_eq!(scores, vec![2_000, 1_000]);
        assert_eq!(write.latest, serde_json::to_string(&newer).unwrap());
    }

    #[test]
    fn streams_are_grouped_separately() {
        let plan = plan_batch(
            "p:",
            &[
                record_at("sensor/a/x", "1", 1),
                record_at("sensor/b/x", "2", 2),
                record_at("sensor/a/x", "3", 3),
            ],
        )
        .unwrap();

        let keys: Vec<&str> = plan.iter().map(|w| w.log_key.as_str()).collect();
        assert_eq!(keys, vec!["p:mqtt:a:sensor/a/x", "p:mqtt:b:sensor/b/x"]);
        assert_eq!(plan[0].entries.len(), 2);
        assert_eq!(plan[1].entries.len(), 1);
    }

    #[test]
    fn equal_timestamps_prefer_later_record() {
        let first = record_at("s/d/t", "first", 5);
        let second = record_at("s/d/t", "second", 5);
        let plan = plan_batch("", &[first, second.clone()]).unwrap();
        assert_eq!(plan[0].latest, serde_json::to_string(&second).unwrap());
    }

    #[test]
    fn stored_value_is_record_json() {
        let record = record_at("s/d/t", r#"{"v":1}"#, 9);
        let plan = plan_batch("", std::slice::from_ref(&record)).unwrap();
        let stored: Record = serde_json::from_str(&plan[0].latest).unwrap();
        assert_eq!(stored, record);
    }

    #[test]
    fn empty_batch_plans_nothing() {
        assert!(plan_batch("p:", &[]).unwrap().is_empty());
    }

    /// Accepts TCP connections and never answers, like a wedged server.
    async fn silent_server() -> (String, tokio::task::JoinHandle<()>) {
        let listener = tokio::net::TcpListener::bind("127.0.0.1:0").await.unwrap();
        let addr = listener.local_addr().unwrap();
        let handle = tokio::spawn(async move {
            let mut held = Vec::new();
            while let Ok((socket, _)) = listener.accept().await {
                held.push(socket);
            }
        });
        (format!("redis://{}", addr), handle)
    }

    #[tokio::test]
    async fn unresponsive_server_fails_within_timeouts() {
        let (url, server) = silent_server().await;
        let storage = RedisStorage::new(RedisConfig {
            url,
            connection_timeout_ms: 200,
            response_timeout_ms: 200,
            ..Default::default()
        })
        .unwrap();

        let connected = tokio::time::timeout(Duration::from_secs(10), storage.is_connected())
            .await
            .expect("probe must not hang");
        assert!(!connected);

        let record = record_at("sensor/d1/temp", "1", 1);
        let written = tokio::time::timeout(
            Duration::from_secs(10),
            storage.write_batch(std::slice::from_ref(&record)),
        )
        .await
        .expect("write must not hang");
        assert!(written.is_err());

        server.abort();
    }
}
