//! Time-series point backend on the InfluxDB v2 HTTP API.
//!
//! A record turns into one point per numeric top-level entry of the payload's
//! `data` object:
//!
//! ```text
//! {"deviceId":"d1","data":{"temp":21.5,"hum":40}}
//!   -> protocol_data,tag=d1_temp value=21.5 <now>
//!   -> protocol_data,tag=d1_hum value=40 <now>
//! ```
//!
//! Points are stamped with the write instant at second precision, not with the
//! record's ingestion time.

use async_trait::async_trait;
use chrono::Utc;
use serde_json::Value;
use std::time::Duration;
use tracing::{debug, error, info, warn};

use super::line_protocol::{self, FieldValue, Point};
use super::{StorageBackend, StorageError};
use crate::config::InfluxConfig;
use crate::record::Record;

const TAG_KEY: &str = "tag";
const FIELD_KEY: &str = "value";
const PROBE_QUERY: &str = "buckets() |> limit(n:1)";

pub struct InfluxStorage {
    http: reqwest::Client,
    config: InfluxConfig,
}

impl InfluxStorage {
    pub fn new(config: InfluxConfig) -> Result<Self, StorageError> {
        let http = reqwest::Client::builder()
            .connect_timeout(Duration::from_millis(config.connection_timeout_ms))
            .timeout(Duration::from_millis(config.write_timeout_ms))
            .build()?;
        Ok(Self { http, config })
    }

    fn endpoint(&self, path: &str) -> String {
        format!("{}{}", self.config.url.trim_end_matches('/'), path)
    }

    fn auth_header(&self) -> String {
        format!("Token {}", self.config.token)
    }

    async fn write_points(&self, points: &[Point]) -> Result<(), StorageError> {
        let body = line_protocol::encode(points);
        if body.is_empty() {
            return Ok(());
        }

        let resp = self
            .http
            .post(self.endpoint("/api/v2/write"))
            .query(&[
                ("org", self.config.org.as_str()),
                ("bucket", self.config.bucket.as_str()),
                ("precision", "s"),
            ])
            .header(reqwest::header::AUTHORIZATION, self.auth_header())
            .header(reqwest::header::CONTENT_TYPE, "text/plain; charset=utf-8")
            .body(body)
            .send()
            .await?;

        let status = resp.status();
        if status.is_success() {
            Ok(())
        } else {
            let body = resp.text().await.unwrap_or_default();
            Err(StorageError::Rejected {
                status: status.as_u16(),
                body,
            })
        }
    }

    async fn probe(&self) -> Result<(), StorageError> {
        let resp = self
            .http
            .post(self.endpoint("/api/v2/query"))
            .query(&[("org", self.config.org.as_str())])
            .header(reqwest::header::AUTHORIZATION, self.auth_header())
            .header(reqwest::header::ACCEPT, "application/csv")
            .timeout(Duration::from_millis(self.config.read_timeout_ms))
            .json(&serde_json::json!({ "query": PROBE_QUERY, "type": "flux" }))
            .send()
            .await?;

        let status = resp.status();
        if status.is_success() {
            Ok(())
        } else {
            Err(StorageError::Rejected {
                status: status.as_u16(),
                body: resp.text().await.unwrap_or_default(),
            })
        }
    }
}

#[async_trait]
impl StorageBackend for InfluxStorage {
    async fn initialize(&self) {
        info!("Initializing InfluxDB storage at {}", self.config.url);
        match self.probe().await {
            Ok(()) => info!("InfluxDB storage initialized successfully"),
            Err(e) => error!("Failed to connect to InfluxDB: {}", e),
        }
    }

    async fn destroy(&self) {
        info!("Closing InfluxDB storage");
    }

    async fn store(&self, record: &Record) -> Result<(), StorageError> {
        let points = points_from_record(record, &self.config.table, Utc::now().timestamp());
        self.write_points(&points).await?;
        debug!("Stored record to InfluxDB: {}", record);
        Ok(())
    }

    async fn write_batch(&self, records: &[Record]) -> Result<(), StorageError> {
        if records.is_empty() {
            return Ok(());
        }
        let now = Utc::now().timestamp();
        let points: Vec<Point> = records
            .iter()
            .flat_map(|record| points_from_record(record, &self.config.table, now))
            .collect();

        if points.is_empty() {
            debug!("Batch of {} records produced no points", records.len());
            return Ok(());
        }

        self.write_points(&points).await?;
        debug!(
            "Stored {} points from {} records to InfluxDB",
            points.len(),
            records.len()
        );
        Ok(())
    }

    async fn is_connected(&self) -> bool {
        match self.probe().await {
            Ok(()) => true,
            Err(e) => {
                warn!("InfluxDB connection test failed: {}", e);
                false
            }
        }
    }

    fn backend_type(&self) -> &'static str {
        "influxdb"
    }
}

/// Maps one record onto its points.
///
/// Yields nothing for payloads that are not JSON, lack `deviceId`, or lack a
/// `data` object. Non-numeric entries of `data` are skipped.
pub fn points_from_record(record: &Record, measurement: &str, timestamp_secs: i64) -> Vec<Point> {
    let Ok(payload) = serde_json::from_str::<Value>(&record.raw_payload) else {
        debug!("Payload on {} is not JSON, skipping", record.address);
        return Vec::new();
    };

    let device_id = match payload.get("deviceId") {
        Some(Value::String(id)) => id.clone(),
        Some(Value::Number(id)) => id.to_string(),
        _ => return Vec::new(),
    };

    let Some(data) = payload.get("data").and_then(Value::as_object) else {
        return Vec::new();
    };

    data.iter()
        .filter_map(|(name, value)| {
            let value = value.as_f64()?;
            Some(
                Point::new(measurement, timestamp_secs)
                    .tag(TAG_KEY, format!("{}_{}", device_id, name))
                    .field(FIELD_KEY, FieldValue::Float(value)),
            )
        })
        .collect()
}
