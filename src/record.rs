//! Normalized data unit flowing from the MQTT ingestion boundary into storage.
//!
//! A [`Record`] is built exactly once, at the point where a message enters the
//! gateway (an upstream subscription or the hosted broker), and is never mutated
//! afterwards. The batch writer owns it until it has been flushed.

use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};
use std::fmt;

/// Protocol tag for every record produced by the MQTT ingestion paths
pub const MQTT_PROTOCOL: &str = "mqtt";

/// Placeholder used when a topic carries no device segment
pub const UNKNOWN_DEVICE: &str = "unknown";

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct Record {
    /// Protocol the record arrived through, e.g. `"mqtt"`
    pub protocol: String,
    /// Identifier of the publishing connection (hosted broker only)
    pub client: Option<String>,
    /// Logical source device, usually derived from the topic
    pub device_id: Option<String>,
    /// Topic or register address
    pub address: String,
    /// Opaque payload, usually JSON
    pub raw_payload: String,
    /// Ingestion instant
    pub timestamp: DateTime<Utc>,
}

impl Record {
    /// Builds a record for a message received on an upstream subscription.
    ///
    /// The device id is the second `/`-separated topic segment
    /// (`sensor/device001/temperature` -> `device001`).
    pub fn from_subscription(topic: &str, payload: &[u8]) -> Self {
        Self {
            protocol: MQTT_PROTOCOL.to_string(),
            client: None,
            device_id: Some(device_id_from_topic(topic)),
            address: topic.to_string(),
            raw_payload: String::from_utf8_lossy(payload).into_owned(),
            timestamp: Utc::now(),
        }
    }

    /// Builds a record for a message published by a client of the hosted broker.
    pub fn from_broker(client_id: &str, topic: &str, payload: &[u8]) -> Self {
        Self {
            protocol: MQTT_PROTOCOL.to_string(),
            client: Some(client_id.to_string()),
            device_id: None,
            address: topic.to_string(),
            raw_payload: String::from_utf8_lossy(payload).into_owned(),
            timestamp: Utc::now(),
        }
    }

    pub fn with_timestamp(mut self, timestamp: DateTime<Utc>) -> Self {
        self.timestamp = timestamp;
        self
    }

    pub fn device_or_unknown(&self) -> &str {
        self.device_id.as_deref().unwrap_or(UNKNOWN_DEVICE)
    }
}

impl fmt::Display for Record {
    fn fmt(&self, f: &mut fmt::Formatter) -> fmt::Result {
        write!(
            f,
            "{} [{}] {}:{} ({} bytes)",
            self.timestamp.format("%H:%M:%S%.3f"),
            self.protocol,
            self.device_or_unknown(),
            self.address,
            self.raw_payload.len()
        )
    }
}

/// Extracts the device segment of a topic, falling back to [`UNKNOWN_DEVICE`].
pub fn device_id_from_topic(topic: &str) -> String {
    match topic.split('/').nth(1) {
        Some(segment) if !segment.is_empty() => segment.to_string(),
        _ => UNKNOWN_DEVICE.to_string(),
    }
}
