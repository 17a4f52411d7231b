//! Gateway configuration.
//!
//! One TOML file holds every section. All fields have defaults, so a partial
//! file (or none at all) still yields a runnable configuration:
//!
//! ```toml
//! [mqtt.client]
//! enabled = true
//! broker_url = "tcp://broker.local:1883"
//! topics = [{ topic = "sensor/#", qos = 1 }]
//!
//! [storage]
//! kind = "redis"
//! batch_size = 200
//! ```

use color_eyre::{eyre::eyre, Result};
use serde::{Deserialize, Serialize};
use std::fmt;
use std::path::{Path, PathBuf};
use tracing::{debug, info, warn};

use crate::mqtt::MqttClientConfig;
use crate::persistence::OverflowPolicy;
use crate::storage::StorageKind;

const CONFIG_DIR: &str = ".config/protocol-gateway";
const CONFIG_FILE: &str = "gateway.toml";

#[derive(Deserialize, Serialize, Clone, Debug, Default, PartialEq)]
#[serde(default)]
pub struct GatewayConfig {
    pub mqtt: MqttSection,
    pub storage: StorageConfig,
    pub status: StatusConfig,
}

#[derive(Deserialize, Serialize, Clone, Debug, Default, PartialEq)]
#[serde(default)]
pub struct MqttSection {
    pub client: MqttClientConfig,
    pub server: MqttServerConfig,
}

/// Hosted broker settings
#[derive(Deserialize, Serialize, Clone, Debug, PartialEq)]
#[serde(default)]
pub struct MqttServerConfig {
    pub enabled: bool,
    pub host: String,
    pub port: u16,
    pub websocket_port: u16,
    pub max_message_size: usize,
    pub keep_alive_timeout: u64,
    pub name: String,
}

impl Default for MqttServerConfig {
    fn default() -> Self {
        Self {
            enabled: true,
            host: "0.0.0.0".to_string(),
            port: 1883,
            websocket_port: 8883,
            max_message_size: 8192,
            keep_alive_timeout: 60,
            name: "MQTT (hosted)".to_string(),
        }
    }
}

#[derive(Deserialize, Serialize, Clone, Debug, PartialEq)]
#[serde(default)]
pub struct StorageConfig {
    pub enabled: bool,
    pub kind: StorageKind,
    pub batch_size: usize,
    pub write_interval_ms: u64,
    pub queue_capacity: usize,
    pub overflow: OverflowPolicy,
    pub influx: InfluxConfig,
    pub redis: RedisConfig,
}

impl Default for StorageConfig {
    fn default() -> Self {
        Self {
            enabled: true,
            kind: StorageKind::InfluxDb,
            batch_size: 100,
            write_interval_ms: 5000,
            queue_capacity: 100_000,
            overflow: OverflowPolicy::DropOldest,
            influx: InfluxConfig::default(),
            redis: RedisConfig::default(),
        }
    }
}

#[derive(Deserialize, Serialize, Clone, PartialEq)]
#[serde(default)]
pub struct InfluxConfig {
    pub url: String,
    pub token: String,
    pub org: String,
    pub bucket: String,
    /// Measurement every point is written to
    pub table: String,
    pub connection_timeout_ms: u64,
    pub read_timeout_ms: u64,
    pub write_timeout_ms: u64,
}

impl Default for InfluxConfig {
    fn default() -> Self {
        Self {
            url: "http://127.0.0.1:8086".to_string(),
            token: String::new(),
            org: "protocol-gateway".to_string(),
            bucket: "protocol-data".to_string(),
            table: "protocol_data".to_string(),
            connection_timeout_ms: 10_000,
            read_timeout_ms: 30_000,
            write_timeout_ms: 10_000,
        }
    }
}

// Token stays out of the logs
impl fmt::Debug for InfluxConfig {
    fn fmt(&self, f: &mut fmt::Formatter) -> fmt::Result {
        f.debug_struct("InfluxConfig")
            .field("url", &self.url)
            .field("org", &self.org)
            .field("bucket", &self.bucket)
            .field("table", &self.table)
            .finish()
    }
}

#[derive(Deserialize, Serialize, Clone, Debug, PartialEq)]
#[serde(default)]
pub struct RedisConfig {
    pub url: String,
    pub database: i64,
    pub key_prefix: String,
    pub time_to_live_secs: u64,
    pub use_key_expiration: bool,
    pub connection_timeout_ms: u64,
    /// Upper bound for one command or pipeline round trip
    pub response_timeout_ms: u64,
}

impl Default for RedisConfig {
    fn default() -> Self {
        Self {
            url: "redis://127.0.0.1:6379".to_string(),
            database: 0,
            key_prefix: "protocol:".to_string(),
            time_to_live_secs: 86_400,
            use_key_expiration: true,
            connection_timeout_ms: 5_000,
            response_timeout_ms: 10_000,
        }
    }
}

#[derive(Deserialize, Serialize, Clone, Debug, PartialEq)]
#[serde(default)]
pub struct StatusConfig {
    /// Period of the status log line, 0 disables it
    pub log_interval_secs: u64,
}

impl Default for StatusConfig {
    fn default() -> Self {
        Self {
            log_interval_secs: 60,
        }
    }
}

impl GatewayConfig {
    pub fn from_toml_str(content: &str) -> Result<Self> {
        toml::from_str(content).map_err(|e| eyre!("Failed to parse gateway config: {}", e))
    }

    /// `~/.config/protocol-gateway/gateway.toml`
    pub fn default_path() -> PathBuf {
        let mut path = get_home_dir();
        path.push(CONFIG_DIR);
        path.push(CONFIG_FILE);
        path
    }

    pub async fn load(path: &Path) -> Result<Self> {
        let content = tokio::fs::read_to_string(path)
            .await
            .map_err(|e| eyre!("Failed to read config file {}: {}", path.display(), e))?;
        let config = Self::from_toml_str(&content)?;
        debug!("Loaded gateway config from {}", path.display());
        Ok(config)
    }

    pub async fn save(&self, path: &Path) -> Result<()> {
        if let Some(parent) = path.parent() {
            tokio::fs::create_dir_all(parent)
                .await
                .map_err(|e| eyre!("Failed to create config directory: {}", e))?;
        }
        let content = toml::to_string_pretty(self)
            .map_err(|e| eyre!("Failed to serialize gateway config: {}", e))?;
        tokio::fs::write(path, content)
            .await
            .map_err(|e| eyre!("Failed to write config file {}: {}", path.display(), e))?;
        Ok(())
    }

    /// Writes a default config file unless one already exists.
    pub async fn ensure_default_config(path: &Path) -> Result<()> {
        if tokio::fs::try_exists(path)
            .await
            .map_err(|e| eyre!("Failed to check if config file exists: {}", e))?
        {
            return Ok(());
        }
        info!("No config found, writing defaults to {}", path.display());
        Self::default().save(path).await
    }

    pub fn validate(&self) -> Result<()> {
        let client = &self.mqtt.client;
        if client.enabled && client.broker_url.trim().is_empty() {
            return Err(eyre!("mqtt.client.broker_url must not be empty"));
        }
        if let Some(topic) = client.topics.iter().find(|t| t.qos > 2) {
            return Err(eyre!(
                "Invalid QoS {} for topic '{}', expected 0, 1 or 2",
                topic.qos,
                topic.topic
            ));
        }
        if client.reconnect_delay_ms == 0 {
            return Err(eyre!("mqtt.client.reconnect_delay_ms must be greater than 0"));
        }
        if client.max_reconnect_delay_ms < client.reconnect_delay_ms {
            return Err(eyre!(
                "mqtt.client.max_reconnect_delay_ms ({}) is below reconnect_delay_ms ({})",
                client.max_reconnect_delay_ms,
                client.reconnect_delay_ms
            ));
        }
        if client.enabled && client.topics.is_empty() {
            warn!("MQTT client enabled without any topics to subscribe");
        }

        let storage = &self.storage;
        if storage.batch_size == 0 {
            return Err(eyre!("storage.batch_size must be greater than 0"));
        }
        if storage.queue_capacity < storage.batch_size {
            return Err(eyre!(
                "storage.queue_capacity ({}) must be at least batch_size ({})",
                storage.queue_capacity,
                storage.batch_size
            ));
        }
        Ok(())
    }
}

fn get_home_dir() -> PathBuf {
    dirs::home_dir().unwrap_or_else(|| {
        warn!("Could not determine home directory, using current directory");
        PathBuf::from(".")
    })
}
