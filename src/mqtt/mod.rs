//! # MQTT Client Module
//!
//! Maintains the gateway's outbound MQTT session against an upstream broker and
//! feeds every message received on the configured subscriptions into the
//! storage pipeline.
//!
//! ## Module Architecture
//!
//! ```text
//! mqtt/
//! ├── config.rs           - Client settings, broker URL parsing, QoS mapping
//! ├── reconnect.rs        - Backoff sequence and single-flight reconnect guard
//! ├── message_manager.rs  - Inbound publish -> Record
//! └── mqtt_handler.rs     - Connection actor and the MqttClient handle
//! ```
//!
//! ## Connection Lifecycle
//!
//! ```text
//!                  connect() / startup delay
//! Disconnected ─────────────────────────────► Connecting
//!      ▲                                       │     │
//!      │ auto_reconnect off        handshake ok│     │handshake failed
//!      │                                       ▼     ▼
//!      └──────────────────────────────── Connected   ReconnectScheduled
//!                          connection lost   │            ▲      │
//!                                            └────────────┘      │ backoff elapsed
//!                                                                ▼
//!                                                            Connecting
//! ```
//!
//! All state lives in a single actor task. The rumqttc event loop of the current
//! session runs in its own task and only reports back through the actor's
//! channel, so there is exactly one writer of connection state.

pub mod config;
pub mod message_manager;
pub mod mqtt_handler;
pub mod reconnect;

use serde::Serialize;
use std::fmt;

pub use config::{MqttClientConfig, TopicConfig};
pub use mqtt_handler::MqttClient;

#[derive(Debug, thiserror::Error)]
pub enum MqttError {
    #[error("Invalid broker URL: {0}")]
    InvalidBrokerUrl(String),

    #[error("Handshake failed: {0}")]
    Handshake(#[from] rumqttc::ConnectionError),

    #[error("No CONNACK within {0:?}")]
    Timeout(std::time::Duration),

    #[error("Client request failed: {0}")]
    Client(#[from] rumqttc::ClientError),
}

#[derive(Clone, Copy, Default, Debug, PartialEq, Eq, Serialize)]
#[serde(rename_all = "snake_case")]
pub enum ConnectionState {
    #[default]
    Disconnected,
    Connecting,
    Connected,
    ReconnectScheduled,
}

impl fmt::Display for ConnectionState {
    fn fmt(&self, f: &mut fmt::Formatter) -> fmt::Result {
        match self {
            ConnectionState::Disconnected => write!(f, "disconnected"),
            ConnectionState::Connecting => write!(f, "connecting"),
            ConnectionState::Connected => write!(f, "connected"),
            ConnectionState::ReconnectScheduled => write!(f, "reconnect_scheduled"),
        }
    }
}
