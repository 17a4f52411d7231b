//! MQTT protocol gateway.
//!
//! Terminates device traffic over MQTT (as an upstream client and as the
//! adapter of a hosted broker), normalizes every message into a [`Record`] and
//! persists it through a batching pipeline into InfluxDB or Redis.

pub mod broker;
pub mod config;
pub mod gateway;
pub mod mqtt;
pub mod persistence;
pub mod record;
pub mod status;
pub mod storage;

pub use config::GatewayConfig;
pub use gateway::Gateway;
pub use record::Record;
