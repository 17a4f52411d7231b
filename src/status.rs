//! Read-only status snapshots for monitoring.

use serde::Serialize;
use std::fmt;

use crate::mqtt::ConnectionState;

pub use crate::broker::BrokerStatus;

#[derive(Debug, Clone, Serialize)]
#[serde(rename_all = "camelCase")]
pub struct StorageStatus {
    pub enabled: bool,
    /// `"none"` when storage is disabled
    pub backend_type: String,
    pub connected: bool,
    pub pending: usize,
    pub dropped: u64,
    pub flushed: u64,
    pub failed_flushes: u64,
}

#[derive(Debug, Clone, Serialize)]
#[serde(rename_all = "camelCase")]
pub struct ClientStatus {
    pub state: ConnectionState,
    pub connected: bool,
    pub broker_url: String,
    pub client_id: String,
    pub reconnecting: bool,
    pub subscribed_topics: usize,
    pub pending_deliveries: u64,
    pub messages_received: u64,
    pub messages_published: u64,
}

#[derive(Debug, Clone, Serialize)]
#[serde(rename_all = "camelCase")]
pub struct GatewayStatus {
    pub storage: StorageStatus,
    pub client: Option<ClientStatus>,
    pub broker: Option<BrokerStatus>,
}

impl fmt::Display for GatewayStatus {
    fn fmt(&self, f: &mut fmt::Formatter) -> fmt::Result {
        write!(
            f,
            "storage {} (connected: {}, pending: {}, dropped: {}, flushed: {}, failed flushes: {})",
            self.storage.backend_type,
            self.storage.connected,
            self.storage.pending,
            self.storage.dropped,
            self.storage.flushed,
            self.storage.failed_flushes
        )?;
        if let Some(client) = &self.client {
            write!(
                f,
                "; client {} {} (topics: {}, received: {}, pending deliveries: {})",
                client.client_id,
                client.state,
                client.subscribed_topics,
                client.messages_received,
                client.pending_deliveries
            )?;
        }
        if let Some(broker) = &self.broker {
            write!(
                f,
                "; {} running: {} ({} clients)",
                broker.server_name, broker.running, broker.client_count
            )?;
        }
        Ok(())
    }
}
