//! Wires storage, batch writer, hosted broker adapter and MQTT client together.
//!
//! Start order is the reverse of the data flow so nothing produces into a
//! component that does not exist yet:
//!
//! ```text
//! storage ─► batch writer ─► broker adapter ─► mqtt client
//! ```
//!
//! Shutdown runs the other way round: ingestion stops first, then the writer
//! makes its final flush, then the backend is closed.

use color_eyre::{eyre::eyre, Result};
use std::sync::Arc;
use std::time::Duration;
use tokio_util::sync::CancellationToken;
use tracing::{info, warn};

use crate::broker::BrokerAdapter;
use crate::config::GatewayConfig;
use crate::mqtt::MqttClient;
use crate::persistence::{BatchSettings, BatchWriter};
use crate::status::GatewayStatus;
use crate::storage::{Storage, StorageBackend};

pub struct Gateway {
    config: GatewayConfig,
    storage: Option<Arc<dyn StorageBackend>>,
    writer: BatchWriter,
    broker: Option<BrokerAdapter>,
    client: Option<MqttClient>,
}

impl Gateway {
    /// Builds the configured backend and starts every enabled component.
    pub async fn start(config: GatewayConfig) -> Result<Self> {
        config.validate()?;

        let storage: Option<Arc<dyn StorageBackend>> = if config.storage.enabled {
            let storage = Storage::from_config(&config.storage)
                .map_err(|e| eyre!("Failed to create {} storage: {}", config.storage.kind, e))?;
            Some(Arc::new(storage))
        } else {
            None
        };

        Ok(Self::start_with_backend(config, storage).await)
    }

    /// Starts the gateway on an already constructed backend.
    pub async fn start_with_backend(
        config: GatewayConfig,
        storage: Option<Arc<dyn StorageBackend>>,
    ) -> Self {
        let writer = match &storage {
            Some(backend) => {
                backend.initialize().await;
                BatchWriter::spawn(BatchSettings::from_config(&config.storage), backend.clone())
            }
            None => {
                info!("Data storage is disabled");
                BatchWriter::disabled()
            }
        };

        let broker = config
            .mqtt
            .server
            .enabled
            .then(|| BrokerAdapter::spawn(&config.mqtt.server, writer.sink()));

        let client = config.mqtt.client.enabled.then(|| {
            let mut client = MqttClient::new(config.mqtt.client.clone(), writer.sink());
            client.initialize();
            client
        });

        info!(
            "Gateway started (storage: {}, broker adapter: {}, mqtt client: {})",
            writer.backend_type(),
            broker.is_some(),
            client.is_some()
        );

        Self {
            config,
            storage,
            writer,
            broker,
            client,
        }
    }

    pub fn config(&self) -> &GatewayConfig {
        &self.config
    }

    pub fn writer(&self) -> &BatchWriter {
        &self.writer
    }

    pub fn broker(&self) -> Option<&BrokerAdapter> {
        self.broker.as_ref()
    }

    pub fn client(&self) -> Option<&MqttClient> {
        self.client.as_ref()
    }

    pub async fn status(&self) -> GatewayStatus {
        GatewayStatus {
            storage: self.writer.status().await,
            client: self.client.as_ref().map(MqttClient::status),
            broker: self.broker.as_ref().map(BrokerAdapter::status),
        }
    }

    /// Logs the status periodically until `token` is cancelled, then shuts down.
    pub async fn run_until_cancelled(self, token: CancellationToken) {
        let period = self.config.status.log_interval_secs;
        if period == 0 {
            token.cancelled().await;
        } else {
            let mut interval = tokio::time::interval(Duration::from_secs(period));
            // first tick fires immediately
            interval.tick().await;
            loop {
                tokio::select! {
                    _ = token.cancelled() => break,
                    _ = interval.tick() => {}
                }
                // the backend probe inside status() may be slow
                let status = tokio::select! {
                    _ = token.cancelled() => break,
                    status = self.status() => status,
                };
                info!("Gateway status: {}", status);
                if status.storage.dropped > 0 {
                    warn!("{} records dropped due to a full queue", status.storage.dropped);
                }
            }
        }
        info!("Shutdown requested");
        self.shutdown().await;
    }

    pub async fn shutdown(mut self) {
        info!("Shutting down gateway");

        if let Some(mut client) = self.client.take() {
            client.shutdown().await;
        }
        if let Some(mut broker) = self.broker.take() {
            broker.shutdown().await;
        }
        self.writer.shutdown().await;
        if let Some(storage) = self.storage.take() {
            storage.destroy().await;
        }

        info!("Gateway stopped");
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::broker::BrokerEvent;
    use crate::persistence::test_support::RecordingBackend;
    use bytes::Bytes;

    fn config() -> GatewayConfig {
        let mut config = GatewayConfig::default();
        config.storage.batch_size = 1;
        config
    }

    #[tokio::test]
    async fn broker_publish_reaches_storage() {
        let backend = Arc::new(RecordingBackend::default());
        let gateway = Gateway::start_with_backend(config(), Some(backend.clone())).await;

        let events = gateway.broker().unwrap().events();
        events
            .send(BrokerEvent::Published {
                client_id: Some("dev-1".to_string()),
                topic: "sensor/dev-1/temp".to_string(),
                payload: Bytes::from_static(b"21.5"),
            })
            .await
            .unwrap();

        tokio::time::timeout(Duration::from_secs(5), async {
            while backend.batches().is_empty() {
                tokio::time::sleep(Duration::from_millis(10)).await;
            }
        })
        .await
        .unwrap();

        let status = gateway.status().await;
        assert!(status.client.is_none());
        assert_eq!(status.storage.backend_type, "memory");
        assert_eq!(status.broker.unwrap().messages_stored, 1);

        gateway.shutdown().await;
        assert!(backend.destroyed());
        assert_eq!(backend.batches()[0][0].client.as_deref(), Some("dev-1"));
    }

    #[tokio::test]
    async fn disabled_storage_reports_none() {
        let mut config = config();
        config.storage.enabled = false;
        config.mqtt.server.enabled = false;
        let gateway = Gateway::start(config).await.unwrap();

        let status = gateway.status().await;
        assert!(!status.storage.enabled);
        assert_eq!(status.storage.backend_type, "none");
        assert!(status.broker.is_none());
        gateway.shutdown().await;
    }

    #[tokio::test]
    async fn invalid_config_is_rejected() {
        let mut config = config();
        config.storage.batch_size = 0;
        assert!(Gateway::start(config).await.is_err());
    }

    #[tokio::test(start_paused = true)]
    async fn cancellation_interrupts_a_hanging_status_probe() {
        let backend = Arc::new(RecordingBackend::with_hanging_probe());
        let mut config = config();
        config.status.log_interval_secs = 1;
        let gateway = Gateway::start_with_backend(config, Some(backend.clone())).await;

        let token = CancellationToken::new();
        let run = tokio::spawn(gateway.run_until_cancelled(token.clone()));

        // let the first status tick start its probe
        tokio::time::sleep(Duration::from_millis(1_500)).await;
        assert!(backend.probes() >= 1);
        token.cancel();

        tokio::time::timeout(Duration::from_secs(15), run)
            .await
            .expect("gateway must stop while the probe hangs")
            .unwrap();
        assert!(backend.destroyed());
    }

    #[tokio::test]
    async fn cancellation_stops_gateway() {
        let backend = Arc::new(RecordingBackend::default());
        let gateway = Gateway::start_with_backend(config(), Some(backend.clone())).await;

        let token = CancellationToken::new();
        let run = tokio::spawn(gateway.run_until_cancelled(token.clone()));
        token.cancel();

        tokio::time::timeout(Duration::from_secs(15), run)
            .await
            .unwrap()
            .unwrap();
        assert!(backend.destroyed());
    }
}
