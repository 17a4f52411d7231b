//! # Hosted Broker Adapter
//!
//! When the gateway also hosts an MQTT broker, that broker reports what happens
//! on it as [`BrokerEvent`]s. The adapter keeps the set of connected client ids
//! and turns every client publish into a [`Record`] for the storage pipeline.
//!
//! ```text
//! broker ──BrokerEvent──► mpsc ──► BrokerCallback ──► RecordSink
//!                                        │
//!                                   DashSet<client id> ◄── status queries
//! ```
//!
//! Broker events never fail. A session loop error is logged and the broker
//! keeps running.

use bytes::Bytes;
use dashmap::DashSet;
use serde::Serialize;
use std::sync::atomic::{AtomicBool, AtomicU64, Ordering};
use std::sync::Arc;
use tokio::sync::{mpsc, oneshot};
use tokio::task::JoinHandle;
use tracing::{debug, error, info, warn};

use crate::config::MqttServerConfig;
use crate::persistence::RecordSink;
use crate::record::Record;

const EVENT_CHANNEL_SIZE: usize = 1024;

#[derive(Debug, Clone)]
pub enum BrokerEvent {
    ClientConnected {
        client_id: String,
    },
    ClientDisconnected {
        client_id: String,
    },
    Published {
        client_id: Option<String>,
        topic: String,
        payload: Bytes,
    },
    SessionLoopError {
        error: String,
    },
}

#[derive(Debug, Clone, Serialize)]
#[serde(rename_all = "camelCase")]
pub struct BrokerStatus {
    pub running: bool,
    pub server_name: String,
    pub client_count: usize,
    pub clients: Vec<String>,
    pub messages_stored: u64,
}

/// Reacts to broker events. Safe to call from any number of broker threads.
#[derive(Debug)]
pub struct BrokerCallback {
    clients: DashSet<String>,
    sink: RecordSink,
    messages_stored: AtomicU64,
}

impl BrokerCallback {
    pub fn new(sink: RecordSink) -> Self {
        Self {
            clients: DashSet::new(),
            sink,
            messages_stored: AtomicU64::new(0),
        }
    }

    pub fn handle(&self, event: BrokerEvent) {
        match event {
            BrokerEvent::ClientConnected { client_id } => self.on_connect(&client_id),
            BrokerEvent::ClientDisconnected { client_id } => self.on_disconnect(&client_id),
            BrokerEvent::Published {
                client_id,
                topic,
                payload,
            } => {
                self.on_publish(client_id.as_deref(), &topic, &payload);
            }
            BrokerEvent::SessionLoopError { error } => self.on_session_loop_error(&error),
        }
    }

    pub fn on_connect(&self, client_id: &str) {
        self.clients.insert(client_id.to_string());
        info!("Client connected: {}", client_id);
    }

    pub fn on_disconnect(&self, client_id: &str) {
        self.clients.remove(client_id);
        info!("Client disconnected: {}", client_id);
    }

    /// Forwards a client publish to storage. Publishes without a client id
    /// (e.g. broker-internal ones) are not stored.
    pub fn on_publish(&self, client_id: Option<&str>, topic: &str, payload: &[u8]) -> Option<Record> {
        debug!(
            "Received MQTT message from client {:?}: topic={}, {} bytes",
            client_id,
            topic,
            payload.len()
        );

        let client_id = client_id?;
        let record = Record::from_broker(client_id, topic, payload);
        self.sink.enqueue(record.clone());
        self.messages_stored.fetch_add(1, Ordering::Relaxed);
        Some(record)
    }

    pub fn on_session_loop_error(&self, error: &str) {
        error!("MQTT session loop error: {}", error);
    }

    pub fn client_count(&self) -> usize {
        self.clients.len()
    }

    /// Connected client ids, sorted
    pub fn connected_clients(&self) -> Vec<String> {
        let mut clients: Vec<String> = self.clients.iter().map(|c| c.key().clone()).collect();
        clients.sort();
        clients
    }

    pub fn messages_stored(&self) -> u64 {
        self.messages_stored.load(Ordering::Relaxed)
    }
}

/// Runs a [`BrokerCallback`] behind an event channel.
pub struct BrokerAdapter {
    server_name: String,
    callback: Arc<BrokerCallback>,
    events_tx: mpsc::Sender<BrokerEvent>,
    running: Arc<AtomicBool>,
    task_handle: Option<JoinHandle<()>>,
    shutdown_tx: Option<oneshot::Sender<()>>,
}

impl BrokerAdapter {
    pub fn spawn(config: &MqttServerConfig, sink: RecordSink) -> Self {
        let callback = Arc::new(BrokerCallback::new(sink));
        let (events_tx, mut events_rx) = mpsc::channel(EVENT_CHANNEL_SIZE);
        let (shutdown_tx, mut shutdown_rx) = oneshot::channel::<()>();
        let running = Arc::new(AtomicBool::new(true));

        let task_callback = callback.clone();
        let task_running = running.clone();
        let task_handle = tokio::spawn(async move {
            loop {
                tokio::select! {
                    _ = &mut shutdown_rx => {
                        debug!("Shutdown signal received for broker adapter");
                        break;
                    }
                    event = events_rx.recv() => match event {
                        Some(event) => task_callback.handle(event),
                        None => {
                            debug!("Broker event channel closed");
                            break;
                        }
                    }
                }
            }
            // handle what the broker already delivered
            while let Ok(event) = events_rx.try_recv() {
                task_callback.handle(event);
            }
            task_running.store(false, Ordering::Relaxed);
        });

        info!(
            "{} adapter started for {}:{}",
            config.name, config.host, config.port
        );

        Self {
            server_name: config.name.clone(),
            callback,
            events_tx,
            running,
            task_handle: Some(task_handle),
            shutdown_tx: Some(shutdown_tx),
        }
    }

    /// Sender the hosted broker reports its events on
    pub fn events(&self) -> mpsc::Sender<BrokerEvent> {
        self.events_tx.clone()
    }

    pub fn callback(&self) -> Arc<BrokerCallback> {
        self.callback.clone()
    }

    pub fn is_running(&self) -> bool {
        self.running.load(Ordering::Relaxed)
    }

    pub fn client_count(&self) -> usize {
        self.callback.client_count()
    }

    pub fn connected_clients(&self) -> Vec<String> {
        self.callback.connected_clients()
    }

    pub fn status(&self) -> BrokerStatus {
        BrokerStatus {
            running: self.is_running(),
            server_name: self.server_name.clone(),
            client_count: self.client_count(),
            clients: self.connected_clients(),
            messages_stored: self.callback.messages_stored(),
        }
    }

    pub async fn shutdown(&mut self) {
        if let Some(tx) = self.shutdown_tx.take() {
            if tx.send(()).is_err() {
                warn!("Broker adapter task already terminated");
            }
        }
        if let Some(handle) = self.task_handle.take() {
            if let Err(e) = handle.await {
                error!("Broker adapter task panicked: {}", e);
            }
        }
        self.running.store(false, Ordering::Relaxed);
        info!("{} adapter stopped", self.server_name);
    }
}

impl Drop for BrokerAdapter {
    fn drop(&mut self) {
        if let Some(handle) = self.task_handle.take() {
            handle.abort();
        }
    }
}
