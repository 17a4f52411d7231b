//! Connection actor and client handle for the outbound MQTT session
//!
//! [`MqttClient`] is the handle the gateway holds. Everything it does is turned
//! into a [`ControlEvent`] for the connection actor, which owns the rumqttc
//! client, the backoff state and the reconnect guard. Each established session
//! gets its own poll task that drives the rumqttc `EventLoop`, converts inbound
//! publishes into records and reports a lost connection back to the actor.
//!
//! The poll task stops at the first error instead of letting rumqttc reconnect
//! on its own; reconnecting is the actor's decision alone. Every session carries
//! a generation number so a late loss report from an old session is ignored.

use chrono::Utc;
use rumqttc::{AsyncClient, Event, EventLoop, Outgoing, Packet, QoS};
use std::sync::atomic::{AtomicU64, AtomicUsize, Ordering};
use std::sync::{Arc, RwLock};
use std::time::Duration;
use tokio::sync::{mpsc, oneshot, watch};
use tokio::task::JoinHandle;
use tokio::time::Instant;
use tracing::{debug, error, info, warn};

use super::config::{qos_from_level, MqttClientConfig};
use super::message_manager;
use super::reconnect::{Backoff, ReconnectGuard, LOSS_DEBOUNCE};
use super::{ConnectionState, MqttError};
use crate::persistence::RecordSink;
use crate::status::ClientStatus;

const CONTROL_CHANNEL_SIZE: usize = 64;
/// Capacity of rumqttc's request channel
const REQUEST_CHANNEL_CAP: usize = 100;
const DISCONNECT_GRACE: Duration = Duration::from_secs(2);
pub const SHUTDOWN_GRACE: Duration = Duration::from_secs(10);

#[derive(Debug)]
pub enum ControlEvent {
    Connect {
        respond: Option<oneshot::Sender<bool>>,
    },
    ConnectionLost {
        generation: u64,
        cause: String,
    },
    ReconnectDue,
    Publish {
        topic: String,
        payload: Vec<u8>,
        qos: QoS,
    },
    Shutdown {
        respond: oneshot::Sender<()>,
    },
}

/// Counters shared between the actor, the poll task and status readers
#[derive(Debug, Default)]
struct SessionShared {
    messages_received: AtomicU64,
    messages_published: AtomicU64,
    pending_deliveries: AtomicU64,
    subscribed_topics: AtomicUsize,
    client_id: RwLock<Option<String>>,
}

impl SessionShared {
    fn delivery_completed(&self) {
        let _ = self
            .pending_deliveries
            .fetch_update(Ordering::Relaxed, Ordering::Relaxed, |n| n.checked_sub(1));
    }

    fn reset_session(&self) {
        self.pending_deliveries.store(0, Ordering::Relaxed);
        self.subscribed_topics.store(0, Ordering::Relaxed);
    }

    fn set_client_id(&self, id: Option<String>) {
        *self
            .client_id
            .write()
            .unwrap_or_else(|poisoned| poisoned.into_inner()) = id;
    }

    fn client_id(&self) -> Option<String> {
        self.client_id
            .read()
            .unwrap_or_else(|poisoned| poisoned.into_inner())
            .clone()
    }
}

struct Session {
    client: AsyncClient,
    generation: u64,
    poll_task: JoinHandle<()>,
}

struct ConnectionManager {
    config: MqttClientConfig,
    sink: RecordSink,
    control_tx: mpsc::Sender<ControlEvent>,
    state_tx: watch::Sender<ConnectionState>,
    shared: Arc<SessionShared>,
    backoff: Backoff,
    guard: ReconnectGuard,
    generation: u64,
    session: Option<Session>,
    reconnect_timer: Option<JoinHandle<()>>,
}

impl ConnectionManager {
    fn new(
        config: MqttClientConfig,
        sink: RecordSink,
        control_tx: mpsc::Sender<ControlEvent>,
        state_tx: watch::Sender<ConnectionState>,
        shared: Arc<SessionShared>,
    ) -> Self {
        // A success always lands outside the loss debounce window of the
        // attempt that produced it.
        let backoff = Backoff::new(
            config.reconnect_delay().max(LOSS_DEBOUNCE),
            config.max_reconnect_delay(),
        );
        Self {
            config,
            sink,
            control_tx,
            state_tx,
            shared,
            backoff,
            guard: ReconnectGuard::default(),
            generation: 0,
            session: None,
            reconnect_timer: None,
        }
    }

    fn state(&self) -> ConnectionState {
        *self.state_tx.borrow()
    }

    fn set_state(&self, state: ConnectionState) {
        let previous = self.state_tx.send_replace(state);
        if previous != state {
            debug!("MQTT client state: {} -> {}", previous, state);
        }
    }

    async fn run(mut self, mut control_rx: mpsc::Receiver<ControlEvent>) {
        info!(
            "MQTT connection manager started for {}",
            self.config.broker_url
        );

        while let Some(event) = control_rx.recv().await {
            match event {
                ControlEvent::Connect { respond } => {
                    let connected = self.connect().await;
                    if let Some(tx) = respond {
                        let _ = tx.send(connected);
                    }
                }
                ControlEvent::ConnectionLost { generation, cause } => {
                    self.on_connection_lost(generation, &cause);
                }
                ControlEvent::ReconnectDue => self.on_reconnect_due().await,
                ControlEvent::Publish {
                    topic,
                    payload,
                    qos,
                } => self.publish(&topic, payload, qos),
                ControlEvent::Shutdown { respond } => {
                    self.shutdown().await;
                    let _ = respond.send(());
                    break;
                }
            }
        }

        debug!("MQTT connection manager stopped");
    }

    async fn connect(&mut self) -> bool {
        if self.session.is_some() && self.state() == ConnectionState::Connected {
            debug!("MQTT client already connected");
            return true;
        }

        self.close_session().await;
        self.set_state(ConnectionState::Connecting);
        self.generation += 1;
        let client_id = format!(
            "{}_{}",
            self.config.client_id,
            Utc::now().timestamp_millis()
        );
        info!(
            "Connecting to MQTT broker {} as {}",
            self.config.broker_url, client_id
        );

        match self.handshake(&client_id).await {
            Ok((client, eventloop)) => {
                let poll_task = tokio::spawn(poll_session(
                    eventloop,
                    self.generation,
                    self.sink.clone(),
                    self.shared.clone(),
                    self.control_tx.clone(),
                ));
                self.session = Some(Session {
                    client,
                    generation: self.generation,
                    poll_task,
                });
                self.shared.set_client_id(Some(client_id));
                self.backoff.reset();
                self.cancel_reconnect();
                self.set_state(ConnectionState::Connected);
                info!("Connected to MQTT broker {}", self.config.broker_url);

                self.subscribe_all().await;
                true
            }
            Err(e @ MqttError::InvalidBrokerUrl(_)) => {
                error!("Cannot connect to MQTT broker: {}", e);
                self.set_state(ConnectionState::Disconnected);
                false
            }
            Err(e) => {
                error!(
                    "Failed to connect to MQTT broker {} (client id {}): {}",
                    self.config.broker_url, client_id, e
                );
                self.schedule_reconnect(false);
                false
            }
        }
    }

    /// Opens the network connection and waits for CONNACK.
    async fn handshake(&self, client_id: &str) -> Result<(AsyncClient, EventLoop), MqttError> {
        let options = self.config.mqtt_options(client_id)?;
        let (client, mut eventloop) = AsyncClient::new(options, REQUEST_CHANNEL_CAP);

        let limit = self.config.connect_timeout();
        let wait_for_ack = async {
            loop {
                if let Event::Incoming(Packet::ConnAck(_)) = eventloop.poll().await? {
                    return Ok::<(), MqttError>(());
                }
            }
        };

        let outcome = tokio::time::timeout(limit, wait_for_ack).await;
        match outcome {
            Ok(Ok(())) => Ok((client, eventloop)),
            Ok(Err(e)) => Err(e),
            Err(_) => Err(MqttError::Timeout(limit)),
        }
    }

    async fn subscribe_all(&self) {
        let Some(session) = &self.session else {
            return;
        };
        if self.config.topics.is_empty() {
            warn!("No topics configured for subscription");
        }

        let mut subscribed = 0;
        for topic in &self.config.topics {
            match session
                .client
                .subscribe(topic.topic.as_str(), qos_from_level(topic.qos))
                .await
            {
                Ok(()) => {
                    subscribed += 1;
                    info!("Subscribed to {}", topic);
                }
                Err(e) => error!("Failed to subscribe to {}: {}", topic.topic, e),
            }
        }
        self.shared
            .subscribed_topics
            .store(subscribed, Ordering::Relaxed);
    }

    fn schedule_reconnect(&mut self, from_loss: bool) {
        if !self.config.auto_reconnect {
            info!("Auto-reconnect disabled, MQTT client stays disconnected");
            self.set_state(ConnectionState::Disconnected);
            return;
        }

        if !self.guard.try_schedule(Instant::now(), from_loss) {
            debug!("Reconnect already scheduled or requested too soon, skipping");
            // a pending timer still owns the next attempt
            let state = if self.guard.in_flight() {
                ConnectionState::ReconnectScheduled
            } else {
                ConnectionState::Disconnected
            };
            self.set_state(state);
            return;
        }

        let delay = self.backoff.next_delay();
        info!(
            "Scheduling reconnect to {} in {} ms",
            self.config.broker_url,
            delay.as_millis()
        );
        self.set_state(ConnectionState::ReconnectScheduled);

        let tx = self.control_tx.clone();
        self.reconnect_timer = Some(tokio::spawn(async move {
            tokio::time::sleep(delay).await;
            let _ = tx.send(ControlEvent::ReconnectDue).await;
        }));
    }

    /// Drops a pending reconnect timer and opens a fresh debounce window.
    fn cancel_reconnect(&mut self) {
        if let Some(timer) = self.reconnect_timer.take() {
            timer.abort();
        }
        self.guard.reset();
    }

    async fn on_reconnect_due(&mut self) {
        self.guard.release();
        self.reconnect_timer = None;
        if self.session.is_some() {
            debug!("Session already established, skipping scheduled reconnect");
            return;
        }
        self.connect().await;
    }

    fn on_connection_lost(&mut self, generation: u64, cause: &str) {
        let current = self.session.as_ref().map(|s| s.generation);
        if current != Some(generation) {
            debug!(
                "Ignoring connection loss of stale session {} ({})",
                generation, cause
            );
            return;
        }

        warn!("Connection to MQTT broker lost: {}", cause);
        if let Some(session) = self.session.take() {
            session.poll_task.abort();
        }
        self.shared.reset_session();
        self.set_state(ConnectionState::Disconnected);
        self.schedule_reconnect(true);
    }

    fn publish(&self, topic: &str, payload: Vec<u8>, qos: QoS) {
        let session = match &self.session {
            Some(session) if self.state() == ConnectionState::Connected => session,
            _ => {
                warn!("MQTT client not connected, cannot publish to {}", topic);
                return;
            }
        };

        match session.client.try_publish(topic, qos, false, payload) {
            Ok(()) => {
                self.shared
                    .messages_published
                    .fetch_add(1, Ordering::Relaxed);
                if qos != QoS::AtMostOnce {
                    self.shared
                        .pending_deliveries
                        .fetch_add(1, Ordering::Relaxed);
                }
                debug!("Published MQTT message to {}", topic);
            }
            Err(e) => error!("Failed to publish MQTT message to {}: {}", topic, e),
        }
    }

    /// Sends DISCONNECT and gives the poll task a moment to write it.
    async fn close_session(&mut self) {
        let Some(session) = self.session.take() else {
            return;
        };
        if let Err(e) = session.client.disconnect().await {
            debug!("Disconnect request not delivered: {}", e);
        }
        let mut poll_task = session.poll_task;
        if tokio::time::timeout(DISCONNECT_GRACE, &mut poll_task)
            .await
            .is_err()
        {
            poll_task.abort();
        }
        self.shared.reset_session();
    }

    async fn shutdown(&mut self) {
        info!("Shutting down MQTT client");
        self.cancel_reconnect();
        self.close_session().await;
        self.shared.set_client_id(None);
        self.set_state(ConnectionState::Disconnected);
        info!("MQTT client shut down");
    }
}

/// Drives one session's event loop until it fails or is disconnected.
async fn poll_session(
    mut eventloop: EventLoop,
    generation: u64,
    sink: RecordSink,
    shared: Arc<SessionShared>,
    control_tx: mpsc::Sender<ControlEvent>,
) {
    let cause = loop {
        match eventloop.poll().await {
            Ok(Event::Incoming(Packet::Publish(publish))) => {
                shared.messages_received.fetch_add(1, Ordering::Relaxed);
                message_manager::on_message_arrived(
                    &sink,
                    &publish.topic,
                    &publish.payload,
                    publish.qos,
                );
            }
            Ok(Event::Incoming(Packet::PubAck(_))) | Ok(Event::Incoming(Packet::PubComp(_))) => {
                shared.delivery_completed();
            }
            Ok(Event::Incoming(Packet::Disconnect)) => {
                break "broker closed the session".to_string();
            }
            Ok(Event::Outgoing(Outgoing::Disconnect)) => {
                debug!("Session {} disconnected", generation);
                return;
            }
            Ok(_) => {}
            Err(e) => break e.to_string(),
        }
    };

    let _ = control_tx
        .send(ControlEvent::ConnectionLost { generation, cause })
        .await;
}

/// Handle to the outbound MQTT session
pub struct MqttClient {
    config: MqttClientConfig,
    sink: RecordSink,
    shared: Arc<SessionShared>,
    state_rx: watch::Receiver<ConnectionState>,
    state_tx: Option<watch::Sender<ConnectionState>>,
    control_tx: Option<mpsc::Sender<ControlEvent>>,
    task_handle: Option<JoinHandle<()>>,
    startup_handle: Option<JoinHandle<()>>,
}

impl MqttClient {
    pub fn new(config: MqttClientConfig, sink: RecordSink) -> Self {
        let (state_tx, state_rx) = watch::channel(ConnectionState::Disconnected);
        Self {
            config,
            sink,
            shared: Arc::new(SessionShared::default()),
            state_rx,
            state_tx: Some(state_tx),
            control_tx: None,
            task_handle: None,
            startup_handle: None,
        }
    }

    /// Starts the connection actor and schedules the first connection attempt
    /// after the configured startup delay. No-op when disabled.
    pub fn initialize(&mut self) {
        if !self.config.enabled {
            info!("MQTT client is disabled");
            return;
        }
        let Some(state_tx) = self.state_tx.take() else {
            debug!("MQTT client already initialized");
            return;
        };

        info!("Initializing MQTT client: {:?}", self.config);
        let (control_tx, control_rx) = mpsc::channel(CONTROL_CHANNEL_SIZE);
        let manager = ConnectionManager::new(
            self.config.clone(),
            self.sink.clone(),
            control_tx.clone(),
            state_tx,
            self.shared.clone(),
        );
        self.task_handle = Some(tokio::spawn(manager.run(control_rx)));

        let delay = self.config.startup_delay();
        let startup_tx = control_tx.clone();
        self.startup_handle = Some(tokio::spawn(async move {
            tokio::time::sleep(delay).await;
            let _ = startup_tx.send(ControlEvent::Connect { respond: None }).await;
        }));

        self.control_tx = Some(control_tx);
    }

    /// Runs a connection attempt now and reports whether the client is
    /// connected afterwards.
    pub async fn connect(&self) -> bool {
        if !self.config.enabled {
            info!("MQTT client is disabled, cannot connect");
            return false;
        }
        let Some(control_tx) = &self.control_tx else {
            warn!("MQTT client not initialized, cannot connect");
            return false;
        };

        let (respond, response) = oneshot::channel();
        if control_tx
            .send(ControlEvent::Connect {
                respond: Some(respond),
            })
            .await
            .is_err()
        {
            error!("MQTT connection manager is not running");
            return false;
        }
        response.await.unwrap_or(false)
    }

    /// Fire-and-forget publish; dropped with a warning while disconnected.
    pub fn publish(&self, topic: &str, payload: impl Into<Vec<u8>>, qos: QoS) {
        if !self.is_connected() {
            warn!("MQTT client not connected, cannot publish to {}", topic);
            return;
        }
        let Some(control_tx) = &self.control_tx else {
            return;
        };
        let event = ControlEvent::Publish {
            topic: topic.to_string(),
            payload: payload.into(),
            qos,
        };
        if let Err(e) = control_tx.try_send(event) {
            warn!("Dropping publish to {}: {}", topic, e);
        }
    }

    pub fn state(&self) -> ConnectionState {
        *self.state_rx.borrow()
    }

    pub fn is_connected(&self) -> bool {
        self.state() == ConnectionState::Connected
    }

    pub fn status(&self) -> ClientStatus {
        let state = self.state();
        ClientStatus {
            state,
            connected: state == ConnectionState::Connected,
            broker_url: self.config.broker_url.clone(),
            client_id: self
                .shared
                .client_id()
                .unwrap_or_else(|| self.config.client_id.clone()),
            reconnecting: state == ConnectionState::ReconnectScheduled,
            subscribed_topics: self.shared.subscribed_topics.load(Ordering::Relaxed),
            pending_deliveries: self.shared.pending_deliveries.load(Ordering::Relaxed),
            messages_received: self.shared.messages_received.load(Ordering::Relaxed),
            messages_published: self.shared.messages_published.load(Ordering::Relaxed),
        }
    }

    /// Disconnects and stops the actor, forcing it down after [`SHUTDOWN_GRACE`].
    pub async fn shutdown(&mut self) {
        if let Some(startup) = self.startup_handle.take() {
            startup.abort();
        }

        if let Some(control_tx) = self.control_tx.take() {
            let (respond, done) = oneshot::channel();
            if control_tx
                .send(ControlEvent::Shutdown { respond })
                .await
                .is_ok()
                && tokio::time::timeout(SHUTDOWN_GRACE, done).await.is_err()
            {
                warn!("MQTT client did not shut down within {:?}", SHUTDOWN_GRACE);
            }
        }

        if let Some(mut handle) = self.task_handle.take() {
            if tokio::time::timeout(DISCONNECT_GRACE, &mut handle)
                .await
                .is_err()
            {
                warn!("Aborting MQTT connection manager");
                handle.abort();
            }
        }
    }
}

impl Drop for MqttClient {
    fn drop(&mut self) {
        if let Some(handle) = self.startup_handle.take() {
            handle.abort();
        }
        if let Some(handle) = self.task_handle.take() {
            handle.abort();
        }
    }
}
