// SPDX-License-Identifier: MPL-2.0
// This Source Code Form is subject to the terms of the Mozilla Public
// License, v. 2.0. If a copy of the MPL was not distributed with this
// file, You can obtain one at https://mozilla.org/MPL/2.0/.

//! MQTT broker connection shared by the router and the command correlator.
//!
//! The broker owns a registry mapping topic patterns to message handlers.
//! The registry is the single source of truth for subscriptions: entries are
//! written before the broker is asked to subscribe, and after every
//! reconnect the whole registry is replayed against the broker.
//!
//! # Examples
//!
//! ```no_run
//! use lockhub::protocol::{MqttBroker, message_handler};
//!
//! # async fn example() -> lockhub::Result<()> {
//! let broker = MqttBroker::builder()
//!     .url("mqtt://192.168.1.50:1883")?
//!     .credentials("backend", "secret")
//!     .build()
//!     .await?;
//!
//! broker
//!     .subscribe(
//!         "device/+/heartbeat",
//!         message_handler(|msg| async move {
//!             println!("{} bytes on {}", msg.payload.len(), msg.topic);
//!         }),
//!     )
//!     .await?;
//!
//! broker.publish("device/lock-7/command", r#"{"command":"reboot"}"#).await?;
//! broker.disconnect().await?;
//! # Ok(())
//! # }
//! ```

use std::collections::HashMap;
use std::future::Future;
use std::pin::Pin;
use std::sync::Arc;
use std::sync::atomic::{AtomicBool, AtomicU64, Ordering};
use std::time::Duration;

use parking_lot::RwLock;
use rumqttc::{AsyncClient, EventLoop, MqttOptions, QoS};
use tokio::sync::{Semaphore, TryAcquireError, oneshot};
use tokio::task::JoinHandle;
use tokio_util::sync::CancellationToken;

use crate::error::TransportError;

use super::link::{BrokerLink, Payload};
use super::topics::topic_matches;

/// Global counter for generating unique client IDs.
static BROKER_CLIENT_ID_COUNTER: AtomicU64 = AtomicU64::new(0);

/// An inbound publish handed to a [`MessageHandler`].
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct IncomingMessage {
    /// The concrete topic the message arrived on.
    pub topic: String,
    /// The raw payload.
    pub payload: Vec<u8>,
}

/// Future returned by a [`MessageHandler`].
pub type HandlerFuture = Pin<Box<dyn Future<Output = ()> + Send + 'static>>;

/// Handler invoked once per inbound message, each call on its own task.
pub type MessageHandler = Arc<dyn Fn(IncomingMessage) -> HandlerFuture + Send + Sync>;

/// Wraps an async closure as a [`MessageHandler`].
pub fn message_handler<F, Fut>(handler: F) -> MessageHandler
where
    F: Fn(IncomingMessage) -> Fut + Send + Sync + 'static,
    Fut: Future<Output = ()> + Send + 'static,
{
    Arc::new(move |msg| Box::pin(handler(msg)))
}

/// Configuration for an MQTT broker connection.
#[derive(Debug, Clone)]
pub struct MqttBrokerConfig {
    host: String,
    port: u16,
    client_id: Option<String>,
    credentials: Option<(String, String)>,
    keep_alive: Duration,
    clean_session: bool,
    auto_reconnect: bool,
    reconnect_delay: Duration,
    qos: QoS,
    connection_timeout: Duration,
    max_in_flight: usize,
}

impl Default for MqttBrokerConfig {
    fn default() -> Self {
        Self {
            host: String::new(),
            port: 1883,
            client_id: None,
            credentials: None,
            keep_alive: Duration::from_secs(30),
            clean_session: true,
            auto_reconnect: true,
            reconnect_delay: Duration::from_secs(5),
            qos: QoS::AtLeastOnce,
            connection_timeout: Duration::from_secs(10),
            max_in_flight: 256,
        }
    }
}

impl MqttBrokerConfig {
    /// Returns the broker host.
    #[must_use]
    pub fn host(&self) -> &str {
        &self.host
    }

    /// Returns the broker port.
    #[must_use]
    pub fn port(&self) -> u16 {
        self.port
    }

    /// Returns the default delivery-quality level.
    #[must_use]
    pub fn qos(&self) -> QoS {
        self.qos
    }

    /// Returns whether the event loop reconnects after a connection loss.
    #[must_use]
    pub fn auto_reconnect(&self) -> bool {
        self.auto_reconnect
    }

    /// Returns the maximum number of concurrently running message handlers.
    #[must_use]
    pub fn max_in_flight(&self) -> usize {
        self.max_in_flight
    }
}

/// A registry entry.
struct Subscription {
    qos: QoS,
    handler: MessageHandler,
}

/// An MQTT broker connection.
///
/// `MqttBroker` is cheaply cloneable (via `Arc`); every clone shares the same
/// connection and subscription registry.
#[derive(Clone)]
pub struct MqttBroker {
    inner: Arc<MqttBrokerInner>,
}

struct MqttBrokerInner {
    /// Outbound side of the connection.
    link: Arc<dyn BrokerLink>,
    /// Topic pattern to handler. Never held across an `.await`.
    registry: RwLock<HashMap<String, Subscription>>,
    /// Configuration used for this connection.
    config: MqttBrokerConfig,
    /// Connection status.
    connected: AtomicBool,
    /// Bounds the number of running handler tasks.
    in_flight: Arc<Semaphore>,
    /// Stops the event loop.
    shutdown: CancellationToken,
}

impl MqttBroker {
    /// Creates a new builder for configuring an MQTT broker connection.
    #[must_use]
    pub fn builder() -> MqttBrokerBuilder {
        MqttBrokerBuilder::default()
    }

    /// Creates a broker over an already established link.
    ///
    /// No event loop is started: inbound messages must be fed through
    /// [`deliver`](Self::deliver) and reconnects signalled through
    /// [`handle_reconnect`](Self::handle_reconnect).
    #[must_use]
    pub fn from_link(link: Arc<dyn BrokerLink>, config: MqttBrokerConfig) -> Self {
        let broker = Self::new(link, config);
        broker.inner.connected.store(true, Ordering::Release);
        broker
    }

    fn new(link: Arc<dyn BrokerLink>, config: MqttBrokerConfig) -> Self {
        let in_flight = Arc::new(Semaphore::new(config.max_in_flight.max(1)));
        Self {
            inner: Arc::new(MqttBrokerInner {
                link,
                registry: RwLock::new(HashMap::new()),
                config,
                connected: AtomicBool::new(false),
                in_flight,
                shutdown: CancellationToken::new(),
            }),
        }
    }

    /// Returns whether the broker is currently connected.
    #[must_use]
    pub fn is_connected(&self) -> bool {
        self.inner.connected.load(Ordering::Acquire)
    }

    /// Returns the configuration this connection was built with.
    #[must_use]
    pub fn config(&self) -> &MqttBrokerConfig {
        &self.inner.config
    }

    /// Registers `handler` for `topic` and subscribes on the broker.
    ///
    /// The registry entry is written before the broker subscription is
    /// requested and is kept even if the request fails, so the next
    /// reconnect retries it.
    ///
    /// # Errors
    ///
    /// Returns [`TransportError::Subscribe`] if the broker request fails.
    pub async fn subscribe(
        &self,
        topic: impl Into<String>,
        handler: MessageHandler,
    ) -> Result<(), TransportError> {
        let topic = topic.into();
        let qos = self.inner.config.qos;
        self.register(topic.clone(), qos, handler);

        self.inner.link.subscribe(&topic, qos).await.inspect_err(|e| {
            tracing::warn!(topic = %topic, error = %e, "Subscription request failed, kept for retry");
        })?;

        tracing::debug!(topic = %topic, "Subscribed");
        Ok(())
    }

    /// Registers and subscribes several topics.
    ///
    /// Every entry is registered first; then each subscription is requested
    /// independently.
    ///
    /// # Errors
    ///
    /// Returns the first [`TransportError::Subscribe`] after all requests
    /// have been attempted.
    pub async fn subscribe_multiple<I, S>(&self, topics: I) -> Result<(), TransportError>
    where
        I: IntoIterator<Item = (S, MessageHandler)>,
        S: Into<String>,
    {
        let qos = self.inner.config.qos;
        let topics: Vec<String> = topics
            .into_iter()
            .map(|(topic, handler)| {
                let topic = topic.into();
                self.register(topic.clone(), qos, handler);
                topic
            })
            .collect();

        let mut first_error = None;
        for topic in &topics {
            match self.inner.link.subscribe(topic, qos).await {
                Ok(()) => tracing::debug!(topic = %topic, "Subscribed"),
                Err(e) => {
                    tracing::warn!(topic = %topic, error = %e, "Subscription request failed, kept for retry");
                    first_error.get_or_insert(e);
                }
            }
        }

        first_error.map_or(Ok(()), Err)
    }

    fn register(&self, topic: String, qos: QoS, handler: MessageHandler) {
        self.inner
            .registry
            .write()
            .insert(topic, Subscription { qos, handler });
    }

    /// Unsubscribes on the broker, then drops the registry entries.
    ///
    /// The registry is pruned whether or not the broker requests succeed.
    ///
    /// # Errors
    ///
    /// Returns the first [`TransportError::Unsubscribe`] encountered.
    pub async fn unsubscribe<S: AsRef<str>>(&self, topics: &[S]) -> Result<(), TransportError> {
        let mut first_error = None;
        for topic in topics {
            let topic = topic.as_ref();
            if let Err(e) = self.inner.link.unsubscribe(topic).await {
                tracing::warn!(topic = %topic, error = %e, "Unsubscribe request failed");
                first_error.get_or_insert(e);
            }
        }

        {
            let mut registry = self.inner.registry.write();
            for topic in topics {
                registry.remove(topic.as_ref());
            }
        }

        tracing::debug!(count = topics.len(), "Unsubscribed");
        first_error.map_or(Ok(()), Err)
    }

    /// Publishes a message with the default delivery-quality level.
    ///
    /// # Errors
    ///
    /// Returns [`TransportError::Publish`] if the publish request fails.
    pub async fn publish(
        &self,
        topic: &str,
        payload: impl Into<Payload>,
    ) -> Result<(), TransportError> {
        self.publish_inner(topic, payload.into(), false).await
    }

    /// Publishes a retained message with the default delivery-quality level.
    ///
    /// # Errors
    ///
    /// Returns [`TransportError::Publish`] if the publish request fails.
    pub async fn publish_retained(
        &self,
        topic: &str,
        payload: impl Into<Payload>,
    ) -> Result<(), TransportError> {
        self.publish_inner(topic, payload.into(), true).await
    }

    async fn publish_inner(
        &self,
        topic: &str,
        payload: Payload,
        retain: bool,
    ) -> Result<(), TransportError> {
        let bytes = payload.into_bytes();
        tracing::debug!(topic = %topic, retain, bytes = bytes.len(), "Publishing");
        self.inner
            .link
            .publish(topic, self.inner.config.qos, retain, bytes)
            .await
    }

    /// Publishes a message, giving up when `cancel` fires first.
    ///
    /// The publish runs on its own task; if cancellation wins it may still
    /// complete later, unobserved.
    ///
    /// # Errors
    ///
    /// Returns [`TransportError::Cancelled`] if `cancel` fires first, or
    /// [`TransportError::Publish`] if the publish request fails.
    pub async fn publish_with_cancel(
        &self,
        cancel: &CancellationToken,
        topic: &str,
        payload: impl Into<Payload>,
    ) -> Result<(), TransportError> {
        if cancel.is_cancelled() {
            return Err(TransportError::Cancelled);
        }

        let broker = self.clone();
        let owned_topic = topic.to_string();
        let payload = payload.into();
        let mut task =
            tokio::spawn(async move { broker.publish_inner(&owned_topic, payload, false).await });

        tokio::select! {
            biased;
            () = cancel.cancelled() => {
                tracing::debug!(topic = %topic, "Publish abandoned by caller");
                Err(TransportError::Cancelled)
            }
            joined = &mut task => joined.map_err(|e| TransportError::Publish {
                topic: topic.to_string(),
                reason: e.to_string(),
            })?,
        }
    }

    /// Dispatches an inbound message to every handler whose pattern matches.
    ///
    /// Each matching handler runs on its own task; at most `max_in_flight`
    /// tasks run at once. This never waits: when every slot is taken the
    /// message is dropped for that handler with a warning, so the event
    /// loop keeps polling. Returns the handles of the spawned tasks.
    pub fn deliver(&self, topic: &str, payload: Vec<u8>) -> Vec<JoinHandle<()>> {
        let handlers: Vec<MessageHandler> = {
            let registry = self.inner.registry.read();
            registry
                .iter()
                .filter(|(pattern, _)| topic_matches(pattern, topic))
                .map(|(_, sub)| Arc::clone(&sub.handler))
                .collect()
        };

        if handlers.is_empty() {
            tracing::trace!(topic = %topic, "No handler registered for topic");
            return Vec::new();
        }

        let mut tasks = Vec::with_capacity(handlers.len());
        for handler in handlers {
            let permit = match Arc::clone(&self.inner.in_flight).try_acquire_owned() {
                Ok(permit) => permit,
                Err(TryAcquireError::NoPermits) => {
                    tracing::warn!(topic = %topic, "Handler capacity exhausted, dropping message");
                    continue;
                }
                Err(TryAcquireError::Closed) => break,
            };
            let msg = IncomingMessage {
                topic: topic.to_string(),
                payload: payload.clone(),
            };
            tasks.push(tokio::spawn(async move {
                handler(msg).await;
                drop(permit);
            }));
        }
        tasks
    }

    /// Replays the whole registry against the broker.
    ///
    /// Each topic is resubscribed independently; failures are logged and do
    /// not stop the remaining topics. Returns the topics that failed.
    pub async fn handle_reconnect(&self) -> Vec<String> {
        let snapshot: Vec<(String, QoS)> = self
            .inner
            .registry
            .read()
            .iter()
            .map(|(topic, sub)| (topic.clone(), sub.qos))
            .collect();

        let mut failed = Vec::new();
        for (topic, qos) in snapshot {
            if let Err(e) = self.inner.link.subscribe(&topic, qos).await {
                tracing::warn!(topic = %topic, error = %e, "Resubscribe failed");
                failed.push(topic);
            }
        }

        tracing::info!(failed = failed.len(), "Resubscribed registry after connect");
        failed
    }

    fn on_connection_lost(&self, reason: &str) {
        self.inner.connected.store(false, Ordering::Release);
        tracing::warn!(
            host = %self.inner.config.host,
            reason = %reason,
            "MQTT connection lost"
        );
    }

    /// Waits out the reconnect delay. Returns `false` if shut down meanwhile.
    async fn on_reconnecting(&self) -> bool {
        let delay = self.inner.config.reconnect_delay;
        tracing::info!(
            host = %self.inner.config.host,
            delay_ms = u64::try_from(delay.as_millis()).unwrap_or(u64::MAX),
            "Reconnecting to MQTT broker"
        );

        tokio::select! {
            () = self.inner.shutdown.cancelled() => false,
            () = tokio::time::sleep(delay) => true,
        }
    }

    /// Disconnects from the broker.
    ///
    /// Clears the registry and stops the event loop.
    ///
    /// # Errors
    ///
    /// Returns error if the disconnect request fails.
    pub async fn disconnect(&self) -> Result<(), TransportError> {
        tracing::info!(
            host = %self.inner.config.host,
            port = %self.inner.config.port,
            "Disconnecting from MQTT broker"
        );

        self.inner.registry.write().clear();
        let result = self.inner.link.disconnect().await;
        self.inner.shutdown.cancel();
        self.inner.connected.store(false, Ordering::Release);
        result
    }

    /// Returns the number of registered topic patterns.
    #[must_use]
    pub fn subscription_count(&self) -> usize {
        self.inner.registry.read().len()
    }

    /// Returns the registered topic patterns.
    #[must_use]
    pub fn subscribed_topics(&self) -> Vec<String> {
        self.inner.registry.read().keys().cloned().collect()
    }
}

impl std::fmt::Debug for MqttBroker {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("MqttBroker")
            .field("host", &self.inner.config.host)
            .field("port", &self.inner.config.port)
            .field("connected", &self.is_connected())
            .field("subscriptions", &self.subscription_count())
            .finish()
    }
}

/// Builder for creating an MQTT broker connection.
///
/// # Examples
///
/// ```no_run
/// use lockhub::protocol::MqttBroker;
/// use std::time::Duration;
///
/// # async fn example() -> lockhub::Result<()> {
/// let broker = MqttBroker::builder()
///     .host("192.168.1.50")
///     .port(1883)
///     .credentials("user", "password")
///     .keep_alive(Duration::from_secs(60))
///     .reconnect_delay(Duration::from_secs(2))
///     .build()
///     .await?;
/// # Ok(())
/// # }
/// ```
#[derive(Debug, Default)]
pub struct MqttBrokerBuilder {
    config: MqttBrokerConfig,
}

impl MqttBrokerBuilder {
    /// Sets the broker host address.
    #[must_use]
    pub fn host(mut self, host: impl Into<String>) -> Self {
        self.config.host = host.into();
        self
    }

    /// Sets the broker port (default: 1883).
    #[must_use]
    pub fn port(mut self, port: u16) -> Self {
        self.config.port = port;
        self
    }

    /// Sets host and port from a URL such as `mqtt://broker:1883`.
    ///
    /// # Errors
    ///
    /// Returns [`TransportError::InvalidAddress`] if the port is not a number.
    pub fn url(mut self, url: &str) -> Result<Self, TransportError> {
        let (host, port) = parse_mqtt_url(url)?;
        self.config.host = host;
        self.config.port = port;
        Ok(self)
    }

    /// Sets a fixed client id instead of a generated one.
    #[must_use]
    pub fn client_id(mut self, id: impl Into<String>) -> Self {
        self.config.client_id = Some(id.into());
        self
    }

    /// Sets authentication credentials.
    #[must_use]
    pub fn credentials(mut self, username: impl Into<String>, password: impl Into<String>) -> Self {
        self.config.credentials = Some((username.into(), password.into()));
        self
    }

    /// Sets the keep-alive interval (default: 30 seconds).
    #[must_use]
    pub fn keep_alive(mut self, duration: Duration) -> Self {
        self.config.keep_alive = duration;
        self
    }

    /// Sets the clean-session flag (default: true).
    #[must_use]
    pub fn clean_session(mut self, clean: bool) -> Self {
        self.config.clean_session = clean;
        self
    }

    /// Enables or disables reconnecting after a connection loss (default: true).
    #[must_use]
    pub fn auto_reconnect(mut self, enabled: bool) -> Self {
        self.config.auto_reconnect = enabled;
        self
    }

    /// Sets the pause between reconnect attempts (default: 5 seconds).
    #[must_use]
    pub fn reconnect_delay(mut self, delay: Duration) -> Self {
        self.config.reconnect_delay = delay;
        self
    }

    /// Sets the default delivery-quality level (default: at-least-once).
    #[must_use]
    pub fn qos(mut self, qos: QoS) -> Self {
        self.config.qos = qos;
        self
    }

    /// Sets the connection timeout (default: 10 seconds).
    #[must_use]
    pub fn connection_timeout(mut self, duration: Duration) -> Self {
        self.config.connection_timeout = duration;
        self
    }

    /// Caps concurrently running message handlers (default: 256).
    #[must_use]
    pub fn max_in_flight(mut self, max: usize) -> Self {
        self.config.max_in_flight = max;
        self
    }

    /// Returns the configuration assembled so far.
    #[must_use]
    pub fn into_config(self) -> MqttBrokerConfig {
        self.config
    }

    /// Builds and connects to the MQTT broker.
    ///
    /// # Errors
    ///
    /// Returns error if:
    /// - Host is not set
    /// - The handshake fails
    /// - The handshake times out
    pub async fn build(self) -> Result<MqttBroker, TransportError> {
        connect(self.config).await
    }
}

/// Connects to the broker described by `config`.
///
/// # Errors
///
/// Returns [`TransportError::InvalidAddress`] without a host and
/// [`TransportError::Connect`] if the handshake fails or times out.
pub async fn connect(config: MqttBrokerConfig) -> Result<MqttBroker, TransportError> {
    if config.host.is_empty() {
        return Err(TransportError::InvalidAddress(
            "MQTT broker host is required".to_string(),
        ));
    }

    let client_id = config.client_id.clone().unwrap_or_else(|| {
        let counter = BROKER_CLIENT_ID_COUNTER.fetch_add(1, Ordering::Relaxed);
        format!("lockhub_{}_{}", std::process::id(), counter)
    });

    let mut mqtt_options = MqttOptions::new(&client_id, &config.host, config.port);
    mqtt_options.set_keep_alive(config.keep_alive);
    mqtt_options.set_clean_session(config.clean_session);

    if let Some((ref username, ref password)) = config.credentials {
        mqtt_options.set_credentials(username, password);
    }

    let (client, event_loop) = AsyncClient::new(mqtt_options, 64);
    let timeout = config.connection_timeout;
    let broker = MqttBroker::new(Arc::new(client), config);

    let (connack_tx, connack_rx) = oneshot::channel();
    tokio::spawn(run_event_loop(event_loop, broker.clone(), connack_tx));

    match tokio::time::timeout(timeout, connack_rx).await {
        Ok(Ok(Ok(()))) => {
            tracing::info!(
                host = %broker.inner.config.host,
                port = %broker.inner.config.port,
                client_id = %client_id,
                "Connected to MQTT broker"
            );
            Ok(broker)
        }
        Ok(Ok(Err(reason))) => {
            broker.inner.shutdown.cancel();
            Err(TransportError::Connect(reason))
        }
        Ok(Err(_)) => {
            broker.inner.shutdown.cancel();
            Err(TransportError::Connect(
                "MQTT event loop terminated unexpectedly".to_string(),
            ))
        }
        Err(_) => {
            broker.inner.shutdown.cancel();
            Err(TransportError::Connect(format!(
                "MQTT connection timeout after {}s",
                timeout.as_secs()
            )))
        }
    }
}

/// Drives the `rumqttc` event loop until shutdown.
///
/// Errors before the first `ConnAck` are handshake failures and end the
/// loop; later errors go through the connection-lost and reconnecting
/// handlers, and the next poll reconnects.
async fn run_event_loop(
    mut event_loop: EventLoop,
    broker: MqttBroker,
    connack_tx: oneshot::Sender<Result<(), String>>,
) {
    use rumqttc::{Event, Outgoing, Packet};

    let mut connack_tx = Some(connack_tx);

    loop {
        match event_loop.poll().await {
            Ok(Event::Incoming(Packet::ConnAck(connack))) => {
                tracing::debug!(?connack, "MQTT broker connected");
                broker.inner.connected.store(true, Ordering::Release);
                if let Some(tx) = connack_tx.take() {
                    let _ = tx.send(Ok(()));
                }
                // Subscribe requests are drained by this loop, so replay on
                // a separate task.
                let replay = broker.clone();
                tokio::spawn(async move {
                    replay.handle_reconnect().await;
                });
            }
            Ok(Event::Incoming(Packet::SubAck(suback))) => {
                tracing::trace!(?suback, "MQTT subscription acknowledged");
            }
            Ok(Event::Incoming(Packet::Publish(publish))) => {
                tracing::trace!(
                    topic = %publish.topic,
                    bytes = publish.payload.len(),
                    "MQTT message received"
                );
                broker.deliver(&publish.topic, publish.payload.to_vec());
            }
            Ok(Event::Incoming(Packet::Disconnect)) => {
                broker.on_connection_lost("broker sent disconnect");
            }
            Ok(Event::Outgoing(Outgoing::Disconnect)) => {
                tracing::info!("MQTT broker disconnected");
                break;
            }
            Ok(_) => {}
            Err(e) => {
                if let Some(tx) = connack_tx.take() {
                    let _ = tx.send(Err(e.to_string()));
                    break;
                }
                if broker.inner.shutdown.is_cancelled() {
                    break;
                }
                broker.on_connection_lost(&e.to_string());
                if !broker.inner.config.auto_reconnect || !broker.on_reconnecting().await {
                    break;
                }
            }
        }
    }

    broker.inner.connected.store(false, Ordering::Release);
    tracing::debug!("MQTT event loop stopped");
}

/// Parses an MQTT URL into host and port.
fn parse_mqtt_url(url: &str) -> Result<(String, u16), TransportError> {
    let url = url
        .strip_prefix("mqtt://")
        .or_else(|| url.strip_prefix("tcp://"))
        .unwrap_or(url);

    let (host, port) = if let Some((h, p)) = url.rsplit_once(':') {
        let port = p
            .parse()
            .map_err(|_| TransportError::InvalidAddress(format!("Invalid port: {p}")))?;
        (h.to_string(), port)
    } else {
        (url.to_string(), 1883)
    };

    Ok((host, port))
}
