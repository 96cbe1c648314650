// SPDX-License-Identifier: MPL-2.0
// This Source Code Form is subject to the terms of the Mozilla Public
// License, v. 2.0. If a copy of the MPL was not distributed with this
// file, You can obtain one at https://mozilla.org/MPL/2.0/.

//! Routing of device reports to a [`DeviceHandler`].
//!
//! # Architecture
//!
//! ```text
//! MQTT Message: device/lock-0042/heartbeat → {"battery": 81}
//!                     ↓
//!           MqttBroker spawns one task
//!                     ↓
//!             TopicRouter.route()
//!                     ↓
//!     decode: device id "lock-0042", kind heartbeat
//!                     ↓
//!   handler.on_heartbeat() bounded by dispatch timeout
//! ```
//!
//! Nothing that goes wrong here reaches the transport: undecodable
//! messages are dropped, handler failures and timeouts are logged.

use std::sync::{Arc, Weak};
use std::time::Duration;

use async_trait::async_trait;
use parking_lot::Mutex;
use tokio_util::sync::CancellationToken;

use crate::error::{HandlerError, TransportError};

use super::envelope::{
    CommandAck, EventReport, Heartbeat, InboundMessage, InboundPayload, StatusReport,
};
use super::mqtt_broker::{MessageHandler, MqttBroker, message_handler};
use super::topics::REPORT_PATTERNS;

/// Receiver of decoded device reports.
#[async_trait]
pub trait DeviceHandler: Send + Sync {
    /// Handles a heartbeat.
    async fn on_heartbeat(&self, device_id: &str, heartbeat: Heartbeat) -> Result<(), HandlerError>;

    /// Handles a status snapshot.
    async fn on_status(&self, device_id: &str, status: StatusReport) -> Result<(), HandlerError>;

    /// Handles a device event.
    async fn on_event(&self, device_id: &str, event: EventReport) -> Result<(), HandlerError>;

    /// Handles a command acknowledgement.
    async fn on_ack(&self, device_id: &str, ack: CommandAck) -> Result<(), HandlerError>;
}

/// Router settings.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct RouterConfig {
    /// Upper bound for a single handler call.
    pub dispatch_timeout: Duration,
}

impl Default for RouterConfig {
    fn default() -> Self {
        Self {
            dispatch_timeout: Duration::from_secs(5),
        }
    }
}

/// What happened to a routed message.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum RouteOutcome {
    /// The handler completed successfully.
    Dispatched,
    /// The topic or payload could not be decoded.
    Dropped,
    /// The handler returned an error.
    Failed,
    /// The handler exceeded the dispatch timeout.
    TimedOut,
    /// The router was stopped while the handler ran.
    Cancelled,
}

/// Subscribes to device report topics and dispatches them to a handler.
#[derive(Clone)]
pub struct TopicRouter {
    inner: Arc<RouterInner>,
}

struct RouterInner {
    broker: MqttBroker,
    handler: Arc<dyn DeviceHandler>,
    config: RouterConfig,
    /// Parent of every dispatch; replaced on each start.
    cancel: Mutex<CancellationToken>,
}

impl TopicRouter {
    /// Creates a router with the default dispatch timeout.
    #[must_use]
    pub fn new(broker: MqttBroker, handler: Arc<dyn DeviceHandler>) -> Self {
        Self::with_config(broker, handler, RouterConfig::default())
    }

    /// Creates a router with explicit settings.
    #[must_use]
    pub fn with_config(
        broker: MqttBroker,
        handler: Arc<dyn DeviceHandler>,
        config: RouterConfig,
    ) -> Self {
        Self {
            inner: Arc::new(RouterInner {
                broker,
                handler,
                config,
                cancel: Mutex::new(CancellationToken::new()),
            }),
        }
    }

    /// Returns the router settings.
    #[must_use]
    pub fn config(&self) -> RouterConfig {
        self.inner.config
    }

    /// Subscribes to the four device report patterns.
    ///
    /// Dispatches are children of `parent`: cancelling it, or calling
    /// [`stop`](Self::stop), abandons in-flight handler calls.
    ///
    /// # Errors
    ///
    /// Returns the first subscription failure. Failed patterns stay
    /// registered and are retried on reconnect.
    pub async fn start(&self, parent: &CancellationToken) -> Result<(), TransportError> {
        *self.inner.cancel.lock() = parent.child_token();

        let handler = self.message_handler();
        self.inner
            .broker
            .subscribe_multiple(REPORT_PATTERNS.map(|pattern| (pattern, Arc::clone(&handler))))
            .await?;

        tracing::info!(patterns = ?REPORT_PATTERNS, "Device report routing started");
        Ok(())
    }

    /// Unsubscribes from the report patterns and cancels in-flight dispatches.
    ///
    /// # Errors
    ///
    /// Returns the first unsubscribe failure; the patterns are removed from
    /// the registry regardless.
    pub async fn stop(&self) -> Result<(), TransportError> {
        self.inner.cancel.lock().cancel();
        self.inner.broker.unsubscribe(&REPORT_PATTERNS).await?;
        tracing::info!("Device report routing stopped");
        Ok(())
    }

    fn message_handler(&self) -> MessageHandler {
        let router: Weak<RouterInner> = Arc::downgrade(&self.inner);
        message_handler(move |msg| {
            let router = router.upgrade().map(|inner| TopicRouter { inner });
            async move {
                if let Some(router) = router {
                    router.route(&msg.topic, &msg.payload).await;
                }
            }
        })
    }

    /// Decodes one message and dispatches it to the handler.
    pub async fn route(&self, topic: &str, payload: &[u8]) -> RouteOutcome {
        let message = match InboundMessage::decode(topic, payload) {
            Ok(message) => message,
            Err(e) => {
                tracing::warn!(topic = %topic, error = %e, "Dropping undecodable device report");
                return RouteOutcome::Dropped;
            }
        };

        let device_id = message.device_id.clone();
        let kind = message.kind();
        let cancel = self.inner.cancel.lock().clone();
        let timeout = self.inner.config.dispatch_timeout;
        let handled = dispatch(self.inner.handler.as_ref(), message);

        let result = tokio::select! {
            biased;
            () = cancel.cancelled() => {
                tracing::debug!(device = %device_id, %kind, "Dispatch abandoned, router stopped");
                return RouteOutcome::Cancelled;
            }
            result = tokio::time::timeout(timeout, handled) => result,
        };

        match result {
            Ok(Ok(())) => {
                tracing::trace!(device = %device_id, %kind, "Device report handled");
                RouteOutcome::Dispatched
            }
            Ok(Err(e)) => {
                tracing::warn!(device = %device_id, %kind, error = %e, "Device report handler failed");
                RouteOutcome::Failed
            }
            Err(_) => {
                tracing::warn!(
                    device = %device_id,
                    %kind,
                    timeout_ms = u64::try_from(timeout.as_millis()).unwrap_or(u64::MAX),
                    "Device report handler timed out"
                );
                RouteOutcome::TimedOut
            }
        }
    }
}

impl std::fmt::Debug for TopicRouter {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("TopicRouter")
            .field("broker", &self.inner.broker)
            .field("config", &self.inner.config)
            .finish_non_exhaustive()
    }
}

async fn dispatch(handler: &dyn DeviceHandler, message: InboundMessage) -> Result<(), HandlerError> {
    let InboundMessage { device_id, payload } = message;
    match payload {
        InboundPayload::Heartbeat(heartbeat) => handler.on_heartbeat(&device_id, heartbeat).await,
        InboundPayload::Status(status) => handler.on_status(&device_id, status).await,
        InboundPayload::Event(event) => handler.on_event(&device_id, event).await,
        InboundPayload::Ack(ack) => handler.on_ack(&device_id, ack).await,
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::protocol::MqttBrokerConfig;
    use crate::testing::RecordingLink;

    /// Records every call; optionally fails or stalls.
    #[derive(Default)]
    struct StubHandler {
        calls: Mutex<Vec<(String, &'static str)>>,
        fail: bool,
        stall: Option<Duration>,
    }

    impl StubHandler {
        fn calls(&self) -> Vec<(String, &'static str)> {
            self.calls.lock().clone()
        }

        async fn record(&self, device_id: &str, kind: &'static str) -> Result<(), HandlerError> {
            self.calls.lock().push((device_id.to_string(), kind));
            if let Some(stall) = self.stall {
                tokio::time::sleep(stall).await;
            }
            if self.fail {
                return Err(HandlerError::UnknownDevice(device_id.to_string()));
            }
            Ok(())
        }
    }

    #[async_trait]
    impl DeviceHandler for StubHandler {
        async fn on_heartbeat(&self, device_id: &str, _: Heartbeat) -> Result<(), HandlerError> {
            self.record(device_id, "heartbeat").await
        }

        async fn on_status(&self, device_id: &str, _: StatusReport) -> Result<(), HandlerError> {
            self.record(device_id, "status").await
        }

        async fn on_event(&self, device_id: &str, _: EventReport) -> Result<(), HandlerError> {
            self.record(device_id, "event").await
        }

        async fn on_ack(&self, device_id: &str, _: CommandAck) -> Result<(), HandlerError> {
            self.record(device_id, "ack").await
        }
    }

    fn router_with(handler: &Arc<StubHandler>) -> (TopicRouter, Arc<RecordingLink>) {
        let link = Arc::new(RecordingLink::new());
        let broker = MqttBroker::from_link(link.clone(), MqttBrokerConfig::default());
        (TopicRouter::new(broker, handler.clone()), link)
    }

    #[tokio::test]
    async fn routes_each_kind_to_its_method() {
        let handler = Arc::new(StubHandler::default());
        let (router, _) = router_with(&handler);

        assert_eq!(
            router.route("device/lock-7/heartbeat", br#"{"battery":50}"#).await,
            RouteOutcome::Dispatched
        );
        router
            .route(
                "device/lock-7/status",
                br#"{"online_status":"online","lock_status":"locked","status":"idle","available_slots":1}"#,
            )
            .await;
        router.route("device/lock-8/event", br#"{"type":"locked"}"#).await;
        router
            .route("device/lock-8/ack", br#"{"command_id":"c-1","success":false}"#)
            .await;

        assert_eq!(
            handler.calls(),
            vec![
                ("lock-7".to_string(), "heartbeat"),
                ("lock-7".to_string(), "status"),
                ("lock-8".to_string(), "event"),
                ("lock-8".to_string(), "ack"),
            ]
        );
    }

    #[tokio::test]
    async fn drops_short_topics() {
        let handler = Arc::new(StubHandler::default());
        let (router, _) = router_with(&handler);

        assert_eq!(router.route("device", b"{}").await, RouteOutcome::Dropped);
        assert!(handler.calls().is_empty());
    }

    #[tokio::test]
    async fn drops_malformed_payloads() {
        let handler = Arc::new(StubHandler::default());
        let (router, _) = router_with(&handler);

        assert_eq!(
            router.route("device/lock-7/ack", b"{truncated").await,
            RouteOutcome::Dropped
        );
        assert!(handler.calls().is_empty());
    }

    #[tokio::test]
    async fn handler_errors_are_contained() {
        let handler = Arc::new(StubHandler {
            fail: true,
            ..StubHandler::default()
        });
        let (router, _) = router_with(&handler);

        assert_eq!(
            router.route("device/lock-7/event", br#"{"type":"alarm"}"#).await,
            RouteOutcome::Failed
        );
    }

    #[tokio::test(start_paused = true)]
    async fn slow_handlers_are_cut_off() {
        let handler = Arc::new(StubHandler {
            stall: Some(Duration::from_secs(60)),
            ..StubHandler::default()
        });
        let (router, _) = router_with(&handler);

        let started = tokio::time::Instant::now();
        let outcome = router.route("device/lock-7/heartbeat", b"{}").await;

        assert_eq!(outcome, RouteOutcome::TimedOut);
        assert_eq!(started.elapsed(), Duration::from_secs(5));
    }

    #[tokio::test]
    async fn start_subscribes_report_patterns_and_routes_deliveries() {
        let handler = Arc::new(StubHandler::default());
        let (router, link) = router_with(&handler);
        let broker = router.inner.broker.clone();

        router.start(&CancellationToken::new()).await.unwrap();

        let mut subscribed = link.subscribed();
        subscribed.sort();
        assert_eq!(
            subscribed,
            vec!["device/+/ack", "device/+/event", "device/+/heartbeat", "device/+/status"]
        );

        for task in broker.deliver("device/lock-9/heartbeat", br#"{"signal":-60}"#.to_vec()) {
            task.await.unwrap();
        }
        assert_eq!(handler.calls(), vec![("lock-9".to_string(), "heartbeat")]);
    }

    #[tokio::test]
    async fn stop_unsubscribes_and_cancels() {
        let handler = Arc::new(StubHandler::default());
        let (router, link) = router_with(&handler);
        let broker = router.inner.broker.clone();

        router.start(&CancellationToken::new()).await.unwrap();
        router.stop().await.unwrap();

        assert_eq!(broker.subscription_count(), 0);
        assert_eq!(link.unsubscribed().len(), 4);
        assert_eq!(
            router.route("device/lock-7/heartbeat", b"{}").await,
            RouteOutcome::Cancelled
        );
        assert!(handler.calls().is_empty());
    }
}
