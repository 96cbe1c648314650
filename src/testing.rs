// SPDX-License-Identifier: MPL-2.0
// This Source Code Form is subject to the terms of the Mozilla Public
// License, v. 2.0. If a copy of the MPL was not distributed with this
// file, You can obtain one at https://mozilla.org/MPL/2.0/.

//! Test doubles for running the stack without a broker.
//!
//! [`RecordingLink`] implements [`BrokerLink`] in memory: it records every
//! request, fails on demand, and can call a hook for each publish, which is
//! how tests play the device side of a command exchange.

use std::collections::HashSet;
use std::sync::Arc;
use std::sync::atomic::{AtomicBool, Ordering};
use std::time::Duration;

use async_trait::async_trait;
use parking_lot::Mutex;
use rumqttc::QoS;

use crate::error::TransportError;
use crate::protocol::BrokerLink;

/// A message captured by [`RecordingLink`].
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct PublishedMessage {
    /// Destination topic.
    pub topic: String,
    /// Requested delivery-quality level.
    pub qos: QoS,
    /// Retain flag.
    pub retain: bool,
    /// Raw payload.
    pub payload: Vec<u8>,
}

impl PublishedMessage {
    /// Decodes the payload as JSON.
    ///
    /// # Errors
    ///
    /// Returns the JSON error if the payload does not match `T`.
    pub fn json<T: serde::de::DeserializeOwned>(&self) -> Result<T, serde_json::Error> {
        serde_json::from_slice(&self.payload)
    }
}

/// Callback run after each recorded publish.
pub type PublishHook = Arc<dyn Fn(&PublishedMessage) + Send + Sync>;

/// In-memory [`BrokerLink`] that records requests.
#[derive(Default)]
pub struct RecordingLink {
    subscribed: Mutex<Vec<String>>,
    subscribe_attempts: Mutex<Vec<String>>,
    unsubscribed: Mutex<Vec<String>>,
    published: Mutex<Vec<PublishedMessage>>,
    failing_subscribes: Mutex<HashSet<String>>,
    fail_unsubscribe: AtomicBool,
    fail_publish: AtomicBool,
    publish_delay: Mutex<Option<Duration>>,
    on_publish: Mutex<Option<PublishHook>>,
    disconnected: AtomicBool,
}

impl RecordingLink {
    /// Creates a link that accepts every request.
    #[must_use]
    pub fn new() -> Self {
        Self::default()
    }

    /// Makes subscribe requests for `topic` fail.
    pub fn fail_subscribe(&self, topic: impl Into<String>) {
        self.failing_subscribes.lock().insert(topic.into());
    }

    /// Makes every unsubscribe request fail (or succeed again).
    pub fn fail_unsubscribes(&self, fail: bool) {
        self.fail_unsubscribe.store(fail, Ordering::SeqCst);
    }

    /// Makes every publish request fail (or succeed again).
    pub fn fail_publishes(&self, fail: bool) {
        self.fail_publish.store(fail, Ordering::SeqCst);
    }

    /// Delays every publish by `delay` before recording it.
    pub fn set_publish_delay(&self, delay: Duration) {
        *self.publish_delay.lock() = Some(delay);
    }

    /// Installs a hook called after each recorded publish.
    pub fn on_publish<F>(&self, hook: F)
    where
        F: Fn(&PublishedMessage) + Send + Sync + 'static,
    {
        *self.on_publish.lock() = Some(Arc::new(hook));
    }

    /// Topics successfully subscribed, in request order.
    #[must_use]
    pub fn subscribed(&self) -> Vec<String> {
        self.subscribed.lock().clone()
    }

    /// Every subscribe request, including failed ones.
    #[must_use]
    pub fn subscribe_attempts(&self) -> Vec<String> {
        self.subscribe_attempts.lock().clone()
    }

    /// Topics unsubscribed, in request order.
    #[must_use]
    pub fn unsubscribed(&self) -> Vec<String> {
        self.unsubscribed.lock().clone()
    }

    /// Messages published, in request order.
    #[must_use]
    pub fn published(&self) -> Vec<PublishedMessage> {
        self.published.lock().clone()
    }

    /// Returns true once `disconnect` has been requested.
    #[must_use]
    pub fn is_disconnected(&self) -> bool {
        self.disconnected.load(Ordering::SeqCst)
    }

    /// Forgets recorded requests and injected subscribe failures.
    pub fn clear(&self) {
        self.subscribed.lock().clear();
        self.subscribe_attempts.lock().clear();
        self.unsubscribed.lock().clear();
        self.published.lock().clear();
        self.failing_subscribes.lock().clear();
    }
}

impl std::fmt::Debug for RecordingLink {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("RecordingLink")
            .field("subscribed", &self.subscribed.lock().len())
            .field("published", &self.published.lock().len())
            .field("disconnected", &self.is_disconnected())
            .finish_non_exhaustive()
    }
}

#[async_trait]
impl BrokerLink for RecordingLink {
    async fn subscribe(&self, topic: &str, _qos: QoS) -> Result<(), TransportError> {
        self.subscribe_attempts.lock().push(topic.to_string());
        if self.failing_subscribes.lock().contains(topic) {
            return Err(TransportError::Subscribe {
                topic: topic.to_string(),
                reason: "injected failure".to_string(),
            });
        }
        self.subscribed.lock().push(topic.to_string());
        Ok(())
    }

    async fn unsubscribe(&self, topic: &str) -> Result<(), TransportError> {
        if self.fail_unsubscribe.load(Ordering::SeqCst) {
            return Err(TransportError::Unsubscribe {
                topic: topic.to_string(),
                reason: "injected failure".to_string(),
            });
        }
        self.unsubscribed.lock().push(topic.to_string());
        Ok(())
    }

    async fn publish(
        &self,
        topic: &str,
        qos: QoS,
        retain: bool,
        payload: Vec<u8>,
    ) -> Result<(), TransportError> {
        let delay = *self.publish_delay.lock();
        if let Some(delay) = delay {
            tokio::time::sleep(delay).await;
        }
        if self.fail_publish.load(Ordering::SeqCst) {
            return Err(TransportError::Publish {
                topic: topic.to_string(),
                reason: "injected failure".to_string(),
            });
        }

        let message = PublishedMessage {
            topic: topic.to_string(),
            qos,
            retain,
            payload,
        };
        self.published.lock().push(message.clone());

        let hook = self.on_publish.lock().clone();
        if let Some(hook) = hook {
            hook(&message);
        }
        Ok(())
    }

    async fn disconnect(&self) -> Result<(), TransportError> {
        self.disconnected.store(true, Ordering::SeqCst);
        Ok(())
    }
}
