// SPDX-License-Identifier: MPL-2.0
// This Source Code Form is subject to the terms of the Mozilla Public
// License, v. 2.0. If a copy of the MPL was not distributed with this
// file, You can obtain one at https://mozilla.org/MPL/2.0/.

//! The wire-facing half of the transport.
//!
//! [`MqttBroker`](super::MqttBroker) never calls `rumqttc` directly; it goes
//! through [`BrokerLink`], which is implemented for [`rumqttc::AsyncClient`]
//! and by the doubles in [`crate::testing`].

use async_trait::async_trait;
use rumqttc::{AsyncClient, QoS};
use serde::Serialize;
use serde_json::Value;

use crate::error::TransportError;

/// Outbound operations a broker connection must support.
#[async_trait]
pub trait BrokerLink: Send + Sync {
    /// Requests a subscription to `topic`.
    async fn subscribe(&self, topic: &str, qos: QoS) -> Result<(), TransportError>;

    /// Requests removal of the subscription to `topic`.
    async fn unsubscribe(&self, topic: &str) -> Result<(), TransportError>;

    /// Publishes `payload` on `topic`.
    async fn publish(
        &self,
        topic: &str,
        qos: QoS,
        retain: bool,
        payload: Vec<u8>,
    ) -> Result<(), TransportError>;

    /// Closes the session.
    async fn disconnect(&self) -> Result<(), TransportError>;
}

#[async_trait]
impl BrokerLink for AsyncClient {
    async fn subscribe(&self, topic: &str, qos: QoS) -> Result<(), TransportError> {
        AsyncClient::subscribe(self, topic, qos)
            .await
            .map_err(|e| TransportError::Subscribe {
                topic: topic.to_string(),
                reason: e.to_string(),
            })
    }

    async fn unsubscribe(&self, topic: &str) -> Result<(), TransportError> {
        AsyncClient::unsubscribe(self, topic)
            .await
            .map_err(|e| TransportError::Unsubscribe {
                topic: topic.to_string(),
                reason: e.to_string(),
            })
    }

    async fn publish(
        &self,
        topic: &str,
        qos: QoS,
        retain: bool,
        payload: Vec<u8>,
    ) -> Result<(), TransportError> {
        AsyncClient::publish(self, topic, qos, retain, payload)
            .await
            .map_err(|e| TransportError::Publish {
                topic: topic.to_string(),
                reason: e.to_string(),
            })
    }

    async fn disconnect(&self) -> Result<(), TransportError> {
        AsyncClient::disconnect(self)
            .await
            .map_err(|e| TransportError::Disconnect(e.to_string()))
    }
}

/// A message body to publish.
///
/// Raw bytes and strings are sent unmodified; structured values are encoded
/// as JSON.
///
/// # Examples
///
/// ```
/// use lockhub::protocol::Payload;
///
/// let raw = Payload::from("reboot");
/// assert_eq!(raw.into_bytes(), b"reboot".to_vec());
///
/// let json = Payload::json(&serde_json::json!({"slot": 2})).unwrap();
/// assert_eq!(json.into_bytes(), br#"{"slot":2}"#.to_vec());
/// ```
#[derive(Debug, Clone, PartialEq)]
pub enum Payload {
    /// Bytes sent as-is.
    Bytes(Vec<u8>),
    /// Text sent as its UTF-8 bytes.
    Text(String),
    /// A structured value, JSON-encoded on publish.
    Json(Value),
}

impl Payload {
    /// Captures a serializable value as a JSON payload.
    ///
    /// # Errors
    ///
    /// Returns [`TransportError::Encode`] if the value cannot be represented
    /// as JSON.
    pub fn json<T: Serialize + ?Sized>(value: &T) -> Result<Self, TransportError> {
        Ok(Self::Json(serde_json::to_value(value)?))
    }

    /// Returns the bytes that go on the wire.
    #[must_use]
    pub fn into_bytes(self) -> Vec<u8> {
        match self {
            Self::Bytes(bytes) => bytes,
            Self::Text(text) => text.into_bytes(),
            Self::Json(value) => value.to_string().into_bytes(),
        }
    }
}

impl From<Vec<u8>> for Payload {
    fn from(bytes: Vec<u8>) -> Self {
        Self::Bytes(bytes)
    }
}

impl From<&[u8]> for Payload {
    fn from(bytes: &[u8]) -> Self {
        Self::Bytes(bytes.to_vec())
    }
}

impl From<String> for Payload {
    fn from(text: String) -> Self {
        Self::Text(text)
    }
}

impl From<&str> for Payload {
    fn from(text: &str) -> Self {
        Self::Text(text.to_string())
    }
}

impl From<Value> for Payload {
    fn from(value: Value) -> Self {
        Self::Json(value)
    }
}
