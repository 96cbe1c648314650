// SPDX-License-Identifier: MPL-2.0
// This Source Code Form is subject to the terms of the Mozilla Public
// License, v. 2.0. If a copy of the MPL was not distributed with this
// file, You can obtain one at https://mozilla.org/MPL/2.0/.

//! Error types for the `lockhub` library.
//!
//! Each layer owns its error enum: the transport surfaces
//! [`TransportError`], inbound decoding produces [`DecodeError`], the command
//! correlator returns [`CommandError`], and device reconciliation fails with
//! [`HandlerError`] or [`StoreError`]. [`Error`] unifies them for callers that
//! do not care which layer failed.

use thiserror::Error;

/// The main error type for this library.
#[derive(Debug, Error)]
pub enum Error {
    /// Broker connection, subscription or publish failure.
    #[error("transport error: {0}")]
    Transport(#[from] TransportError),

    /// Malformed inbound topic or payload.
    #[error("decode error: {0}")]
    Decode(#[from] DecodeError),

    /// A device command did not complete.
    #[error("command error: {0}")]
    Command(#[from] CommandError),

    /// Device state reconciliation failed.
    #[error("handler error: {0}")]
    Handler(#[from] HandlerError),

    /// The device store failed.
    #[error("store error: {0}")]
    Store(#[from] StoreError),
}

/// Errors related to the MQTT transport.
#[derive(Debug, Error)]
pub enum TransportError {
    /// The broker handshake failed or timed out.
    #[error("connection failed: {0}")]
    Connect(String),

    /// Subscribing to a topic failed.
    #[error("subscribe to {topic} failed: {reason}")]
    Subscribe {
        /// The topic pattern.
        topic: String,
        /// Description of the failure.
        reason: String,
    },

    /// Unsubscribing from a topic failed.
    #[error("unsubscribe from {topic} failed: {reason}")]
    Unsubscribe {
        /// The topic pattern.
        topic: String,
        /// Description of the failure.
        reason: String,
    },

    /// Publishing a message failed.
    #[error("publish to {topic} failed: {reason}")]
    Publish {
        /// The destination topic.
        topic: String,
        /// Description of the failure.
        reason: String,
    },

    /// A structured payload could not be encoded.
    #[error("payload encoding failed: {0}")]
    Encode(#[from] serde_json::Error),

    /// Invalid broker URL or address.
    #[error("invalid address: {0}")]
    InvalidAddress(String),

    /// Disconnecting from the broker failed.
    #[error("disconnect failed: {0}")]
    Disconnect(String),

    /// The caller cancelled the operation before it completed.
    #[error("operation cancelled")]
    Cancelled,
}

/// Errors related to decoding inbound device reports.
#[derive(Debug, Error)]
pub enum DecodeError {
    /// The topic does not carry a device identifier.
    #[error("malformed topic: {0}")]
    Topic(String),

    /// The topic suffix is not a known report kind.
    #[error("unknown message kind: {0}")]
    UnknownKind(String),

    /// The payload is not valid JSON for its kind.
    #[error("invalid {kind} payload: {source}")]
    Payload {
        /// The report kind that failed to decode.
        kind: &'static str,
        /// The underlying JSON error.
        #[source]
        source: serde_json::Error,
    },
}

/// Errors returned by synchronous device commands.
#[derive(Debug, Error)]
pub enum CommandError {
    /// No acknowledgement arrived within the ack window.
    #[error("command {command_id} timed out after {timeout_ms} ms")]
    Timeout {
        /// Correlation id of the command.
        command_id: String,
        /// The ack window in milliseconds.
        timeout_ms: u64,
    },

    /// The caller cancelled the wait.
    #[error("command {command_id} cancelled")]
    Cancelled {
        /// Correlation id of the command.
        command_id: String,
    },

    /// The pending entry was swept before an ack arrived.
    #[error("command {command_id} expired")]
    Expired {
        /// Correlation id of the command.
        command_id: String,
    },

    /// The command could not be published.
    #[error(transparent)]
    Transport(#[from] TransportError),
}

impl CommandError {
    /// Returns the correlation id for errors raised after publishing.
    #[must_use]
    pub fn command_id(&self) -> Option<&str> {
        match self {
            Self::Timeout { command_id, .. }
            | Self::Cancelled { command_id }
            | Self::Expired { command_id } => Some(command_id),
            Self::Transport(_) => None,
        }
    }

    /// Returns true if the device never acknowledged in time.
    #[must_use]
    pub fn is_timeout(&self) -> bool {
        matches!(self, Self::Timeout { .. })
    }
}

/// Errors raised while reconciling an inbound report.
#[derive(Debug, Error)]
pub enum HandlerError {
    /// The reporting device is not known to the store.
    #[error("unknown device: {0}")]
    UnknownDevice(String),

    /// The store rejected a read or write.
    #[error(transparent)]
    Store(#[from] StoreError),
}

/// Errors related to the device store.
#[derive(Debug, Error, Clone, PartialEq, Eq)]
pub enum StoreError {
    /// No device with the given id exists.
    #[error("device {0} not found")]
    NotFound(i64),

    /// The backing storage failed.
    #[error("storage backend failed: {0}")]
    Backend(String),
}

/// A specialized Result type for this library.
pub type Result<T> = std::result::Result<T, Error>;

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn timeout_display() {
        let err = CommandError::Timeout {
            command_id: "abc".to_string(),
            timeout_ms: 30_000,
        };
        assert_eq!(err.to_string(), "command abc timed out after 30000 ms");
        assert!(err.is_timeout());
        assert_eq!(err.command_id(), Some("abc"));
    }

    #[test]
    fn subscribe_error_display() {
        let err = TransportError::Subscribe {
            topic: "device/+/ack".to_string(),
            reason: "request channel closed".to_string(),
        };
        assert_eq!(
            err.to_string(),
            "subscribe to device/+/ack failed: request channel closed"
        );
    }

    #[test]
    fn transport_error_into_command_error() {
        let err: CommandError = TransportError::Cancelled.into();
        assert!(matches!(err, CommandError::Transport(TransportError::Cancelled)));
        assert!(err.command_id().is_none());
    }

    #[test]
    fn error_from_store_error() {
        let err: Error = StoreError::NotFound(7).into();
        assert!(matches!(err, Error::Store(StoreError::NotFound(7))));
        assert_eq!(err.to_string(), "store error: device 7 not found");
    }
}
