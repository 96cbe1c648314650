// SPDX-License-Identifier: MPL-2.0
// This Source Code Form is subject to the terms of the Mozilla Public
// License, v. 2.0. If a copy of the MPL was not distributed with this
// file, You can obtain one at https://mozilla.org/MPL/2.0/.

//! JSON envelopes exchanged with devices.
//!
//! Inbound reports are decoded from the topic they arrive on: the topic
//! suffix selects the schema and the second topic segment names the device.
//! Outbound commands carry a correlation id that the device echoes back in
//! its [`CommandAck`].

use std::fmt;

use serde::{Deserialize, Serialize};
use serde_json::{Map, Value};

use crate::error::DecodeError;
use crate::types::{DeviceStatus, LockStatus, OnlineStatus};

use super::topics::ParsedTopic;

/// Kind of an inbound device report.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub enum MessageKind {
    /// Periodic telemetry.
    Heartbeat,
    /// Full status snapshot.
    Status,
    /// Lock, alarm or error event.
    Event,
    /// Command acknowledgement.
    Ack,
}

impl MessageKind {
    /// Maps a topic suffix to a report kind.
    #[must_use]
    pub fn from_suffix(suffix: &str) -> Option<Self> {
        match suffix {
            "heartbeat" => Some(Self::Heartbeat),
            "status" => Some(Self::Status),
            "event" => Some(Self::Event),
            "ack" => Some(Self::Ack),
            _ => None,
        }
    }

    /// Returns the topic suffix for this kind.
    #[must_use]
    pub const fn as_str(self) -> &'static str {
        match self {
            Self::Heartbeat => "heartbeat",
            Self::Status => "status",
            Self::Event => "event",
            Self::Ack => "ack",
        }
    }
}

impl fmt::Display for MessageKind {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(self.as_str())
    }
}

/// Telemetry pushed by a device on `device/<id>/heartbeat`.
///
/// Every metric is optional; devices only report what their hardware has.
#[derive(Debug, Clone, Default, PartialEq, Serialize, Deserialize)]
pub struct Heartbeat {
    /// Device clock, unix seconds.
    #[serde(default)]
    pub timestamp: i64,
    /// Cellular or Wi-Fi signal strength.
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub signal: Option<i32>,
    /// Battery level in percent.
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub battery: Option<i32>,
    /// Enclosure temperature in °C.
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub temperature: Option<f64>,
    /// Relative humidity in percent.
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub humidity: Option<f64>,
    /// Running firmware version.
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub firmware_version: Option<String>,
}

/// Authoritative status snapshot pushed on `device/<id>/status`.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct StatusReport {
    /// Device clock, unix seconds.
    #[serde(default)]
    pub timestamp: i64,
    /// Reachability as seen by the device.
    pub online_status: OnlineStatus,
    /// Physical lock state.
    pub lock_status: LockStatus,
    /// Rental availability.
    pub status: DeviceStatus,
    /// Free slots on multi-slot cabinets.
    pub available_slots: u32,
}

/// Recognized event types.
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum EventKind {
    /// The lock opened.
    Unlocked,
    /// The lock closed.
    Locked,
    /// The device reported a fault.
    Error,
    /// The device raised an alarm (tamper, forced open, ...).
    Alarm,
    /// Anything else; recorded verbatim.
    Other(String),
}

impl EventKind {
    /// Parses the `type` field of an event report.
    #[must_use]
    pub fn parse(value: &str) -> Self {
        match value {
            "unlocked" | "unlock" => Self::Unlocked,
            "locked" | "lock" => Self::Locked,
            "error" => Self::Error,
            "alarm" => Self::Alarm,
            other => Self::Other(other.to_string()),
        }
    }
}

/// Event pushed on `device/<id>/event`.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct EventReport {
    /// Device clock, unix seconds.
    #[serde(default)]
    pub timestamp: i64,
    /// Event name, e.g. `unlocked` or `alarm`.
    #[serde(rename = "type")]
    pub event_type: String,
    /// Free-form event arguments.
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub data: Option<Map<String, Value>>,
}

impl EventReport {
    /// Returns the parsed event kind.
    #[must_use]
    pub fn kind(&self) -> EventKind {
        EventKind::parse(&self.event_type)
    }

    /// Returns the human-readable message carried in `data.message`.
    #[must_use]
    pub fn message(&self) -> Option<&str> {
        self.data.as_ref()?.get("message")?.as_str()
    }
}

/// Acknowledgement of a command, pushed on `device/<id>/ack`.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct CommandAck {
    /// Correlation id copied from the command envelope.
    pub command_id: String,
    /// Whether the device executed the command.
    pub success: bool,
    /// Device-provided detail.
    #[serde(default)]
    pub message: String,
    /// Device clock, unix seconds.
    #[serde(default)]
    pub timestamp: i64,
}

/// Kind-specific body of an inbound report.
#[derive(Debug, Clone, PartialEq)]
pub enum InboundPayload {
    /// A heartbeat.
    Heartbeat(Heartbeat),
    /// A status snapshot.
    Status(StatusReport),
    /// An event.
    Event(EventReport),
    /// A command acknowledgement.
    Ack(CommandAck),
}

/// A decoded inbound report.
#[derive(Debug, Clone, PartialEq)]
pub struct InboundMessage {
    /// The reporting device.
    pub device_id: String,
    /// The decoded body.
    pub payload: InboundPayload,
}

impl InboundMessage {
    /// Decodes a report from its topic and raw payload.
    ///
    /// # Errors
    ///
    /// Returns [`DecodeError::Topic`] if the topic has no device segment,
    /// [`DecodeError::UnknownKind`] for an unrecognized suffix, and
    /// [`DecodeError::Payload`] if the body does not match the kind's schema.
    pub fn decode(topic: &str, payload: &[u8]) -> Result<Self, DecodeError> {
        let parsed = ParsedTopic::parse(topic).ok_or_else(|| DecodeError::Topic(topic.to_string()))?;
        let kind = MessageKind::from_suffix(parsed.suffix)
            .ok_or_else(|| DecodeError::UnknownKind(parsed.suffix.to_string()))?;

        let payload = match kind {
            MessageKind::Heartbeat => InboundPayload::Heartbeat(decode_body(kind, payload)?),
            MessageKind::Status => InboundPayload::Status(decode_body(kind, payload)?),
            MessageKind::Event => InboundPayload::Event(decode_body(kind, payload)?),
            MessageKind::Ack => InboundPayload::Ack(decode_body(kind, payload)?),
        };

        Ok(Self {
            device_id: parsed.device_id.to_string(),
            payload,
        })
    }

    /// Returns the report kind.
    #[must_use]
    pub fn kind(&self) -> MessageKind {
        match self.payload {
            InboundPayload::Heartbeat(_) => MessageKind::Heartbeat,
            InboundPayload::Status(_) => MessageKind::Status,
            InboundPayload::Event(_) => MessageKind::Event,
            InboundPayload::Ack(_) => MessageKind::Ack,
        }
    }

    /// Returns the device-reported timestamp.
    #[must_use]
    pub fn timestamp(&self) -> i64 {
        match &self.payload {
            InboundPayload::Heartbeat(p) => p.timestamp,
            InboundPayload::Status(p) => p.timestamp,
            InboundPayload::Event(p) => p.timestamp,
            InboundPayload::Ack(p) => p.timestamp,
        }
    }
}

fn decode_body<T: serde::de::DeserializeOwned>(
    kind: MessageKind,
    payload: &[u8],
) -> Result<T, DecodeError> {
    serde_json::from_slice(payload).map_err(|source| DecodeError::Payload {
        kind: kind.as_str(),
        source,
    })
}

/// Command sent to a device.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum CommandKind {
    /// Open the lock.
    Unlock,
    /// Close the lock.
    Lock,
    /// Restart the controller.
    Reboot,
    /// Install new firmware.
    Upgrade,
    /// Apply configuration values.
    Config,
}

impl CommandKind {
    /// Returns the wire name.
    #[must_use]
    pub const fn as_str(self) -> &'static str {
        match self {
            Self::Unlock => "unlock",
            Self::Lock => "lock",
            Self::Reboot => "reboot",
            Self::Upgrade => "upgrade",
            Self::Config => "config",
        }
    }

    /// Returns the topic this command is published on.
    #[must_use]
    pub fn topic(self, device_id: &str) -> String {
        match self {
            Self::Config => super::topics::config_topic(device_id),
            _ => super::topics::command_topic(device_id),
        }
    }
}

impl fmt::Display for CommandKind {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(self.as_str())
    }
}

/// Arguments of a command.
///
/// # Examples
///
/// ```
/// use lockhub::protocol::CommandArgs;
///
/// let args = CommandArgs::new().slot(3).with("reason", "rental-start");
/// assert_eq!(args.get("slot"), Some(&serde_json::json!(3)));
/// ```
#[derive(Debug, Clone, Default, PartialEq, Serialize, Deserialize)]
#[serde(transparent)]
pub struct CommandArgs(Map<String, Value>);

impl CommandArgs {
    /// Creates an empty argument map.
    #[must_use]
    pub fn new() -> Self {
        Self::default()
    }

    /// Adds an arbitrary argument.
    #[must_use]
    pub fn with(mut self, key: impl Into<String>, value: impl Into<Value>) -> Self {
        self.0.insert(key.into(), value.into());
        self
    }

    /// Targets a specific slot on multi-slot cabinets.
    #[must_use]
    pub fn slot(self, slot: u32) -> Self {
        self.with("slot", slot)
    }

    /// Sets the firmware location for an upgrade.
    #[must_use]
    pub fn firmware(self, url: impl Into<String>, version: impl Into<String>) -> Self {
        self.with("url", url.into()).with("version", version.into())
    }

    /// Returns an argument by name.
    #[must_use]
    pub fn get(&self, key: &str) -> Option<&Value> {
        self.0.get(key)
    }

    /// Returns true if no arguments are set.
    #[must_use]
    pub fn is_empty(&self) -> bool {
        self.0.is_empty()
    }
}

impl From<Map<String, Value>> for CommandArgs {
    fn from(map: Map<String, Value>) -> Self {
        Self(map)
    }
}

/// Outbound command envelope.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct CommandEnvelope {
    /// Correlation id echoed in the device's ack.
    pub command_id: String,
    /// The command to execute.
    pub command: CommandKind,
    /// Command arguments.
    #[serde(default)]
    pub params: CommandArgs,
    /// Send time, unix seconds.
    pub timestamp: i64,
}

impl CommandEnvelope {
    /// Builds an envelope with a fresh correlation id stamped now.
    #[must_use]
    pub fn new(command: CommandKind, params: CommandArgs) -> Self {
        Self::with_id(uuid::Uuid::new_v4().to_string(), command, params)
    }

    /// Builds an envelope with the given correlation id stamped now.
    #[must_use]
    pub fn with_id(command_id: String, command: CommandKind, params: CommandArgs) -> Self {
        Self {
            command_id,
            command,
            params,
            timestamp: chrono::Utc::now().timestamp(),
        }
    }
}
