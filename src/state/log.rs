// SPDX-License-Identifier: MPL-2.0
// This Source Code Form is subject to the terms of the Mozilla Public
// License, v. 2.0. If a copy of the MPL was not distributed with this
// file, You can obtain one at https://mozilla.org/MPL/2.0/.

//! Device history entries.

use std::fmt;

use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};

use crate::protocol::EventKind;

/// Actor recorded on every entry written by the reconciler.
pub const SYSTEM_ACTOR: &str = "system";

/// Kind of a [`DeviceLog`] entry.
#[derive(Debug, Clone, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(into = "String", from = "String")]
pub enum LogType {
    /// The device came online.
    Online,
    /// The device went offline.
    Offline,
    /// The lock opened.
    Unlock,
    /// The lock closed.
    Lock,
    /// The device reported an error or alarm.
    Error,
    /// Any other device event, named as reported.
    Event(String),
}

impl LogType {
    /// Returns the stored name of this type.
    #[must_use]
    pub fn as_str(&self) -> &str {
        match self {
            Self::Online => "online",
            Self::Offline => "offline",
            Self::Unlock => "unlock",
            Self::Lock => "lock",
            Self::Error => "error",
            Self::Event(name) => name,
        }
    }

    /// Maps a device event to the entry it produces.
    #[must_use]
    pub fn from_event(kind: EventKind) -> Self {
        match kind {
            EventKind::Unlocked => Self::Unlock,
            EventKind::Locked => Self::Lock,
            EventKind::Error | EventKind::Alarm => Self::Error,
            EventKind::Other(name) => Self::Event(name),
        }
    }
}

impl fmt::Display for LogType {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(self.as_str())
    }
}

impl From<LogType> for String {
    fn from(log_type: LogType) -> Self {
        log_type.as_str().to_string()
    }
}

impl From<String> for LogType {
    fn from(name: String) -> Self {
        match name.as_str() {
            "online" => Self::Online,
            "offline" => Self::Offline,
            "unlock" => Self::Unlock,
            "lock" => Self::Lock,
            "error" => Self::Error,
            _ => Self::Event(name),
        }
    }
}

/// An append-only history entry for a device.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct DeviceLog {
    /// Store key of the device.
    pub device_id: i64,
    /// What happened.
    #[serde(rename = "type")]
    pub log_type: LogType,
    /// Free-form detail, usually the device's message.
    pub content: Option<String>,
    /// Who caused the entry.
    pub actor: Option<String>,
    /// When the entry was written.
    pub created_at: DateTime<Utc>,
}

impl DeviceLog {
    /// Creates an entry attributed to [`SYSTEM_ACTOR`], stamped now.
    #[must_use]
    pub fn system(device_id: i64, log_type: LogType, content: Option<String>) -> Self {
        Self {
            device_id,
            log_type,
            content,
            actor: Some(SYSTEM_ACTOR.to_string()),
            created_at: Utc::now(),
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn event_kinds_map_to_log_types() {
        assert_eq!(LogType::from_event(EventKind::Unlocked), LogType::Unlock);
        assert_eq!(LogType::from_event(EventKind::Locked), LogType::Lock);
        assert_eq!(LogType::from_event(EventKind::Alarm), LogType::Error);
        assert_eq!(
            LogType::from_event(EventKind::Other("door_ajar".to_string())),
            LogType::Event("door_ajar".to_string())
        );
    }

    #[test]
    fn log_type_serializes_as_its_name() {
        let log = DeviceLog::system(3, LogType::Event("door_ajar".to_string()), None);
        let json = serde_json::to_value(&log).unwrap();

        assert_eq!(json["type"], "door_ajar");
        assert_eq!(json["actor"], "system");

        let back: DeviceLog = serde_json::from_value(json).unwrap();
        assert_eq!(back.log_type, LogType::Event("door_ajar".to_string()));
    }

    #[test]
    fn known_names_parse_to_variants() {
        assert_eq!(LogType::from("offline".to_string()), LogType::Offline);
        assert_eq!(LogType::Unlock.to_string(), "unlock");
    }
}
