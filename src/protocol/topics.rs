// SPDX-License-Identifier: MPL-2.0
// This Source Code Form is subject to the terms of the Mozilla Public
// License, v. 2.0. If a copy of the MPL was not distributed with this
// file, You can obtain one at https://mozilla.org/MPL/2.0/.

//! Device topic layout.
//!
//! Devices report on `device/<id>/<kind>` and receive commands on
//! `device/<id>/command` and `device/<id>/config`:
//!
//! ```text
//! device/lock-0042/heartbeat   device → backend   telemetry
//! device/lock-0042/status      device → backend   status snapshot
//! device/lock-0042/event       device → backend   lock/alarm events
//! device/lock-0042/ack         device → backend   command acknowledgements
//! device/lock-0042/command     backend → device   unlock, lock, reboot, upgrade
//! device/lock-0042/config      backend → device   configuration pushes
//! ```

/// Root segment of every device topic.
pub const DEVICE_ROOT: &str = "device";

/// Wildcard subscription for heartbeat reports.
pub const HEARTBEAT_PATTERN: &str = "device/+/heartbeat";

/// Wildcard subscription for status snapshots.
pub const STATUS_PATTERN: &str = "device/+/status";

/// Wildcard subscription for device events.
pub const EVENT_PATTERN: &str = "device/+/event";

/// Wildcard subscription for command acknowledgements.
pub const ACK_PATTERN: &str = "device/+/ack";

/// The four report patterns the router listens on.
pub const REPORT_PATTERNS: [&str; 4] = [HEARTBEAT_PATTERN, STATUS_PATTERN, EVENT_PATTERN, ACK_PATTERN];

/// Returns the command topic for a device.
#[must_use]
pub fn command_topic(device_id: &str) -> String {
    format!("{DEVICE_ROOT}/{device_id}/command")
}

/// Returns the configuration topic for a device.
#[must_use]
pub fn config_topic(device_id: &str) -> String {
    format!("{DEVICE_ROOT}/{device_id}/config")
}

/// Returns the report topic of the given kind for a device.
#[must_use]
pub fn report_topic(device_id: &str, kind: &str) -> String {
    format!("{DEVICE_ROOT}/{device_id}/{kind}")
}

/// Parsed device topic components.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct ParsedTopic<'a> {
    /// The device identifier (second path segment).
    pub device_id: &'a str,
    /// The trailing segment (`heartbeat`, `ack`, ...), empty if absent.
    pub suffix: &'a str,
}

impl<'a> ParsedTopic<'a> {
    /// Parses a topic of the form `root/<device_id>[/<suffix>]`.
    ///
    /// Returns `None` when the topic has fewer than two segments or the
    /// device segment is empty.
    #[must_use]
    pub fn parse(topic: &'a str) -> Option<Self> {
        let mut parts = topic.split('/');
        let _root = parts.next()?;
        let device_id = parts.next().filter(|id| !id.is_empty())?;
        let suffix = parts.next_back().unwrap_or("");
        Some(Self { device_id, suffix })
    }
}

/// Returns true if `topic` matches the MQTT subscription `filter`.
///
/// Supports the single-level `+` and multi-level `#` wildcards.
#[must_use]
pub fn topic_matches(filter: &str, topic: &str) -> bool {
    let mut filter_parts = filter.split('/');
    let mut topic_parts = topic.split('/');

    loop {
        match (filter_parts.next(), topic_parts.next()) {
            (Some("#"), _) => return true,
            (Some("+"), Some(_)) => {}
            (Some(f), Some(t)) if f == t => {}
            (None, None) => return true,
            _ => return false,
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn parse_report_topic() {
        let parsed = ParsedTopic::parse("device/lock-7/heartbeat").unwrap();
        assert_eq!(parsed.device_id, "lock-7");
        assert_eq!(parsed.suffix, "heartbeat");
    }

    #[test]
    fn parse_two_segment_topic() {
        let parsed = ParsedTopic::parse("device/lock-7").unwrap();
        assert_eq!(parsed.device_id, "lock-7");
        assert_eq!(parsed.suffix, "");
    }

    #[test]
    fn parse_rejects_short_topics() {
        assert!(ParsedTopic::parse("device").is_none());
        assert!(ParsedTopic::parse("").is_none());
        assert!(ParsedTopic::parse("device//ack").is_none());
    }

    #[test]
    fn outbound_topics() {
        assert_eq!(command_topic("lock-7"), "device/lock-7/command");
        assert_eq!(config_topic("lock-7"), "device/lock-7/config");
        assert_eq!(report_topic("lock-7", "ack"), "device/lock-7/ack");
    }

    #[test]
    fn single_level_wildcard() {
        assert!(topic_matches("device/+/ack", "device/lock-7/ack"));
        assert!(!topic_matches("device/+/ack", "device/lock-7/event"));
        assert!(!topic_matches("device/+/ack", "device/lock-7/ack/extra"));
        assert!(!topic_matches("device/+/ack", "device/ack"));
    }

    #[test]
    fn multi_level_wildcard() {
        assert!(topic_matches("device/#", "device/lock-7/ack"));
        assert!(topic_matches("#", "anything/at/all"));
        assert!(!topic_matches("device/#", "other/lock-7"));
    }

    #[test]
    fn exact_match() {
        assert!(topic_matches("device/lock-7/ack", "device/lock-7/ack"));
        assert!(!topic_matches("device/lock-7/ack", "device/lock-8/ack"));
    }
}
