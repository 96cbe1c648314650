// SPDX-License-Identifier: MPL-2.0
// This Source Code Form is subject to the terms of the Mozilla Public
// License, v. 2.0. If a copy of the MPL was not distributed with this
// file, You can obtain one at https://mozilla.org/MPL/2.0/.

//! Persisted device state.

use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};

use crate::protocol::{Heartbeat, StatusReport};
use crate::types::{DeviceStatus, LockStatus, OnlineStatus};

/// Last telemetry reported in a heartbeat.
#[derive(Debug, Clone, Default, PartialEq, Serialize, Deserialize)]
pub struct Telemetry {
    /// Signal strength.
    pub signal: Option<i32>,
    /// Battery level in percent.
    pub battery: Option<i32>,
    /// Enclosure temperature in °C.
    pub temperature: Option<f64>,
    /// Relative humidity in percent.
    pub humidity: Option<f64>,
    /// Running firmware version.
    pub firmware_version: Option<String>,
}

/// A lockable rental device as stored by the backend.
///
/// `device_no` is the identifier devices use in their topics; `id` is the
/// store's key.
///
/// # Examples
///
/// ```
/// use lockhub::state::Device;
/// use lockhub::types::OnlineStatus;
///
/// let device = Device::new(7, "lock-0042");
/// assert_eq!(device.online_status, OnlineStatus::Offline);
/// assert!(device.last_heartbeat_at.is_none());
/// ```
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct Device {
    /// Store key.
    pub id: i64,
    /// Identifier used in topics.
    pub device_no: String,
    /// Reachability.
    pub online_status: OnlineStatus,
    /// Physical lock state.
    pub lock_status: LockStatus,
    /// Rental availability.
    pub status: DeviceStatus,
    /// Free slots on multi-slot cabinets.
    pub available_slots: u32,
    /// Last reported telemetry.
    pub telemetry: Telemetry,
    /// When the last heartbeat was processed.
    pub last_heartbeat_at: Option<DateTime<Utc>>,
    /// When the device last went online.
    pub last_online_at: Option<DateTime<Utc>>,
    /// When the device last went offline.
    pub last_offline_at: Option<DateTime<Utc>>,
}

impl Device {
    /// Creates an offline, locked, idle device with no history.
    #[must_use]
    pub fn new(id: i64, device_no: impl Into<String>) -> Self {
        Self {
            id,
            device_no: device_no.into(),
            online_status: OnlineStatus::default(),
            lock_status: LockStatus::default(),
            status: DeviceStatus::default(),
            available_slots: 0,
            telemetry: Telemetry::default(),
            last_heartbeat_at: None,
            last_online_at: None,
            last_offline_at: None,
        }
    }

    /// Returns true if the device is online.
    #[must_use]
    pub fn is_online(&self) -> bool {
        self.online_status == OnlineStatus::Online
    }

    /// Applies a partial update. Fields left `None` keep their value.
    pub fn apply(&mut self, update: &DeviceUpdate) {
        if let Some(v) = update.online_status {
            self.online_status = v;
        }
        if let Some(v) = update.lock_status {
            self.lock_status = v;
        }
        if let Some(v) = update.status {
            self.status = v;
        }
        if let Some(v) = update.available_slots {
            self.available_slots = v;
        }
        if let Some(v) = update.signal {
            self.telemetry.signal = Some(v);
        }
        if let Some(v) = update.battery {
            self.telemetry.battery = Some(v);
        }
        if let Some(v) = update.temperature {
            self.telemetry.temperature = Some(v);
        }
        if let Some(v) = update.humidity {
            self.telemetry.humidity = Some(v);
        }
        if let Some(v) = &update.firmware_version {
            self.telemetry.firmware_version = Some(v.clone());
        }
        if let Some(v) = update.last_heartbeat_at {
            self.last_heartbeat_at = Some(v);
        }
        if let Some(v) = update.last_online_at {
            self.last_online_at = Some(v);
        }
        if let Some(v) = update.last_offline_at {
            self.last_offline_at = Some(v);
        }
    }
}

/// A partial write to a [`Device`].
#[derive(Debug, Clone, Default, PartialEq)]
pub struct DeviceUpdate {
    /// New reachability.
    pub online_status: Option<OnlineStatus>,
    /// New lock state.
    pub lock_status: Option<LockStatus>,
    /// New rental availability.
    pub status: Option<DeviceStatus>,
    /// New free slot count.
    pub available_slots: Option<u32>,
    /// New signal strength.
    pub signal: Option<i32>,
    /// New battery level.
    pub battery: Option<i32>,
    /// New temperature.
    pub temperature: Option<f64>,
    /// New humidity.
    pub humidity: Option<f64>,
    /// New firmware version.
    pub firmware_version: Option<String>,
    /// Heartbeat stamp.
    pub last_heartbeat_at: Option<DateTime<Utc>>,
    /// Online transition stamp.
    pub last_online_at: Option<DateTime<Utc>>,
    /// Offline transition stamp.
    pub last_offline_at: Option<DateTime<Utc>>,
}

impl DeviceUpdate {
    /// Telemetry carried by a heartbeat. Metrics the device left out are
    /// not touched.
    #[must_use]
    pub fn from_heartbeat(heartbeat: &Heartbeat) -> Self {
        Self {
            signal: heartbeat.signal,
            battery: heartbeat.battery,
            temperature: heartbeat.temperature,
            humidity: heartbeat.humidity,
            firmware_version: heartbeat.firmware_version.clone(),
            ..Self::default()
        }
    }

    /// Every field of a status snapshot.
    #[must_use]
    pub fn from_status(report: &StatusReport) -> Self {
        Self {
            online_status: Some(report.online_status),
            lock_status: Some(report.lock_status),
            status: Some(report.status),
            available_slots: Some(report.available_slots),
            ..Self::default()
        }
    }

    /// Returns true if the update changes nothing.
    #[must_use]
    pub fn is_empty(&self) -> bool {
        *self == Self::default()
    }
}
