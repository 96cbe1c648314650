// SPDX-License-Identifier: MPL-2.0
// This Source Code Form is subject to the terms of the Mozilla Public
// License, v. 2.0. If a copy of the MPL was not distributed with this
// file, You can obtain one at https://mozilla.org/MPL/2.0/.

//! Persistence seam for device state and history.

use std::collections::HashMap;

use async_trait::async_trait;
use chrono::{DateTime, Utc};
use parking_lot::RwLock;

use crate::error::StoreError;
use crate::types::{DeviceStatus, LockStatus, OnlineStatus};

use super::{Device, DeviceLog, DeviceUpdate};

/// Storage used by the reconciler and the liveness watchdog.
///
/// Implement this over the application's database. [`MemoryStore`] is a
/// complete in-process implementation.
#[async_trait]
pub trait DeviceStore: Send + Sync {
    /// Looks up a device by the identifier it uses in topics.
    async fn get_by_device_no(&self, device_no: &str) -> Result<Option<Device>, StoreError>;

    /// Writes the fields set in `update`.
    async fn update_fields(&self, id: i64, update: DeviceUpdate) -> Result<(), StoreError>;

    /// Appends a history entry.
    async fn create_log(&self, log: DeviceLog) -> Result<(), StoreError>;

    /// Sets the lock state.
    async fn update_lock_status(&self, id: i64, status: LockStatus) -> Result<(), StoreError>;

    /// Sets the rental status.
    async fn update_status(&self, id: i64, status: DeviceStatus) -> Result<(), StoreError>;

    /// Switches the device online if it is offline, stamping
    /// `last_online_at`.
    ///
    /// The check and the write must be one atomic step: of several
    /// concurrent calls on an offline device exactly one returns `true`.
    async fn mark_online(&self, id: i64, at: DateTime<Utc>) -> Result<bool, StoreError>;

    /// Switches the device offline if it is online, stamping
    /// `last_offline_at`.
    ///
    /// With `silent_before`, the device must also have no heartbeat at or
    /// after that instant. Atomic like [`mark_online`](Self::mark_online);
    /// returns whether the device changed.
    async fn mark_offline(
        &self,
        id: i64,
        at: DateTime<Utc>,
        silent_before: Option<DateTime<Utc>>,
    ) -> Result<bool, StoreError>;

    /// Online devices with no heartbeat since `before`.
    ///
    /// Devices that are online but have never sent a heartbeat count as
    /// stale.
    async fn stale_online_devices(&self, before: DateTime<Utc>) -> Result<Vec<Device>, StoreError>;
}

/// In-memory [`DeviceStore`].
///
/// # Examples
///
/// ```
/// use lockhub::state::{Device, MemoryStore};
///
/// let store = MemoryStore::new();
/// store.insert(Device::new(1, "lock-0001"));
/// assert_eq!(store.device(1).unwrap().device_no, "lock-0001");
/// ```
#[derive(Debug, Default)]
pub struct MemoryStore {
    devices: RwLock<HashMap<i64, Device>>,
    logs: RwLock<Vec<DeviceLog>>,
}

impl MemoryStore {
    /// Creates an empty store.
    #[must_use]
    pub fn new() -> Self {
        Self::default()
    }

    /// Adds or replaces a device.
    pub fn insert(&self, device: Device) {
        self.devices.write().insert(device.id, device);
    }

    /// Returns a copy of the device with store key `id`.
    #[must_use]
    pub fn device(&self, id: i64) -> Option<Device> {
        self.devices.read().get(&id).cloned()
    }

    /// Returns every history entry, oldest first.
    #[must_use]
    pub fn logs(&self) -> Vec<DeviceLog> {
        self.logs.read().clone()
    }

    /// Returns the history of one device, oldest first.
    #[must_use]
    pub fn logs_for(&self, device_id: i64) -> Vec<DeviceLog> {
        self.logs
            .read()
            .iter()
            .filter(|log| log.device_id == device_id)
            .cloned()
            .collect()
    }

    fn modify<T>(&self, id: i64, f: impl FnOnce(&mut Device) -> T) -> Result<T, StoreError> {
        let mut devices = self.devices.write();
        let device = devices.get_mut(&id).ok_or(StoreError::NotFound(id))?;
        Ok(f(device))
    }
}

#[async_trait]
impl DeviceStore for MemoryStore {
    async fn get_by_device_no(&self, device_no: &str) -> Result<Option<Device>, StoreError> {
        Ok(self
            .devices
            .read()
            .values()
            .find(|device| device.device_no == device_no)
            .cloned())
    }

    async fn update_fields(&self, id: i64, update: DeviceUpdate) -> Result<(), StoreError> {
        self.modify(id, |device| device.apply(&update))
    }

    async fn create_log(&self, log: DeviceLog) -> Result<(), StoreError> {
        self.logs.write().push(log);
        Ok(())
    }

    async fn update_lock_status(&self, id: i64, status: LockStatus) -> Result<(), StoreError> {
        self.modify(id, |device| device.lock_status = status)
    }

    async fn update_status(&self, id: i64, status: DeviceStatus) -> Result<(), StoreError> {
        self.modify(id, |device| device.status = status)
    }

    async fn mark_online(&self, id: i64, at: DateTime<Utc>) -> Result<bool, StoreError> {
        self.modify(id, |device| {
            if device.is_online() {
                return false;
            }
            device.online_status = OnlineStatus::Online;
            device.last_online_at = Some(at);
            true
        })
    }

    async fn mark_offline(
        &self,
        id: i64,
        at: DateTime<Utc>,
        silent_before: Option<DateTime<Utc>>,
    ) -> Result<bool, StoreError> {
        self.modify(id, |device| {
            let silent = silent_before
                .is_none_or(|cutoff| device.last_heartbeat_at.is_none_or(|seen| seen < cutoff));
            if !device.is_online() || !silent {
                return false;
            }
            device.online_status = OnlineStatus::Offline;
            device.last_offline_at = Some(at);
            true
        })
    }

    async fn stale_online_devices(&self, before: DateTime<Utc>) -> Result<Vec<Device>, StoreError> {
        Ok(self
            .devices
            .read()
            .values()
            .filter(|device| device.is_online())
            .filter(|device| device.last_heartbeat_at.is_none_or(|at| at < before))
            .cloned()
            .collect())
    }
}
