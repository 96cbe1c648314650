// SPDX-License-Identifier: MPL-2.0
// This Source Code Form is subject to the terms of the Mozilla Public
// License, v. 2.0. If a copy of the MPL was not distributed with this
// file, You can obtain one at https://mozilla.org/MPL/2.0/.

//! Applies device reports to the store.

use std::sync::Arc;

use async_trait::async_trait;
use chrono::{DateTime, Utc};

use crate::command::CommandCorrelator;
use crate::error::HandlerError;
use crate::protocol::{CommandAck, DeviceHandler, EventKind, EventReport, Heartbeat, StatusReport};
use crate::types::{DeviceStatus, LockStatus};

use super::{Device, DeviceLog, DeviceStore, DeviceUpdate, LogType};

/// Keeps stored device state in line with what devices report.
///
/// History entries are written only on transitions: coming online, going
/// offline, and device events. Routine heartbeats and status snapshots
/// update fields silently.
pub struct DeviceReconciler {
    store: Arc<dyn DeviceStore>,
    correlator: Arc<CommandCorrelator>,
}

impl DeviceReconciler {
    /// Creates a reconciler writing to `store` and forwarding acks to
    /// `correlator`.
    #[must_use]
    pub fn new(store: Arc<dyn DeviceStore>, correlator: Arc<CommandCorrelator>) -> Self {
        Self { store, correlator }
    }

    /// Returns the store this reconciler writes to.
    #[must_use]
    pub fn store(&self) -> &Arc<dyn DeviceStore> {
        &self.store
    }

    async fn device(&self, device_no: &str) -> Result<Device, HandlerError> {
        self.store
            .get_by_device_no(device_no)
            .await?
            .ok_or_else(|| HandlerError::UnknownDevice(device_no.to_string()))
    }

    /// Marks an online device offline.
    ///
    /// Returns `false` without writing anything if the device is already
    /// offline.
    ///
    /// # Errors
    ///
    /// Returns [`HandlerError::UnknownDevice`] if no device uses
    /// `device_no`, or the store error if a write fails.
    pub async fn set_device_offline(&self, device_no: &str) -> Result<bool, HandlerError> {
        self.take_offline(device_no, None).await
    }

    /// Marks an online device offline unless it has sent a heartbeat at or
    /// after `cutoff`.
    ///
    /// The heartbeat check happens in the same store write as the
    /// transition, so a heartbeat landing after a stale-device query keeps
    /// the device online.
    ///
    /// # Errors
    ///
    /// Same as [`set_device_offline`](Self::set_device_offline).
    pub async fn set_device_offline_if_silent(
        &self,
        device_no: &str,
        cutoff: DateTime<Utc>,
    ) -> Result<bool, HandlerError> {
        self.take_offline(device_no, Some(cutoff)).await
    }

    async fn take_offline(
        &self,
        device_no: &str,
        silent_before: Option<DateTime<Utc>>,
    ) -> Result<bool, HandlerError> {
        let device = self.device(device_no).await?;
        if !self
            .store
            .mark_offline(device.id, Utc::now(), silent_before)
            .await?
        {
            return Ok(false);
        }

        self.store
            .create_log(DeviceLog::system(device.id, LogType::Offline, None))
            .await?;
        tracing::info!(device = %device_no, "Device went offline");
        Ok(true)
    }
}

impl std::fmt::Debug for DeviceReconciler {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("DeviceReconciler")
            .field("correlator", &self.correlator)
            .finish_non_exhaustive()
    }
}

#[async_trait]
impl DeviceHandler for DeviceReconciler {
    async fn on_heartbeat(&self, device_id: &str, heartbeat: Heartbeat) -> Result<(), HandlerError> {
        let device = self.device(device_id).await?;
        let now = Utc::now();

        let mut update = DeviceUpdate::from_heartbeat(&heartbeat);
        update.last_heartbeat_at = Some(now);
        self.store.update_fields(device.id, update).await?;

        // Only the caller that flips the stored status writes the log.
        if self.store.mark_online(device.id, now).await? {
            self.store
                .create_log(DeviceLog::system(device.id, LogType::Online, None))
                .await?;
            tracing::info!(device = %device_id, "Device came online");
        }
        Ok(())
    }

    async fn on_status(&self, device_id: &str, status: StatusReport) -> Result<(), HandlerError> {
        let device = self.device(device_id).await?;
        self.store
            .update_fields(device.id, DeviceUpdate::from_status(&status))
            .await?;
        tracing::debug!(
            device = %device_id,
            online = %status.online_status,
            lock = %status.lock_status,
            status = %status.status,
            "Status snapshot applied"
        );
        Ok(())
    }

    async fn on_event(&self, device_id: &str, event: EventReport) -> Result<(), HandlerError> {
        let device = self.device(device_id).await?;
        let kind = event.kind();

        match kind {
            EventKind::Unlocked => {
                self.store
                    .update_lock_status(device.id, LockStatus::Unlocked)
                    .await?;
            }
            EventKind::Locked => {
                self.store
                    .update_lock_status(device.id, LockStatus::Locked)
                    .await?;
            }
            EventKind::Error | EventKind::Alarm => {
                self.store.update_status(device.id, DeviceStatus::Fault).await?;
                tracing::warn!(device = %device_id, event = %event.event_type, "Device reported a fault");
            }
            EventKind::Other(_) => {}
        }

        let content = event.message().map(str::to_string);
        self.store
            .create_log(DeviceLog::system(device.id, LogType::from_event(kind), content))
            .await?;
        tracing::debug!(device = %device_id, event = %event.event_type, "Device event recorded");
        Ok(())
    }

    async fn on_ack(&self, device_id: &str, ack: CommandAck) -> Result<(), HandlerError> {
        let delivered = self.correlator.handle_ack(&ack);
        tracing::debug!(device = %device_id, command_id = %ack.command_id, delivered, "Ack received");
        Ok(())
    }
}
