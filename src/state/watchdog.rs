// SPDX-License-Identifier: MPL-2.0
// This Source Code Form is subject to the terms of the Mozilla Public
// License, v. 2.0. If a copy of the MPL was not distributed with this
// file, You can obtain one at https://mozilla.org/MPL/2.0/.

//! Marks silent devices offline.

use std::sync::Arc;
use std::time::Duration;

use chrono::{TimeDelta, Utc};
use tokio::task::JoinHandle;
use tokio::time::{Instant, MissedTickBehavior};
use tokio_util::sync::CancellationToken;

use crate::error::HandlerError;

use super::DeviceReconciler;

/// Liveness check timing.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct WatchdogConfig {
    /// How often the store is scanned.
    pub check_interval: Duration,
    /// Heartbeat silence after which a device counts as offline.
    pub offline_after: Duration,
}

impl Default for WatchdogConfig {
    fn default() -> Self {
        Self {
            check_interval: Duration::from_secs(60),
            offline_after: Duration::from_secs(180),
        }
    }
}

impl WatchdogConfig {
    /// Sets the scan period.
    #[must_use]
    pub fn with_check_interval(mut self, interval: Duration) -> Self {
        self.check_interval = interval;
        self
    }

    /// Sets the silence threshold.
    #[must_use]
    pub fn with_offline_after(mut self, after: Duration) -> Self {
        self.offline_after = after;
        self
    }
}

/// Periodically takes devices offline once their heartbeats stop.
#[derive(Debug, Clone)]
pub struct LivenessWatchdog {
    reconciler: Arc<DeviceReconciler>,
    config: WatchdogConfig,
}

impl LivenessWatchdog {
    /// Creates a watchdog driving `reconciler`.
    #[must_use]
    pub fn new(reconciler: Arc<DeviceReconciler>, config: WatchdogConfig) -> Self {
        Self { reconciler, config }
    }

    /// Returns the watchdog timing.
    #[must_use]
    pub fn config(&self) -> WatchdogConfig {
        self.config
    }

    /// Runs one scan and returns how many devices were taken offline.
    ///
    /// Each device is re-checked against the cutoff as it is taken offline,
    /// so one that reports between the query and the write stays online.
    /// A device that fails to transition is logged and skipped.
    ///
    /// # Errors
    ///
    /// Returns the store error if the stale-device query itself fails.
    pub async fn check_once(&self) -> Result<usize, HandlerError> {
        let silence = TimeDelta::from_std(self.config.offline_after).unwrap_or(TimeDelta::MAX);
        let cutoff = Utc::now()
            .checked_sub_signed(silence)
            .unwrap_or(chrono::DateTime::<Utc>::MIN_UTC);
        let stale = self.reconciler.store().stale_online_devices(cutoff).await?;

        let mut marked = 0;
        for device in stale {
            match self
                .reconciler
                .set_device_offline_if_silent(&device.device_no, cutoff)
                .await
            {
                Ok(true) => marked += 1,
                Ok(false) => {}
                Err(e) => {
                    tracing::warn!(device = %device.device_no, error = %e, "Failed to mark device offline");
                }
            }
        }

        if marked > 0 {
            tracing::info!(marked, "Silent devices marked offline");
        }
        Ok(marked)
    }

    /// Runs [`check_once`](Self::check_once) every check interval until
    /// `cancel` fires.
    pub fn start(&self, cancel: CancellationToken) -> JoinHandle<()> {
        let watchdog = self.clone();
        let period = self.config.check_interval;
        tokio::spawn(async move {
            let mut ticks = tokio::time::interval_at(Instant::now() + period, period);
            ticks.set_missed_tick_behavior(MissedTickBehavior::Delay);
            loop {
                tokio::select! {
                    () = cancel.cancelled() => break,
                    _ = ticks.tick() => {
                        if let Err(e) = watchdog.check_once().await {
                            tracing::warn!(error = %e, "Liveness check failed");
                        }
                    }
                }
            }
            tracing::debug!("Liveness watchdog stopped");
        })
    }
}
