// SPDX-License-Identifier: MPL-2.0
// This Source Code Form is subject to the terms of the Mozilla Public
// License, v. 2.0. If a copy of the MPL was not distributed with this
// file, You can obtain one at https://mozilla.org/MPL/2.0/.

//! Device state reconciliation.
//!
//! [`DeviceReconciler`] is the [`DeviceHandler`](crate::protocol::DeviceHandler)
//! behind the topic router: it turns heartbeats, status snapshots and events
//! into writes on a [`DeviceStore`], and forwards acks to the command
//! correlator. [`LivenessWatchdog`] drives the offline transition for
//! devices that stop reporting.
//!
//! # Examples
//!
//! ```
//! use lockhub::state::{Device, DeviceUpdate};
//! use lockhub::types::LockStatus;
//!
//! let mut device = Device::new(1, "lock-0001");
//! device.apply(&DeviceUpdate {
//!     lock_status: Some(LockStatus::Unlocked),
//!     ..DeviceUpdate::default()
//! });
//!
//! assert_eq!(device.lock_status, LockStatus::Unlocked);
//! ```

mod device;
mod log;
mod reconciler;
mod store;
mod watchdog;

pub use device::{Device, DeviceUpdate, Telemetry};
pub use log::{DeviceLog, LogType, SYSTEM_ACTOR};
pub use reconciler::DeviceReconciler;
pub use store::{DeviceStore, MemoryStore};
pub use watchdog::{LivenessWatchdog, WatchdogConfig};
