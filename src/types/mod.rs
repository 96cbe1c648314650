// SPDX-License-Identifier: MPL-2.0
// This Source Code Form is subject to the terms of the Mozilla Public
// License, v. 2.0. If a copy of the MPL was not distributed with this
// file, You can obtain one at https://mozilla.org/MPL/2.0/.

//! Value types shared by the wire format and the device store.
//!
//! - [`OnlineStatus`] - reachability (online/offline)
//! - [`LockStatus`] - physical lock state (locked/unlocked)
//! - [`DeviceStatus`] - rental availability (idle/in use/fault/maintenance)

mod status;

pub use status::{DeviceStatus, LockStatus, OnlineStatus};
