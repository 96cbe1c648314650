// SPDX-License-Identifier: MPL-2.0
// This Source Code Form is subject to the terms of the Mozilla Public
// License, v. 2.0. If a copy of the MPL was not distributed with this
// file, You can obtain one at https://mozilla.org/MPL/2.0/.

//! Device commands.
//!
//! Commands travel as a JSON [`CommandEnvelope`](crate::protocol::CommandEnvelope)
//! on `device/<id>/command` (configuration pushes use `device/<id>/config`).
//! The device answers on `device/<id>/ack` with the same `command_id`.
//!
//! | Command | Arguments | Topic |
//! |---------|-----------|-------|
//! | unlock | optional `slot` | `command` |
//! | lock | none | `command` |
//! | reboot | none | `command` |
//! | upgrade | `url`, `version` | `command` |
//! | config | arbitrary keys | `config` |
//!
//! [`CommandCorrelator`] offers each command in two flavours: `send_*`
//! waits for the ack, `send_*_async` returns the correlation id right after
//! publishing.

mod correlator;

pub use correlator::{CommandCorrelator, CommandReply, CorrelatorConfig};
