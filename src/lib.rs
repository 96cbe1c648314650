// SPDX-License-Identifier: MPL-2.0
// This Source Code Form is subject to the terms of the Mozilla Public
// License, v. 2.0. If a copy of the MPL was not distributed with this
// file, You can obtain one at https://mozilla.org/MPL/2.0/.

//! `lockhub` - backend core for lockable rental devices reachable over MQTT.
//!
//! Devices only talk through the broker: they push heartbeats, status
//! snapshots, events and command acknowledgements, and receive commands on
//! their own topics. This library turns that one-way traffic into
//! request/response commands and keeps stored device state current.
//!
//! # Components
//!
//! - [`protocol::MqttBroker`]: connection, subscription registry, resubscribe
//!   on reconnect, bounded per-message dispatch
//! - [`protocol::TopicRouter`]: decodes `device/<id>/<kind>` reports and
//!   hands them to a [`protocol::DeviceHandler`]
//! - [`command::CommandCorrelator`]: sends commands and pairs them with acks
//!   by correlation id, with timeout and cancellation
//! - [`state::DeviceReconciler`]: applies reports to a [`state::DeviceStore`]
//!   and writes transition history
//! - [`DeviceHub`]: all of the above wired together
//!
//! # Topics
//!
//! | Direction | Topic | Payload |
//! |-----------|-------|---------|
//! | device → hub | `device/<id>/heartbeat` | [`protocol::Heartbeat`] |
//! | device → hub | `device/<id>/status` | [`protocol::StatusReport`] |
//! | device → hub | `device/<id>/event` | [`protocol::EventReport`] |
//! | device → hub | `device/<id>/ack` | [`protocol::CommandAck`] |
//! | hub → device | `device/<id>/command` | [`protocol::CommandEnvelope`] |
//! | hub → device | `device/<id>/config` | [`protocol::CommandEnvelope`] |
//!
//! # Quick Start
//!
//! ```no_run
//! use std::sync::Arc;
//! use lockhub::DeviceHub;
//! use lockhub::protocol::{CommandArgs, MqttBroker};
//! use lockhub::state::{Device, MemoryStore};
//! use tokio_util::sync::CancellationToken;
//!
//! #[tokio::main]
//! async fn main() -> lockhub::Result<()> {
//!     let broker = MqttBroker::builder()
//!         .host("192.168.1.50")
//!         .build()
//!         .await?;
//!
//!     let store = Arc::new(MemoryStore::new());
//!     store.insert(Device::new(1, "lock-0001"));
//!
//!     let hub = DeviceHub::builder(broker, store).start().await?;
//!
//!     // Wait for the device to confirm
//!     let cancel = CancellationToken::new();
//!     let reply = hub
//!         .correlator()
//!         .send_unlock(&cancel, "lock-0001", CommandArgs::new().slot(1))
//!         .await?;
//!     println!("success={} message={}", reply.success, reply.message);
//!
//!     // Or fire and forget
//!     let id = hub
//!         .correlator()
//!         .send_reboot_async("lock-0001", CommandArgs::new())
//!         .await?;
//!     println!("reboot sent as {id}");
//!
//!     hub.shutdown().await?;
//!     Ok(())
//! }
//! ```
//!
//! # Logging
//!
//! The library emits [`tracing`] events and never installs a subscriber.

pub mod command;
pub mod error;
mod hub;
pub mod protocol;
pub mod state;
pub mod testing;
pub mod types;

pub use command::{CommandCorrelator, CommandReply, CorrelatorConfig};
pub use error::{CommandError, DecodeError, Error, HandlerError, Result, StoreError, TransportError};
pub use hub::{DeviceHub, DeviceHubBuilder};
pub use protocol::{MqttBroker, MqttBrokerBuilder, MqttBrokerConfig, TopicRouter};
pub use types::{DeviceStatus, LockStatus, OnlineStatus};
