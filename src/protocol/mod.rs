// SPDX-License-Identifier: MPL-2.0
// This Source Code Form is subject to the terms of the Mozilla Public
// License, v. 2.0. If a copy of the MPL was not distributed with this
// file, You can obtain one at https://mozilla.org/MPL/2.0/.

//! The MQTT side of the hub.
//!
//! # Layers
//!
//! - [`topics`]: topic layout (`device/<id>/<kind>`) and wildcard matching
//! - [`CommandEnvelope`], [`Heartbeat`], [`StatusReport`], [`EventReport`],
//!   [`CommandAck`]: the JSON wire format
//! - [`BrokerLink`]: the outbound wire seam, implemented for
//!   `rumqttc::AsyncClient`
//! - [`MqttBroker`]: connection, reconnect handling and the subscription
//!   registry
//! - [`TopicRouter`]: decodes device reports and hands them to a
//!   [`DeviceHandler`]

mod envelope;
mod link;
mod mqtt_broker;
mod topic_router;
pub mod topics;

pub use envelope::{
    CommandAck, CommandArgs, CommandEnvelope, CommandKind, EventKind, EventReport, Heartbeat,
    InboundMessage, InboundPayload, MessageKind, StatusReport,
};
pub use link::{BrokerLink, Payload};
pub use mqtt_broker::{
    HandlerFuture, IncomingMessage, MessageHandler, MqttBroker, MqttBrokerBuilder,
    MqttBrokerConfig, connect, message_handler,
};
pub use topic_router::{DeviceHandler, RouteOutcome, RouterConfig, TopicRouter};
