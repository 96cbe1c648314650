// SPDX-License-Identifier: MPL-2.0
// This Source Code Form is subject to the terms of the Mozilla Public
// License, v. 2.0. If a copy of the MPL was not distributed with this
// file, You can obtain one at https://mozilla.org/MPL/2.0/.

//! End-to-end flows through a hub wired to an in-memory link.
//!
//! A simulated device answers published commands by pushing reports back
//! through `MqttBroker::deliver`, exactly as the event loop would.

use std::sync::Arc;
use std::time::Duration;

use lockhub::protocol::topics::{ParsedTopic, report_topic};
use lockhub::protocol::{CommandArgs, CommandEnvelope, CommandKind, MqttBroker, MqttBrokerConfig};
use lockhub::state::{Device, LogType, MemoryStore};
use lockhub::testing::RecordingLink;
use lockhub::{CommandError, CorrelatorConfig, DeviceHub, LockStatus, OnlineStatus};
use serde_json::json;
use tokio_util::sync::CancellationToken;

struct Harness {
    hub: DeviceHub,
    broker: MqttBroker,
    link: Arc<RecordingLink>,
    store: Arc<MemoryStore>,
}

async fn harness(correlator: CorrelatorConfig) -> Harness {
    let link = Arc::new(RecordingLink::new());
    let broker = MqttBroker::from_link(link.clone(), MqttBrokerConfig::default());
    let store = Arc::new(MemoryStore::new());
    store.insert(Device::new(1, "lock-1"));
    store.insert(Device::new(2, "lock-2"));

    let hub = DeviceHub::builder(broker.clone(), store.clone())
        .correlator_config(correlator)
        .start()
        .await
        .unwrap();

    Harness {
        hub,
        broker,
        link,
        store,
    }
}

/// Pushes a report as if it had arrived from the broker and waits for the
/// handlers to finish.
async fn push(broker: &MqttBroker, device_id: &str, kind: &str, body: serde_json::Value) {
    for task in broker.deliver(&report_topic(device_id, kind), body.to_string().into_bytes()) {
        task.await.unwrap();
    }
}

/// Makes every device answer commands: an event for lock/unlock, then an ack.
fn simulate_devices(link: &RecordingLink, broker: &MqttBroker, success: bool) {
    let broker = broker.clone();
    link.on_publish(move |published| {
        let Some(topic) = ParsedTopic::parse(&published.topic) else {
            return;
        };
        let device_id = topic.device_id.to_string();
        let envelope: CommandEnvelope = published.json().unwrap();
        let broker = broker.clone();
        let message = if success { "ok" } else { "motor stalled" };

        tokio::spawn(async move {
            if success {
                match envelope.command {
                    CommandKind::Unlock => {
                        push(&broker, &device_id, "event", json!({"type": "unlocked"})).await;
                    }
                    CommandKind::Lock => {
                        push(&broker, &device_id, "event", json!({"type": "locked"})).await;
                    }
                    _ => {}
                }
            }
            push(
                &broker,
                &device_id,
                "ack",
                json!({
                    "command_id": envelope.command_id,
                    "success": success,
                    "message": message,
                }),
            )
            .await;
        });
    });
}

#[tokio::test]
async fn unlock_round_trip_updates_state() {
    let h = harness(CorrelatorConfig::default()).await;
    simulate_devices(&h.link, &h.broker, true);

    let reply = h
        .hub
        .correlator()
        .send_unlock(&CancellationToken::new(), "lock-1", CommandArgs::new().slot(1))
        .await
        .unwrap();

    assert!(reply.success);
    assert_eq!(reply.message, "ok");
    assert_eq!(h.hub.correlator().pending_count(), 0);

    let device = h.store.device(1).unwrap();
    assert_eq!(device.lock_status, LockStatus::Unlocked);
    let logs = h.store.logs_for(1);
    assert_eq!(logs.len(), 1);
    assert_eq!(logs[0].log_type, LogType::Unlock);
    assert_eq!(logs[0].actor.as_deref(), Some("system"));

    h.hub.shutdown().await.unwrap();
}

#[tokio::test]
async fn failed_command_is_a_reply() {
    let h = harness(CorrelatorConfig::default()).await;
    simulate_devices(&h.link, &h.broker, false);

    let reply = h
        .hub
        .correlator()
        .send_lock(&CancellationToken::new(), "lock-2", CommandArgs::new())
        .await
        .unwrap();

    assert!(!reply.success);
    assert_eq!(reply.message, "motor stalled");
    assert!(h.store.logs().is_empty());
}

#[tokio::test]
async fn concurrent_commands_to_many_devices() {
    let h = harness(CorrelatorConfig::default()).await;
    simulate_devices(&h.link, &h.broker, true);
    let correlator = Arc::clone(h.hub.correlator());

    let unlock = {
        let correlator = Arc::clone(&correlator);
        tokio::spawn(async move {
            correlator
                .send_unlock(&CancellationToken::new(), "lock-1", CommandArgs::new())
                .await
        })
    };
    let reboot = {
        let correlator = Arc::clone(&correlator);
        tokio::spawn(async move {
            correlator
                .send_reboot(&CancellationToken::new(), "lock-2", CommandArgs::new())
                .await
        })
    };

    let unlock = unlock.await.unwrap().unwrap();
    let reboot = reboot.await.unwrap().unwrap();

    assert_ne!(unlock.command_id, reboot.command_id);
    assert_eq!(correlator.pending_count(), 0);
}

#[tokio::test(start_paused = true)]
async fn silent_device_times_out_without_leaking() {
    let h = harness(CorrelatorConfig::default().with_ack_timeout(Duration::from_secs(30))).await;
    let before = h.hub.correlator().pending_count();

    let err = h
        .hub
        .correlator()
        .send_unlock(&CancellationToken::new(), "lock-1", CommandArgs::new())
        .await
        .unwrap_err();

    assert!(matches!(err, CommandError::Timeout { timeout_ms: 30_000, .. }));
    assert_eq!(h.hub.correlator().pending_count(), before);
    assert_eq!(h.store.device(1).unwrap().lock_status, LockStatus::Locked);
}

#[tokio::test]
async fn ack_for_async_command_is_ignored() {
    let h = harness(CorrelatorConfig::default()).await;
    simulate_devices(&h.link, &h.broker, true);

    let command_id = h
        .hub
        .correlator()
        .send_reboot_async("lock-1", CommandArgs::new())
        .await
        .unwrap();

    // Let the simulated device answer.
    for _ in 0..10 {
        tokio::task::yield_now().await;
    }

    assert!(!h.hub.correlator().is_pending(&command_id));
    assert_eq!(h.hub.correlator().pending_count(), 0);
}

#[tokio::test]
async fn heartbeats_drive_online_history() {
    let h = harness(CorrelatorConfig::default()).await;

    for battery in [90, 89, 88] {
        push(&h.broker, "lock-1", "heartbeat", json!({"battery": battery, "signal": -71})).await;
    }

    let device = h.store.device(1).unwrap();
    assert_eq!(device.online_status, OnlineStatus::Online);
    assert_eq!(device.telemetry.battery, Some(88));
    assert_eq!(device.telemetry.signal, Some(-71));
    let logs = h.store.logs_for(1);
    assert_eq!(logs.len(), 1);
    assert_eq!(logs[0].log_type, LogType::Online);

    assert!(h.hub.reconciler().set_device_offline("lock-1").await.unwrap());
    push(&h.broker, "lock-1", "heartbeat", json!({})).await;

    let types: Vec<LogType> = h.store.logs_for(1).into_iter().map(|log| log.log_type).collect();
    assert_eq!(types, vec![LogType::Online, LogType::Offline, LogType::Online]);
}

#[tokio::test]
async fn bad_reports_do_not_disturb_the_hub() {
    let h = harness(CorrelatorConfig::default()).await;

    push(&h.broker, "lock-404", "heartbeat", json!({"battery": 1})).await;
    for task in h.broker.deliver("device/lock-1/status", b"not json".to_vec()) {
        task.await.unwrap();
    }
    push(&h.broker, "lock-1", "status", json!({"online_status": "online"})).await;

    assert!(h.store.logs().is_empty());
    assert_eq!(h.store.device(1).unwrap().online_status, OnlineStatus::Offline);

    push(
        &h.broker,
        "lock-1",
        "status",
        json!({
            "online_status": "online",
            "lock_status": "unlocked",
            "status": "in_use",
            "available_slots": 4
        }),
    )
    .await;
    let device = h.store.device(1).unwrap();
    assert_eq!(device.online_status, OnlineStatus::Online);
    assert_eq!(device.available_slots, 4);
}

#[tokio::test]
async fn cancelled_send_leaves_no_entry() {
    let h = harness(CorrelatorConfig::default()).await;
    let cancel = CancellationToken::new();
    cancel.cancel();

    let err = h
        .hub
        .correlator()
        .send_config(&cancel, "lock-1", CommandArgs::new().with("volume", 3))
        .await
        .unwrap_err();

    assert!(matches!(err, CommandError::Cancelled { .. }));
    assert_eq!(h.hub.correlator().pending_count(), 0);
}
