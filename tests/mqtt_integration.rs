// SPDX-License-Identifier: MPL-2.0
// This Source Code Form is subject to the terms of the Mozilla Public
// License, v. 2.0. If a copy of the MPL was not distributed with this
// file, You can obtain one at https://mozilla.org/MPL/2.0/.

//! Integration tests for the MQTT transport using mockforge-mqtt.

use std::sync::Arc;
use std::time::Duration;

use lockhub::DeviceHub;
use lockhub::TransportError;
use lockhub::protocol::{MqttBroker, Payload, message_handler};
use lockhub::state::{Device, MemoryStore};
use mockforge_mqtt::broker::MqttConfig;
use mockforge_mqtt::start_mqtt_server;
use tokio::time::sleep;

/// Helper to find an available port for testing.
fn get_test_port() -> u16 {
    use std::sync::atomic::{AtomicU16, Ordering};
    static PORT_COUNTER: AtomicU16 = AtomicU16::new(18850);
    PORT_COUNTER.fetch_add(1, Ordering::SeqCst)
}

/// Starts a mock MQTT broker on the given port.
async fn start_mock_broker(port: u16) {
    let config = MqttConfig {
        port,
        host: "127.0.0.1".to_string(),
        ..Default::default()
    };

    tokio::spawn(async move {
        let _ = start_mqtt_server(config).await;
    });

    // Give the broker time to bind
    sleep(Duration::from_millis(500)).await;
}

// ============================================================================
// Connection
// ============================================================================

mod connection {
    use super::*;

    #[tokio::test]
    async fn connect_to_broker() {
        let port = get_test_port();
        start_mock_broker(port).await;

        let result = MqttBroker::builder()
            .host("127.0.0.1")
            .port(port)
            .build()
            .await;

        assert!(result.is_ok(), "Failed to connect: {:?}", result.err());
        assert!(result.unwrap().is_connected());
    }

    #[tokio::test]
    async fn connect_with_url() {
        let port = get_test_port();
        start_mock_broker(port).await;

        let result = MqttBroker::builder()
            .url(&format!("mqtt://127.0.0.1:{port}"))
            .unwrap()
            .client_id("lockhub-it")
            .build()
            .await;

        assert!(result.is_ok());
    }

    #[tokio::test]
    async fn connect_without_listener_fails() {
        let port = get_test_port();

        let result = MqttBroker::builder()
            .host("127.0.0.1")
            .port(port)
            .connection_timeout(Duration::from_secs(2))
            .build()
            .await;

        assert!(matches!(result, Err(TransportError::Connect(_))));
    }

    #[tokio::test]
    async fn build_missing_host_fails() {
        let result = MqttBroker::builder().build().await;

        assert!(matches!(result, Err(TransportError::InvalidAddress(_))));
    }

    #[tokio::test]
    async fn disconnect_marks_broker_disconnected() {
        let port = get_test_port();
        start_mock_broker(port).await;

        let broker = MqttBroker::builder()
            .host("127.0.0.1")
            .port(port)
            .build()
            .await
            .unwrap();

        broker.disconnect().await.unwrap();

        assert!(!broker.is_connected());
        assert_eq!(broker.subscription_count(), 0);
    }
}

// ============================================================================
// Subscriptions and publishing
// ============================================================================

mod messaging {
    use super::*;

    #[tokio::test]
    async fn subscribe_registers_handler() {
        let port = get_test_port();
        start_mock_broker(port).await;

        let broker = MqttBroker::builder()
            .host("127.0.0.1")
            .port(port)
            .build()
            .await
            .unwrap();

        broker
            .subscribe("device/+/heartbeat", message_handler(|_msg| async {}))
            .await
            .unwrap();

        assert_eq!(broker.subscribed_topics(), vec!["device/+/heartbeat".to_string()]);
    }

    #[tokio::test]
    async fn publish_raw_and_json() {
        let port = get_test_port();
        start_mock_broker(port).await;

        let broker = MqttBroker::builder()
            .host("127.0.0.1")
            .port(port)
            .build()
            .await
            .unwrap();

        broker.publish("device/lock-1/command", "reboot").await.unwrap();
        broker
            .publish(
                "device/lock-1/config",
                Payload::json(&serde_json::json!({"heartbeat_interval": 30})).unwrap(),
            )
            .await
            .unwrap();
    }

    #[tokio::test]
    async fn hub_starts_and_stops_over_a_real_connection() {
        let port = get_test_port();
        start_mock_broker(port).await;

        let broker = MqttBroker::builder()
            .host("127.0.0.1")
            .port(port)
            .build()
            .await
            .unwrap();
        let store = Arc::new(MemoryStore::new());
        store.insert(Device::new(1, "lock-1"));

        let hub = DeviceHub::builder(broker, store).start().await.unwrap();
        assert_eq!(hub.broker().subscription_count(), 4);

        hub.shutdown().await.unwrap();
        assert!(!hub.broker().is_connected());
    }
}
