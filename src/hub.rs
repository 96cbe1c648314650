// SPDX-License-Identifier: MPL-2.0
// This Source Code Form is subject to the terms of the Mozilla Public
// License, v. 2.0. If a copy of the MPL was not distributed with this
// file, You can obtain one at https://mozilla.org/MPL/2.0/.

//! The assembled device backend.

use std::sync::Arc;

use parking_lot::Mutex;
use tokio::task::JoinHandle;
use tokio_util::sync::CancellationToken;

use crate::command::{CommandCorrelator, CorrelatorConfig};
use crate::error::TransportError;
use crate::protocol::{MqttBroker, RouterConfig, TopicRouter};
use crate::state::{DeviceReconciler, DeviceStore, LivenessWatchdog, WatchdogConfig};

/// A running hub: broker connection, command correlation, report routing
/// and state reconciliation, plus their background tasks.
///
/// # Examples
///
/// ```no_run
/// use std::sync::Arc;
/// use lockhub::DeviceHub;
/// use lockhub::protocol::{CommandArgs, MqttBroker};
/// use lockhub::state::{Device, MemoryStore, WatchdogConfig};
/// use tokio_util::sync::CancellationToken;
///
/// #[tokio::main]
/// async fn main() -> lockhub::Result<()> {
///     let broker = MqttBroker::builder()
///         .url("mqtt://192.168.1.50:1883")?
///         .credentials("backend", "secret")
///         .build()
///         .await?;
///
///     let store = Arc::new(MemoryStore::new());
///     store.insert(Device::new(1, "lock-0001"));
///
///     let hub = DeviceHub::builder(broker, store)
///         .watchdog(WatchdogConfig::default())
///         .start()
///         .await?;
///
///     let reply = hub
///         .correlator()
///         .send_unlock(&CancellationToken::new(), "lock-0001", CommandArgs::new())
///         .await?;
///     println!("unlock acknowledged: {}", reply.success);
///
///     hub.shutdown().await?;
///     Ok(())
/// }
/// ```
pub struct DeviceHub {
    broker: MqttBroker,
    correlator: Arc<CommandCorrelator>,
    reconciler: Arc<DeviceReconciler>,
    router: TopicRouter,
    cancel: CancellationToken,
    tasks: Mutex<Vec<JoinHandle<()>>>,
}

impl DeviceHub {
    /// Creates a builder over a connected broker and a device store.
    #[must_use]
    pub fn builder(broker: MqttBroker, store: Arc<dyn DeviceStore>) -> DeviceHubBuilder {
        DeviceHubBuilder {
            broker,
            store,
            correlator: CorrelatorConfig::default(),
            router: RouterConfig::default(),
            watchdog: None,
        }
    }

    /// Returns the broker connection.
    #[must_use]
    pub fn broker(&self) -> &MqttBroker {
        &self.broker
    }

    /// Returns the command API.
    #[must_use]
    pub fn correlator(&self) -> &Arc<CommandCorrelator> {
        &self.correlator
    }

    /// Returns the reconciler, e.g. to take a device offline by hand.
    #[must_use]
    pub fn reconciler(&self) -> &Arc<DeviceReconciler> {
        &self.reconciler
    }

    /// Returns the report router.
    #[must_use]
    pub fn router(&self) -> &TopicRouter {
        &self.router
    }

    /// Stops routing, waits for the background tasks and disconnects.
    ///
    /// Safe to call more than once.
    ///
    /// # Errors
    ///
    /// Returns the broker's disconnect error. Unsubscribe failures are
    /// logged only.
    pub async fn shutdown(&self) -> Result<(), TransportError> {
        if let Err(e) = self.router.stop().await {
            tracing::warn!(error = %e, "Unsubscribe during shutdown failed");
        }
        self.cancel.cancel();

        let tasks = std::mem::take(&mut *self.tasks.lock());
        for task in tasks {
            if let Err(e) = task.await {
                tracing::warn!(error = %e, "Background task ended abnormally");
            }
        }

        self.broker.disconnect().await?;
        tracing::info!("Device hub stopped");
        Ok(())
    }
}

impl std::fmt::Debug for DeviceHub {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("DeviceHub")
            .field("broker", &self.broker)
            .field("correlator", &self.correlator)
            .field("router", &self.router)
            .finish_non_exhaustive()
    }
}

/// Builder for [`DeviceHub`].
#[must_use]
pub struct DeviceHubBuilder {
    broker: MqttBroker,
    store: Arc<dyn DeviceStore>,
    correlator: CorrelatorConfig,
    router: RouterConfig,
    watchdog: Option<WatchdogConfig>,
}

impl DeviceHubBuilder {
    /// Sets the command timing.
    pub fn correlator_config(mut self, config: CorrelatorConfig) -> Self {
        self.correlator = config;
        self
    }

    /// Sets the dispatch timeout.
    pub fn router_config(mut self, config: RouterConfig) -> Self {
        self.router = config;
        self
    }

    /// Enables the liveness watchdog. Disabled by default.
    pub fn watchdog(mut self, config: WatchdogConfig) -> Self {
        self.watchdog = Some(config);
        self
    }

    /// Wires the components, subscribes to device reports and starts the
    /// background tasks.
    ///
    /// # Errors
    ///
    /// Returns the subscription error if report routing cannot start. The
    /// report patterns are unsubscribed again before returning.
    pub async fn start(self) -> Result<DeviceHub, TransportError> {
        let correlator = Arc::new(CommandCorrelator::with_config(
            self.broker.clone(),
            self.correlator,
        ));
        let reconciler = Arc::new(DeviceReconciler::new(self.store, Arc::clone(&correlator)));
        let router = TopicRouter::with_config(self.broker.clone(), reconciler.clone(), self.router);

        let cancel = CancellationToken::new();
        if let Err(e) = router.start(&cancel).await {
            // Registered patterns would otherwise be replayed on every reconnect.
            if let Err(stop) = router.stop().await {
                tracing::warn!(error = %stop, "Unsubscribe after failed start failed");
            }
            cancel.cancel();
            return Err(e);
        }

        let mut tasks = vec![correlator.start_cleanup(cancel.child_token())];
        if let Some(config) = self.watchdog {
            let watchdog = LivenessWatchdog::new(Arc::clone(&reconciler), config);
            tasks.push(watchdog.start(cancel.child_token()));
        }

        tracing::info!(
            host = %self.broker.config().host(),
            background_tasks = tasks.len(),
            "Device hub started"
        );

        Ok(DeviceHub {
            broker: self.broker,
            correlator,
            reconciler,
            router,
            cancel,
            tasks: Mutex::new(tasks),
        })
    }
}

impl std::fmt::Debug for DeviceHubBuilder {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("DeviceHubBuilder")
            .field("correlator", &self.correlator)
            .field("router", &self.router)
            .field("watchdog", &self.watchdog)
            .finish_non_exhaustive()
    }
}
