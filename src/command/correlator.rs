// SPDX-License-Identifier: MPL-2.0
// This Source Code Form is subject to the terms of the Mozilla Public
// License, v. 2.0. If a copy of the MPL was not distributed with this
// file, You can obtain one at https://mozilla.org/MPL/2.0/.

//! Request/acknowledgement correlation over the broker.

use std::collections::HashMap;
use std::sync::Arc;
use std::time::Duration;

use parking_lot::Mutex;
use tokio::sync::mpsc;
use tokio::sync::mpsc::error::TrySendError;
use tokio::task::JoinHandle;
use tokio::time::{Instant, MissedTickBehavior};
use tokio_util::sync::CancellationToken;

use crate::error::{CommandError, TransportError};
use crate::protocol::{CommandAck, CommandArgs, CommandEnvelope, CommandKind, MqttBroker, Payload};

/// Correlator timing.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct CorrelatorConfig {
    /// How long a synchronous send waits for its acknowledgement.
    pub ack_timeout: Duration,
    /// Period of the background sweep started by
    /// [`CommandCorrelator::start_cleanup`].
    pub cleanup_interval: Duration,
}

impl Default for CorrelatorConfig {
    fn default() -> Self {
        Self {
            ack_timeout: Duration::from_secs(30),
            cleanup_interval: Duration::from_secs(60),
        }
    }
}

impl CorrelatorConfig {
    /// Sets the acknowledgement timeout.
    #[must_use]
    pub fn with_ack_timeout(mut self, timeout: Duration) -> Self {
        self.ack_timeout = timeout;
        self
    }

    /// Sets the sweep period.
    #[must_use]
    pub fn with_cleanup_interval(mut self, interval: Duration) -> Self {
        self.cleanup_interval = interval;
        self
    }
}

/// The outcome reported by a device for a synchronous command.
///
/// A device that answers `success: false` still produces a reply; only
/// the absence of an answer is an error.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct CommandReply {
    /// Correlation id of the command.
    pub command_id: String,
    /// Whether the device executed the command.
    pub success: bool,
    /// Device-provided detail.
    pub message: String,
}

impl From<CommandAck> for CommandReply {
    fn from(ack: CommandAck) -> Self {
        Self {
            command_id: ack.command_id,
            success: ack.success,
            message: ack.message,
        }
    }
}

struct PendingCommand {
    device_id: String,
    kind: CommandKind,
    created_at: Instant,
    /// Capacity 1: the first ack wins, later ones are dropped.
    reply: mpsc::Sender<CommandAck>,
}

/// Removes a pending entry when the waiting send returns or is dropped.
struct PendingGuard<'a> {
    pending: &'a Mutex<HashMap<String, PendingCommand>>,
    command_id: String,
}

impl Drop for PendingGuard<'_> {
    fn drop(&mut self) {
        self.pending.lock().remove(&self.command_id);
    }
}

/// Sends commands to devices and pairs them with their acknowledgements.
///
/// Synchronous sends register a pending entry keyed by a fresh correlation
/// id and wait until the matching ack arrives through
/// [`handle_ack`](Self::handle_ack), the ack timeout elapses, or the
/// caller's token is cancelled. The entry is removed on every exit path.
///
/// # Examples
///
/// ```no_run
/// use std::sync::Arc;
/// use lockhub::command::CommandCorrelator;
/// use lockhub::protocol::{CommandArgs, MqttBroker};
/// use tokio_util::sync::CancellationToken;
///
/// # async fn example() -> lockhub::Result<()> {
/// let broker = MqttBroker::builder().host("192.168.1.50").build().await?;
/// let correlator = Arc::new(CommandCorrelator::new(broker));
///
/// let reply = correlator
///     .send_unlock(&CancellationToken::new(), "lock-0042", CommandArgs::new().slot(2))
///     .await?;
/// println!("unlocked: {}", reply.success);
/// # Ok(())
/// # }
/// ```
pub struct CommandCorrelator {
    broker: MqttBroker,
    pending: Mutex<HashMap<String, PendingCommand>>,
    config: CorrelatorConfig,
}

impl CommandCorrelator {
    /// Creates a correlator with the default timeouts.
    #[must_use]
    pub fn new(broker: MqttBroker) -> Self {
        Self::with_config(broker, CorrelatorConfig::default())
    }

    /// Creates a correlator with explicit timeouts.
    #[must_use]
    pub fn with_config(broker: MqttBroker, config: CorrelatorConfig) -> Self {
        Self {
            broker,
            pending: Mutex::new(HashMap::new()),
            config,
        }
    }

    /// Returns the correlator timing.
    #[must_use]
    pub fn config(&self) -> CorrelatorConfig {
        self.config
    }

    /// Sends `kind` to `device_id` and waits for the device's ack.
    ///
    /// # Errors
    ///
    /// - [`CommandError::Transport`] if the envelope cannot be published
    /// - [`CommandError::Cancelled`] if `cancel` fires first
    /// - [`CommandError::Timeout`] if no ack arrives within the ack timeout
    /// - [`CommandError::Expired`] if the entry was swept while waiting
    pub async fn send(
        &self,
        cancel: &CancellationToken,
        device_id: &str,
        kind: CommandKind,
        args: CommandArgs,
    ) -> Result<CommandReply, CommandError> {
        let (reply, mut acks) = mpsc::channel(1);
        let envelope = self.register(device_id, kind, args, reply);
        let command_id = envelope.command_id.clone();
        let _guard = PendingGuard {
            pending: &self.pending,
            command_id: command_id.clone(),
        };

        tracing::debug!(device = %device_id, command = %kind, command_id = %command_id, "Sending command");
        match self
            .broker
            .publish_with_cancel(cancel, &kind.topic(device_id), Payload::json(&envelope)?)
            .await
        {
            Ok(()) => {}
            Err(TransportError::Cancelled) => return Err(CommandError::Cancelled { command_id }),
            Err(e) => return Err(e.into()),
        }

        let timeout = self.config.ack_timeout;
        tokio::select! {
            biased;
            () = cancel.cancelled() => {
                tracing::debug!(command_id = %command_id, "Command wait cancelled");
                Err(CommandError::Cancelled { command_id })
            }
            ack = acks.recv() => match ack {
                Some(ack) => {
                    tracing::debug!(command_id = %command_id, success = ack.success, "Command acknowledged");
                    Ok(ack.into())
                }
                None => Err(CommandError::Expired { command_id }),
            },
            () = tokio::time::sleep(timeout) => {
                tracing::warn!(device = %device_id, command = %kind, command_id = %command_id, "Command timed out");
                Err(CommandError::Timeout {
                    command_id,
                    timeout_ms: u64::try_from(timeout.as_millis()).unwrap_or(u64::MAX),
                })
            }
        }
    }

    /// Inserts a pending entry under a correlation id not already in use.
    fn register(
        &self,
        device_id: &str,
        kind: CommandKind,
        args: CommandArgs,
        reply: mpsc::Sender<CommandAck>,
    ) -> CommandEnvelope {
        let mut pending = self.pending.lock();
        let mut envelope = CommandEnvelope::new(kind, args);
        while pending.contains_key(&envelope.command_id) {
            envelope.command_id = uuid::Uuid::new_v4().to_string();
        }
        pending.insert(
            envelope.command_id.clone(),
            PendingCommand {
                device_id: device_id.to_string(),
                kind,
                created_at: Instant::now(),
                reply,
            },
        );
        envelope
    }

    /// Sends an unlock command and waits for the ack.
    ///
    /// # Errors
    ///
    /// See [`send`](Self::send).
    pub async fn send_unlock(
        &self,
        cancel: &CancellationToken,
        device_id: &str,
        args: CommandArgs,
    ) -> Result<CommandReply, CommandError> {
        self.send(cancel, device_id, CommandKind::Unlock, args).await
    }

    /// Sends a lock command and waits for the ack.
    ///
    /// # Errors
    ///
    /// See [`send`](Self::send).
    pub async fn send_lock(
        &self,
        cancel: &CancellationToken,
        device_id: &str,
        args: CommandArgs,
    ) -> Result<CommandReply, CommandError> {
        self.send(cancel, device_id, CommandKind::Lock, args).await
    }

    /// Sends a reboot command and waits for the ack.
    ///
    /// # Errors
    ///
    /// See [`send`](Self::send).
    pub async fn send_reboot(
        &self,
        cancel: &CancellationToken,
        device_id: &str,
        args: CommandArgs,
    ) -> Result<CommandReply, CommandError> {
        self.send(cancel, device_id, CommandKind::Reboot, args).await
    }

    /// Sends a firmware upgrade command and waits for the ack.
    ///
    /// # Errors
    ///
    /// See [`send`](Self::send).
    pub async fn send_upgrade(
        &self,
        cancel: &CancellationToken,
        device_id: &str,
        args: CommandArgs,
    ) -> Result<CommandReply, CommandError> {
        self.send(cancel, device_id, CommandKind::Upgrade, args).await
    }

    /// Pushes configuration on the config topic and waits for the ack.
    ///
    /// # Errors
    ///
    /// See [`send`](Self::send).
    pub async fn send_config(
        &self,
        cancel: &CancellationToken,
        device_id: &str,
        args: CommandArgs,
    ) -> Result<CommandReply, CommandError> {
        self.send(cancel, device_id, CommandKind::Config, args).await
    }

    /// Publishes `kind` without waiting; returns the correlation id.
    ///
    /// Nothing is registered, so an ack for this id is ignored.
    ///
    /// # Errors
    ///
    /// Returns [`CommandError::Transport`] if the publish fails.
    pub async fn send_async(
        &self,
        device_id: &str,
        kind: CommandKind,
        args: CommandArgs,
    ) -> Result<String, CommandError> {
        let envelope = CommandEnvelope::new(kind, args);
        self.broker
            .publish(&kind.topic(device_id), Payload::json(&envelope)?)
            .await?;
        tracing::debug!(device = %device_id, command = %kind, command_id = %envelope.command_id, "Command sent without wait");
        Ok(envelope.command_id)
    }

    /// Publishes an unlock command without waiting.
    ///
    /// # Errors
    ///
    /// See [`send_async`](Self::send_async).
    pub async fn send_unlock_async(
        &self,
        device_id: &str,
        args: CommandArgs,
    ) -> Result<String, CommandError> {
        self.send_async(device_id, CommandKind::Unlock, args).await
    }

    /// Publishes a lock command without waiting.
    ///
    /// # Errors
    ///
    /// See [`send_async`](Self::send_async).
    pub async fn send_lock_async(
        &self,
        device_id: &str,
        args: CommandArgs,
    ) -> Result<String, CommandError> {
        self.send_async(device_id, CommandKind::Lock, args).await
    }

    /// Publishes a reboot command without waiting.
    ///
    /// # Errors
    ///
    /// See [`send_async`](Self::send_async).
    pub async fn send_reboot_async(
        &self,
        device_id: &str,
        args: CommandArgs,
    ) -> Result<String, CommandError> {
        self.send_async(device_id, CommandKind::Reboot, args).await
    }

    /// Publishes a firmware upgrade command without waiting.
    ///
    /// # Errors
    ///
    /// See [`send_async`](Self::send_async).
    pub async fn send_upgrade_async(
        &self,
        device_id: &str,
        args: CommandArgs,
    ) -> Result<String, CommandError> {
        self.send_async(device_id, CommandKind::Upgrade, args).await
    }

    /// Publishes configuration without waiting.
    ///
    /// # Errors
    ///
    /// See [`send_async`](Self::send_async).
    pub async fn send_config_async(
        &self,
        device_id: &str,
        args: CommandArgs,
    ) -> Result<String, CommandError> {
        self.send_async(device_id, CommandKind::Config, args).await
    }

    /// Hands an acknowledgement to the send waiting for it.
    ///
    /// Never blocks. Returns `false` when no send is waiting for the id or
    /// an ack has already been delivered for it.
    pub fn handle_ack(&self, ack: &CommandAck) -> bool {
        let pending = self.pending.lock();
        let Some(entry) = pending.get(&ack.command_id) else {
            tracing::debug!(command_id = %ack.command_id, "Ack for unknown or finished command");
            return false;
        };

        match entry.reply.try_send(ack.clone()) {
            Ok(()) => true,
            Err(TrySendError::Full(_)) => {
                tracing::debug!(
                    command_id = %ack.command_id,
                    device = %entry.device_id,
                    "Duplicate ack ignored"
                );
                false
            }
            Err(TrySendError::Closed(_)) => false,
        }
    }

    /// Drops pending entries older than twice the ack timeout.
    ///
    /// Returns how many entries were removed. A send still waiting on a
    /// removed entry fails with [`CommandError::Expired`].
    pub fn cleanup_expired(&self) -> usize {
        let max_age = self.config.ack_timeout.saturating_mul(2);
        let mut pending = self.pending.lock();
        let before = pending.len();
        pending.retain(|command_id, entry| {
            let keep = entry.created_at.elapsed() <= max_age;
            if !keep {
                tracing::debug!(
                    command_id = %command_id,
                    device = %entry.device_id,
                    command = %entry.kind,
                    "Sweeping expired command"
                );
            }
            keep
        });
        let removed = before - pending.len();
        if removed > 0 {
            tracing::info!(removed, "Swept expired pending commands");
        }
        removed
    }

    /// Runs [`cleanup_expired`](Self::cleanup_expired) every cleanup
    /// interval until `cancel` fires.
    pub fn start_cleanup(self: &Arc<Self>, cancel: CancellationToken) -> JoinHandle<()> {
        let correlator = Arc::clone(self);
        let period = self.config.cleanup_interval;
        tokio::spawn(async move {
            let mut ticks = tokio::time::interval_at(Instant::now() + period, period);
            ticks.set_missed_tick_behavior(MissedTickBehavior::Delay);
            loop {
                tokio::select! {
                    () = cancel.cancelled() => break,
                    _ = ticks.tick() => {
                        correlator.cleanup_expired();
                    }
                }
            }
            tracing::debug!("Pending command sweep stopped");
        })
    }

    /// Returns the number of sends waiting for an ack.
    #[must_use]
    pub fn pending_count(&self) -> usize {
        self.pending.lock().len()
    }

    /// Returns whether a send is waiting for `command_id`.
    #[must_use]
    pub fn is_pending(&self, command_id: &str) -> bool {
        self.pending.lock().contains_key(command_id)
    }
}

impl std::fmt::Debug for CommandCorrelator {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("CommandCorrelator")
            .field("pending", &self.pending_count())
            .field("config", &self.config)
            .finish_non_exhaustive()
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::protocol::MqttBrokerConfig;
    use crate::testing::RecordingLink;

    fn correlator() -> (Arc<CommandCorrelator>, Arc<RecordingLink>) {
        let link = Arc::new(RecordingLink::new());
        let broker = MqttBroker::from_link(link.clone(), MqttBrokerConfig::default());
        (Arc::new(CommandCorrelator::new(broker)), link)
    }

    /// Plays a device that acks every command it receives.
    fn auto_ack(link: &RecordingLink, correlator: &Arc<CommandCorrelator>, success: bool, message: &str) {
        let correlator = Arc::downgrade(correlator);
        let message = message.to_string();
        link.on_publish(move |published| {
            let envelope: CommandEnvelope = published.json().unwrap();
            if let Some(correlator) = correlator.upgrade() {
                correlator.handle_ack(&CommandAck {
                    command_id: envelope.command_id,
                    success,
                    message: message.clone(),
                    timestamp: 1_700_000_000,
                });
            }
        });
    }

    #[tokio::test]
    async fn ack_is_returned_verbatim() {
        let (correlator, link) = correlator();
        auto_ack(&link, &correlator, true, "opened");

        let reply = correlator
            .send_unlock(&CancellationToken::new(), "lock-7", CommandArgs::new().slot(1))
            .await
            .unwrap();

        assert!(reply.success);
        assert_eq!(reply.message, "opened");
        assert_eq!(correlator.pending_count(), 0);

        let published = link.published();
        assert_eq!(published.len(), 1);
        assert_eq!(published[0].topic, "device/lock-7/command");
        let envelope: CommandEnvelope = published[0].json().unwrap();
        assert_eq!(envelope.command, CommandKind::Unlock);
        assert_eq!(envelope.command_id, reply.command_id);
        assert_eq!(envelope.params.get("slot"), Some(&serde_json::json!(1)));
    }

    #[tokio::test]
    async fn negative_ack_is_a_reply_not_an_error() {
        let (correlator, link) = correlator();
        auto_ack(&link, &correlator, false, "jammed");

        let reply = correlator
            .send_lock(&CancellationToken::new(), "lock-7", CommandArgs::new())
            .await
            .unwrap();

        assert!(!reply.success);
        assert_eq!(reply.message, "jammed");
    }

    #[tokio::test]
    async fn config_goes_to_config_topic() {
        let (correlator, link) = correlator();
        auto_ack(&link, &correlator, true, "");

        correlator
            .send_config(
                &CancellationToken::new(),
                "lock-7",
                CommandArgs::new().with("heartbeat_interval", 30),
            )
            .await
            .unwrap();

        assert_eq!(link.published()[0].topic, "device/lock-7/config");
    }

    #[tokio::test(start_paused = true)]
    async fn missing_ack_times_out_without_leaking() {
        let (correlator, _link) = correlator();
        let started = Instant::now();

        let err = correlator
            .send_reboot(&CancellationToken::new(), "lock-7", CommandArgs::new())
            .await
            .unwrap_err();

        assert!(err.is_timeout());
        assert!(matches!(err, CommandError::Timeout { timeout_ms: 30_000, .. }));
        assert_eq!(started.elapsed(), Duration::from_secs(30));
        assert_eq!(correlator.pending_count(), 0);
    }

    #[tokio::test(start_paused = true)]
    async fn cancellation_ends_the_wait() {
        let (correlator, _link) = correlator();
        let cancel = CancellationToken::new();

        let send = {
            let correlator = Arc::clone(&correlator);
            let cancel = cancel.clone();
            tokio::spawn(async move {
                correlator
                    .send_unlock(&cancel, "lock-7", CommandArgs::new())
                    .await
            })
        };

        tokio::time::sleep(Duration::from_secs(1)).await;
        assert_eq!(correlator.pending_count(), 1);
        cancel.cancel();

        let err = send.await.unwrap().unwrap_err();
        assert!(matches!(err, CommandError::Cancelled { .. }));
        assert_eq!(correlator.pending_count(), 0);
    }

    #[tokio::test(start_paused = true)]
    async fn dropped_send_removes_its_entry() {
        let (correlator, _link) = correlator();

        let send = {
            let correlator = Arc::clone(&correlator);
            tokio::spawn(async move {
                correlator
                    .send_unlock(&CancellationToken::new(), "lock-7", CommandArgs::new())
                    .await
            })
        };

        tokio::time::sleep(Duration::from_secs(1)).await;
        assert_eq!(correlator.pending_count(), 1);
        send.abort();
        let _ = send.await;

        assert_eq!(correlator.pending_count(), 0);
    }

    #[tokio::test]
    async fn unknown_ack_changes_nothing() {
        let (correlator, _link) = correlator();

        let delivered = correlator.handle_ack(&CommandAck {
            command_id: "never-sent".to_string(),
            success: true,
            message: String::new(),
            timestamp: 0,
        });

        assert!(!delivered);
        assert_eq!(correlator.pending_count(), 0);
    }

    #[tokio::test]
    async fn async_send_registers_nothing() {
        let (correlator, link) = correlator();

        let command_id = correlator
            .send_upgrade_async(
                "lock-7",
                CommandArgs::new().firmware("https://fw.example/2.1.bin", "2.1.0"),
            )
            .await
            .unwrap();

        assert_eq!(correlator.pending_count(), 0);
        assert!(!correlator.is_pending(&command_id));
        let envelope: CommandEnvelope = link.published()[0].json().unwrap();
        assert_eq!(envelope.command_id, command_id);
        assert_eq!(envelope.command, CommandKind::Upgrade);
    }

    #[tokio::test]
    async fn publish_failure_removes_the_entry() {
        let (correlator, link) = correlator();
        link.fail_publishes(true);

        let err = correlator
            .send_unlock(&CancellationToken::new(), "lock-7", CommandArgs::new())
            .await
            .unwrap_err();

        assert!(matches!(err, CommandError::Transport(TransportError::Publish { .. })));
        assert_eq!(correlator.pending_count(), 0);
    }

    #[tokio::test(start_paused = true)]
    async fn cleanup_ignores_young_entries() {
        let (correlator, _link) = correlator();
        let send = {
            let correlator = Arc::clone(&correlator);
            tokio::spawn(async move {
                correlator
                    .send_lock(&CancellationToken::new(), "lock-7", CommandArgs::new())
                    .await
            })
        };

        tokio::time::sleep(Duration::from_secs(10)).await;
        assert_eq!(correlator.cleanup_expired(), 0);
        assert_eq!(correlator.cleanup_expired(), 0);
        assert_eq!(correlator.pending_count(), 1);

        send.abort();
    }

    #[tokio::test(start_paused = true)]
    async fn swept_waiter_sees_expired() {
        let link = Arc::new(RecordingLink::new());
        let broker = MqttBroker::from_link(link, MqttBrokerConfig::default());
        let correlator = Arc::new(CommandCorrelator::with_config(
            broker,
            CorrelatorConfig::default().with_ack_timeout(Duration::from_secs(10)),
        ));
        let (reply, mut acks) = mpsc::channel(1);
        let command_id = correlator
            .register("lock-7", CommandKind::Lock, CommandArgs::new(), reply)
            .command_id;

        tokio::time::advance(Duration::from_secs(21)).await;
        assert_eq!(correlator.cleanup_expired(), 1);
        assert!(!correlator.is_pending(&command_id));
        assert!(acks.recv().await.is_none());
    }

    #[tokio::test(start_paused = true)]
    async fn background_sweep_runs_until_cancelled() {
        let link = Arc::new(RecordingLink::new());
        let broker = MqttBroker::from_link(link, MqttBrokerConfig::default());
        let correlator = Arc::new(CommandCorrelator::with_config(
            broker,
            CorrelatorConfig::default()
                .with_ack_timeout(Duration::from_secs(1))
                .with_cleanup_interval(Duration::from_secs(5)),
        ));
        let (reply, _acks) = mpsc::channel(1);
        correlator.register("lock-7", CommandKind::Reboot, CommandArgs::new(), reply);

        let cancel = CancellationToken::new();
        let sweep = correlator.start_cleanup(cancel.clone());

        tokio::time::sleep(Duration::from_secs(6)).await;
        assert_eq!(correlator.pending_count(), 0);

        cancel.cancel();
        sweep.await.unwrap();
    }

    #[tokio::test]
    async fn concurrent_sends_are_independent() {
        let (correlator, link) = correlator();
        auto_ack(&link, &correlator, true, "ok");

        let sends: Vec<_> = (0..8)
            .map(|n| {
                let correlator = Arc::clone(&correlator);
                tokio::spawn(async move {
                    correlator
                        .send_unlock(&CancellationToken::new(), &format!("lock-{n}"), CommandArgs::new())
                        .await
                })
            })
            .collect();

        let mut ids = Vec::new();
        for send in sends {
            ids.push(send.await.unwrap().unwrap().command_id);
        }
        ids.sort();
        ids.dedup();

        assert_eq!(ids.len(), 8);
        assert_eq!(correlator.pending_count(), 0);
    }
}
