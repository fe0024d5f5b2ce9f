//! Persistent event-channel connection with bounded reconnection.
//!
//! [`ConnectionManager`] owns the one shared connection to the
//! notification endpoint. [`connect`](ConnectionManager::connect) spawns a
//! connection task (connect -> pump frames -> retry loop) that feeds every
//! parsed [`InboundMessage`](sitescope_events::InboundMessage) into the
//! [`EventDispatcher`]. The manager knows nothing about jobs.
//!
//! Lifecycle notifications are broadcast via a [`tokio::sync::broadcast`]
//! channel; the current [`ConnectionState`] is published on a
//! [`tokio::sync::watch`] channel.
//!
//! Every connect bumps an epoch. State changes made by the task are
//! applied only while its epoch is current, so a task torn down by
//! [`disconnect`](ConnectionManager::disconnect) cannot touch state even
//! if it is still between two await points.

use std::sync::{Arc, Mutex, MutexGuard, PoisonError};

use futures::stream::{BoxStream, StreamExt};
use serde::Serialize;
use sitescope_core::types::{now_millis, TimestampMillis};
use sitescope_events::{parse_message, EventDispatcher};
use tokio::sync::{broadcast, mpsc, watch};
use tokio::task::JoinHandle;
use tokio_util::sync::CancellationToken;

use crate::reconnect::{next_delay, ReconnectConfig};
use crate::transport::{Channel, ConnectionError, Transport};

/// Broadcast channel capacity for lifecycle events.
const LIFECYCLE_CHANNEL_CAPACITY: usize = 64;

#[derive(Debug, Clone, Copy, PartialEq, Eq, Default, Serialize)]
#[serde(rename_all = "snake_case")]
pub enum ConnectionState {
    #[default]
    Disconnected,
    Connecting,
    Connected,
    Reconnecting,
    Failed,
}

impl ConnectionState {
    /// An attempt is in flight or the channel is open; `connect` is a no-op.
    fn is_opening_or_open(self) -> bool {
        matches!(self, Self::Connecting | Self::Connected)
    }
}

/// Snapshot of the connection record.
#[derive(Debug, Clone, PartialEq, Eq, Default)]
pub struct Connection {
    pub state: ConnectionState,
    /// Retries since the last successful connect.
    pub attempt: u32,
    pub last_error: Option<String>,
}

/// Lifecycle notification emitted by the connection task.
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum ConnectionEvent {
    Connected,
    Disconnected,
    Error(String),
}

/// A message to send over the channel. The timestamp is filled in at
/// send time.
#[derive(Debug, Clone, PartialEq, Serialize)]
#[serde(rename_all = "camelCase")]
pub struct OutboundMessage {
    #[serde(rename = "type")]
    pub event_type: String,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub job_id: Option<String>,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub data: Option<serde_json::Value>,
}

impl OutboundMessage {
    pub fn new(event_type: impl Into<String>) -> Self {
        Self {
            event_type: event_type.into(),
            job_id: None,
            data: None,
        }
    }

    pub fn with_job(mut self, job_id: impl Into<String>) -> Self {
        self.job_id = Some(job_id.into());
        self
    }

    pub fn with_data(mut self, data: serde_json::Value) -> Self {
        self.data = Some(data);
        self
    }
}

#[derive(Serialize)]
struct Stamped<'a> {
    #[serde(flatten)]
    message: &'a OutboundMessage,
    timestamp: TimestampMillis,
}

/// Manages the persistent connection to the notification endpoint.
///
/// Create once at startup and keep it for the lifetime of the client;
/// dropping it tears the connection down.
pub struct ConnectionManager {
    inner: Arc<Inner>,
}

struct Inner {
    transport: Arc<dyn Transport>,
    dispatcher: Arc<EventDispatcher>,
    config: ReconnectConfig,
    shared: Mutex<Shared>,
    state_tx: watch::Sender<ConnectionState>,
    lifecycle_tx: broadcast::Sender<ConnectionEvent>,
}

#[derive(Default)]
struct Shared {
    connection: Connection,
    epoch: u64,
    outbound: Option<mpsc::UnboundedSender<String>>,
    task: Option<ConnectionTask>,
}

/// Handle to the running connection task.
struct ConnectionTask {
    cancel: CancellationToken,
    handle: JoinHandle<()>,
}

impl ConnectionTask {
    fn stop(self) {
        self.cancel.cancel();
        self.handle.abort();
    }
}

impl ConnectionManager {
    /// Manager in the `Disconnected` state. Nothing is opened until
    /// [`ConnectionManager::connect`].
    pub fn new(
        transport: Arc<dyn Transport>,
        dispatcher: Arc<EventDispatcher>,
        config: ReconnectConfig,
    ) -> Self {
        let (state_tx, _) = watch::channel(ConnectionState::Disconnected);
        let (lifecycle_tx, _) = broadcast::channel(LIFECYCLE_CHANNEL_CAPACITY);

        Self {
            inner: Arc::new(Inner {
                transport,
                dispatcher,
                config,
                shared: Mutex::new(Shared::default()),
                state_tx,
                lifecycle_tx,
            }),
        }
    }

    /// Open the channel unless it is already `Connected` or `Connecting`.
    ///
    /// Resets the retry counter, so calling this after the connection has
    /// `Failed` starts a fresh retry budget. While `Reconnecting` the
    /// pending backoff is abandoned and a new attempt starts at once.
    /// Must be called from within a Tokio runtime.
    pub fn connect(&self) {
        let mut shared = self.inner.lock();
        if shared.connection.state.is_opening_or_open() {
            tracing::debug!(state = ?shared.connection.state, "Connect ignored, already active");
            return;
        }

        if let Some(stale) = shared.task.take() {
            if shared.connection.state == ConnectionState::Reconnecting {
                tracing::debug!(
                    attempt = shared.connection.attempt,
                    "Manual connect interrupts reconnect backoff",
                );
            }
            stale.stop();
        }

        shared.epoch += 1;
        let epoch = shared.epoch;
        shared.connection = Connection {
            state: ConnectionState::Connecting,
            attempt: 0,
            last_error: None,
        };
        self.inner.publish_state(&shared);

        let cancel = CancellationToken::new();
        let handle = tokio::spawn(run_connection_loop(
            Arc::clone(&self.inner),
            epoch,
            cancel.clone(),
        ));
        shared.task = Some(ConnectionTask { cancel, handle });

        tracing::info!(endpoint = self.inner.transport.endpoint(), "Connecting to event channel");
    }

    /// Tear the connection down unconditionally.
    ///
    /// Cancels the connection task together with any pending reconnect
    /// timer and releases the outbound writer.
    pub fn disconnect(&self) {
        let mut shared = self.inner.lock();
        shared.epoch += 1;
        let task = shared.task.take();
        let was_connected = shared.connection.state == ConnectionState::Connected;
        shared.outbound = None;
        shared.connection = Connection::default();
        self.inner.publish_state(&shared);
        drop(shared);

        if let Some(task) = task {
            task.stop();
        }
        if was_connected {
            self.inner.emit(ConnectionEvent::Disconnected);
        }
        tracing::info!(endpoint = self.inner.transport.endpoint(), "Event channel disconnected");
    }

    /// Queue a message for the peer. Returns `false` when not connected.
    pub fn send_message(&self, message: &OutboundMessage) -> bool {
        let shared = self.inner.lock();
        if shared.connection.state != ConnectionState::Connected {
            return false;
        }
        let Some(outbound) = shared.outbound.as_ref() else {
            return false;
        };

        let stamped = Stamped {
            message,
            timestamp: now_millis(),
        };
        match serde_json::to_string(&stamped) {
            Ok(text) => outbound.send(text).is_ok(),
            Err(e) => {
                tracing::warn!(error = %e, "Failed to serialize outbound message");
                false
            }
        }
    }

    /// Snapshot of the current state, attempt count and last error.
    pub fn connection(&self) -> Connection {
        self.inner.lock().connection.clone()
    }

    pub fn state(&self) -> ConnectionState {
        self.inner.lock().connection.state
    }

    /// `true` only in the `Connected` state.
    pub fn is_connected(&self) -> bool {
        self.state() == ConnectionState::Connected
    }

    /// Observe state changes.
    pub fn watch_state(&self) -> watch::Receiver<ConnectionState> {
        self.inner.state_tx.subscribe()
    }

    /// Subscribe to lifecycle notifications.
    pub fn subscribe_lifecycle(&self) -> broadcast::Receiver<ConnectionEvent> {
        self.inner.lifecycle_tx.subscribe()
    }

    /// Dispatcher that receives every parsed inbound frame.
    pub fn dispatcher(&self) -> &Arc<EventDispatcher> {
        &self.inner.dispatcher
    }

    /// Retry policy this manager was built with.
    pub fn config(&self) -> &ReconnectConfig {
        &self.inner.config
    }
}

impl Drop for ConnectionManager {
    fn drop(&mut self) {
        let task = {
            let mut shared = self.inner.lock();
            shared.epoch += 1;
            shared.outbound = None;
            shared.task.take()
        };
        if let Some(task) = task {
            task.stop();
        }
    }
}

impl Inner {
    /// The lock is never held across an await or a listener call.
    fn lock(&self) -> MutexGuard<'_, Shared> {
        self.shared.lock().unwrap_or_else(PoisonError::into_inner)
    }

    fn publish_state(&self, shared: &Shared) {
        self.state_tx.send_replace(shared.connection.state);
    }

    fn emit(&self, event: ConnectionEvent) {
        // Ignore the SendError; it only means there are zero receivers.
        let _ = self.lifecycle_tx.send(event);
    }

    /// Apply `f` if `epoch` is still current. Returns `None` for a stale
    /// task, which must then exit.
    fn transition<R>(&self, epoch: u64, f: impl FnOnce(&mut Shared) -> R) -> Option<R> {
        let mut shared = self.lock();
        if shared.epoch != epoch {
            return None;
        }
        let result = f(&mut shared);
        self.publish_state(&shared);
        Some(result)
    }
}

/// Core connection loop: connect -> pump frames -> retry.
///
/// Runs until cancelled, until the retry budget is exhausted, or until an
/// established connection closes with auto-reconnect disabled.
async fn run_connection_loop(inner: Arc<Inner>, epoch: u64, cancel: CancellationToken) {
    let config = inner.config.clone();
    let endpoint = inner.transport.endpoint().to_string();
    let mut delay = config.initial_delay;

    loop {
        let result = tokio::select! {
            biased;
            _ = cancel.cancelled() => return,
            result = tokio::time::timeout(config.connect_timeout, inner.transport.connect()) => {
                result.unwrap_or_else(|_| {
                    Err(ConnectionError::Connection(format!(
                        "connect timed out after {}ms",
                        config.connect_timeout.as_millis()
                    )))
                })
            }
        };

        match result {
            Ok(Channel { inbound, outbound }) => {
                let connected = inner.transition(epoch, |s| {
                    s.connection = Connection {
                        state: ConnectionState::Connected,
                        attempt: 0,
                        last_error: None,
                    };
                    s.outbound = Some(outbound);
                });
                if connected.is_none() {
                    return;
                }
                delay = config.initial_delay;
                inner.emit(ConnectionEvent::Connected);
                tracing::info!(endpoint = %endpoint, "Event channel connected");

                pump(&inner, inbound, &cancel).await;

                let auto_reconnect = config.auto_reconnect;
                let dropped = inner.transition(epoch, |s| {
                    s.outbound = None;
                    if !auto_reconnect {
                        s.connection.state = ConnectionState::Disconnected;
                    }
                });
                if dropped.is_none() || cancel.is_cancelled() {
                    return;
                }
                inner.emit(ConnectionEvent::Disconnected);

                if !auto_reconnect {
                    tracing::info!(endpoint = %endpoint, "Event channel closed, auto-reconnect disabled");
                    return;
                }
                tracing::warn!(endpoint = %endpoint, "Event channel lost");
            }
            Err(e) => {
                tracing::warn!(endpoint = %endpoint, error = %e, "Event channel connection failed");
                let message = e.to_string();
                let recorded = inner.transition(epoch, |s| {
                    s.connection.last_error = Some(message.clone());
                });
                if recorded.is_none() {
                    return;
                }
                inner.emit(ConnectionEvent::Error(message));
            }
        }

        let retry = inner.transition(epoch, |s| {
            if config.allows_retry(s.connection.attempt) {
                s.connection.attempt += 1;
                s.connection.state = ConnectionState::Reconnecting;
                Some(s.connection.attempt)
            } else {
                s.connection.state = ConnectionState::Failed;
                None
            }
        });

        let attempt = match retry {
            None => return,
            Some(None) => {
                tracing::error!(
                    endpoint = %endpoint,
                    max_attempts = config.max_attempts,
                    "Event channel failed, reconnect attempts exhausted",
                );
                return;
            }
            Some(Some(attempt)) => attempt,
        };

        tracing::info!(
            endpoint = %endpoint,
            attempt,
            delay_ms = delay.as_millis() as u64,
            "Reconnecting to event channel",
        );

        // Wait before the next attempt, respecting cancellation.
        tokio::select! {
            biased;
            _ = cancel.cancelled() => return,
            _ = tokio::time::sleep(delay) => {}
        }

        delay = next_delay(delay, &config);
    }
}

/// Read frames until the channel closes, errors, or is cancelled.
async fn pump(
    inner: &Inner,
    mut inbound: BoxStream<'static, Result<String, ConnectionError>>,
    cancel: &CancellationToken,
) {
    loop {
        let frame = tokio::select! {
            biased;
            _ = cancel.cancelled() => return,
            frame = inbound.next() => frame,
        };

        match frame {
            Some(Ok(text)) => handle_frame(&inner.dispatcher, &text),
            Some(Err(e)) => {
                tracing::error!(error = %e, "Event channel receive error");
                return;
            }
            None => {
                tracing::info!("Event channel stream ended");
                return;
            }
        }
    }
}

/// Parse one text frame and hand it to the dispatcher.
fn handle_frame(dispatcher: &EventDispatcher, text: &str) {
    match parse_message(text) {
        Ok(message) => {
            let delivered = dispatcher.dispatch(&message);
            tracing::trace!(
                event_type = %message.event_type,
                job_id = message.job_id.as_deref().unwrap_or(""),
                delivered,
                "Channel message dispatched",
            );
        }
        Err(e) => {
            tracing::warn!(error = %e, raw_message = %text, "Failed to parse channel message");
        }
    }
}
