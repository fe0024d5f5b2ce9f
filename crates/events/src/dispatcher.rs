//! Synchronous listener registry for inbound channel messages.
//!
//! [`EventDispatcher`] keeps callbacks keyed by [`EventKey`]: either a bare
//! message type or a message type scoped to one job. It is designed to be
//! shared via `Arc<EventDispatcher>` between the connection task that
//! feeds it and the consumers that subscribe.
//!
//! [`dispatch`](EventDispatcher::dispatch) copies the matching listeners
//! out of the registry before invoking any of them. Callbacks may therefore
//! subscribe or unsubscribe freely, including themselves, without another
//! listener in the same pass being skipped or called twice. A panicking
//! callback is caught and logged; the remaining listeners still run.

use std::collections::HashMap;
use std::fmt;
use std::panic::{self, AssertUnwindSafe};
use std::sync::atomic::{AtomicBool, Ordering};
use std::sync::{Arc, Mutex, MutexGuard, PoisonError, Weak};

use crate::message::InboundMessage;

/// Listener callback. Invoked on the dispatching thread.
pub type Callback = Arc<dyn Fn(&InboundMessage) + Send + Sync>;

/// Registry key a listener is filed under.
#[derive(Debug, Clone, PartialEq, Eq, Hash)]
pub enum EventKey {
    /// Every message of this type.
    Type(String),
    /// Messages of this type for one job.
    Scoped { event_type: String, job_id: String },
}

impl EventKey {
    pub fn of_type(event_type: impl Into<String>) -> Self {
        Self::Type(event_type.into())
    }

    pub fn scoped(event_type: impl Into<String>, job_id: impl Into<String>) -> Self {
        Self::Scoped {
            event_type: event_type.into(),
            job_id: job_id.into(),
        }
    }
}

impl fmt::Display for EventKey {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            Self::Type(event_type) => f.write_str(event_type),
            Self::Scoped { event_type, job_id } => write!(f, "{event_type}:{job_id}"),
        }
    }
}

#[derive(Clone)]
struct Listener {
    /// Registration sequence number; defines invocation order.
    id: u64,
    callback: Callback,
}

#[derive(Default)]
struct Registry {
    next_id: u64,
    listeners: HashMap<EventKey, Vec<Listener>>,
}

impl Registry {
    fn insert(&mut self, key: EventKey, callback: Callback) -> u64 {
        let id = self.next_id;
        self.next_id += 1;
        self.listeners
            .entry(key)
            .or_default()
            .push(Listener { id, callback });
        id
    }

    fn remove(&mut self, key: &EventKey, id: u64) {
        if let Some(list) = self.listeners.get_mut(key) {
            list.retain(|l| l.id != id);
            if list.is_empty() {
                self.listeners.remove(key);
            }
        }
    }
}

/// Publish/subscribe hub for [`InboundMessage`]s.
#[derive(Default)]
pub struct EventDispatcher {
    registry: Arc<Mutex<Registry>>,
}

impl EventDispatcher {
    pub fn new() -> Self {
        Self::default()
    }

    /// Listen for every message with the given `type`.
    pub fn subscribe<F>(&self, event_type: impl Into<String>, callback: F) -> Subscription
    where
        F: Fn(&InboundMessage) + Send + Sync + 'static,
    {
        self.register(EventKey::of_type(event_type), Arc::new(callback))
    }

    /// Listen for messages with the given `type` and `jobId` only.
    pub fn subscribe_scoped<F>(
        &self,
        event_type: impl Into<String>,
        job_id: impl Into<String>,
        callback: F,
    ) -> Subscription
    where
        F: Fn(&InboundMessage) + Send + Sync + 'static,
    {
        self.register(EventKey::scoped(event_type, job_id), Arc::new(callback))
    }

    fn register(&self, key: EventKey, callback: Callback) -> Subscription {
        let id = lock(&self.registry).insert(key.clone(), callback);
        tracing::trace!(listener_id = id, key = %key, "Listener registered");
        Subscription {
            id,
            key,
            registry: Arc::downgrade(&self.registry),
            active: AtomicBool::new(true),
        }
    }

    /// Deliver a message to every matching listener in registration order.
    ///
    /// Listeners under the bare type key and, when the message carries a
    /// `jobId`, under the scoped key are merged into one snapshot. Returns
    /// the number of listeners invoked.
    pub fn dispatch(&self, message: &InboundMessage) -> usize {
        let snapshot = self.snapshot(message);

        for listener in &snapshot {
            let outcome = panic::catch_unwind(AssertUnwindSafe(|| (listener.callback)(message)));
            if outcome.is_err() {
                tracing::error!(
                    listener_id = listener.id,
                    event_type = %message.event_type,
                    job_id = message.job_id.as_deref().unwrap_or(""),
                    "Event listener panicked",
                );
            }
        }

        if snapshot.is_empty() {
            tracing::trace!(event_type = %message.event_type, "No listeners for message");
        }
        snapshot.len()
    }

    /// Number of listeners currently filed under `key`.
    pub fn listener_count(&self, key: &EventKey) -> usize {
        lock(&self.registry)
            .listeners
            .get(key)
            .map_or(0, Vec::len)
    }

    /// Total number of registered listeners.
    pub fn total_listeners(&self) -> usize {
        lock(&self.registry).listeners.values().map(Vec::len).sum()
    }

    fn snapshot(&self, message: &InboundMessage) -> Vec<Listener> {
        let registry = lock(&self.registry);

        let mut snapshot: Vec<Listener> = registry
            .listeners
            .get(&EventKey::of_type(message.event_type.as_str()))
            .cloned()
            .unwrap_or_default();

        if let Some(job_id) = &message.job_id {
            let scoped = EventKey::scoped(message.event_type.as_str(), job_id.as_str());
            if let Some(list) = registry.listeners.get(&scoped) {
                snapshot.extend(list.iter().cloned());
                snapshot.sort_by_key(|l| l.id);
            }
        }
        snapshot
    }
}

/// Handle to one registered listener.
///
/// [`unsubscribe`](Self::unsubscribe) removes it; calling it again is a
/// no-op. Dropping the handle unsubscribes as well, so a listener never
/// outlives the scope holding its subscription.
#[must_use = "dropping a Subscription unsubscribes the listener"]
pub struct Subscription {
    id: u64,
    key: EventKey,
    registry: Weak<Mutex<Registry>>,
    active: AtomicBool,
}

impl Subscription {
    pub fn key(&self) -> &EventKey {
        &self.key
    }

    pub fn is_active(&self) -> bool {
        self.active.load(Ordering::Acquire)
    }

    /// Remove the listener. Idempotent.
    pub fn unsubscribe(&self) {
        if !self.active.swap(false, Ordering::AcqRel) {
            return;
        }
        if let Some(registry) = self.registry.upgrade() {
            lock(&registry).remove(&self.key, self.id);
            tracing::trace!(listener_id = self.id, key = %self.key, "Listener removed");
        }
    }
}

impl Drop for Subscription {
    fn drop(&mut self) {
        self.unsubscribe();
    }
}

impl fmt::Debug for Subscription {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("Subscription")
            .field("id", &self.id)
            .field("key", &self.key)
            .field("active", &self.is_active())
            .finish()
    }
}

/// Callbacks never run while the registry is locked, so a poisoned lock
/// still holds a consistent map.
fn lock(registry: &Mutex<Registry>) -> MutexGuard<'_, Registry> {
    registry.lock().unwrap_or_else(PoisonError::into_inner)
}
