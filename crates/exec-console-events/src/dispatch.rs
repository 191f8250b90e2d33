//! Typed subscription registry with deterministic fan-out.

use std::collections::HashMap;
use std::panic::{AssertUnwindSafe, catch_unwind};
use std::sync::atomic::{AtomicU64, Ordering};
use std::sync::{Arc, RwLock, Weak};

use crate::protocol::{EventKind, ServerEvent};

type Callback = dyn Fn(&ServerEvent) + Send + Sync;

struct Listener {
    id: u64,
    callback: Arc<Callback>,
}

type Registry = RwLock<HashMap<EventKind, Vec<Listener>>>;

/// Publish/subscribe registry over [`ServerEvent`] kinds.
///
/// Delivery order within one `dispatch` call equals registration order.
/// A panicking subscriber is caught and logged and does not block delivery
/// to the remaining subscribers.
pub struct EventDispatcher {
    registry: Arc<Registry>,
    next_id: AtomicU64,
}

impl Default for EventDispatcher {
    fn default() -> Self {
        Self::new()
    }
}

impl EventDispatcher {
    /// Create an empty dispatcher.
    #[must_use]
    pub fn new() -> Self {
        Self {
            registry: Arc::new(RwLock::new(HashMap::new())),
            next_id: AtomicU64::new(0),
        }
    }

    /// Register a callback for one event kind.
    ///
    /// Multiple subscribers per kind are allowed. The returned handle
    /// removes the registration when dropped.
    pub fn subscribe(
        &self,
        kind: EventKind,
        callback: impl Fn(&ServerEvent) + Send + Sync + 'static,
    ) -> Subscription {
        let id = self.next_id.fetch_add(1, Ordering::Relaxed);
        self.registry
            .write()
            .unwrap()
            .entry(kind)
            .or_default()
            .push(Listener {
                id,
                callback: Arc::new(callback),
            });
        Subscription {
            kind,
            id,
            registry: Arc::downgrade(&self.registry),
        }
    }

    /// Fan an event out to the subscribers of its kind.
    ///
    /// Operates on a snapshot of the current subscriber list, so callbacks
    /// that subscribe or unsubscribe only affect subsequent dispatches.
    pub fn dispatch(&self, event: &ServerEvent) {
        let kind = event.kind();
        let snapshot: Vec<Arc<Callback>> = {
            let registry = self.registry.read().unwrap();
            registry
                .get(&kind)
                .map(|listeners| listeners.iter().map(|l| Arc::clone(&l.callback)).collect())
                .unwrap_or_default()
        };

        for callback in snapshot {
            if let Err(payload) = catch_unwind(AssertUnwindSafe(|| callback(event))) {
                let message = payload
                    .downcast_ref::<&str>()
                    .copied()
                    .or_else(|| payload.downcast_ref::<String>().map(String::as_str))
                    .unwrap_or("non-string panic payload");
                tracing::error!(?kind, panic = message, "event subscriber panicked");
            }
        }
    }

    /// Number of subscribers currently registered for a kind.
    #[must_use]
    pub fn subscriber_count(&self, kind: EventKind) -> usize {
        self.registry
            .read()
            .unwrap()
            .get(&kind)
            .map_or(0, Vec::len)
    }
}

/// Handle for one registration; unsubscribes on drop.
pub struct Subscription {
    kind: EventKind,
    id: u64,
    registry: Weak<Registry>,
}

impl Subscription {
    /// Remove the registration now instead of at drop time.
    pub fn unsubscribe(self) {}
}

impl Drop for Subscription {
    fn drop(&mut self) {
        if let Some(registry) = self.registry.upgrade() {
            let mut registry = registry.write().unwrap();
            if let Some(listeners) = registry.get_mut(&self.kind) {
                listeners.retain(|l| l.id != self.id);
            }
        }
    }
}
