//! Publish/subscribe registry for push messages.
//!
//! Listeners subscribe per [`PushKind`] and get a [`Subscription`] back.
//! Dropping the subscription unsubscribes, so a listener cannot outlive its owner.

use crate::protocol::{PushKind, PushMessage};
use std::collections::HashMap;
use crate::sync::lock;
use std::sync::{Arc, Mutex, MutexGuard, Weak};

/// Callback invoked for each broadcast push message.
pub type PushListener = Arc<dyn Fn(&PushMessage) + Send + Sync + 'static>;

#[derive(Default)]
struct HubState {
    listeners: HashMap<PushKind, Vec<(u64, PushListener)>>,
    next_id: u64,
}

/// Fan-out registry keyed by push kind.
#[derive(Clone, Default)]
pub struct EventHub {
    state: Arc<Mutex<HubState>>,
}

impl EventHub {
    pub fn new() -> Self {
        Self::default()
    }

    fn lock(&self) -> MutexGuard<'_, HubState> {
        lock(&self.state)
    }

    /// Register a listener for one kind of push message.
    pub fn subscribe(
        &self,
        kind: PushKind,
        listener: impl Fn(&PushMessage) + Send + Sync + 'static,
    ) -> Subscription {
        let mut state = self.lock();
        let id = state.next_id;
        state.next_id += 1;
        state
            .listeners
            .entry(kind)
            .or_default()
            .push((id, Arc::new(listener)));

        Subscription {
            hub: Arc::downgrade(&self.state),
            kind,
            id,
        }
    }

    /// Deliver a message to every listener for its kind. Returns how many were called.
    ///
    /// Listeners run outside the registry lock, so they may subscribe or
    /// unsubscribe while being called.
    pub fn broadcast(&self, message: &PushMessage) -> usize {
        let listeners: Vec<PushListener> = self
            .lock()
            .listeners
            .get(&message.kind)
            .map(|entries| entries.iter().map(|(_, l)| l.clone()).collect())
            .unwrap_or_default();

        for listener in &listeners {
            listener(message);
        }
        listeners.len()
    }

    #[cfg(test)]
    fn listener_count(&self, kind: PushKind) -> usize {
        self.lock().listeners.get(&kind).map_or(0, Vec::len)
    }
}

/// Handle for a registered listener; unsubscribes on drop.
#[must_use = "dropping a subscription immediately unsubscribes"]
pub struct Subscription {
    hub: Weak<Mutex<HubState>>,
    kind: PushKind,
    id: u64,
}

impl Subscription {
    pub fn kind(&self) -> PushKind {
        self.kind
    }

    /// Unsubscribe now. Equivalent to dropping.
    pub fn unsubscribe(self) {}
}

impl Drop for Subscription {
    fn drop(&mut self) {
        let Some(state) = self.hub.upgrade() else {
            return;
        };
        let mut state = lock(&state);
        if let Some(entries) = state.listeners.get_mut(&self.kind) {
            entries.retain(|(id, _)| *id != self.id);
            if entries.is_empty() {
                state.listeners.remove(&self.kind);
            }
        }
    }
}

impl std::fmt::Debug for Subscription {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("Subscription")
            .field("kind", &self.kind)
            .field("id", &self.id)
            .finish()
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::destination::DestinationKey;
    use std::sync::atomic::{AtomicUsize, Ordering};

    fn message(kind: PushKind) -> PushMessage {
        PushMessage {
            kind,
            destination: DestinationKey::Any,
            doc_fd: None,
            data: serde_json::json!({}),
            extra: Default::default(),
        }
    }

    #[test]
    fn test_broadcast_reaches_matching_listeners_only() {
        let hub = EventHub::new();
        let hits = Arc::new(AtomicUsize::new(0));

        let counter = hits.clone();
        let _sub = hub.subscribe(PushKind::DocUserAction, move |_| {
            counter.fetch_add(1, Ordering::SeqCst);
        });

        assert_eq!(hub.broadcast(&message(PushKind::DocUserAction)), 1);
        assert_eq!(hub.broadcast(&message(PushKind::DocShutdown)), 0);
        assert_eq!(hits.load(Ordering::SeqCst), 1);
    }

    #[test]
    fn test_drop_unsubscribes() {
        let hub = EventHub::new();
        let first = hub.subscribe(PushKind::ClientLogout, |_| {});
        let second = hub.subscribe(PushKind::ClientLogout, |_| {});
        assert_eq!(hub.listener_count(PushKind::ClientLogout), 2);

        drop(first);
        assert_eq!(hub.listener_count(PushKind::ClientLogout), 1);

        second.unsubscribe();
        assert_eq!(hub.listener_count(PushKind::ClientLogout), 0);
        assert_eq!(hub.broadcast(&message(PushKind::ClientLogout)), 0);
    }

    #[test]
    fn test_subscription_outliving_hub() {
        let hub = EventHub::new();
        let sub = hub.subscribe(PushKind::ProfileFetch, |_| {});
        drop(hub);
        drop(sub);
    }

    #[test]
    fn test_listener_may_subscribe_during_broadcast() {
        let hub = EventHub::new();
        let inner_hub = hub.clone();
        let held = Arc::new(Mutex::new(Vec::new()));
        let held_clone = held.clone();

        let _sub = hub.subscribe(PushKind::UserSettings, move |_| {
            let sub = inner_hub.subscribe(PushKind::UserSettings, |_| {});
            held_clone.lock().unwrap().push(sub);
        });

        hub.broadcast(&message(PushKind::UserSettings));
        assert_eq!(hub.listener_count(PushKind::UserSettings), 2);
    }
}
