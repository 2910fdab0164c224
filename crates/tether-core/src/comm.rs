//! The communication facade.
//!
//! [`Comm`] owns the connection registry and the pending request table behind
//! one lock, and consumes transport events from a single channel. Listener
//! callbacks and the recovery callback are always invoked after that lock is
//! released, so they may call back into `Comm`.

use crate::config::CommConfig;
use crate::destination::DestinationKey;
use crate::error::{CommError, Result};
use crate::events::{EventHub, Subscription};
use crate::pending::{PendingRequest, PendingTable, ResponseFuture};
use crate::protocol::{Inbound, PushKind, PushMessage, Request};
use crate::registry::ConnectionRegistry;
use crate::resend::resend_pending;
use crate::sync::lock;
use crate::transport::{TransportEvent, TransportEventKind, TransportFactory};
use serde_json::Value;
use std::sync::atomic::{AtomicBool, Ordering};
use std::sync::{Arc, Mutex, MutexGuard, Weak};
use tokio::sync::{mpsc, watch};
use tokio::task::JoinHandle;
use tracing::{debug, info, warn};

/// A request failed because view access was lost mid-session.
#[derive(Debug, Clone, PartialEq)]
pub struct AccessLost {
    pub req_id: u64,
    pub method: String,
    pub destination: DestinationKey,
    pub message: String,
}

/// Callback invoked when access is lost; the host typically reloads.
pub type RecoveryCallback = Arc<dyn Fn(AccessLost) + Send + Sync + 'static>;

struct CommState {
    registry: ConnectionRegistry,
    pending: PendingTable,
    /// `Some` while user actions are being collected.
    user_actions: Option<Vec<Value>>,
}

struct CommInner {
    state: Mutex<CommState>,
    hub: EventHub,
    recovery: Mutex<Option<RecoveryCallback>>,
    pending_count: watch::Sender<usize>,
    connected: watch::Sender<bool>,
    events_rx: Mutex<Option<mpsc::UnboundedReceiver<TransportEvent>>>,
    disposed: AtomicBool,
}

/// Work left over from handling one event, run after the state lock is released.
#[derive(Default)]
struct Deferred {
    access_lost: Option<AccessLost>,
    settle: Option<(PendingRequest, Result<Value>)>,
    push: Option<PushMessage>,
}

/// Client-side RPC over persistent connections.
///
/// Cheap to clone; all clones share the same connections and pending requests.
#[derive(Clone)]
pub struct Comm {
    inner: Arc<CommInner>,
}

impl Comm {
    /// Create a communication layer that opens connections through `factory`.
    ///
    /// Events are queued until [`Comm::spawn_dispatcher`] or [`Comm::poll_events`] consumes them.
    pub fn new(config: CommConfig, factory: impl TransportFactory + 'static) -> Self {
        Self::with_factory(config, Arc::new(factory))
    }

    pub fn with_factory(config: CommConfig, factory: Arc<dyn TransportFactory>) -> Self {
        let (events_tx, events_rx) = mpsc::unbounded_channel();
        let (pending_count, _) = watch::channel(0);
        let (connected, _) = watch::channel(false);

        info!(
            "Comm: starting in {} mode",
            if config.single_destination { "single-destination" } else { "multi-destination" }
        );

        Self {
            inner: Arc::new(CommInner {
                state: Mutex::new(CommState {
                    registry: ConnectionRegistry::new(config, factory, events_tx),
                    pending: PendingTable::new(),
                    user_actions: None,
                }),
                hub: EventHub::new(),
                recovery: Mutex::new(None),
                pending_count,
                connected,
                events_rx: Mutex::new(Some(events_rx)),
                disposed: AtomicBool::new(false),
            }),
        }
    }

    /// Install the callback invoked when a request fails with `AUTH_NO_VIEW`.
    pub fn with_recovery(self, recovery: impl Fn(AccessLost) + Send + Sync + 'static) -> Self {
        self.set_recovery(recovery);
        self
    }

    pub fn set_recovery(&self, recovery: impl Fn(AccessLost) + Send + Sync + 'static) {
        *lock(&self.inner.recovery) = Some(Arc::new(recovery));
    }

    fn state(&self) -> MutexGuard<'_, CommState> {
        lock(&self.inner.state)
    }

    /// Publish pending count and connectivity. Call with the state lock held.
    fn publish(&self, state: &CommState) {
        let count = state.pending.len();
        self.inner.pending_count.send_if_modified(|current| {
            let changed = *current != count;
            *current = count;
            changed
        });

        let connected = state.registry.any_established();
        self.inner.connected.send_if_modified(|current| {
            let changed = *current != connected;
            *current = connected;
            changed
        });
    }

    /// Issue a request and return the future for its outcome.
    ///
    /// With `session` set, the call only proceeds if the resolved connection
    /// still carries that session id; otherwise the future is already failed
    /// with [`CommError::OutdatedSession`] and nothing is sent or queued.
    ///
    /// The request is registered before this returns. It is sent immediately
    /// if the connection is established, and otherwise on the next handshake.
    pub fn call(
        &self,
        session: Option<&str>,
        destination: &DestinationKey,
        method: &str,
        args: Vec<Value>,
    ) -> ResponseFuture {
        if self.inner.disposed.load(Ordering::SeqCst) {
            return ResponseFuture::failed(CommError::Closed);
        }

        let mut guard = self.state();
        let state = &mut *guard;

        let record = match state.registry.resolve(destination) {
            Ok(record) => record,
            Err(e) => {
                warn!("Comm request {} to {} failed: {}", method, destination, e);
                return ResponseFuture::failed(e);
            }
        };

        if let Some(bound) = session {
            if record.session_id() != Some(bound) {
                let err = CommError::OutdatedSession {
                    method: method.to_string(),
                    bound: bound.to_string(),
                    current: record.session_id().map(str::to_string),
                };
                warn!("Comm: Rejecting {}: {}", method, err);
                return ResponseFuture::failed(err);
            }
        }

        let req_id = state.pending.next_id();
        let message = match Request::new(req_id, method, args).to_message() {
            Ok(message) => message,
            Err(e) => return ResponseFuture::failed(e),
        };

        let sent = record.send(&message);
        debug!(
            "Comm request #{} {}{}",
            req_id,
            method,
            if sent { "" } else { " (queued)" }
        );

        let future = state.pending.insert(
            req_id,
            method,
            message,
            session.map(str::to_string),
            destination.clone(),
            sent,
        );
        self.publish(state);
        future
    }

    /// Unbound call on whichever connection is available.
    pub fn call_shared(&self, method: &str, args: Vec<Value>) -> ResponseFuture {
        self.call(None, &DestinationKey::Any, method, args)
    }

    /// Pin the connection for `destination`, opening it if needed. Returns the use count.
    pub fn use_destination(&self, destination: &DestinationKey) -> Result<u32> {
        if self.inner.disposed.load(Ordering::SeqCst) {
            return Err(CommError::Closed);
        }
        let mut state = self.state();
        let count = state.registry.use_destination(destination)?;
        self.publish(&state);
        Ok(count)
    }

    /// Unpin the connection for `destination`.
    ///
    /// When the last use is released the connection is closed and every
    /// request still addressed to it fails with [`CommError::ConnectionDisposed`].
    /// Returns whether the connection was disposed.
    pub fn release(&self, destination: &DestinationKey) -> bool {
        let mut guard = self.state();
        let state = &mut *guard;

        let Some(key) = state.registry.release(destination) else {
            return false;
        };
        let rejected = state
            .pending
            .reject_matching(&key, |_| CommError::ConnectionDisposed {
                destination: key.clone(),
            });
        if rejected > 0 {
            warn!("Comm: released {} with {} requests outstanding", key, rejected);
        }
        self.publish(state);
        true
    }

    /// Whether any request is still outstanding.
    pub fn has_active(&self) -> bool {
        !self.state().pending.is_empty()
    }

    pub fn pending_count(&self) -> usize {
        self.state().pending.len()
    }

    /// Wait until no request is outstanding, including requests issued while waiting.
    pub async fn drain(&self) {
        let mut rx = self.inner.pending_count.subscribe();
        // The sender lives as long as `self`
        let _ = rx.wait_for(|count| *count == 0).await;
    }

    /// Listen for one kind of push message. Dropping the handle unsubscribes.
    pub fn subscribe(
        &self,
        kind: PushKind,
        listener: impl Fn(&PushMessage) + Send + Sync + 'static,
    ) -> Subscription {
        self.inner.hub.subscribe(kind, listener)
    }

    /// Watch channel that is `true` while at least one connection is established.
    pub fn connected(&self) -> watch::Receiver<bool> {
        self.inner.connected.subscribe()
    }

    pub fn is_connected(&self) -> bool {
        *self.inner.connected.borrow()
    }

    /// Destinations with an open connection and their endpoints, oldest first.
    pub fn list_connections(&self) -> Vec<(DestinationKey, Option<String>)> {
        self.state().registry.list()
    }

    /// Endpoint of the connection serving `destination`.
    pub fn endpoint(&self, destination: &DestinationKey) -> Result<Option<String>> {
        let mut state = self.state();
        let endpoint = state.registry.resolve(destination)?.endpoint();
        self.publish(&state);
        Ok(endpoint)
    }

    /// Session id of the connection serving `destination`, if established.
    ///
    /// `Any` resolves like [`Comm::use_destination`] but never opens a connection.
    pub fn session_id(&self, destination: &DestinationKey) -> Option<String> {
        self.state()
            .registry
            .get(destination)
            .and_then(|record| record.session_id().map(str::to_string))
    }

    /// Start or stop collecting user actions. Starting discards anything collected.
    pub fn collect_user_actions(&self, enabled: bool) {
        self.state().user_actions = enabled.then(Vec::new);
    }

    /// Record user actions if collection is enabled.
    pub fn add_user_actions(&self, actions: impl IntoIterator<Item = Value>) {
        if let Some(collected) = self.state().user_actions.as_mut() {
            collected.extend(actions);
        }
    }

    /// Return what was collected and start over. Empty when not collecting.
    pub fn take_user_actions(&self) -> Vec<Value> {
        self.state()
            .user_actions
            .as_mut()
            .map(std::mem::take)
            .unwrap_or_default()
    }

    /// Close every connection and fail every outstanding request with [`CommError::Closed`].
    ///
    /// Later calls fail immediately.
    pub fn dispose(&self) {
        if self.inner.disposed.swap(true, Ordering::SeqCst) {
            return;
        }
        let mut state = self.state();
        state.registry.dispose_all();
        let rejected = state.pending.reject_all(|_| CommError::Closed);
        info!("Comm: disposed, {} requests rejected", rejected);
        self.publish(&state);
    }

    pub fn is_disposed(&self) -> bool {
        self.inner.disposed.load(Ordering::SeqCst)
    }

    /// Handle one transport event.
    ///
    /// Events from connections that were disposed or replaced are ignored.
    pub fn process_event(&self, event: TransportEvent) {
        let deferred = self.handle_event(event);

        if let Some(lost) = deferred.access_lost {
            let recovery = lock(&self.inner.recovery).clone();
            match recovery {
                Some(recovery) => recovery(lost),
                None => warn!("Comm: access lost on req #{} with no recovery handler", lost.req_id),
            }
        }

        if let Some((request, outcome)) = deferred.settle {
            request.settle(outcome);
        }

        {
            let state = self.state();
            self.publish(&state);
        }

        if let Some(push) = deferred.push {
            let delivered = self.inner.hub.broadcast(&push);
            debug!("Comm: {} push delivered to {} listeners", push.kind, delivered);
        }
    }

    fn handle_event(&self, event: TransportEvent) -> Deferred {
        let mut deferred = Deferred::default();
        let mut guard = self.state();
        let state = &mut *guard;

        let Some(record) = state
            .registry
            .for_event(&event.destination, event.connection_id)
        else {
            debug!(
                "Comm: ignoring event from stale connection {} for {}",
                event.connection_id, event.destination
            );
            return deferred;
        };

        match event.kind {
            TransportEventKind::Status(status) => record.on_status(status),
            TransportEventKind::Message(text) => match Inbound::decode(&text, record.destination()) {
                Ok(Inbound::Response(response)) => {
                    let Some(request) = state.pending.take(response.req_id) else {
                        debug!("Comm: response to unknown req #{}", response.req_id);
                        return deferred;
                    };
                    // The code alone triggers recovery, whatever the outcome
                    if response.is_access_lost() {
                        deferred.access_lost = Some(AccessLost {
                            req_id: request.req_id,
                            method: request.method.clone(),
                            destination: record.destination().clone(),
                            message: response
                                .outcome
                                .as_ref()
                                .err()
                                .map(|failure| failure.message.clone())
                                .unwrap_or_default(),
                        });
                    }
                    match &response.outcome {
                        Ok(_) => debug!("Comm response #{} {} OK", request.req_id, request.method),
                        Err(failure) => warn!(
                            "Comm response #{} {} ERROR: {}",
                            request.req_id, request.method, failure
                        ),
                    }
                    deferred.settle = Some((request, response.outcome.map_err(CommError::Server)));
                }
                Ok(Inbound::Push(push)) => {
                    if push.kind == PushKind::ClientConnect {
                        let session = push.session_id();
                        let previous = record.on_established(session.clone());
                        info!(
                            "Comm: connection {} for {} established (session {:?}, was {:?})",
                            record.id(),
                            record.destination(),
                            session,
                            previous
                        );
                        let report = resend_pending(&mut state.pending, record);
                        if !report.is_empty() {
                            info!(
                                "Comm: after reconnect resent {}, interrupted {}, stale {}, queued {}",
                                report.resent.len(),
                                report.interrupted.len(),
                                report.stale.len(),
                                report.queued.len()
                            );
                        }
                    }
                    deferred.push = Some(push);
                }
                Ok(Inbound::UnknownPush(kind)) => {
                    warn!("Comm: dropping push of unknown type {:?}", kind);
                }
                Err(e) => warn!("Comm: dropping undecodable message from {}: {}", event.destination, e),
            },
        }

        deferred
    }

    /// Handle every event queued so far. Returns how many were handled.
    ///
    /// Does nothing once [`Comm::spawn_dispatcher`] has taken the event queue.
    pub fn poll_events(&self) -> usize {
        let events: Vec<TransportEvent> = {
            let mut rx = lock(&self.inner.events_rx);
            let Some(rx) = rx.as_mut() else {
                return 0;
            };
            std::iter::from_fn(|| rx.try_recv().ok()).collect()
        };
        let count = events.len();
        for event in events {
            self.process_event(event);
        }
        count
    }

    /// Start the background task that handles transport events as they arrive.
    ///
    /// Returns `None` if a dispatcher is already running or no tokio runtime is available.
    /// The task ends once every handle to this `Comm` is dropped.
    pub fn spawn_dispatcher(&self) -> Option<JoinHandle<()>> {
        let runtime = match tokio::runtime::Handle::try_current() {
            Ok(runtime) => runtime,
            Err(e) => {
                warn!("Comm: cannot start dispatcher: {}", e);
                return None;
            }
        };
        let mut rx = lock(&self.inner.events_rx).take()?;
        let weak: Weak<CommInner> = Arc::downgrade(&self.inner);

        Some(runtime.spawn(async move {
            while let Some(event) = rx.recv().await {
                let Some(inner) = weak.upgrade() else {
                    break;
                };
                Comm { inner }.process_event(event);
            }
            debug!("Comm: dispatcher stopped");
        }))
    }
}

impl std::fmt::Debug for Comm {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        let state = self.state();
        f.debug_struct("Comm")
            .field("connections", &state.registry.len())
            .field("pending", &state.pending.len())
            .field("disposed", &self.is_disposed())
            .finish()
    }
}
