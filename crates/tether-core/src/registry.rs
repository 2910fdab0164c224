//! Connection registry: one connection per destination, reference counted.
//!
//! In multi-destination mode each destination gets its own connection, which
//! lives while its use count is positive. In single-shared-destination mode
//! every key collapses onto [`DestinationKey::Any`] and the connection lives
//! until the registry itself is disposed.

use crate::config::CommConfig;
use crate::destination::DestinationKey;
use crate::error::{CommError, Result};
use crate::transport::{EventSink, Transport, TransportEvent, TransportFactory, TransportStatus};
use std::collections::HashMap;
use std::sync::Arc;
use tokio::sync::mpsc;
use tracing::{debug, info};

/// Per-connection state machine.
///
/// `Disconnected → Connecting → Established → {Disconnected, Disposed}`
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum ConnectionState {
    /// Socket lost; waiting for the transport to reconnect.
    Disconnected,
    /// Socket opening or open, handshake not yet received.
    Connecting,
    /// Handshake received; requests may be sent.
    Established,
    /// Torn down. Terminal.
    Disposed,
}

/// One live connection.
pub struct ConnectionRecord {
    id: u64,
    destination: DestinationKey,
    transport: Box<dyn Transport>,
    session_id: Option<String>,
    use_count: u32,
    state: ConnectionState,
}

impl ConnectionRecord {
    pub fn id(&self) -> u64 {
        self.id
    }

    pub fn destination(&self) -> &DestinationKey {
        &self.destination
    }

    /// Session id assigned by the server on the latest handshake.
    pub fn session_id(&self) -> Option<&str> {
        self.session_id.as_deref()
    }

    pub fn use_count(&self) -> u32 {
        self.use_count
    }

    pub fn state(&self) -> ConnectionState {
        self.state
    }

    pub fn is_established(&self) -> bool {
        self.state == ConnectionState::Established
    }

    pub fn endpoint(&self) -> Option<String> {
        self.transport.endpoint()
    }

    /// Hand a message to the transport. Only an established connection accepts.
    pub fn send(&self, message: &str) -> bool {
        self.is_established() && self.transport.send(message)
    }

    /// Apply a transport status change. Never resolves any request by itself.
    pub fn on_status(&mut self, status: TransportStatus) {
        self.state = match status {
            TransportStatus::Up => ConnectionState::Connecting,
            TransportStatus::Down => ConnectionState::Disconnected,
        };
        debug!("Connection {} for {} now {:?}", self.id, self.destination, self.state);
    }

    /// Record a completed handshake. Returns the previous session id.
    pub fn on_established(&mut self, session_id: Option<String>) -> Option<String> {
        self.state = ConnectionState::Established;
        std::mem::replace(&mut self.session_id, session_id)
    }

    fn dispose(&mut self) {
        self.state = ConnectionState::Disposed;
        self.transport.close();
    }
}

impl std::fmt::Debug for ConnectionRecord {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("ConnectionRecord")
            .field("id", &self.id)
            .field("destination", &self.destination)
            .field("session_id", &self.session_id)
            .field("use_count", &self.use_count)
            .field("state", &self.state)
            .finish_non_exhaustive()
    }
}

/// Maps destinations to connections.
pub struct ConnectionRegistry {
    config: CommConfig,
    connections: HashMap<DestinationKey, ConnectionRecord>,
    next_connection_id: u64,
    factory: Arc<dyn TransportFactory>,
    events_tx: mpsc::UnboundedSender<TransportEvent>,
}

impl ConnectionRegistry {
    pub fn new(
        config: CommConfig,
        factory: Arc<dyn TransportFactory>,
        events_tx: mpsc::UnboundedSender<TransportEvent>,
    ) -> Self {
        Self {
            config,
            connections: HashMap::new(),
            next_connection_id: 0,
            factory,
            events_tx,
        }
    }

    /// Key under which a destination's connection is stored.
    fn key_for(&self, destination: &DestinationKey) -> DestinationKey {
        if self.config.single_destination {
            DestinationKey::Any
        } else {
            destination.clone()
        }
    }

    /// Key of the connection pinned by `use`/`release` of a destination.
    ///
    /// `Any` maps to the default destination when one is configured.
    fn pin_key(&self, destination: &DestinationKey) -> DestinationKey {
        match (&self.config.default_destination, destination) {
            (Some(default), DestinationKey::Any) if !self.config.single_destination => {
                DestinationKey::doc(default.clone())
            }
            _ => self.key_for(destination),
        }
    }

    /// Key of the existing connection that `use_destination` would count for `destination`.
    ///
    /// In multi-destination mode `Any` without a default is the oldest connection.
    fn lookup_key(&self, destination: &DestinationKey) -> Option<DestinationKey> {
        let key = self.pin_key(destination);
        if key.is_any() && !self.config.single_destination {
            return self
                .connections
                .values()
                .min_by_key(|record| record.id)
                .map(|record| record.destination.clone());
        }
        Some(key)
    }

    /// Get or create the connection for a destination.
    ///
    /// Does not touch the use count.
    pub fn acquire(&mut self, destination: &DestinationKey) -> Result<&mut ConnectionRecord> {
        let key = self.pin_key(destination);

        if !self.connections.contains_key(&key) {
            let id = self.next_connection_id;
            self.next_connection_id += 1;

            let sink = EventSink::new(key.clone(), id, self.events_tx.clone());
            let transport = self.factory.connect(&key, sink)?;
            info!("Comm: opening connection {} for {}", id, key);

            self.connections.insert(
                key.clone(),
                ConnectionRecord {
                    id,
                    destination: key.clone(),
                    transport,
                    session_id: None,
                    use_count: 0,
                    state: ConnectionState::Connecting,
                },
            );
        }

        self.connections
            .get_mut(&key)
            .ok_or(CommError::NoConnection)
    }

    /// Resolve the connection a request for `destination` should use.
    ///
    /// In multi-destination mode `Any` picks the oldest open connection and
    /// never creates one.
    pub fn resolve(&mut self, destination: &DestinationKey) -> Result<&mut ConnectionRecord> {
        let key = self.key_for(destination);
        if key.is_any() && !self.config.single_destination {
            return self
                .connections
                .values_mut()
                .min_by_key(|record| record.id)
                .ok_or(CommError::NoConnection);
        }
        self.acquire(&key)
    }

    /// Pin a destination's connection. Returns the new use count.
    pub fn use_destination(&mut self, destination: &DestinationKey) -> Result<u32> {
        let single = self.config.single_destination;
        let key = self.pin_key(destination);
        let record = self.resolve(&key)?;
        if !single {
            record.use_count += 1;
        }
        info!(
            "Comm.use_destination({}): use_count now {}",
            destination, record.use_count
        );
        Ok(record.use_count)
    }

    /// Unpin a destination's connection.
    ///
    /// Returns the key of the connection if this release disposed it; the
    /// caller must then reject the requests still addressed to it.
    pub fn release(&mut self, destination: &DestinationKey) -> Option<DestinationKey> {
        if self.config.single_destination {
            debug!("Comm.release({}): shared connection is kept", destination);
            return None;
        }

        let key = self.lookup_key(destination)?;
        let record = self.connections.get_mut(&key)?;
        record.use_count = record.use_count.saturating_sub(1);
        info!("Comm.release({}): use_count now {}", destination, record.use_count);
        if record.use_count > 0 {
            return None;
        }

        let mut record = self.connections.remove(&key)?;
        record.dispose();
        info!("Comm: disposed connection {} for {}", record.id, key);
        Some(key)
    }

    /// Look up the live connection an event came from.
    pub fn for_event(
        &mut self,
        destination: &DestinationKey,
        connection_id: u64,
    ) -> Option<&mut ConnectionRecord> {
        self.connections
            .get_mut(destination)
            .filter(|record| record.id == connection_id)
    }

    /// Existing connection for a destination, resolved like `use_destination` but never opened.
    pub fn get(&self, destination: &DestinationKey) -> Option<&ConnectionRecord> {
        self.connections.get(&self.lookup_key(destination)?)
    }

    /// True while at least one connection is established.
    pub fn any_established(&self) -> bool {
        self.connections.values().any(ConnectionRecord::is_established)
    }

    /// Destinations and endpoint descriptions, oldest connection first.
    pub fn list(&self) -> Vec<(DestinationKey, Option<String>)> {
        let mut records: Vec<&ConnectionRecord> = self.connections.values().collect();
        records.sort_by_key(|record| record.id);
        records
            .into_iter()
            .map(|record| (record.destination.clone(), record.endpoint()))
            .collect()
    }

    pub fn len(&self) -> usize {
        self.connections.len()
    }

    pub fn is_empty(&self) -> bool {
        self.connections.is_empty()
    }

    /// Close every connection.
    pub fn dispose_all(&mut self) {
        for (key, mut record) in self.connections.drain() {
            record.dispose();
            info!("Comm: disposed connection {} for {}", record.id, key);
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::testing::FakeFactory;

    fn registry(config: CommConfig) -> (ConnectionRegistry, FakeFactory) {
        let factory = FakeFactory::new();
        let (tx, _rx) = mpsc::unbounded_channel();
        (
            ConnectionRegistry::new(config, Arc::new(factory.clone()), tx),
            factory,
        )
    }

    #[test]
    fn test_acquire_reuses_connection() {
        let (mut reg, factory) = registry(CommConfig::new());
        let first = reg.acquire(&DestinationKey::doc("doc1")).unwrap().id();
        let second = reg.acquire(&DestinationKey::doc("doc1")).unwrap().id();

        assert_eq!(first, second);
        assert_eq!(factory.connect_count(), 1);
        assert_eq!(reg.get(&DestinationKey::doc("doc1")).unwrap().use_count(), 0);
        assert_eq!(
            reg.get(&DestinationKey::doc("doc1")).unwrap().state(),
            ConnectionState::Connecting
        );
    }

    #[test]
    fn test_resolve_any_without_connections_fails() {
        let (mut reg, _factory) = registry(CommConfig::new());
        assert!(matches!(
            reg.resolve(&DestinationKey::Any),
            Err(CommError::NoConnection)
        ));
    }

    #[test]
    fn test_resolve_any_picks_oldest_connection() {
        let (mut reg, _factory) = registry(CommConfig::new());
        reg.acquire(&DestinationKey::doc("doc1")).unwrap();
        reg.acquire(&DestinationKey::doc("doc2")).unwrap();

        let record = reg.resolve(&DestinationKey::Any).unwrap();
        assert_eq!(record.destination(), &DestinationKey::doc("doc1"));
    }

    #[test]
    fn test_use_and_release_counts() {
        let (mut reg, factory) = registry(CommConfig::new());
        let doc1 = DestinationKey::doc("doc1");

        assert_eq!(reg.use_destination(&doc1).unwrap(), 1);
        assert_eq!(reg.use_destination(&doc1).unwrap(), 2);

        assert_eq!(reg.release(&doc1), None);
        assert_eq!(reg.get(&doc1).unwrap().use_count(), 1);

        assert_eq!(reg.release(&doc1), Some(doc1.clone()));
        assert!(reg.get(&doc1).is_none());
        assert!(factory.transport(0).unwrap().is_closed());

        // Releasing an unknown destination is harmless
        assert_eq!(reg.release(&doc1), None);
    }

    #[test]
    fn test_release_any_undoes_use_any() {
        let (mut reg, factory) = registry(CommConfig::new());
        let doc1 = DestinationKey::doc("doc1");

        reg.use_destination(&doc1).unwrap();
        assert_eq!(reg.use_destination(&DestinationKey::Any).unwrap(), 2);
        assert_eq!(reg.get(&DestinationKey::Any).unwrap().destination(), &doc1);

        assert_eq!(reg.release(&DestinationKey::Any), None);
        assert_eq!(reg.get(&doc1).unwrap().use_count(), 1);
        assert_eq!(reg.release(&doc1), Some(doc1.clone()));
        assert!(reg.is_empty());
        assert!(factory.transport(0).unwrap().is_closed());
    }

    #[test]
    fn test_single_destination_collapses_keys() {
        let (mut reg, factory) = registry(CommConfig::new().with_single_destination(true));

        let a = reg.acquire(&DestinationKey::doc("doc1")).unwrap().id();
        let b = reg.acquire(&DestinationKey::doc("doc2")).unwrap().id();
        assert_eq!(a, b);
        assert_eq!(factory.connect_count(), 1);

        reg.use_destination(&DestinationKey::doc("doc1")).unwrap();
        assert_eq!(reg.release(&DestinationKey::doc("doc1")), None);
        assert_eq!(reg.release(&DestinationKey::doc("doc1")), None);
        assert_eq!(reg.len(), 1);
    }

    #[test]
    fn test_acquire_any_uses_default_destination() {
        let (mut reg, _factory) = registry(CommConfig::from_assignment(Some("doc9".into())));
        let record = reg.acquire(&DestinationKey::Any).unwrap();
        assert_eq!(record.destination(), &DestinationKey::doc("doc9"));
    }

    #[test]
    fn test_send_requires_established() {
        let (mut reg, factory) = registry(CommConfig::new());
        let record = reg.acquire(&DestinationKey::doc("doc1")).unwrap();

        assert!(!record.send("early"));
        record.on_established(Some("s1".into()));
        assert!(record.send("ok"));
        record.on_status(TransportStatus::Down);
        assert!(!record.send("late"));

        assert_eq!(factory.transport(0).unwrap().sent(), vec!["ok".to_string()]);
    }

    #[test]
    fn test_for_event_ignores_stale_connection_ids() {
        let (mut reg, _factory) = registry(CommConfig::new());
        let doc1 = DestinationKey::doc("doc1");
        reg.use_destination(&doc1).unwrap();
        reg.release(&doc1);
        reg.acquire(&doc1).unwrap();

        assert!(reg.for_event(&doc1, 0).is_none());
        assert!(reg.for_event(&doc1, 1).is_some());
    }

    #[test]
    fn test_list_in_creation_order() {
        let (mut reg, _factory) = registry(CommConfig::new());
        reg.acquire(&DestinationKey::doc("b")).unwrap();
        reg.acquire(&DestinationKey::doc("a")).unwrap();

        let listed: Vec<DestinationKey> = reg.list().into_iter().map(|(k, _)| k).collect();
        assert_eq!(listed, vec![DestinationKey::doc("b"), DestinationKey::doc("a")]);
    }
}
