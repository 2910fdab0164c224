//! Transport collaborator interfaces.
//!
//! A [`Transport`] owns one underlying socket to one destination. It is created
//! by a [`TransportFactory`] (the destination-resolution collaborator) and
//! reports everything it observes through the [`EventSink`] it was handed.
//! Events are queued onto a channel consumed by a single dispatcher, so
//! transports never call back into the communication layer directly.
//!
//! - **backoff**: pluggable reconnect timing for transports that retry
//! - **frame**: length-prefixed framing used by the TCP adapter
//! - **tcp**: a reference transport over `tokio::net::TcpStream`

pub mod backoff;
pub mod frame;
pub mod tcp;

pub use backoff::{ExponentialBackoff, ReconnectPolicy};
pub use tcp::{StaticResolver, TcpTransport, TcpTransportConfig, TcpTransportFactory};

use crate::destination::DestinationKey;
use crate::error::Result;
use tokio::sync::mpsc;

/// Low-level socket status reported by a transport.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum TransportStatus {
    /// The socket is open; the handshake has not necessarily completed.
    Up,
    /// The socket was lost. The transport may be retrying.
    Down,
}

/// What a transport observed.
#[derive(Debug, Clone, PartialEq)]
pub enum TransportEventKind {
    /// A complete text message arrived.
    Message(String),
    /// The socket status changed.
    Status(TransportStatus),
}

/// An event tagged with the connection it came from.
#[derive(Debug, Clone, PartialEq)]
pub struct TransportEvent {
    pub destination: DestinationKey,
    /// Registry-assigned id; events from disposed connections are ignored.
    pub connection_id: u64,
    pub kind: TransportEventKind,
}

/// Handle through which a transport reports events.
#[derive(Debug, Clone)]
pub struct EventSink {
    destination: DestinationKey,
    connection_id: u64,
    tx: mpsc::UnboundedSender<TransportEvent>,
}

impl EventSink {
    pub fn new(
        destination: DestinationKey,
        connection_id: u64,
        tx: mpsc::UnboundedSender<TransportEvent>,
    ) -> Self {
        Self {
            destination,
            connection_id,
            tx,
        }
    }

    pub fn destination(&self) -> &DestinationKey {
        &self.destination
    }

    pub fn connection_id(&self) -> u64 {
        self.connection_id
    }

    /// Report a received message. Returns false once nobody is listening.
    pub fn message(&self, text: impl Into<String>) -> bool {
        self.emit(TransportEventKind::Message(text.into()))
    }

    /// Report a status change. Returns false once nobody is listening.
    pub fn status(&self, status: TransportStatus) -> bool {
        self.emit(TransportEventKind::Status(status))
    }

    fn emit(&self, kind: TransportEventKind) -> bool {
        self.tx
            .send(TransportEvent {
                destination: self.destination.clone(),
                connection_id: self.connection_id,
                kind,
            })
            .is_ok()
    }
}

/// One connection to one destination.
pub trait Transport: Send + Sync {
    /// Hand a serialized message to the transport.
    ///
    /// Returns true if it was accepted for sending. Acceptance says nothing
    /// about whether the server will ever see it.
    fn send(&self, message: &str) -> bool;

    /// Stop the transport. No further events should be emitted.
    fn close(&self);

    /// Description of the physical endpoint serving this connection, if known.
    fn endpoint(&self) -> Option<String> {
        None
    }
}

/// Creates transports for destinations and begins establishing them.
pub trait TransportFactory: Send + Sync {
    fn connect(&self, destination: &DestinationKey, sink: EventSink) -> Result<Box<dyn Transport>>;
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_event_sink_tags_events() {
        let (tx, mut rx) = mpsc::unbounded_channel();
        let sink = EventSink::new(DestinationKey::doc("doc1"), 4, tx);

        assert!(sink.message("hello"));
        assert!(sink.status(TransportStatus::Down));

        let first = rx.try_recv().unwrap();
        assert_eq!(first.destination, DestinationKey::doc("doc1"));
        assert_eq!(first.connection_id, 4);
        assert_eq!(first.kind, TransportEventKind::Message("hello".into()));

        let second = rx.try_recv().unwrap();
        assert_eq!(second.kind, TransportEventKind::Status(TransportStatus::Down));
    }

    #[test]
    fn test_event_sink_reports_closed_channel() {
        let (tx, rx) = mpsc::unbounded_channel();
        let sink = EventSink::new(DestinationKey::Any, 0, tx);
        drop(rx);
        assert!(!sink.message("lost"));
    }
}
