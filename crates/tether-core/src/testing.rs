//! In-memory transport for deterministic tests.
//!
//! Available in this crate's unit tests and to dependents that enable the
//! `testing` feature.
//!
//! [`FakeFactory`] records every transport it creates. Each one is reachable
//! through a [`FakeConnection`] handle that plays the server side: it can
//! report socket status, deliver messages, and inspect what was sent.
//!
//! ```ignore
//! use tether_core::testing::FakeFactory;
//! use tether_core::{Comm, CommConfig, DestinationKey};
//!
//! let factory = FakeFactory::new();
//! let comm = Comm::new(CommConfig::new(), factory.clone());
//! comm.use_destination(&DestinationKey::doc("doc1")).unwrap();
//!
//! let server = factory.transport(0).unwrap();
//! server.handshake("session-1");
//! comm.poll_events();
//! ```

use crate::config::ProtocolConfig;
use crate::destination::DestinationKey;
use crate::error::{CommError, Result};
use crate::sync::lock;
use crate::transport::{EventSink, Transport, TransportFactory, TransportStatus};
use serde_json::{json, Value};
use std::sync::atomic::{AtomicBool, Ordering};
use std::sync::{Arc, Mutex};

struct FakeShared {
    sink: EventSink,
    sent: Mutex<Vec<String>>,
    closed: AtomicBool,
    accepting: AtomicBool,
}

struct FakeTransport {
    shared: Arc<FakeShared>,
}

impl Transport for FakeTransport {
    fn send(&self, message: &str) -> bool {
        if self.shared.closed.load(Ordering::SeqCst) || !self.shared.accepting.load(Ordering::SeqCst) {
            return false;
        }
        lock(&self.shared.sent).push(message.to_string());
        true
    }

    fn close(&self) {
        self.shared.closed.store(true, Ordering::SeqCst);
    }

    fn endpoint(&self) -> Option<String> {
        Some(format!("fake://{}", self.shared.sink.destination()))
    }
}

/// Server-side view of one fake transport.
#[derive(Clone)]
pub struct FakeConnection {
    shared: Arc<FakeShared>,
}

impl FakeConnection {
    pub fn destination(&self) -> &DestinationKey {
        self.shared.sink.destination()
    }

    pub fn connection_id(&self) -> u64 {
        self.shared.sink.connection_id()
    }

    /// Messages the transport accepted, oldest first.
    pub fn sent(&self) -> Vec<String> {
        lock(&self.shared.sent).clone()
    }

    /// Accepted messages parsed as JSON.
    pub fn sent_json(&self) -> Vec<Value> {
        self.sent()
            .iter()
            .filter_map(|text| serde_json::from_str(text).ok())
            .collect()
    }

    pub fn is_closed(&self) -> bool {
        self.shared.closed.load(Ordering::SeqCst)
    }

    /// Make `send` refuse (or accept again) messages.
    pub fn set_accepting(&self, accepting: bool) {
        self.shared.accepting.store(accepting, Ordering::SeqCst);
    }

    /// Deliver a raw text message. Closed transports stay silent.
    pub fn deliver(&self, text: impl Into<String>) -> bool {
        !self.is_closed() && self.shared.sink.message(text)
    }

    /// Deliver a JSON message.
    pub fn deliver_json(&self, value: Value) -> bool {
        self.deliver(value.to_string())
    }

    pub fn up(&self) -> bool {
        !self.is_closed() && self.shared.sink.status(TransportStatus::Up)
    }

    pub fn down(&self) -> bool {
        !self.is_closed() && self.shared.sink.status(TransportStatus::Down)
    }

    /// Deliver the connection-established push announcing `session_id`.
    pub fn handshake(&self, session_id: impl Into<Value>) -> bool {
        let mut data = serde_json::Map::new();
        data.insert(ProtocolConfig::SESSION_ID_FIELD.to_string(), session_id.into());
        self.deliver_json(json!({ "type": "clientConnect", "data": data }))
    }

    /// Drop the socket, reopen it, and complete a new handshake.
    pub fn reconnect(&self, session_id: impl Into<Value>) -> bool {
        self.down() && self.up() && self.handshake(session_id)
    }

    /// Answer a request successfully.
    pub fn respond(&self, req_id: u64, data: Value) -> bool {
        self.deliver_json(json!({ "reqId": req_id, "data": data }))
    }

    /// Answer a request with a failure.
    pub fn respond_error(&self, req_id: u64, message: &str, code: Option<&str>) -> bool {
        let mut response = json!({ "reqId": req_id, "error": message });
        if let Some(code) = code {
            response["errorCode"] = json!(code);
        }
        self.deliver_json(response)
    }

    /// Deliver a push message of the given wire type.
    pub fn push(&self, kind: &str, data: Value) -> bool {
        self.deliver_json(json!({ "type": kind, "data": data }))
    }
}

impl std::fmt::Debug for FakeConnection {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("FakeConnection")
            .field("destination", self.destination())
            .field("connection_id", &self.connection_id())
            .field("closed", &self.is_closed())
            .finish()
    }
}

#[derive(Default)]
struct FactoryState {
    transports: Vec<Arc<FakeShared>>,
    failing: bool,
}

/// Transport factory producing in-memory transports.
#[derive(Clone, Default)]
pub struct FakeFactory {
    state: Arc<Mutex<FactoryState>>,
}

impl FakeFactory {
    pub fn new() -> Self {
        Self::default()
    }

    /// Make subsequent `connect` calls fail.
    pub fn set_failing(&self, failing: bool) {
        lock(&self.state).failing = failing;
    }

    /// Number of transports created so far.
    pub fn connect_count(&self) -> usize {
        lock(&self.state).transports.len()
    }

    /// The `index`-th transport created.
    pub fn transport(&self, index: usize) -> Option<FakeConnection> {
        lock(&self.state)
            .transports
            .get(index)
            .map(|shared| FakeConnection {
                shared: shared.clone(),
            })
    }
}

impl TransportFactory for FakeFactory {
    fn connect(&self, destination: &DestinationKey, sink: EventSink) -> Result<Box<dyn Transport>> {
        let mut state = lock(&self.state);
        if state.failing {
            return Err(CommError::Transport {
                destination: destination.clone(),
                message: "fake factory refused to connect".to_string(),
            });
        }

        let shared = Arc::new(FakeShared {
            sink,
            sent: Mutex::new(Vec::new()),
            closed: AtomicBool::new(false),
            accepting: AtomicBool::new(true),
        });
        state.transports.push(shared.clone());
        Ok(Box::new(FakeTransport { shared }))
    }
}
