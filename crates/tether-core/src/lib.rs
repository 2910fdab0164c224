//! Tether: client-side RPC over persistent, reconnecting connections.
//!
//! This crate multiplexes request/response calls and server push messages over
//! one connection per logical destination. It provides:
//!
//! - Reference-counted connections per destination, or one shared connection
//! - Request ids, response correlation, and futures that settle exactly once
//! - Resend of unsent requests after a reconnect, with session-id checks
//! - Typed push messages broadcast to per-kind subscribers
//!
//! # Example
//!
//! ```rust,no_run
//! use std::net::SocketAddr;
//! use tether_core::transport::{StaticResolver, TcpTransportFactory};
//! use tether_core::{Comm, CommConfig, DestinationKey, PushKind};
//!
//! #[tokio::main]
//! async fn main() -> tether_core::Result<()> {
//!     let addr: SocketAddr = "127.0.0.1:8484".parse().expect("valid address");
//!     let comm = Comm::new(
//!         CommConfig::from_assignment(Some("doc1".into())),
//!         TcpTransportFactory::new(StaticResolver::new(addr)),
//!     );
//!     comm.spawn_dispatcher();
//!
//!     let doc1 = DestinationKey::doc("doc1");
//!     comm.use_destination(&doc1)?;
//!     let _sub = comm.subscribe(PushKind::DocUserAction, |msg| println!("{}", msg.data));
//!
//!     let tables = comm.call(None, &doc1, "fetchTable", vec!["Table1".into()]).await?;
//!     println!("{}", tables);
//!     comm.release(&doc1);
//!     Ok(())
//! }
//! ```

pub mod comm;
pub mod config;
pub mod destination;
pub mod error;
pub mod events;
pub mod pending;
pub mod protocol;
pub mod registry;
pub mod resend;
mod sync;
#[cfg(any(test, feature = "testing"))]
pub mod testing;
pub mod transport;

pub use comm::{AccessLost, Comm, RecoveryCallback};
pub use config::{CommConfig, ProtocolConfig, TransportConfig};
pub use destination::DestinationKey;
pub use error::{CommError, Result, ServerFailure};
pub use events::{EventHub, PushListener, Subscription};
pub use pending::ResponseFuture;
pub use protocol::{Inbound, PushKind, PushMessage, Request, Response};
pub use registry::ConnectionState;
pub use transport::{
    EventSink, Transport, TransportEvent, TransportEventKind, TransportFactory, TransportStatus,
};
