//! Reference transport over TCP.
//!
//! Each [`TcpTransport`] runs one background task that connects to its
//! endpoint, reports [`TransportStatus::Up`], pumps frames in both directions
//! until the socket is lost, reports [`TransportStatus::Down`], and retries
//! according to its [`ReconnectPolicy`].
//!
//! Messages accepted by [`Transport::send`] but not yet written when the socket
//! drops are discarded rather than replayed on the next socket. The
//! communication layer already treats them as sent-with-unknown-outcome.

use super::backoff::{ExponentialBackoff, ReconnectPolicy};
use super::frame::{read_frame, write_frame};
use super::{EventSink, Transport, TransportFactory, TransportStatus};
use crate::config::TransportConfig;
use crate::destination::DestinationKey;
use crate::error::{CommError, Result};
use std::collections::HashMap;
use std::net::SocketAddr;
use std::sync::atomic::{AtomicBool, Ordering};
use std::sync::{Arc, Mutex};
use std::time::Duration;
use tokio::net::TcpStream;
use tokio::sync::{mpsc, watch};
use tokio::task::JoinHandle;
use tracing::{debug, info, warn};

/// Maps destinations to socket addresses.
#[derive(Debug, Clone, Default)]
pub struct StaticResolver {
    default: Option<SocketAddr>,
    routes: HashMap<String, SocketAddr>,
}

impl StaticResolver {
    /// Resolver sending every destination to `default`.
    pub fn new(default: SocketAddr) -> Self {
        Self {
            default: Some(default),
            routes: HashMap::new(),
        }
    }

    /// Route one destination to its own endpoint.
    pub fn with_route(mut self, destination: impl Into<String>, addr: SocketAddr) -> Self {
        self.routes.insert(destination.into(), addr);
        self
    }

    pub fn resolve(&self, destination: &DestinationKey) -> Option<SocketAddr> {
        match destination {
            DestinationKey::Doc(id) => self.routes.get(id).copied().or(self.default),
            DestinationKey::Any => self.default,
        }
    }
}

/// Runtime settings for TCP transports.
#[derive(Clone)]
pub struct TcpTransportConfig {
    pub connect_timeout: Duration,
    pub reconnect: Arc<dyn ReconnectPolicy>,
}

impl Default for TcpTransportConfig {
    fn default() -> Self {
        Self {
            connect_timeout: TransportConfig::CONNECT_TIMEOUT,
            reconnect: Arc::new(ExponentialBackoff::default()),
        }
    }
}

impl TcpTransportConfig {
    pub fn with_connect_timeout(mut self, timeout: Duration) -> Self {
        self.connect_timeout = timeout;
        self
    }

    pub fn with_reconnect(mut self, policy: impl ReconnectPolicy + 'static) -> Self {
        self.reconnect = Arc::new(policy);
        self
    }
}

impl std::fmt::Debug for TcpTransportConfig {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("TcpTransportConfig")
            .field("connect_timeout", &self.connect_timeout)
            .finish_non_exhaustive()
    }
}

/// Creates [`TcpTransport`]s for resolved destinations.
#[derive(Debug, Clone)]
pub struct TcpTransportFactory {
    resolver: StaticResolver,
    config: TcpTransportConfig,
}

impl TcpTransportFactory {
    pub fn new(resolver: StaticResolver) -> Self {
        Self {
            resolver,
            config: TcpTransportConfig::default(),
        }
    }

    pub fn with_config(mut self, config: TcpTransportConfig) -> Self {
        self.config = config;
        self
    }
}

impl TransportFactory for TcpTransportFactory {
    fn connect(&self, destination: &DestinationKey, sink: EventSink) -> Result<Box<dyn Transport>> {
        let addr = self
            .resolver
            .resolve(destination)
            .ok_or_else(|| CommError::Transport {
                destination: destination.clone(),
                message: "no endpoint configured".to_string(),
            })?;
        let transport = TcpTransport::spawn(addr, sink, self.config.clone())?;
        Ok(Box::new(transport))
    }
}

/// How one socket session ended.
enum SessionEnd {
    Shutdown,
    Lost(String),
}

/// Framed TCP connection with automatic reconnect.
pub struct TcpTransport {
    addr: SocketAddr,
    outbox: mpsc::UnboundedSender<String>,
    connected: Arc<AtomicBool>,
    shutdown_tx: watch::Sender<bool>,
    task_handle: Mutex<Option<JoinHandle<()>>>,
}

impl TcpTransport {
    /// Start connecting to `addr` in the background.
    ///
    /// Must be called from within a tokio runtime.
    pub fn spawn(addr: SocketAddr, sink: EventSink, config: TcpTransportConfig) -> Result<Self> {
        let runtime = tokio::runtime::Handle::try_current().map_err(|e| CommError::Transport {
            destination: sink.destination().clone(),
            message: format!("no async runtime: {}", e),
        })?;

        let (outbox, outbox_rx) = mpsc::unbounded_channel();
        let (shutdown_tx, shutdown_rx) = watch::channel(false);
        let connected = Arc::new(AtomicBool::new(false));

        let task_handle = runtime.spawn(Self::connection_loop(
            addr,
            sink,
            config,
            connected.clone(),
            outbox_rx,
            shutdown_rx,
        ));

        Ok(Self {
            addr,
            outbox,
            connected,
            shutdown_tx,
            task_handle: Mutex::new(Some(task_handle)),
        })
    }

    pub fn addr(&self) -> SocketAddr {
        self.addr
    }

    pub fn is_connected(&self) -> bool {
        self.connected.load(Ordering::SeqCst)
    }

    async fn connection_loop(
        addr: SocketAddr,
        sink: EventSink,
        config: TcpTransportConfig,
        connected: Arc<AtomicBool>,
        mut outbox_rx: mpsc::UnboundedReceiver<String>,
        mut shutdown_rx: watch::Receiver<bool>,
    ) {
        let mut attempt: u32 = 0;

        loop {
            if *shutdown_rx.borrow() {
                break;
            }

            let connect = tokio::time::timeout(config.connect_timeout, TcpStream::connect(addr));
            let result = tokio::select! {
                _ = shutdown_rx.changed() => break,
                result = connect => result,
            };

            match result {
                Ok(Ok(stream)) => {
                    attempt = 0;
                    // Anything still queued belonged to the previous socket
                    while outbox_rx.try_recv().is_ok() {}

                    connected.store(true, Ordering::SeqCst);
                    info!("Transport for {} connected to {}", sink.destination(), addr);
                    if !sink.status(TransportStatus::Up) {
                        break;
                    }

                    let end = Self::pump(stream, &sink, &mut outbox_rx, &mut shutdown_rx).await;
                    connected.store(false, Ordering::SeqCst);

                    match end {
                        SessionEnd::Shutdown => break,
                        SessionEnd::Lost(reason) => {
                            warn!(
                                "Transport for {} lost connection to {}: {}",
                                sink.destination(),
                                addr,
                                reason
                            );
                            if !sink.status(TransportStatus::Down) {
                                break;
                            }
                        }
                    }
                }
                Ok(Err(e)) => {
                    debug!("Transport for {} failed to connect to {}: {}", sink.destination(), addr, e);
                }
                Err(_) => {
                    debug!(
                        "Transport for {} timed out connecting to {} after {:?}",
                        sink.destination(),
                        addr,
                        config.connect_timeout
                    );
                }
            }

            let Some(delay) = config.reconnect.next_delay(attempt) else {
                warn!(
                    "Transport for {} giving up on {} after {} attempts",
                    sink.destination(),
                    addr,
                    attempt
                );
                break;
            };
            attempt = attempt.saturating_add(1);

            tokio::select! {
                _ = shutdown_rx.changed() => break,
                _ = tokio::time::sleep(delay) => {}
            }
        }

        connected.store(false, Ordering::SeqCst);
        debug!("Transport for {} stopped", sink.destination());
    }

    /// Move frames both ways until the socket ends or shutdown is requested.
    async fn pump(
        stream: TcpStream,
        sink: &EventSink,
        outbox_rx: &mut mpsc::UnboundedReceiver<String>,
        shutdown_rx: &mut watch::Receiver<bool>,
    ) -> SessionEnd {
        let (mut reader, mut writer) = stream.into_split();

        // The read loop is never cancelled mid-frame; it only stops when the
        // whole session does.
        let read_loop = async {
            loop {
                match read_frame(&mut reader).await {
                    Ok(Some(text)) => {
                        if !sink.message(text) {
                            return SessionEnd::Shutdown;
                        }
                    }
                    Ok(None) => return SessionEnd::Lost("peer closed connection".to_string()),
                    Err(e) => return SessionEnd::Lost(e.to_string()),
                }
            }
        };

        let write_loop = async {
            loop {
                tokio::select! {
                    _ = shutdown_rx.changed() => return SessionEnd::Shutdown,
                    outgoing = outbox_rx.recv() => match outgoing {
                        Some(text) => {
                            if let Err(e) = write_frame(&mut writer, &text).await {
                                return SessionEnd::Lost(e.to_string());
                            }
                        }
                        None => return SessionEnd::Shutdown,
                    },
                }
            }
        };

        tokio::select! {
            end = read_loop => end,
            end = write_loop => end,
        }
    }
}

impl Transport for TcpTransport {
    fn send(&self, message: &str) -> bool {
        self.is_connected() && self.outbox.send(message.to_string()).is_ok()
    }

    fn close(&self) {
        self.shutdown_tx.send_replace(true);
    }

    fn endpoint(&self) -> Option<String> {
        Some(format!("tcp://{}", self.addr))
    }
}

impl Drop for TcpTransport {
    fn drop(&mut self) {
        self.close();
        let handle = self
            .task_handle
            .get_mut()
            .unwrap_or_else(|poisoned| poisoned.into_inner())
            .take();
        if let Some(handle) = handle {
            handle.abort();
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_resolver_routes_and_default() {
        let default: SocketAddr = "127.0.0.1:9000".parse().unwrap();
        let doc2: SocketAddr = "127.0.0.1:9002".parse().unwrap();
        let resolver = StaticResolver::new(default).with_route("doc2", doc2);

        assert_eq!(resolver.resolve(&DestinationKey::Any), Some(default));
        assert_eq!(resolver.resolve(&DestinationKey::doc("doc1")), Some(default));
        assert_eq!(resolver.resolve(&DestinationKey::doc("doc2")), Some(doc2));
        assert_eq!(StaticResolver::default().resolve(&DestinationKey::Any), None);
    }

    #[test]
    fn test_factory_without_endpoint_fails() {
        let factory = TcpTransportFactory::new(StaticResolver::default());
        let (tx, _rx) = mpsc::unbounded_channel();
        let sink = EventSink::new(DestinationKey::doc("doc1"), 0, tx);

        match factory.connect(&DestinationKey::doc("doc1"), sink) {
            Err(CommError::Transport { destination, .. }) => {
                assert_eq!(destination, DestinationKey::doc("doc1"))
            }
            Err(other) => panic!("Expected transport error, got: {:?}", other),
            Ok(_) => panic!("Expected transport error, got a transport"),
        }
    }

    #[test]
    fn test_spawn_outside_runtime_fails() {
        let (tx, _rx) = mpsc::unbounded_channel();
        let sink = EventSink::new(DestinationKey::Any, 0, tx);
        let addr: SocketAddr = "127.0.0.1:1".parse().unwrap();
        assert!(TcpTransport::spawn(addr, sink, TcpTransportConfig::default()).is_err());
    }

    #[tokio::test]
    async fn test_send_refused_until_connected() {
        let (tx, _rx) = mpsc::unbounded_channel();
        let sink = EventSink::new(DestinationKey::Any, 0, tx);
        // Nothing listens on port 1
        let addr: SocketAddr = "127.0.0.1:1".parse().unwrap();
        let transport = TcpTransport::spawn(addr, sink, TcpTransportConfig::default()).unwrap();

        assert!(!transport.send("hello"));
        assert_eq!(transport.endpoint().as_deref(), Some("tcp://127.0.0.1:1"));
        transport.close();
    }
}
