//! Centralized configuration for tether.
//!
//! Runtime settings live in [`CommConfig`]; fixed protocol and transport
//! parameters are associated constants on the config structs below.

use std::time::Duration;

/// Protocol constants shared by the engine and the dispatcher.
pub struct ProtocolConfig;

impl ProtocolConfig {
    /// Error code signalling that view access was lost mid-session.
    pub const AUTH_NO_VIEW: &'static str = "AUTH_NO_VIEW";
    /// Key inside the connection-established payload carrying the session id.
    pub const SESSION_ID_FIELD: &'static str = "clientId";
}

/// Transport-level constants for the framed TCP adapter.
pub struct TransportConfig;

impl TransportConfig {
    pub const CONNECT_TIMEOUT: Duration = Duration::from_secs(5);
    pub const MAX_FRAME_SIZE: usize = 16 * 1024 * 1024; // 16MB
    pub const RECONNECT_BASE_DELAY: Duration = Duration::from_millis(500);
    pub const RECONNECT_MAX_DELAY: Duration = Duration::from_secs(30);
}

/// Process-wide settings for a [`Comm`](crate::Comm) instance.
#[derive(Debug, Clone, Default)]
pub struct CommConfig {
    /// All destinations collapse onto one connection that is never disposed implicitly.
    pub single_destination: bool,
    /// Destination substituted when a connection is acquired for `Any`.
    pub default_destination: Option<String>,
}

impl CommConfig {
    /// Create a config with default values (multi-destination, no default).
    pub fn new() -> Self {
        Self::default()
    }

    /// Derive the mode from the initial destination assignment.
    ///
    /// Without an assignment there is a single shared server; with one, every
    /// destination may live on a different server.
    pub fn from_assignment(assignment: Option<String>) -> Self {
        Self {
            single_destination: assignment.is_none(),
            default_destination: assignment,
        }
    }

    /// Enable or disable single-shared-destination mode.
    pub fn with_single_destination(mut self, single: bool) -> Self {
        self.single_destination = single;
        self
    }

    /// Set the destination used when acquiring `Any`.
    pub fn with_default_destination(mut self, destination: impl Into<String>) -> Self {
        self.default_destination = Some(destination.into());
        self
    }
}
