//! Error types for the tether communication layer.
//!
//! Every request-level failure is delivered through the call's future as a
//! [`CommError`]. Nothing in this crate panics on a bad message or a lost
//! connection; those become variants here.

use crate::destination::DestinationKey;
use serde_json::Value;
use thiserror::Error;

/// Failure reported by the server for a specific request.
#[derive(Debug, Clone, PartialEq)]
pub struct ServerFailure {
    /// Human-readable error message.
    pub message: String,
    /// Machine-readable error code (e.g. `AUTH_NO_VIEW`).
    pub code: Option<String>,
    /// Structured details attached by the server.
    pub details: Option<Value>,
    /// Server suggests forking the document instead of retrying.
    pub should_fork: Option<bool>,
}

impl std::fmt::Display for ServerFailure {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        match &self.code {
            Some(code) => write!(f, "[{}] {}", code, self.message),
            None => write!(f, "{}", self.message),
        }
    }
}

/// Main error type for tether.
#[derive(Debug, Error)]
pub enum CommError {
    // Session errors
    #[error("Comm: outdated session for {method} (bound {bound}, current {current:?})")]
    OutdatedSession {
        method: String,
        bound: String,
        current: Option<String>,
    },

    #[error("Comm: pending with outdated session ({method})")]
    StaleSession { method: String },

    // Connection errors
    #[error("Comm: interrupted by reconnect ({method})")]
    InterruptedByReconnect { method: String },

    #[error("Comm: connection disposed for {destination}")]
    ConnectionDisposed { destination: DestinationKey },

    #[error("no connection available")]
    NoConnection,

    #[error("Comm: closed")]
    Closed,

    // Server-reported errors
    #[error("{0}")]
    Server(ServerFailure),

    // Boundary errors
    #[error("JSON error: {message}")]
    Json {
        message: String,
        #[source]
        source: Option<serde_json::Error>,
    },

    #[error("IO error: {message}")]
    Io {
        message: String,
        #[source]
        source: Option<std::io::Error>,
    },

    #[error("Protocol error: {message}")]
    Protocol { message: String },

    #[error("Transport error for {destination}: {message}")]
    Transport {
        destination: DestinationKey,
        message: String,
    },
}

/// Result type alias for tether operations.
pub type Result<T> = std::result::Result<T, CommError>;

impl From<std::io::Error> for CommError {
    fn from(err: std::io::Error) -> Self {
        CommError::Io {
            message: err.to_string(),
            source: Some(err),
        }
    }
}

impl From<serde_json::Error> for CommError {
    fn from(err: serde_json::Error) -> Self {
        CommError::Json {
            message: err.to_string(),
            source: Some(err),
        }
    }
}

impl CommError {
    /// Machine-readable code of a server failure, if any.
    pub fn code(&self) -> Option<&str> {
        match self {
            CommError::Server(failure) => failure.code.as_deref(),
            _ => None,
        }
    }

    /// Structured details of a server failure, if any.
    pub fn details(&self) -> Option<&Value> {
        match self {
            CommError::Server(failure) => failure.details.as_ref(),
            _ => None,
        }
    }

    /// Whether the server suggested forking the document.
    pub fn should_fork(&self) -> bool {
        matches!(
            self,
            CommError::Server(ServerFailure {
                should_fork: Some(true),
                ..
            })
        )
    }

    /// Check if the caller may safely re-issue the request.
    ///
    /// These are the cases where the request either never reached the server
    /// or its outcome is unknown and the caller knows better than this layer
    /// whether repeating it is harmless.
    pub fn is_retryable(&self) -> bool {
        matches!(
            self,
            CommError::OutdatedSession { .. }
                | CommError::StaleSession { .. }
                | CommError::InterruptedByReconnect { .. }
                | CommError::ConnectionDisposed { .. }
                | CommError::NoConnection
        )
    }
}
