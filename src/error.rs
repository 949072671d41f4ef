//! Error types for the device transport layer
//!
//! Callers only ever see `InvalidArgument`/`MissingCallback`/`NotReady`
//! synchronously from API calls, and `Socket`/`Protocol` as the result of a
//! `poll`. After the latter the connection stays usable and reconnects on its own.

use crate::config::ConfigError;
use crate::transport::mqtt::backoff::BackoffError;
use crate::transport::mqtt::cache::CacheError;
use crate::transport::mqtt::ConnectionState;
use crate::transport::SessionError;
use thiserror::Error;

/// Boxed error returned by user-supplied callbacks
pub type BoxError = Box<dyn std::error::Error + Send + Sync>;

/// Main error type for connection engine operations
#[derive(Debug, Error)]
pub enum TransportError {
    #[error("Invalid argument: {message}")]
    InvalidArgument { message: String },

    #[error("Missing mandatory callback: {0}")]
    MissingCallback(&'static str),

    #[error("Operation not allowed in connection state {state:?}")]
    NotReady { state: ConnectionState },

    #[error("Credential refresh failed")]
    CredentialRefresh(#[source] BoxError),

    #[error("Failed to resolve broker address {host}:{port}")]
    AddressResolution {
        host: String,
        port: u16,
        #[source]
        source: SessionError,
    },

    #[error("Socket error")]
    Socket(#[source] SessionError),

    #[error("MQTT protocol error")]
    Protocol(#[source] SessionError),

    #[error("Message cache error: {0}")]
    Cache(#[from] CacheError),

    #[error("Configuration error: {0}")]
    Config(#[from] ConfigError),
}

impl TransportError {
    /// Create invalid argument error
    pub fn invalid_argument<S: Into<String>>(message: S) -> Self {
        Self::InvalidArgument {
            message: message.into(),
        }
    }

    /// Create not ready error for the given state
    pub fn not_ready(state: ConnectionState) -> Self {
        Self::NotReady { state }
    }

    /// Whether the engine recovers from this error by itself through the reconnect loop
    pub fn is_recoverable(&self) -> bool {
        matches!(self, Self::Socket(_) | Self::Protocol(_))
    }
}

impl From<BackoffError> for TransportError {
    fn from(err: BackoffError) -> Self {
        Self::invalid_argument(err.to_string())
    }
}

/// Result type for transport operations
pub type TransportResult<T> = Result<T, TransportError>;
