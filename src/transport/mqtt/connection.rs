//! Pure connection state and session parameter handling
//!
//! This module contains the connection state enum and the pure function that
//! turns a [`DeviceConfig`] into the parameters a [`Session`](crate::transport::Session)
//! needs to open a broker connection.

use crate::config::DeviceConfig;
use crate::transport::ConnectParams;
use std::fmt;

/// Connection state of the engine
#[derive(Debug, Clone, Copy, PartialEq, Eq, Default)]
pub enum ConnectionState {
    /// No session, no reconnection attempts
    #[default]
    Disconnected,
    /// CONNECT sent, waiting for CONNACK
    Connecting,
    /// CONNACK received, traffic flows
    Connected,
    /// DISCONNECT sent, waiting for the link to close
    Disconnecting,
    /// Link lost unexpectedly, reconnection runs with backoff
    ConnectionError,
}

impl fmt::Display for ConnectionState {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        let name = match self {
            ConnectionState::Disconnected => "disconnected",
            ConnectionState::Connecting => "connecting",
            ConnectionState::Connected => "connected",
            ConnectionState::Disconnecting => "disconnecting",
            ConnectionState::ConnectionError => "connection_error",
        };
        f.write_str(name)
    }
}

/// Broker endpoint resolved from configuration
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct BrokerEndpoint {
    pub host: String,
    pub port: u16,
}

/// Pure function to derive session parameters from config
pub fn configure_connect_params(config: &DeviceConfig) -> (BrokerEndpoint, ConnectParams) {
    let endpoint = BrokerEndpoint {
        host: config.broker.hostname.clone(),
        port: config.broker.port,
    };

    let tls = if config.tls.enabled {
        Some(config.tls.clone())
    } else {
        None
    };

    let params = ConnectParams {
        hostname: config.broker.hostname.clone(),
        client_id: config.broker.client_id.clone(),
        clean_session: config.broker.clean_session,
        keep_alive: config.timeouts.keep_alive(),
        connect_timeout: config.timeouts.connection_timeout(),
        max_incoming_payload: config.limits.max_incoming_payload,
        tls,
    };

    (endpoint, params)
}
