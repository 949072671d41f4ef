//! Pure state transition and timing decisions for the connection engine
//!
//! Every decision the engine takes about its state lives here as a pure
//! function so the transition table can be tested without a session.

use super::connection::ConnectionState;
use std::time::{Duration, Instant};
use tracing::{error, info, warn};

/// Pure connection health and transition logic
pub struct HealthMonitor;

/// Events that drive state transitions
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum ConnectionEvent {
    /// CONNECT request was sent
    ConnectRequested,
    /// CONNACK received from broker
    ConnAckReceived,
    /// Link closed by the peer or locally
    LinkClosed,
    /// Application asked for a disconnect
    DisconnectRequested,
    /// No CONNACK before the connect deadline
    ConnectTimedOut,
    /// Socket or protocol failure during poll
    TransportFailed,
}

/// Outcome of a disconnect request for a given state
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum DisconnectDecision {
    /// Nothing live to tear down, go straight to `Disconnected`
    Immediate,
    /// Send DISCONNECT and wait for the link to close
    SendRequest,
    /// Not allowed in this state
    Reject,
}

impl HealthMonitor {
    /// Determine next state after a connection event (pure function)
    pub fn determine_next_state(
        current: ConnectionState,
        event: ConnectionEvent,
    ) -> ConnectionState {
        use ConnectionState::*;

        match (current, event) {
            (_, ConnectionEvent::ConnectRequested) => Connecting,
            (Connecting, ConnectionEvent::ConnAckReceived) => Connected,
            (Connecting | Connected, ConnectionEvent::LinkClosed) => ConnectionError,
            (Disconnecting, ConnectionEvent::LinkClosed) => Disconnected,
            (Connecting | Connected, ConnectionEvent::DisconnectRequested) => Disconnecting,
            (ConnectionError, ConnectionEvent::DisconnectRequested) => Disconnected,
            (_, ConnectionEvent::ConnectTimedOut | ConnectionEvent::TransportFailed) => {
                ConnectionError
            }
            (state, _) => state,
        }
    }

    /// Check if a connect request is allowed (pure function)
    pub fn can_connect(state: ConnectionState) -> bool {
        matches!(
            state,
            ConnectionState::Disconnected | ConnectionState::ConnectionError
        )
    }

    /// Decide how to handle a disconnect request (pure function)
    pub fn disconnect_decision(state: ConnectionState) -> DisconnectDecision {
        match state {
            ConnectionState::ConnectionError => DisconnectDecision::Immediate,
            ConnectionState::Connecting | ConnectionState::Connected => {
                DisconnectDecision::SendRequest
            }
            ConnectionState::Disconnected | ConnectionState::Disconnecting => {
                DisconnectDecision::Reject
            }
        }
    }

    /// Check if the connect phase ran past its deadline (pure function)
    pub fn connect_timed_out(state: ConnectionState, deadline: Option<Instant>, now: Instant) -> bool {
        state == ConnectionState::Connecting && deadline.is_some_and(|deadline| now >= deadline)
    }

    /// Check if a reconnection attempt is due (pure function)
    pub fn reconnect_due(state: ConnectionState, eligible_at: Instant, now: Instant) -> bool {
        state == ConnectionState::ConnectionError && now >= eligible_at
    }

    /// Check if the socket should be serviced in this state (pure function)
    pub fn should_service_socket(state: ConnectionState) -> bool {
        !matches!(
            state,
            ConnectionState::Disconnected | ConnectionState::ConnectionError
        )
    }

    /// Socket wait bounded by the poll interval and the next keep-alive (pure function)
    pub fn socket_wait_timeout(poll_timeout: Duration, keepalive_left: Option<Duration>) -> Duration {
        match keepalive_left {
            Some(left) => poll_timeout.min(left),
            None => poll_timeout,
        }
    }

    /// Log connection state transition (pure logging function)
    pub fn log_state_transition(from: ConnectionState, to: ConnectionState) {
        use ConnectionState::*;

        if from == to {
            return;
        }
        match (from, to) {
            (Connecting, Connected) => info!("MQTT connection established"),
            (Connected, ConnectionError) => warn!("MQTT connection lost"),
            (Connecting, ConnectionError) => error!("MQTT connection attempt failed"),
            (Disconnecting, Disconnected) => info!("MQTT client disconnected"),
            _ => info!(from = %from, to = %to, "MQTT connection state changed"),
        }
    }
}
