//! Session events and pure routing decisions
//!
//! The session decodes broker traffic into [`SessionEvent`]s. Before the engine
//! acts on one, [`MessageHandler::route_session_event`] decides whether the
//! current connection state allows handling it at all.

use super::connection::ConnectionState;
use bytes::Bytes;
use rumqttc::mqttbytes::v4::SubscribeReasonCode;
use rumqttc::mqttbytes::QoS;
use tracing::debug;

/// Protocol events produced by a session while processing input
#[derive(Debug, Clone, PartialEq)]
pub enum SessionEvent {
    /// CONNACK accepted, `session_present` is true when the broker resumed a session
    ConnAck { session_present: bool },
    /// The link closed, either by the peer or after a local DISCONNECT
    Disconnected,
    /// Incoming PUBLISH
    PublishReceived {
        id: u16,
        qos: QoS,
        topic: String,
        payload: Bytes,
    },
    PubAck(u16),
    PubRec(u16),
    PubRel(u16),
    PubComp(u16),
    SubAck {
        id: u16,
        return_code: SubscribeReasonCode,
    },
    PingResp,
}

/// Message delivered to the application
#[derive(Debug, Clone, PartialEq)]
pub struct IncomingMessage {
    pub topic: String,
    pub payload: Bytes,
    pub qos: QoS,
}

/// Routing decision for a session event
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum EventRoute {
    /// Handle the event
    Handle,
    /// Drop the event, it is meaningless in the current state
    Ignore,
}

/// Pure routing decisions for session events
pub struct MessageHandler;

impl MessageHandler {
    /// Decide whether an event is handled in the given state (pure function)
    ///
    /// While connecting only CONNACK and link closure matter, while
    /// disconnecting only link closure does.
    pub fn route_session_event(state: ConnectionState, event: &SessionEvent) -> EventRoute {
        let allowed = match state {
            ConnectionState::Connecting => matches!(
                event,
                SessionEvent::ConnAck { .. } | SessionEvent::Disconnected
            ),
            ConnectionState::Disconnecting => matches!(event, SessionEvent::Disconnected),
            _ => true,
        };

        if allowed {
            EventRoute::Handle
        } else {
            debug!(
                state = %state,
                event = Self::event_name(event),
                "Ignoring event in current connection state"
            );
            EventRoute::Ignore
        }
    }

    /// Short name of an event for logging (pure function)
    pub fn event_name(event: &SessionEvent) -> &'static str {
        match event {
            SessionEvent::ConnAck { .. } => "connack",
            SessionEvent::Disconnected => "disconnected",
            SessionEvent::PublishReceived { .. } => "publish",
            SessionEvent::PubAck(_) => "puback",
            SessionEvent::PubRec(_) => "pubrec",
            SessionEvent::PubRel(_) => "pubrel",
            SessionEvent::PubComp(_) => "pubcomp",
            SessionEvent::SubAck { .. } => "suback",
            SessionEvent::PingResp => "pingresp",
        }
    }

    /// Check whether a SUBACK return code grants the subscription (pure function)
    pub fn subscription_granted(return_code: &SubscribeReasonCode) -> bool {
        matches!(return_code, SubscribeReasonCode::Success(_))
    }
}
