//! Transport layer for device-to-broker communication
//!
//! This module defines the [`Session`] seam between the connection engine and
//! the wire: address resolution, MQTT packet primitives, keep-alive and input
//! processing. [`mqtt::TcpSession`] is the production implementation, tests use
//! [`crate::testing::MockSession`].

use crate::config::TlsSection;
use rumqttc::mqttbytes::QoS;
use std::io;
use std::net::SocketAddr;
use std::sync::Arc;
use std::time::{Duration, Instant};
use thiserror::Error;

pub mod mqtt;

pub use mqtt::SessionEvent;

/// Errors reported by a session implementation
#[derive(Debug, Error)]
pub enum SessionError {
    #[error("I/O error: {0}")]
    Io(#[from] io::Error),

    #[error("Packet codec error: {0}")]
    Codec(#[from] rumqttc::mqttbytes::Error),

    #[error("TLS error: {0}")]
    Tls(String),

    #[error("No address found for {0}")]
    NoAddress(String),

    #[error("Connection refused by broker: {0}")]
    ConnectionRefused(String),

    #[error("Not connected")]
    NotConnected,
}

/// Parameters used to open a broker session
#[derive(Debug, Clone, PartialEq)]
pub struct ConnectParams {
    /// Broker hostname, also the default TLS server name
    pub hostname: String,
    pub client_id: String,
    pub clean_session: bool,
    pub keep_alive: Duration,
    pub connect_timeout: Duration,
    /// Largest incoming payload delivered to the application
    pub max_incoming_payload: usize,
    /// TLS settings, `None` for plain TCP
    pub tls: Option<TlsSection>,
}

/// Acknowledgement packets sent by the engine
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum Ack {
    PubAck(u16),
    PubRec(u16),
    PubRel(u16),
    PubComp(u16),
}

impl Ack {
    pub fn message_id(&self) -> u16 {
        match *self {
            Ack::PubAck(id) | Ack::PubRec(id) | Ack::PubRel(id) | Ack::PubComp(id) => id,
        }
    }
}

/// Blocking readability probe usable without holding the connection lock
pub trait Readiness: Send + Sync {
    /// Wait up to `timeout` for input, `Ok(true)` when data or EOF is pending
    fn wait_readable(&self, timeout: Duration) -> io::Result<bool>;
}

/// MQTT session primitives consumed by the connection engine
///
/// Every method is called with the connection lock held, except that the
/// handle returned by [`Session::readiness`] is used after the lock is released.
pub trait Session: Send {
    /// Resolve the broker address
    fn resolve(&mut self, host: &str, port: u16) -> Result<SocketAddr, SessionError>;

    /// Open the transport and send CONNECT, CONNACK arrives later as an event
    fn connect(&mut self, params: &ConnectParams, addr: SocketAddr) -> Result<(), SessionError>;

    /// Send DISCONNECT, the peer closing the link yields [`SessionEvent::Disconnected`]
    fn disconnect(&mut self) -> Result<(), SessionError>;

    /// Drop the transport without any protocol exchange
    fn abort(&mut self);

    fn publish(
        &mut self,
        id: u16,
        topic: &str,
        payload: &[u8],
        qos: QoS,
        dup: bool,
    ) -> Result<(), SessionError>;

    fn subscribe(&mut self, id: u16, topic: &str, max_qos: QoS) -> Result<(), SessionError>;

    fn acknowledge(&mut self, ack: Ack) -> Result<(), SessionError>;

    /// Send PINGREQ when the keep-alive interval elapsed, returns whether one was sent
    fn ping_if_due(&mut self, now: Instant) -> Result<bool, SessionError>;

    /// Time until the next PINGREQ is due, `None` when keep-alive is disabled
    fn keepalive_time_left(&self, now: Instant) -> Option<Duration>;

    /// Readability probe for the current transport, `None` when nothing is open
    fn readiness(&self) -> Option<Arc<dyn Readiness>>;

    /// Consume pending input and append the decoded events
    fn process_input(&mut self, events: &mut Vec<SessionEvent>) -> Result<(), SessionError>;
}

/// Monotonic time source
pub trait Clock: Send + Sync {
    fn now(&self) -> Instant;
}

/// Wall clock backed by [`Instant::now`]
#[derive(Debug, Clone, Copy, Default)]
pub struct SystemClock;

impl Clock for SystemClock {
    fn now(&self) -> Instant {
        Instant::now()
    }
}

impl<C: Clock + ?Sized> Clock for Arc<C> {
    fn now(&self) -> Instant {
        (**self).now()
    }
}
