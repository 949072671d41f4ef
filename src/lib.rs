//! Device Link - reliable MQTT transport for constrained devices
//!
//! A small, blocking MQTT 3.1.1 client layer for device SDKs that must keep a
//! broker session alive over unreliable networks.
//!
//! # Overview
//!
//! This crate provides:
//! - A connection engine with an explicit state machine and automatic reconnection
//! - Randomized exponential backoff between reconnection attempts
//! - QoS 1 and QoS 2 bookkeeping with retransmission and duplicate suppression
//! - A TCP/TLS session built on rustls and the rumqttc packet codec
//! - TOML configuration and structured logging through `tracing`
//!
//! The application drives everything by calling [`Connection::poll`] from one
//! thread; `publish` and `subscribe` may be called from any thread.
//!
//! # Quick Start
//!
//! ```rust
//! use device_link::testing::MockSession;
//! use device_link::transport::SessionEvent;
//! use device_link::{Connection, ConnectionState, DeviceConfig};
//! use rumqttc::mqttbytes::QoS;
//!
//! let session = MockSession::new();
//! let broker = session.handle();
//!
//! let connection = Connection::builder(DeviceConfig::local("sensor-7"), session)
//!     .refresh_credentials(|| Ok(()))
//!     .build()
//!     .unwrap();
//!
//! connection.connect().unwrap();
//! broker.push_event(SessionEvent::ConnAck { session_present: false });
//! connection.poll().unwrap();
//! assert_eq!(connection.state(), ConnectionState::Connected);
//!
//! let id = connection
//!     .publish("/devices/sensor-7/telemetry", b"21.5", QoS::AtLeastOnce)
//!     .unwrap();
//! assert!(id.is_some());
//! assert!(connection.has_pending_outgoing());
//! ```

pub mod config;
pub mod error;
pub mod observability;
pub mod testing;
pub mod transport;

pub use config::{ConfigError, DeviceConfig};
pub use error::{BoxError, TransportError, TransportResult};
pub use transport::mqtt::{
    BackoffScheduler, Connection, ConnectionBuilder, ConnectionState, IncomingMessage,
    MessageCache, TcpSession,
};
pub use transport::{Clock, Session, SessionError, SystemClock};
