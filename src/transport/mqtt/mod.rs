//! Reliable MQTT 3.1.1 connection for constrained devices
//!
//! This module separates pure decisions from I/O so most of the behavior can
//! be tested without a broker.
//!
//! # Architecture
//!
//! - [`backoff`] - Randomized exponential reconnection delays
//! - [`cache`] - Message-id allocation and the in-flight message caches
//! - [`connection`] - Pure connection state and parameter derivation
//! - [`message_handler`] - Session events and pure routing decisions
//! - [`health_monitor`] - Pure state transitions and poll-loop timing
//! - [`client`] - The connection engine that coordinates all of the above
//! - [`session`] - Blocking TCP/TLS session used in production
//!
//! # Usage
//!
//! ```rust,no_run
//! use device_link::config::DeviceConfig;
//! use device_link::transport::mqtt::{Connection, TcpSession};
//! use rumqttc::mqttbytes::QoS;
//! use std::path::Path;
//!
//! let config = DeviceConfig::load_from_file(Path::new("device.toml"))?;
//! let connection = Connection::builder(config, TcpSession::new())
//!     .refresh_credentials(|| Ok(()))
//!     .on_incoming(|message| println!("{}: {} bytes", message.topic, message.payload.len()))
//!     .build()?;
//!
//! connection.connect()?;
//! loop {
//!     if let Err(e) = connection.poll() {
//!         eprintln!("poll failed: {e}");
//!     }
//!     if connection.is_connected() {
//!         connection.publish("/devices/sensor-7/telemetry", b"21.5", QoS::AtLeastOnce)?;
//!     }
//! }
//! # Ok::<(), Box<dyn std::error::Error>>(())
//! ```

pub mod backoff;
pub mod cache;
pub mod client;
pub mod connection;
pub mod health_monitor;
pub mod message_handler;
pub mod session;

pub use backoff::{BackoffError, BackoffScheduler};
pub use cache::{CacheError, CachedMessage, MessageCache};
pub use client::{Connection, ConnectionBuilder};
pub use connection::{configure_connect_params, BrokerEndpoint, ConnectionState};
pub use health_monitor::{ConnectionEvent, DisconnectDecision, HealthMonitor};
pub use message_handler::{EventRoute, IncomingMessage, MessageHandler, SessionEvent};
pub use session::{build_client_config, TcpSession};
