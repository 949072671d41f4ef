//! Connection engine behavior tests
//!
//! Every test drives a real [`Connection`] over the scripted [`MockSession`]
//! with a [`ManualClock`], so timing is deterministic and no broker is needed.

use bytes::Bytes;
use device_link::config::DeviceConfig;
use device_link::testing::{ManualClock, MockSession, MockSessionHandle, SentPacket};
use device_link::transport::mqtt::{CacheError, Connection, ConnectionState, IncomingMessage};
use device_link::transport::{Ack, SessionEvent};
use device_link::TransportError;
use parking_lot::Mutex;
use rumqttc::mqttbytes::v4::SubscribeReasonCode;
use rumqttc::mqttbytes::QoS;
use std::sync::{Arc, OnceLock};
use std::time::Duration;

type TestConnection = Connection<MockSession, Arc<ManualClock>>;

/// Callback invocations in the order they happened
#[derive(Debug, Clone, PartialEq)]
enum Observed {
    Connected(bool),
    Disconnected,
    Delivered(u16),
    Subscribed(u16, SubscribeReasonCode),
    Incoming(IncomingMessage),
}

struct Harness {
    connection: TestConnection,
    broker: MockSessionHandle,
    clock: Arc<ManualClock>,
    observed: Arc<Mutex<Vec<Observed>>>,
}

impl Harness {
    fn new() -> Self {
        Self::with_config(DeviceConfig::local("engine-test"))
    }

    fn with_config(config: DeviceConfig) -> Self {
        let session = MockSession::new();
        let broker = session.handle();
        let clock = Arc::new(ManualClock::new());
        let observed = Arc::new(Mutex::new(Vec::new()));

        let connected = observed.clone();
        let disconnected = observed.clone();
        let delivered = observed.clone();
        let subscribed = observed.clone();
        let incoming = observed.clone();

        let connection = Connection::builder(config, session)
            .with_clock(clock.clone())
            .refresh_credentials(|| Ok(()))
            .on_connected(move |present| connected.lock().push(Observed::Connected(present)))
            .on_disconnected(move || disconnected.lock().push(Observed::Disconnected))
            .on_delivered(move |id| delivered.lock().push(Observed::Delivered(id)))
            .on_subscribed(move |id, code| subscribed.lock().push(Observed::Subscribed(id, code)))
            .on_incoming(move |message| incoming.lock().push(Observed::Incoming(message)))
            .build()
            .unwrap();

        Self {
            connection,
            broker,
            clock,
            observed,
        }
    }

    /// Harness already past CONNACK with an empty history
    fn connected() -> Self {
        let harness = Self::new();
        harness.establish(false);
        harness
    }

    fn establish(&self, session_present: bool) {
        self.connection.connect().unwrap();
        self.broker
            .push_event(SessionEvent::ConnAck { session_present });
        self.connection.poll().unwrap();
        assert_eq!(self.connection.state(), ConnectionState::Connected);
        self.observed.lock().clear();
        self.broker.clear_history();
    }

    fn deliver(&self, event: SessionEvent) {
        self.broker.push_event(event);
        self.connection.poll().unwrap();
    }

    fn observed(&self) -> Vec<Observed> {
        self.observed.lock().clone()
    }

    fn delivered_count(&self, id: u16) -> usize {
        self.observed()
            .iter()
            .filter(|o| **o == Observed::Delivered(id))
            .count()
    }

    fn incoming_count(&self) -> usize {
        self.observed()
            .iter()
            .filter(|o| matches!(o, Observed::Incoming(_)))
            .count()
    }
}

fn incoming_publish(id: u16, qos: QoS, payload: &'static [u8]) -> SessionEvent {
    SessionEvent::PublishReceived {
        id,
        qos,
        topic: "/devices/engine-test/commands".to_string(),
        payload: Bytes::from_static(payload),
    }
}

// ---------------------------------------------------------------------------
// Connection lifecycle
// ---------------------------------------------------------------------------

#[test]
fn test_connack_moves_to_connected_and_notifies() {
    // Arrange
    let harness = Harness::new();

    // Act
    harness.connection.connect().unwrap();
    assert_eq!(harness.connection.state(), ConnectionState::Connecting);
    harness.deliver(SessionEvent::ConnAck {
        session_present: true,
    });

    // Assert
    assert!(harness.connection.is_connected());
    assert_eq!(harness.observed(), vec![Observed::Connected(true)]);
    assert_eq!(
        harness.broker.sent(),
        vec![SentPacket::Connect {
            client_id: "engine-test".to_string(),
            clean_session: true,
        }]
    );
}

#[test]
fn test_connect_rejected_while_connecting_or_connected() {
    let harness = Harness::new();
    harness.connection.connect().unwrap();

    let result = harness.connection.connect();
    assert!(matches!(
        result,
        Err(TransportError::NotReady {
            state: ConnectionState::Connecting
        })
    ));

    harness.deliver(SessionEvent::ConnAck {
        session_present: false,
    });
    let result = harness.connection.connect();
    assert!(matches!(
        result,
        Err(TransportError::NotReady {
            state: ConnectionState::Connected
        })
    ));
    assert_eq!(harness.broker.connect_count(), 1);
}

#[test]
fn test_disconnect_rejected_when_already_disconnected() {
    let harness = Harness::new();

    let result = harness.connection.disconnect();

    assert!(matches!(
        result,
        Err(TransportError::NotReady {
            state: ConnectionState::Disconnected
        })
    ));
    assert!(harness.broker.sent().is_empty());
}

#[test]
fn test_graceful_disconnect_waits_for_link_close() {
    // Arrange
    let harness = Harness::connected();

    // Act
    harness.connection.disconnect().unwrap();

    // Assert: DISCONNECT sent, still waiting for the link to close
    assert_eq!(harness.connection.state(), ConnectionState::Disconnecting);
    assert_eq!(harness.broker.sent(), vec![SentPacket::Disconnect]);

    // Traffic other than link closure is ignored while disconnecting
    harness.broker.push_event(incoming_publish(1, QoS::AtLeastOnce, b"late"));
    harness.deliver(SessionEvent::Disconnected);

    assert_eq!(harness.connection.state(), ConnectionState::Disconnected);
    assert_eq!(harness.observed(), vec![Observed::Disconnected]);
    assert!(harness.broker.acks().is_empty());
}

#[test]
fn test_disconnect_from_connection_error_is_immediate() {
    // Arrange: lose the link so the engine sits in ConnectionError
    let harness = Harness::connected();
    harness.deliver(SessionEvent::Disconnected);
    assert_eq!(harness.connection.state(), ConnectionState::ConnectionError);
    harness.broker.clear_history();

    // Act
    harness.connection.disconnect().unwrap();

    // Assert: no packet sent, and no reconnection afterwards
    assert_eq!(harness.connection.state(), ConnectionState::Disconnected);
    assert!(harness.broker.sent().is_empty());

    harness.clock.advance(Duration::from_secs(120));
    harness.connection.poll().unwrap();
    assert_eq!(harness.connection.state(), ConnectionState::Disconnected);
    assert_eq!(harness.broker.connect_count(), 1);
}

#[test]
fn test_connecting_ignores_everything_but_connack() {
    let harness = Harness::new();
    harness.connection.connect().unwrap();

    harness.deliver(incoming_publish(5, QoS::AtLeastOnce, b"early"));

    assert_eq!(harness.connection.state(), ConnectionState::Connecting);
    assert_eq!(harness.incoming_count(), 0);
    assert!(harness.broker.acks().is_empty());
}

#[test]
fn test_link_loss_while_connecting_is_a_connection_error() {
    let harness = Harness::new();
    harness.connection.connect().unwrap();

    harness.deliver(SessionEvent::Disconnected);

    assert_eq!(harness.connection.state(), ConnectionState::ConnectionError);
    assert_eq!(harness.observed(), vec![Observed::Disconnected]);
}

#[test]
fn test_connect_timeout_then_reconnect() {
    // Arrange
    let harness = Harness::new();
    harness.connection.connect().unwrap();

    // Act: no CONNACK within the 5s connection timeout
    harness.clock.advance(Duration::from_millis(5_001));
    harness.connection.poll().unwrap();

    // Assert
    assert_eq!(harness.connection.state(), ConnectionState::ConnectionError);
    assert_eq!(harness.broker.abort_count(), 1);

    // The first automatic attempt is not delayed
    harness.connection.poll().unwrap();
    assert_eq!(harness.connection.state(), ConnectionState::Connecting);
    assert_eq!(harness.broker.connect_count(), 2);
}

#[test]
fn test_poll_while_disconnected_does_nothing() {
    let harness = Harness::new();

    harness.clock.advance(Duration::from_secs(600));
    harness.connection.poll().unwrap();

    assert_eq!(harness.connection.state(), ConnectionState::Disconnected);
    assert_eq!(harness.broker.connect_count(), 0);
    assert!(harness.observed().is_empty());
}

#[test]
fn test_clean_session_drops_pending_messages() {
    let harness = Harness::new();
    harness.connection.connect().unwrap();
    harness
        .connection
        .publish("/telemetry", b"1", QoS::AtLeastOnce)
        .unwrap();
    assert!(harness.connection.has_pending_outgoing());

    harness.deliver(SessionEvent::ConnAck {
        session_present: false,
    });

    assert!(!harness.connection.has_pending_outgoing());
}

#[test]
fn test_resumed_session_keeps_pending_messages() {
    let harness = Harness::new();
    harness.connection.connect().unwrap();
    let id = harness
        .connection
        .publish("/telemetry", b"1", QoS::AtLeastOnce)
        .unwrap()
        .unwrap();

    harness.deliver(SessionEvent::ConnAck {
        session_present: true,
    });

    assert_eq!(harness.connection.pending_outgoing_ids(), vec![id]);
}

// ---------------------------------------------------------------------------
// Reconnection with backoff
// ---------------------------------------------------------------------------

#[test]
fn test_reconnection_waits_for_backoff() {
    // Arrange: initial backoff 1s, cutoff 60s
    let harness = Harness::connected();

    // Act: link drops, first retry is immediate
    harness.deliver(SessionEvent::Disconnected);
    assert_eq!(harness.connection.state(), ConnectionState::ConnectionError);
    harness.connection.poll().unwrap();
    assert_eq!(harness.broker.connect_count(), 2);

    // The retry fails, the next one waits for the first delay (at most 2s)
    harness.deliver(SessionEvent::Disconnected);
    harness.clock.advance(Duration::from_millis(2_001));
    harness.connection.poll().unwrap();
    assert_eq!(harness.broker.connect_count(), 3);

    // Second delay is between 1s and 3s
    harness.deliver(SessionEvent::Disconnected);
    harness.connection.poll().unwrap();
    harness.clock.advance(Duration::from_millis(999));
    harness.connection.poll().unwrap();
    assert_eq!(harness.broker.connect_count(), 3);
    assert_eq!(harness.connection.state(), ConnectionState::ConnectionError);

    harness.clock.advance(Duration::from_millis(2_002));
    harness.connection.poll().unwrap();

    // Assert
    assert_eq!(harness.broker.connect_count(), 4);
    assert_eq!(harness.connection.state(), ConnectionState::Connecting);
}

#[test]
fn test_failed_reconnect_attempt_does_not_fail_poll() {
    let harness = Harness::connected();
    harness.deliver(SessionEvent::Disconnected);
    harness.broker.fail_connect(true);

    let result = harness.connection.poll();

    assert!(result.is_ok());
    assert_eq!(harness.connection.state(), ConnectionState::ConnectionError);
}

#[test]
fn test_socket_poll_failure_enters_connection_error() {
    // Arrange
    let harness = Harness::connected();
    harness.broker.fail_poll(true);

    // Act
    let result = harness.connection.poll();

    // Assert
    assert!(matches!(result, Err(TransportError::Socket(_))));
    assert!(result.unwrap_err().is_recoverable());
    assert_eq!(harness.connection.state(), ConnectionState::ConnectionError);
    assert_eq!(harness.broker.abort_count(), 1);
    assert_eq!(harness.observed(), vec![Observed::Disconnected]);

    // Recovery happens on a later poll
    harness.broker.fail_poll(false);
    harness.connection.poll().unwrap();
    assert_eq!(harness.broker.connect_count(), 2);
}

#[test]
fn test_malformed_input_enters_connection_error() {
    let harness = Harness::connected();
    harness.broker.fail_next_input();

    let result = harness.connection.poll();

    assert!(matches!(result, Err(TransportError::Protocol(_))));
    assert_eq!(harness.connection.state(), ConnectionState::ConnectionError);
}

// ---------------------------------------------------------------------------
// Outgoing QoS flows
// ---------------------------------------------------------------------------

#[test]
fn test_qos1_retransmits_with_dup_until_acknowledged() {
    // Arrange
    let harness = Harness::connected();
    let id = harness
        .connection
        .publish("/devices/engine-test/telemetry", b"21.5", QoS::AtLeastOnce)
        .unwrap()
        .unwrap();

    // Act: no PUBACK within the keep-alive period
    harness.clock.advance(Duration::from_secs(31));
    harness.connection.poll().unwrap();

    // Assert: original plus one duplicate, same id and payload
    let published = harness.broker.published();
    assert_eq!(published.len(), 2);
    assert!(!published[0].dup);
    assert!(published[1].dup);
    assert_eq!(published[1].id, id);
    assert_eq!(published[1].payload, b"21.5");

    // PUBACK completes the exchange exactly once
    harness.deliver(SessionEvent::PubAck(id));
    harness.deliver(SessionEvent::PubAck(id));
    assert_eq!(harness.delivered_count(id), 1);
    assert!(!harness.connection.has_pending_outgoing());
}

#[test]
fn test_qos1_not_retransmitted_before_expiry() {
    let harness = Harness::connected();
    harness
        .connection
        .publish("/telemetry", b"1", QoS::AtLeastOnce)
        .unwrap();

    harness.clock.advance(Duration::from_secs(29));
    harness.connection.poll().unwrap();

    assert_eq!(harness.broker.published().len(), 1);
}

#[test]
fn test_qos2_outgoing_handshake() {
    // Arrange
    let harness = Harness::connected();
    let id = harness
        .connection
        .publish("/telemetry", b"1", QoS::ExactlyOnce)
        .unwrap()
        .unwrap();

    // Act: PUBREC
    harness.deliver(SessionEvent::PubRec(id));

    // Assert: PUBREL sent, exchange still pending
    assert_eq!(harness.broker.acks(), vec![Ack::PubRel(id)]);
    assert_eq!(harness.connection.pending_outgoing_ids(), vec![id]);
    assert_eq!(harness.delivered_count(id), 0);

    // PUBCOMP completes it
    harness.deliver(SessionEvent::PubComp(id));
    assert_eq!(harness.delivered_count(id), 1);
    assert!(harness.connection.pending_outgoing_ids().is_empty());
}

#[test]
fn test_publish_while_link_down_stays_cached() {
    let harness = Harness::connected();
    harness.broker.fail_send(true);

    let id = harness
        .connection
        .publish("/telemetry", b"1", QoS::AtLeastOnce)
        .unwrap()
        .unwrap();

    assert_eq!(harness.connection.pending_outgoing_ids(), vec![id]);
}

#[test]
fn test_message_ids_are_distinct_while_pending() {
    let harness = Harness::connected();

    let mut ids: Vec<u16> = (0..50)
        .map(|_| {
            harness
                .connection
                .publish("/telemetry", b"1", QoS::AtLeastOnce)
                .unwrap()
                .unwrap()
        })
        .collect();
    let sub_id = harness
        .connection
        .subscribe("/commands", QoS::AtLeastOnce)
        .unwrap();
    ids.push(sub_id);

    ids.sort_unstable();
    ids.dedup();
    assert_eq!(ids.len(), 51);
    assert!(!ids.contains(&0));
}

#[test]
fn test_identifier_exhaustion_is_reported() {
    let harness = Harness::connected();
    for _ in 0..u16::MAX {
        harness
            .connection
            .publish("/t", b"", QoS::AtLeastOnce)
            .unwrap();
    }

    let result = harness.connection.publish("/t", b"", QoS::AtLeastOnce);

    assert!(matches!(
        result,
        Err(TransportError::Cache(CacheError::IdentifiersExhausted))
    ));

    harness.connection.clear_all_pending();
    assert!(harness
        .connection
        .publish("/t", b"", QoS::AtLeastOnce)
        .is_ok());
}

// ---------------------------------------------------------------------------
// Subscriptions
// ---------------------------------------------------------------------------

#[test]
fn test_subscribe_and_suback() {
    // Arrange
    let harness = Harness::connected();

    // Act
    let id = harness
        .connection
        .subscribe("/devices/engine-test/commands", QoS::ExactlyOnce)
        .unwrap();
    harness.deliver(SessionEvent::SubAck {
        id,
        return_code: SubscribeReasonCode::Success(QoS::AtLeastOnce),
    });

    // Assert: granted QoS is reported, duplicate SUBACK is ignored
    harness.deliver(SessionEvent::SubAck {
        id,
        return_code: SubscribeReasonCode::Success(QoS::AtLeastOnce),
    });
    assert_eq!(
        harness.observed(),
        vec![Observed::Subscribed(
            id,
            SubscribeReasonCode::Success(QoS::AtLeastOnce)
        )]
    );
    assert_eq!(
        harness.broker.subscriptions(),
        vec![(id, "/devices/engine-test/commands".to_string())]
    );
}

#[test]
fn test_rejected_subscription_is_reported() {
    let harness = Harness::connected();
    let id = harness
        .connection
        .subscribe("/forbidden", QoS::AtLeastOnce)
        .unwrap();

    harness.deliver(SessionEvent::SubAck {
        id,
        return_code: SubscribeReasonCode::Failure,
    });

    // A repeated rejection for the same id is not reported again
    harness.deliver(SessionEvent::SubAck {
        id,
        return_code: SubscribeReasonCode::Failure,
    });

    assert_eq!(
        harness.observed(),
        vec![Observed::Subscribed(id, SubscribeReasonCode::Failure)]
    );
    assert!(!harness.connection.has_pending_outgoing());
    assert_eq!(harness.connection.state(), ConnectionState::Connected);
}

#[test]
fn test_unacknowledged_subscription_is_resent() {
    let harness = Harness::connected();
    let id = harness
        .connection
        .subscribe("/commands", QoS::AtLeastOnce)
        .unwrap();

    harness.clock.advance(Duration::from_secs(31));
    harness.connection.poll().unwrap();

    assert_eq!(
        harness.broker.subscriptions(),
        vec![(id, "/commands".to_string()), (id, "/commands".to_string())]
    );
}

// ---------------------------------------------------------------------------
// Incoming QoS flows
// ---------------------------------------------------------------------------

#[test]
fn test_incoming_qos0_is_delivered_without_ack() {
    let harness = Harness::connected();

    harness.deliver(incoming_publish(0, QoS::AtMostOnce, b"ping"));

    assert_eq!(harness.incoming_count(), 1);
    assert!(harness.broker.acks().is_empty());
}

#[test]
fn test_incoming_qos1_is_acknowledged_and_delivered() {
    let harness = Harness::connected();

    harness.deliver(incoming_publish(9, QoS::AtLeastOnce, b"reboot"));

    assert_eq!(harness.broker.acks(), vec![Ack::PubAck(9)]);
    assert_eq!(
        harness.observed(),
        vec![Observed::Incoming(IncomingMessage {
            topic: "/devices/engine-test/commands".to_string(),
            payload: Bytes::from_static(b"reboot"),
            qos: QoS::AtLeastOnce,
        })]
    );
}

#[test]
fn test_incoming_qos2_duplicates_are_suppressed() {
    // Arrange
    let harness = Harness::connected();

    // Act: the broker sends the same QoS 2 publish twice before PUBREL
    harness.deliver(incoming_publish(7, QoS::ExactlyOnce, b"open-valve"));
    harness.deliver(incoming_publish(7, QoS::ExactlyOnce, b"open-valve"));

    // Assert: delivered once, PUBREC sent both times
    assert_eq!(harness.incoming_count(), 1);
    assert_eq!(harness.broker.acks(), vec![Ack::PubRec(7), Ack::PubRec(7)]);
    assert_eq!(harness.connection.pending_incoming_ids(), vec![7]);

    // PUBREL releases the id
    harness.deliver(SessionEvent::PubRel(7));
    assert_eq!(harness.broker.acks().last(), Some(&Ack::PubComp(7)));
    assert!(harness.connection.pending_incoming_ids().is_empty());

    // A later publish reusing the id is a new message
    harness.deliver(incoming_publish(7, QoS::ExactlyOnce, b"close-valve"));
    assert_eq!(harness.incoming_count(), 2);
}

#[test]
fn test_pubrec_is_resent_until_pubrel() {
    let harness = Harness::connected();
    harness.deliver(incoming_publish(3, QoS::ExactlyOnce, b"x"));

    harness.clock.advance(Duration::from_secs(31));
    harness.connection.poll().unwrap();

    assert_eq!(harness.broker.acks(), vec![Ack::PubRec(3), Ack::PubRec(3)]);
}

#[test]
fn test_pubrel_for_unknown_id_still_completes() {
    let harness = Harness::connected();

    harness.deliver(SessionEvent::PubRel(44));

    assert_eq!(harness.broker.acks(), vec![Ack::PubComp(44)]);
}

#[test]
fn test_oversized_incoming_payload_is_acked_but_dropped() {
    let mut config = DeviceConfig::local("engine-test");
    config.limits.max_incoming_payload = 4;
    let harness = Harness::with_config(config);
    harness.establish(false);

    harness.deliver(incoming_publish(2, QoS::AtLeastOnce, b"0123456789"));

    assert_eq!(harness.broker.acks(), vec![Ack::PubAck(2)]);
    assert_eq!(harness.incoming_count(), 0);
}

#[test]
fn test_incoming_without_handler_is_dropped() {
    let session = MockSession::new();
    let broker = session.handle();
    let connection = Connection::builder(DeviceConfig::local("no-handler"), session)
        .refresh_credentials(|| Ok(()))
        .build()
        .unwrap();
    connection.connect().unwrap();
    broker.push_event(SessionEvent::ConnAck {
        session_present: false,
    });
    connection.poll().unwrap();

    broker.push_event(incoming_publish(1, QoS::AtLeastOnce, b"x"));
    connection.poll().unwrap();

    assert_eq!(broker.acks(), vec![Ack::PubAck(1)]);
}

// ---------------------------------------------------------------------------
// Keep-alive
// ---------------------------------------------------------------------------

#[test]
fn test_ping_sent_when_due() {
    let harness = Harness::connected();
    harness.broker.set_ping_due();

    harness.connection.poll().unwrap();
    harness.deliver(SessionEvent::PingResp);

    assert_eq!(harness.broker.sent(), vec![SentPacket::PingReq]);
    assert_eq!(harness.connection.state(), ConnectionState::Connected);
}

#[test]
fn test_socket_wait_bounded_by_keepalive() {
    // Arrange
    let harness = Harness::connected();

    // Act: next PINGREQ is due sooner than the 200ms poll timeout
    harness
        .broker
        .set_keepalive_left(Some(Duration::from_millis(50)));
    harness.connection.poll().unwrap();

    // Assert
    assert_eq!(
        harness.broker.last_wait_timeout(),
        Some(Duration::from_millis(50))
    );

    // Without keep-alive the poll timeout applies
    harness.broker.set_keepalive_left(None);
    harness.connection.poll().unwrap();
    assert_eq!(
        harness.broker.last_wait_timeout(),
        Some(Duration::from_millis(200))
    );
}

// ---------------------------------------------------------------------------
// Callbacks
// ---------------------------------------------------------------------------

#[test]
fn test_callbacks_may_call_back_into_the_connection() {
    // Arrange: echo every incoming message from inside the callback
    let slot: Arc<OnceLock<Arc<TestConnection>>> = Arc::new(OnceLock::new());
    let echo = slot.clone();
    let session = MockSession::new();
    let broker = session.handle();
    let clock = Arc::new(ManualClock::new());

    let connection = Connection::builder(DeviceConfig::local("echo"), session)
        .with_clock(clock)
        .refresh_credentials(|| Ok(()))
        .on_incoming(move |message| {
            if let Some(connection) = echo.get() {
                assert!(connection.is_connected());
                connection
                    .publish("/echo", &message.payload, QoS::AtLeastOnce)
                    .unwrap();
            }
        })
        .build()
        .unwrap();
    let connection = Arc::new(connection);
    assert!(slot.set(connection.clone()).is_ok());

    connection.connect().unwrap();
    broker.push_event(SessionEvent::ConnAck {
        session_present: false,
    });
    connection.poll().unwrap();

    // Act
    broker.push_event(incoming_publish(1, QoS::AtMostOnce, b"hello"));
    connection.poll().unwrap();

    // Assert
    let published = broker.published();
    assert_eq!(published.len(), 1);
    assert_eq!(published[0].topic, "/echo");
    assert_eq!(published[0].payload, b"hello");
    assert!(connection.has_pending_outgoing());
}

#[test]
fn test_publish_from_another_thread_while_polling() {
    let harness = Arc::new(Harness::connected());

    let publisher = {
        let harness = harness.clone();
        std::thread::spawn(move || {
            for _ in 0..20 {
                harness
                    .connection
                    .publish("/telemetry", b"1", QoS::AtLeastOnce)
                    .unwrap();
            }
        })
    };
    for _ in 0..20 {
        harness.connection.poll().unwrap();
    }
    publisher.join().unwrap();

    assert_eq!(harness.connection.pending_outgoing_ids().len(), 20);
}
