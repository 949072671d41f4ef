//! Connection engine: state machine, QoS bookkeeping and reconnection
//!
//! [`Connection`] owns one [`Session`] and drives it from [`Connection::poll`].
//! All state sits behind a single lock; the only blocking wait, the socket
//! readability probe, runs with the lock released so other threads can publish
//! or subscribe while the poll thread waits for the network.
//!
//! User callbacks other than the credential refresh run after the lock is
//! released, so they may call back into the connection.

use super::backoff::BackoffScheduler;
use super::cache::{CachedMessage, MessageCache};
use super::connection::{configure_connect_params, BrokerEndpoint, ConnectionState};
use super::health_monitor::{ConnectionEvent, DisconnectDecision, HealthMonitor};
use super::message_handler::{EventRoute, IncomingMessage, MessageHandler, SessionEvent};
use crate::config::DeviceConfig;
use crate::error::{BoxError, TransportError, TransportResult};
use crate::transport::{Ack, Clock, ConnectParams, Session, SessionError, SystemClock};
use bytes::Bytes;
use parking_lot::{Mutex, MutexGuard};
use rumqttc::mqttbytes::v4::SubscribeReasonCode;
use rumqttc::mqttbytes::QoS;
use std::time::{Duration, Instant};
use tracing::{debug, error, info, warn};

pub type ConnectedCallback = Box<dyn Fn(bool) + Send + Sync>;
pub type DisconnectedCallback = Box<dyn Fn() + Send + Sync>;
pub type DeliveredCallback = Box<dyn Fn(u16) + Send + Sync>;
pub type SubscribedCallback = Box<dyn Fn(u16, SubscribeReasonCode) + Send + Sync>;
pub type IncomingCallback = Box<dyn Fn(IncomingMessage) + Send + Sync>;
pub type CredentialRefreshCallback = Box<dyn Fn() -> Result<(), BoxError> + Send + Sync>;

#[derive(Default)]
struct Callbacks {
    on_connected: Option<ConnectedCallback>,
    on_disconnected: Option<DisconnectedCallback>,
    on_delivered: Option<DeliveredCallback>,
    on_subscribed: Option<SubscribedCallback>,
    on_incoming: Option<IncomingCallback>,
}

/// Callback invocation deferred until the lock is released
enum Notification {
    Connected { session_present: bool },
    Disconnected,
    Delivered(u16),
    Subscribed { id: u16, return_code: SubscribeReasonCode },
    Incoming(IncomingMessage),
}

struct Inner<S> {
    state: ConnectionState,
    /// CONNACK deadline, `None` outside the connect phase
    connect_deadline: Option<Instant>,
    /// Earliest instant for the next automatic reconnection
    reconnect_at: Instant,
    backoff: BackoffScheduler,
    outgoing: MessageCache,
    incoming: MessageCache,
    session: S,
}

/// Builder for [`Connection`]
pub struct ConnectionBuilder<S, C = SystemClock> {
    config: DeviceConfig,
    session: S,
    clock: C,
    callbacks: Callbacks,
    refresh_credentials: Option<CredentialRefreshCallback>,
}

impl<S: Session> ConnectionBuilder<S, SystemClock> {
    pub fn new(config: DeviceConfig, session: S) -> Self {
        Self {
            config,
            session,
            clock: SystemClock,
            callbacks: Callbacks::default(),
            refresh_credentials: None,
        }
    }
}

impl<S: Session, C: Clock> ConnectionBuilder<S, C> {
    /// Replace the time source
    pub fn with_clock<C2: Clock>(self, clock: C2) -> ConnectionBuilder<S, C2> {
        ConnectionBuilder {
            config: self.config,
            session: self.session,
            clock,
            callbacks: self.callbacks,
            refresh_credentials: self.refresh_credentials,
        }
    }

    /// Called with the session-present flag once CONNACK is received
    pub fn on_connected(mut self, callback: impl Fn(bool) + Send + Sync + 'static) -> Self {
        self.callbacks.on_connected = Some(Box::new(callback));
        self
    }

    /// Called whenever the link closes
    pub fn on_disconnected(mut self, callback: impl Fn() + Send + Sync + 'static) -> Self {
        self.callbacks.on_disconnected = Some(Box::new(callback));
        self
    }

    /// Called with the message id once a QoS 1 or QoS 2 publish is complete
    pub fn on_delivered(mut self, callback: impl Fn(u16) + Send + Sync + 'static) -> Self {
        self.callbacks.on_delivered = Some(Box::new(callback));
        self
    }

    /// Called with the message id and broker return code on SUBACK
    pub fn on_subscribed(
        mut self,
        callback: impl Fn(u16, SubscribeReasonCode) + Send + Sync + 'static,
    ) -> Self {
        self.callbacks.on_subscribed = Some(Box::new(callback));
        self
    }

    /// Called once per incoming application message
    pub fn on_incoming(
        mut self,
        callback: impl Fn(IncomingMessage) + Send + Sync + 'static,
    ) -> Self {
        self.callbacks.on_incoming = Some(Box::new(callback));
        self
    }

    /// Mandatory hook run before every connection attempt, with the lock held
    pub fn refresh_credentials(
        mut self,
        callback: impl Fn() -> Result<(), BoxError> + Send + Sync + 'static,
    ) -> Self {
        self.refresh_credentials = Some(Box::new(callback));
        self
    }

    /// Validate the configuration and create a disconnected connection
    pub fn build(self) -> TransportResult<Connection<S, C>> {
        let refresh_credentials = self
            .refresh_credentials
            .ok_or(TransportError::MissingCallback("refresh_credentials"))?;

        let backoff = BackoffScheduler::new(self.config.backoff.initial_ms, self.config.backoff.max_ms)?;
        self.config.validate()?;

        let (endpoint, params) = configure_connect_params(&self.config);
        let keep_alive = params.keep_alive;

        let inner = Inner {
            state: ConnectionState::Disconnected,
            connect_deadline: None,
            reconnect_at: self.clock.now(),
            backoff,
            outgoing: MessageCache::new(keep_alive),
            incoming: MessageCache::new(keep_alive),
            session: self.session,
        };

        debug!(
            client_id = %params.client_id,
            host = %endpoint.host,
            port = endpoint.port,
            "Connection initialized"
        );

        Ok(Connection {
            inner: Mutex::new(inner),
            endpoint,
            params,
            poll_timeout: self.config.timeouts.poll_timeout(),
            refresh_credentials,
            callbacks: self.callbacks,
            clock: self.clock,
        })
    }
}

/// Reliable MQTT connection driven by [`Connection::poll`]
pub struct Connection<S: Session, C: Clock = SystemClock> {
    inner: Mutex<Inner<S>>,
    endpoint: BrokerEndpoint,
    params: ConnectParams,
    poll_timeout: Duration,
    refresh_credentials: CredentialRefreshCallback,
    callbacks: Callbacks,
    clock: C,
}

impl<S: Session> Connection<S, SystemClock> {
    pub fn builder(config: DeviceConfig, session: S) -> ConnectionBuilder<S, SystemClock> {
        ConnectionBuilder::new(config, session)
    }
}

impl<S: Session, C: Clock> Connection<S, C> {
    /// Start a connection attempt, allowed from `Disconnected` and `ConnectionError`
    pub fn connect(&self) -> TransportResult<()> {
        let mut inner = self.inner.lock();
        let now = self.clock.now();
        self.connect_locked(&mut inner, now)
    }

    /// Close the session
    ///
    /// From `ConnectionError` this only stops reconnection. From `Connecting`
    /// or `Connected` it sends DISCONNECT and waits in `Disconnecting` for the
    /// link to close.
    pub fn disconnect(&self) -> TransportResult<()> {
        let mut inner = self.inner.lock();

        match HealthMonitor::disconnect_decision(inner.state) {
            DisconnectDecision::Immediate => {
                inner.connect_deadline = None;
                Self::transition(&mut inner, ConnectionEvent::DisconnectRequested);
                Ok(())
            }
            DisconnectDecision::Reject => {
                error!(state = %inner.state, "Disconnection request will be ignored");
                Err(TransportError::not_ready(inner.state))
            }
            DisconnectDecision::SendRequest => {
                inner.session.disconnect().map_err(|e| {
                    error!(error = %e, "Device disconnection failure");
                    TransportError::Protocol(e)
                })?;
                inner.connect_deadline = None;
                Self::transition(&mut inner, ConnectionEvent::DisconnectRequested);
                Ok(())
            }
        }
    }

    /// Publish a message, returns the message id for QoS 1 and QoS 2
    ///
    /// QoS 1 and QoS 2 messages keep a copy of the payload until the exchange
    /// completes. A failed send is logged and left to retransmission.
    pub fn publish(&self, topic: &str, payload: &[u8], qos: QoS) -> TransportResult<Option<u16>> {
        let mut inner = self.inner.lock();

        if matches!(qos, QoS::AtMostOnce) {
            if let Err(e) = inner.session.publish(0, topic, payload, qos, false) {
                warn!(topic = %topic, error = %e, "QoS 0 publish failed");
            }
            return Ok(None);
        }

        let now = self.clock.now();
        let id = inner.outgoing.next_free_id()?;
        inner.outgoing.insert(
            id,
            CachedMessage::Publish {
                topic: topic.to_string(),
                payload: Bytes::copy_from_slice(payload),
                qos,
            },
            now,
        )?;

        debug!(message_id = id, topic = %topic, qos = ?qos, "Publishing message");
        if let Err(e) = inner.session.publish(id, topic, payload, qos, false) {
            warn!(message_id = id, error = %e, "Publish failed, message stays cached");
        }
        Ok(Some(id))
    }

    /// Subscribe to a topic filter, returns the message id of the SUBSCRIBE
    pub fn subscribe(&self, topic: &str, max_qos: QoS) -> TransportResult<u16> {
        let mut inner = self.inner.lock();
        let now = self.clock.now();

        let id = inner.outgoing.next_free_id()?;
        inner.outgoing.insert(
            id,
            CachedMessage::Subscription {
                topic: topic.to_string(),
                max_qos,
            },
            now,
        )?;

        debug!(message_id = id, topic = %topic, qos = ?max_qos, "Subscribing");
        if let Err(e) = inner.session.subscribe(id, topic, max_qos) {
            warn!(message_id = id, error = %e, "Subscribe failed, request stays cached");
        }
        Ok(id)
    }

    /// Drive timers, reconnection and the socket
    ///
    /// Blocks for at most the configured poll timeout. A returned `Socket` or
    /// `Protocol` error leaves the connection in `ConnectionError`, keep
    /// polling to reconnect.
    pub fn poll(&self) -> TransportResult<()> {
        let mut notifications = Vec::new();
        let result = self.poll_locked(&mut notifications);
        self.dispatch(notifications);
        result
    }

    pub fn is_connected(&self) -> bool {
        self.inner.lock().state == ConnectionState::Connected
    }

    pub fn state(&self) -> ConnectionState {
        self.inner.lock().state
    }

    /// Whether any publish or subscription awaits acknowledgement
    pub fn has_pending_outgoing(&self) -> bool {
        !self.inner.lock().outgoing.is_empty()
    }

    /// Ids of outgoing messages awaiting acknowledgement, ascending
    pub fn pending_outgoing_ids(&self) -> Vec<u16> {
        self.inner.lock().outgoing.ids()
    }

    /// Ids of incoming QoS 2 exchanges awaiting PUBREL, ascending
    pub fn pending_incoming_ids(&self) -> Vec<u16> {
        self.inner.lock().incoming.ids()
    }

    /// Drop every cached message in both directions
    pub fn clear_all_pending(&self) {
        let mut inner = self.inner.lock();
        inner.outgoing.clear();
        inner.incoming.clear();
    }

    fn connect_locked(&self, inner: &mut Inner<S>, now: Instant) -> TransportResult<()> {
        let _span = crate::connection_span!(client_id = %self.params.client_id).entered();

        if !HealthMonitor::can_connect(inner.state) {
            error!(state = %inner.state, "Connection request will be ignored");
            return Err(TransportError::not_ready(inner.state));
        }

        (self.refresh_credentials)().map_err(|e| {
            error!(error = %e, "Credential refresh failed");
            TransportError::CredentialRefresh(e)
        })?;

        let addr = inner
            .session
            .resolve(&self.endpoint.host, self.endpoint.port)
            .map_err(|source| {
                error!(host = %self.endpoint.host, error = %source, "Broker address resolution failed");
                TransportError::AddressResolution {
                    host: self.endpoint.host.clone(),
                    port: self.endpoint.port,
                    source,
                }
            })?;

        inner.session.connect(&self.params, addr).map_err(|e| {
            error!(broker = %addr, error = %e, "MQTT connect request failed");
            classify_session_error(e)
        })?;

        info!(broker = %addr, "Connect request sent, waiting for CONNACK");
        inner.connect_deadline = Some(now + self.params.connect_timeout);
        Self::transition(inner, ConnectionEvent::ConnectRequested);
        Ok(())
    }

    fn poll_locked(&self, notifications: &mut Vec<Notification>) -> TransportResult<()> {
        let mut inner = self.inner.lock();
        let now = self.clock.now();

        if HealthMonitor::connect_timed_out(inner.state, inner.connect_deadline, now) {
            error!("Connection attempt has timed out");
            inner.session.abort();
            inner.connect_deadline = None;
            Self::transition(&mut inner, ConnectionEvent::ConnectTimedOut);
            return Ok(());
        }

        if HealthMonitor::reconnect_due(inner.state, inner.reconnect_at, now) {
            let delay = inner.backoff.next_delay();
            inner.reconnect_at = now + delay;
            info!(
                next_attempt_in_ms = delay.as_millis() as u64,
                "Attempting a reconnection"
            );
            if let Err(e) = self.connect_locked(&mut inner, now) {
                error!(error = %e, "Failed establishing a new connection");
                return Ok(());
            }
        }

        if !HealthMonitor::should_service_socket(inner.state) {
            return Ok(());
        }

        if inner.state == ConnectionState::Connected {
            Self::retransmit_expired(&mut inner, now);
        }

        if let Err(e) = inner.session.ping_if_due(now) {
            warn!(error = %e, "Failed to keep the MQTT connection alive");
        }

        let wait = HealthMonitor::socket_wait_timeout(
            self.poll_timeout,
            inner.session.keepalive_time_left(now),
        );
        let Some(readiness) = inner.session.readiness() else {
            error!("No open transport to poll");
            Self::fail_transport(&mut inner, notifications);
            return Err(TransportError::Socket(SessionError::NotConnected));
        };

        let ready = MutexGuard::unlocked(&mut inner, || readiness.wait_readable(wait));
        let ready = match ready {
            Ok(ready) => ready,
            Err(e) => {
                error!(error = %e, "Socket poll error");
                Self::fail_transport(&mut inner, notifications);
                return Err(TransportError::Socket(SessionError::Io(e)));
            }
        };
        if !ready {
            return Ok(());
        }

        let mut events = Vec::new();
        let input = inner.session.process_input(&mut events);

        let now = self.clock.now();
        for event in events {
            self.handle_event(&mut inner, event, now, notifications);
        }

        match input {
            Ok(()) | Err(SessionError::NotConnected) => Ok(()),
            Err(e) => {
                error!(error = %e, "MQTT input failed");
                Self::fail_transport(&mut inner, notifications);
                Err(TransportError::Protocol(e))
            }
        }
    }

    fn retransmit_expired(inner: &mut Inner<S>, now: Instant) {
        let Inner {
            outgoing,
            incoming,
            session,
            ..
        } = inner;

        outgoing.sweep_expired(now, |id, message| {
            let result = match message {
                CachedMessage::Publish {
                    topic,
                    payload,
                    qos,
                } => session.publish(id, topic, payload, *qos, true),
                CachedMessage::Subscription { topic, max_qos } => {
                    session.subscribe(id, topic, *max_qos)
                }
                CachedMessage::IncomingQos2Placeholder => {
                    warn!(message_id = id, "Incoming placeholder found in outgoing cache");
                    Ok(())
                }
            };
            if let Err(e) = result {
                warn!(message_id = id, error = %e, "Retransmission failed");
            }
        });

        incoming.sweep_expired(now, |id, message| {
            if !matches!(message, CachedMessage::IncomingQos2Placeholder) {
                warn!(message_id = id, "Outgoing message found in incoming cache");
                return;
            }
            if let Err(e) = session.acknowledge(Ack::PubRec(id)) {
                warn!(message_id = id, error = %e, "PUBREC retransmission failed");
            }
        });
    }

    fn handle_event(
        &self,
        inner: &mut Inner<S>,
        event: SessionEvent,
        now: Instant,
        notifications: &mut Vec<Notification>,
    ) {
        if MessageHandler::route_session_event(inner.state, &event) == EventRoute::Ignore {
            return;
        }

        match event {
            SessionEvent::ConnAck { session_present } => {
                inner.backoff.reset();
                inner.connect_deadline = None;
                Self::transition(inner, ConnectionEvent::ConnAckReceived);
                if !session_present {
                    inner.outgoing.clear();
                    inner.incoming.clear();
                }
                notifications.push(Notification::Connected { session_present });
            }
            SessionEvent::Disconnected => {
                inner.connect_deadline = None;
                Self::transition(inner, ConnectionEvent::LinkClosed);
                notifications.push(Notification::Disconnected);
            }
            SessionEvent::PublishReceived {
                id,
                qos,
                topic,
                payload,
            } => self.handle_publish(inner, id, qos, topic, payload, now, notifications),
            SessionEvent::PubRel(id) => {
                inner.incoming.remove(id);
                Self::send_ack(inner, Ack::PubComp(id));
            }
            SessionEvent::PubAck(id) | SessionEvent::PubComp(id) => {
                if inner.outgoing.remove(id).is_some() {
                    notifications.push(Notification::Delivered(id));
                }
            }
            SessionEvent::PubRec(id) => {
                inner.outgoing.refresh_expiry(id, now);
                Self::send_ack(inner, Ack::PubRel(id));
            }
            SessionEvent::SubAck { id, return_code } => {
                if !MessageHandler::subscription_granted(&return_code) {
                    warn!(message_id = id, "Subscription rejected by broker");
                }
                if inner.outgoing.remove(id).is_some() {
                    notifications.push(Notification::Subscribed { id, return_code });
                }
            }
            SessionEvent::PingResp => debug!("Received PINGRESP"),
        }
    }

    #[allow(clippy::too_many_arguments)]
    fn handle_publish(
        &self,
        inner: &mut Inner<S>,
        id: u16,
        qos: QoS,
        topic: String,
        payload: Bytes,
        now: Instant,
        notifications: &mut Vec<Notification>,
    ) {
        let oversized = payload.len() > self.params.max_incoming_payload;
        if oversized {
            warn!(
                message_id = id,
                size = payload.len(),
                limit = self.params.max_incoming_payload,
                "Incoming payload exceeds the limit and will be discarded"
            );
        }

        let deliver = match qos {
            QoS::AtMostOnce => true,
            QoS::AtLeastOnce => {
                Self::send_ack(inner, Ack::PubAck(id));
                true
            }
            QoS::ExactlyOnce => {
                Self::send_ack(inner, Ack::PubRec(id));
                if inner.incoming.contains(id) {
                    info!(message_id = id, "Duplicate QoS 2 publish, not delivering again");
                    false
                } else {
                    inner
                        .incoming
                        .insert(id, CachedMessage::IncomingQos2Placeholder, now)
                        .is_ok()
                }
            }
        };

        if deliver && !oversized {
            notifications.push(Notification::Incoming(IncomingMessage {
                topic,
                payload,
                qos,
            }));
        }
    }

    fn send_ack(inner: &mut Inner<S>, ack: Ack) {
        if let Err(e) = inner.session.acknowledge(ack) {
            warn!(message_id = ack.message_id(), ack = ?ack, error = %e, "Failed to send acknowledgement");
        }
    }

    /// Tear the transport down after a poll failure and enter the matching state
    fn fail_transport(inner: &mut Inner<S>, notifications: &mut Vec<Notification>) {
        inner.session.abort();
        inner.connect_deadline = None;
        let event = if inner.state == ConnectionState::Disconnecting {
            ConnectionEvent::LinkClosed
        } else {
            ConnectionEvent::TransportFailed
        };
        Self::transition(inner, event);
        notifications.push(Notification::Disconnected);
    }

    fn transition(inner: &mut Inner<S>, event: ConnectionEvent) {
        let from = inner.state;
        let to = HealthMonitor::determine_next_state(from, event);
        HealthMonitor::log_state_transition(from, to);
        inner.state = to;
    }

    fn dispatch(&self, notifications: Vec<Notification>) {
        for notification in notifications {
            match notification {
                Notification::Connected { session_present } => {
                    if let Some(callback) = &self.callbacks.on_connected {
                        callback(session_present);
                    }
                }
                Notification::Disconnected => {
                    if let Some(callback) = &self.callbacks.on_disconnected {
                        callback();
                    }
                }
                Notification::Delivered(id) => {
                    if let Some(callback) = &self.callbacks.on_delivered {
                        callback(id);
                    }
                }
                Notification::Subscribed { id, return_code } => {
                    if let Some(callback) = &self.callbacks.on_subscribed {
                        callback(id, return_code);
                    }
                }
                Notification::Incoming(message) => match &self.callbacks.on_incoming {
                    Some(callback) => callback(message),
                    None => debug!(topic = %message.topic, "No incoming handler, message dropped"),
                },
            }
        }
    }
}

/// Map a session failure to the engine error taxonomy
fn classify_session_error(err: SessionError) -> TransportError {
    match err {
        SessionError::Io(_) | SessionError::Tls(_) | SessionError::NoAddress(_) | SessionError::NotConnected => {
            TransportError::Socket(err)
        }
        SessionError::Codec(_) | SessionError::ConnectionRefused(_) => TransportError::Protocol(err),
    }
}
