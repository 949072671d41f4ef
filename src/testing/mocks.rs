//! Mock implementations for testing
//!
//! [`MockSession`] records every packet the engine asks it to send and replays
//! scripted inbound events; [`MockSessionHandle`] keeps access to that state
//! after the session has been moved into a connection. [`ManualClock`] only
//! moves when told to.

use crate::transport::{
    Ack, Clock, ConnectParams, Readiness, Session, SessionError, SessionEvent,
};
use parking_lot::Mutex;
use rumqttc::mqttbytes::QoS;
use std::collections::VecDeque;
use std::io;
use std::net::{IpAddr, Ipv4Addr, SocketAddr};
use std::sync::Arc;
use std::time::{Duration, Instant};

/// Publish recorded by [`MockSession`]
#[derive(Debug, Clone, PartialEq)]
pub struct SentPublish {
    pub id: u16,
    pub topic: String,
    pub payload: Vec<u8>,
    pub qos: QoS,
    pub dup: bool,
}

/// Packet recorded by [`MockSession`]
#[derive(Debug, Clone, PartialEq)]
pub enum SentPacket {
    Connect {
        client_id: String,
        clean_session: bool,
    },
    Disconnect,
    Publish(SentPublish),
    Subscribe {
        id: u16,
        topic: String,
        max_qos: QoS,
    },
    Ack(Ack),
    PingReq,
}

#[derive(Debug, Default)]
struct MockState {
    sent: Vec<SentPacket>,
    inbound: VecDeque<SessionEvent>,
    open: bool,
    connect_count: usize,
    abort_count: usize,
    fail_resolve: bool,
    fail_connect: bool,
    fail_send: bool,
    fail_poll: bool,
    fail_input: bool,
    ping_due: bool,
    keepalive_left: Option<Duration>,
    last_wait: Option<Duration>,
}

/// Mock session for testing the connection engine
#[derive(Debug, Default)]
pub struct MockSession {
    state: Arc<Mutex<MockState>>,
}

/// Shared view of a [`MockSession`]
#[derive(Debug, Clone)]
pub struct MockSessionHandle {
    state: Arc<Mutex<MockState>>,
}

impl MockSession {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn handle(&self) -> MockSessionHandle {
        MockSessionHandle {
            state: self.state.clone(),
        }
    }

    fn record(&self, packet: SentPacket) -> Result<(), SessionError> {
        let mut state = self.state.lock();
        if state.fail_send {
            return Err(SessionError::Io(io::Error::new(
                io::ErrorKind::BrokenPipe,
                "Mock send failure",
            )));
        }
        if !state.open {
            return Err(SessionError::NotConnected);
        }
        state.sent.push(packet);
        Ok(())
    }
}

impl MockSessionHandle {
    /// Queue an event for the next input processing
    pub fn push_event(&self, event: SessionEvent) {
        self.state.lock().inbound.push_back(event);
    }

    pub fn sent(&self) -> Vec<SentPacket> {
        self.state.lock().sent.clone()
    }

    pub fn published(&self) -> Vec<SentPublish> {
        self.state
            .lock()
            .sent
            .iter()
            .filter_map(|packet| match packet {
                SentPacket::Publish(publish) => Some(publish.clone()),
                _ => None,
            })
            .collect()
    }

    pub fn acks(&self) -> Vec<Ack> {
        self.state
            .lock()
            .sent
            .iter()
            .filter_map(|packet| match packet {
                SentPacket::Ack(ack) => Some(*ack),
                _ => None,
            })
            .collect()
    }

    pub fn subscriptions(&self) -> Vec<(u16, String)> {
        self.state
            .lock()
            .sent
            .iter()
            .filter_map(|packet| match packet {
                SentPacket::Subscribe { id, topic, .. } => Some((*id, topic.clone())),
                _ => None,
            })
            .collect()
    }

    pub fn clear_history(&self) {
        self.state.lock().sent.clear();
    }

    pub fn connect_count(&self) -> usize {
        self.state.lock().connect_count
    }

    pub fn abort_count(&self) -> usize {
        self.state.lock().abort_count
    }

    pub fn is_open(&self) -> bool {
        self.state.lock().open
    }

    pub fn fail_resolve(&self, fail: bool) {
        self.state.lock().fail_resolve = fail;
    }

    pub fn fail_connect(&self, fail: bool) {
        self.state.lock().fail_connect = fail;
    }

    pub fn fail_send(&self, fail: bool) {
        self.state.lock().fail_send = fail;
    }

    pub fn fail_poll(&self, fail: bool) {
        self.state.lock().fail_poll = fail;
    }

    /// Make the next input processing fail after draining queued events
    pub fn fail_next_input(&self) {
        self.state.lock().fail_input = true;
    }

    /// Make the next keep-alive check send a PINGREQ
    pub fn set_ping_due(&self) {
        self.state.lock().ping_due = true;
    }

    pub fn set_keepalive_left(&self, left: Option<Duration>) {
        self.state.lock().keepalive_left = left;
    }

    /// Timeout passed to the most recent readability wait
    pub fn last_wait_timeout(&self) -> Option<Duration> {
        self.state.lock().last_wait
    }
}

struct MockReadiness {
    state: Arc<Mutex<MockState>>,
}

impl Readiness for MockReadiness {
    fn wait_readable(&self, timeout: Duration) -> io::Result<bool> {
        let mut state = self.state.lock();
        state.last_wait = Some(timeout);
        if state.fail_poll {
            return Err(io::Error::new(io::ErrorKind::ConnectionReset, "Mock poll failure"));
        }
        Ok(!state.inbound.is_empty() || state.fail_input)
    }
}

impl Session for MockSession {
    fn resolve(&mut self, host: &str, port: u16) -> Result<SocketAddr, SessionError> {
        if self.state.lock().fail_resolve {
            return Err(SessionError::NoAddress(host.to_string()));
        }
        Ok(SocketAddr::new(IpAddr::V4(Ipv4Addr::LOCALHOST), port))
    }

    fn connect(&mut self, params: &ConnectParams, _addr: SocketAddr) -> Result<(), SessionError> {
        let mut state = self.state.lock();
        if state.fail_connect {
            return Err(SessionError::Io(io::Error::new(
                io::ErrorKind::ConnectionRefused,
                "Mock connection failure",
            )));
        }
        state.open = true;
        state.connect_count += 1;
        state.sent.push(SentPacket::Connect {
            client_id: params.client_id.clone(),
            clean_session: params.clean_session,
        });
        Ok(())
    }

    fn disconnect(&mut self) -> Result<(), SessionError> {
        self.record(SentPacket::Disconnect)
    }

    fn abort(&mut self) {
        let mut state = self.state.lock();
        state.open = false;
        state.abort_count += 1;
    }

    fn publish(
        &mut self,
        id: u16,
        topic: &str,
        payload: &[u8],
        qos: QoS,
        dup: bool,
    ) -> Result<(), SessionError> {
        self.record(SentPacket::Publish(SentPublish {
            id,
            topic: topic.to_string(),
            payload: payload.to_vec(),
            qos,
            dup,
        }))
    }

    fn subscribe(&mut self, id: u16, topic: &str, max_qos: QoS) -> Result<(), SessionError> {
        self.record(SentPacket::Subscribe {
            id,
            topic: topic.to_string(),
            max_qos,
        })
    }

    fn acknowledge(&mut self, ack: Ack) -> Result<(), SessionError> {
        self.record(SentPacket::Ack(ack))
    }

    fn ping_if_due(&mut self, _now: Instant) -> Result<bool, SessionError> {
        let due = std::mem::take(&mut self.state.lock().ping_due);
        if due {
            self.record(SentPacket::PingReq)?;
        }
        Ok(due)
    }

    fn keepalive_time_left(&self, _now: Instant) -> Option<Duration> {
        self.state.lock().keepalive_left
    }

    fn readiness(&self) -> Option<Arc<dyn Readiness>> {
        if !self.state.lock().open {
            return None;
        }
        Some(Arc::new(MockReadiness {
            state: self.state.clone(),
        }))
    }

    fn process_input(&mut self, events: &mut Vec<SessionEvent>) -> Result<(), SessionError> {
        let mut state = self.state.lock();
        while let Some(event) = state.inbound.pop_front() {
            if event == SessionEvent::Disconnected {
                state.open = false;
            }
            events.push(event);
        }
        if std::mem::take(&mut state.fail_input) {
            return Err(SessionError::Io(io::Error::new(
                io::ErrorKind::InvalidData,
                "Mock malformed packet",
            )));
        }
        Ok(())
    }
}

/// Clock that only advances when told to
#[derive(Debug)]
pub struct ManualClock {
    now: Mutex<Instant>,
}

impl Default for ManualClock {
    fn default() -> Self {
        Self::new()
    }
}

impl ManualClock {
    pub fn new() -> Self {
        Self {
            now: Mutex::new(Instant::now()),
        }
    }

    pub fn advance(&self, by: Duration) {
        *self.now.lock() += by;
    }
}

impl Clock for ManualClock {
    fn now(&self) -> Instant {
        *self.now.lock()
    }
}
