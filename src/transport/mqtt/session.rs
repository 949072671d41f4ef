//! Blocking MQTT 3.1.1 session over TCP or TLS
//!
//! Packets are encoded and decoded with the `rumqttc` v4 codec. The socket
//! stays in blocking mode with timeouts, except inside
//! [`Session::process_input`] where it is switched to non-blocking to drain
//! whatever is pending without waiting for more.

use crate::config::TlsSection;
use crate::transport::{
    Ack, ConnectParams, Readiness, Session, SessionError, SessionEvent,
};
use bytes::{Buf, BytesMut};
use rumqttc::mqttbytes::v4::{
    self, ConnectReturnCode, Connect, Disconnect, Packet, PingReq, PubAck, PubComp, PubRec,
    PubRel, Publish, Subscribe, SubscribeReasonCode,
};
use rumqttc::mqttbytes::{self, QoS};
use rustls::pki_types::{CertificateDer, ServerName};
use rustls::{ClientConfig, ClientConnection, RootCertStore, StreamOwned};
use std::fs::File;
use std::io::{self, BufReader, Read, Write};
use std::net::{Shutdown, SocketAddr, TcpStream, ToSocketAddrs};
use std::path::Path;
use std::sync::Arc;
use std::time::{Duration, Instant};
use tracing::{debug, error, info, warn};

/// Largest packet accepted from the broker
const MAX_PACKET_SIZE: usize = 256 * 1024;

const READ_CHUNK: usize = 4096;

/// SUBACK fixed header byte
const SUBACK_HEADER: u8 = 0x90;

enum Stream {
    Plain(TcpStream),
    Tls(Box<StreamOwned<ClientConnection, TcpStream>>),
}

impl Stream {
    fn tcp(&self) -> &TcpStream {
        match self {
            Stream::Plain(stream) => stream,
            Stream::Tls(stream) => stream.get_ref(),
        }
    }
}

impl Read for Stream {
    fn read(&mut self, buf: &mut [u8]) -> io::Result<usize> {
        match self {
            Stream::Plain(stream) => stream.read(buf),
            Stream::Tls(stream) => stream.read(buf),
        }
    }
}

impl Write for Stream {
    fn write(&mut self, buf: &[u8]) -> io::Result<usize> {
        match self {
            Stream::Plain(stream) => stream.write(buf),
            Stream::Tls(stream) => stream.write(buf),
        }
    }

    fn flush(&mut self) -> io::Result<()> {
        match self {
            Stream::Plain(stream) => stream.flush(),
            Stream::Tls(stream) => stream.flush(),
        }
    }
}

/// Readability probe on a duplicate of the session socket
struct SocketReadiness {
    socket: TcpStream,
}

impl Readiness for SocketReadiness {
    fn wait_readable(&self, timeout: Duration) -> io::Result<bool> {
        // A zero read timeout is rejected by the OS
        let timeout = timeout.max(Duration::from_millis(1));
        self.socket.set_read_timeout(Some(timeout))?;

        let mut probe = [0u8; 1];
        match self.socket.peek(&mut probe) {
            Ok(_) => Ok(true),
            Err(e) if matches!(e.kind(), io::ErrorKind::WouldBlock | io::ErrorKind::TimedOut) => {
                Ok(false)
            }
            Err(e) => Err(e),
        }
    }
}

/// Production [`Session`] over `std::net::TcpStream`
pub struct TcpSession {
    stream: Option<Stream>,
    readiness: Option<Arc<SocketReadiness>>,
    read_buf: BytesMut,
    write_buf: BytesMut,
    keep_alive: Duration,
    last_sent: Instant,
}

impl Default for TcpSession {
    fn default() -> Self {
        Self::new()
    }
}

impl TcpSession {
    pub fn new() -> Self {
        Self {
            stream: None,
            readiness: None,
            read_buf: BytesMut::with_capacity(READ_CHUNK),
            write_buf: BytesMut::with_capacity(READ_CHUNK),
            keep_alive: Duration::ZERO,
            last_sent: Instant::now(),
        }
    }

    pub fn is_open(&self) -> bool {
        self.stream.is_some()
    }

    /// Encode a packet with `encode` and write it out
    fn send<F>(&mut self, encode: F) -> Result<(), SessionError>
    where
        F: FnOnce(&mut BytesMut) -> Result<usize, mqttbytes::Error>,
    {
        let stream = self.stream.as_mut().ok_or(SessionError::NotConnected)?;

        self.write_buf.clear();
        encode(&mut self.write_buf)?;
        stream.write_all(&self.write_buf)?;
        stream.flush()?;
        self.last_sent = Instant::now();
        Ok(())
    }

    fn close(&mut self) {
        if let Some(stream) = self.stream.take() {
            let _ = stream.tcp().shutdown(Shutdown::Both);
        }
        self.readiness = None;
        self.read_buf.clear();
    }

    /// Read everything currently available without blocking, `Ok(false)` on EOF
    fn fill_read_buf(&mut self) -> Result<bool, SessionError> {
        let stream = self.stream.as_mut().ok_or(SessionError::NotConnected)?;
        stream.tcp().set_nonblocking(true)?;

        let mut chunk = [0u8; READ_CHUNK];
        let result = loop {
            match stream.read(&mut chunk) {
                Ok(0) => break Ok(false),
                Ok(n) => self.read_buf.extend_from_slice(&chunk[..n]),
                Err(e) if e.kind() == io::ErrorKind::WouldBlock => break Ok(true),
                Err(e) if e.kind() == io::ErrorKind::Interrupted => continue,
                Err(e) if e.kind() == io::ErrorKind::UnexpectedEof => break Ok(false),
                Err(e) => break Err(SessionError::Io(e)),
            }
        };

        stream.tcp().set_nonblocking(false)?;
        result
    }

    fn decode_packets(&mut self, events: &mut Vec<SessionEvent>) -> Result<(), SessionError> {
        loop {
            if self.read_buf.is_empty() {
                return Ok(());
            }
            if let Some(event) = self.take_empty_suback() {
                events.push(event);
                continue;
            }
            let packet = match v4::read(&mut self.read_buf, MAX_PACKET_SIZE) {
                Ok(packet) => packet,
                Err(mqttbytes::Error::InsufficientBytes(_)) => return Ok(()),
                Err(e) => return Err(SessionError::Codec(e)),
            };
            if let Some(event) = self.packet_to_event(packet)? {
                events.push(event);
            }
        }
    }

    /// Consume a SUBACK without return codes, which the codec rejects as malformed
    ///
    /// Such an acknowledgement is reported as a failed subscription so the
    /// pending request completes and the link stays up.
    fn take_empty_suback(&mut self) -> Option<SessionEvent> {
        match self.read_buf.get(..4) {
            Some(&[SUBACK_HEADER, 0x02, hi, lo]) => {
                let id = u16::from_be_bytes([hi, lo]);
                warn!(message_id = id, "SUBACK without return codes, treating as failure");
                self.read_buf.advance(4);
                Some(SessionEvent::SubAck {
                    id,
                    return_code: SubscribeReasonCode::Failure,
                })
            }
            _ => None,
        }
    }

    fn packet_to_event(&mut self, packet: Packet) -> Result<Option<SessionEvent>, SessionError> {
        let event = match packet {
            Packet::ConnAck(connack) => {
                if connack.code != ConnectReturnCode::Success {
                    error!(code = ?connack.code, "Broker refused the connection");
                    return Err(SessionError::ConnectionRefused(format!("{:?}", connack.code)));
                }
                SessionEvent::ConnAck {
                    session_present: connack.session_present,
                }
            }
            Packet::Publish(publish) => SessionEvent::PublishReceived {
                id: publish.pkid,
                qos: publish.qos,
                topic: publish.topic,
                payload: publish.payload,
            },
            Packet::PubAck(ack) => SessionEvent::PubAck(ack.pkid),
            Packet::PubRec(rec) => SessionEvent::PubRec(rec.pkid),
            Packet::PubRel(rel) => SessionEvent::PubRel(rel.pkid),
            Packet::PubComp(comp) => SessionEvent::PubComp(comp.pkid),
            Packet::SubAck(suback) => {
                if suback.return_codes.len() != 1 {
                    warn!(
                        message_id = suback.pkid,
                        count = suback.return_codes.len(),
                        "SUBACK carries an unexpected number of return codes"
                    );
                }
                let id = suback.pkid;
                let return_code = suback
                    .return_codes
                    .into_iter()
                    .next()
                    .unwrap_or(SubscribeReasonCode::Failure);
                SessionEvent::SubAck { id, return_code }
            }
            Packet::PingResp => SessionEvent::PingResp,
            other => {
                debug!(packet = ?other, "Ignoring unexpected packet from broker");
                return Ok(None);
            }
        };
        Ok(Some(event))
    }
}

impl Session for TcpSession {
    fn resolve(&mut self, host: &str, port: u16) -> Result<SocketAddr, SessionError> {
        (host, port)
            .to_socket_addrs()?
            .next()
            .ok_or_else(|| SessionError::NoAddress(format!("{host}:{port}")))
    }

    fn connect(&mut self, params: &ConnectParams, addr: SocketAddr) -> Result<(), SessionError> {
        self.close();

        let tcp = TcpStream::connect_timeout(&addr, params.connect_timeout)?;
        tcp.set_nodelay(true)?;
        tcp.set_read_timeout(Some(params.connect_timeout))?;
        tcp.set_write_timeout(Some(params.connect_timeout))?;
        let readiness = Arc::new(SocketReadiness {
            socket: tcp.try_clone()?,
        });

        let stream = match &params.tls {
            Some(tls) => Stream::Tls(Box::new(tls_stream(tcp, tls, &params.hostname)?)),
            None => Stream::Plain(tcp),
        };
        self.stream = Some(stream);
        self.readiness = Some(readiness);
        self.keep_alive = params.keep_alive;

        let mut connect = Connect::new(params.client_id.clone());
        connect.keep_alive = u16::try_from(params.keep_alive.as_secs()).unwrap_or(u16::MAX);
        connect.clean_session = params.clean_session;

        if let Err(e) = self.send(|buf| connect.write(buf)) {
            self.close();
            return Err(e);
        }
        info!(broker = %addr, client_id = %params.client_id, "CONNECT sent");
        Ok(())
    }

    fn disconnect(&mut self) -> Result<(), SessionError> {
        self.send(|buf| Disconnect.write(buf))?;
        if let Some(stream) = &self.stream {
            // The broker closes its side on DISCONNECT, EOF then surfaces as an event
            let _ = stream.tcp().shutdown(Shutdown::Write);
        }
        Ok(())
    }

    fn abort(&mut self) {
        if self.stream.is_some() {
            debug!("Dropping MQTT transport");
        }
        self.close();
    }

    fn publish(
        &mut self,
        id: u16,
        topic: &str,
        payload: &[u8],
        qos: QoS,
        dup: bool,
    ) -> Result<(), SessionError> {
        let mut publish = Publish::new(topic, qos, payload.to_vec());
        publish.pkid = id;
        publish.dup = dup;
        self.send(|buf| publish.write(buf))
    }

    fn subscribe(&mut self, id: u16, topic: &str, max_qos: QoS) -> Result<(), SessionError> {
        let mut subscribe = Subscribe::new(topic, max_qos);
        subscribe.pkid = id;
        self.send(|buf| subscribe.write(buf))
    }

    fn acknowledge(&mut self, ack: Ack) -> Result<(), SessionError> {
        match ack {
            Ack::PubAck(id) => self.send(|buf| PubAck::new(id).write(buf)),
            Ack::PubRec(id) => self.send(|buf| PubRec::new(id).write(buf)),
            Ack::PubRel(id) => self.send(|buf| PubRel::new(id).write(buf)),
            Ack::PubComp(id) => self.send(|buf| PubComp::new(id).write(buf)),
        }
    }

    fn ping_if_due(&mut self, now: Instant) -> Result<bool, SessionError> {
        if self.stream.is_none() || self.keep_alive.is_zero() {
            return Ok(false);
        }
        if now.saturating_duration_since(self.last_sent) < self.keep_alive {
            return Ok(false);
        }
        debug!("Sending PINGREQ");
        self.send(|buf| PingReq.write(buf))?;
        Ok(true)
    }

    fn keepalive_time_left(&self, now: Instant) -> Option<Duration> {
        if self.stream.is_none() || self.keep_alive.is_zero() {
            return None;
        }
        let elapsed = now.saturating_duration_since(self.last_sent);
        Some(self.keep_alive.saturating_sub(elapsed))
    }

    fn readiness(&self) -> Option<Arc<dyn Readiness>> {
        self.readiness
            .clone()
            .map(|readiness| readiness as Arc<dyn Readiness>)
    }

    fn process_input(&mut self, events: &mut Vec<SessionEvent>) -> Result<(), SessionError> {
        let open = self.fill_read_buf()?;

        let decoded = self.decode_packets(events);
        if decoded.is_err() {
            self.close();
            return decoded;
        }

        if !open {
            info!("Broker closed the connection");
            self.close();
            events.push(SessionEvent::Disconnected);
        }
        Ok(())
    }
}

fn tls_stream(
    tcp: TcpStream,
    tls: &TlsSection,
    hostname: &str,
) -> Result<StreamOwned<ClientConnection, TcpStream>, SessionError> {
    let config = build_client_config(tls)?;

    let server_name = tls.server_name.as_deref().unwrap_or(hostname);
    let server_name = ServerName::try_from(server_name.to_string())
        .map_err(|_| SessionError::Tls(format!("Invalid server name: {server_name}")))?;

    let conn = ClientConnection::new(Arc::new(config), server_name)
        .map_err(|e| SessionError::Tls(e.to_string()))?;

    Ok(StreamOwned::new(conn, tcp))
}

/// Build a rustls client configuration, certificates are re-read on every call
pub fn build_client_config(tls: &TlsSection) -> Result<ClientConfig, SessionError> {
    let mut root_store = RootCertStore::empty();

    match &tls.ca_cert_path {
        Some(ca_path) => {
            for cert in load_certs(ca_path)? {
                root_store
                    .add(cert)
                    .map_err(|e| SessionError::Tls(format!("Failed to add CA cert: {e}")))?;
            }
        }
        None => root_store.extend(webpki_roots::TLS_SERVER_ROOTS.iter().cloned()),
    }

    let builder = ClientConfig::builder().with_root_certificates(root_store);

    match (&tls.client_cert_path, &tls.client_key_path) {
        (Some(cert_path), Some(key_path)) => {
            let certs = load_certs(cert_path)?;
            let key_file = File::open(key_path)
                .map_err(|e| SessionError::Tls(format!("Failed to open client key: {e}")))?;
            let key = rustls_pemfile::private_key(&mut BufReader::new(key_file))
                .map_err(|e| SessionError::Tls(format!("Failed to parse client key: {e}")))?
                .ok_or_else(|| SessionError::Tls("No private key found in file".to_string()))?;

            builder
                .with_client_auth_cert(certs, key)
                .map_err(|e| SessionError::Tls(format!("Failed to configure client auth: {e}")))
        }
        _ => Ok(builder.with_no_client_auth()),
    }
}

fn load_certs(path: &Path) -> Result<Vec<CertificateDer<'static>>, SessionError> {
    let file = File::open(path).map_err(|e| {
        SessionError::Tls(format!("Failed to open certificate {}: {e}", path.display()))
    })?;

    let certs = rustls_pemfile::certs(&mut BufReader::new(file))
        .collect::<Result<Vec<_>, _>>()
        .map_err(|e| {
            SessionError::Tls(format!("Failed to parse certificate {}: {e}", path.display()))
        })?;

    if certs.is_empty() {
        return Err(SessionError::Tls(format!(
            "No certificate found in {}",
            path.display()
        )));
    }
    Ok(certs)
}
