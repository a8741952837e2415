//! QUIC session wrapper
//!
//! Terminates one QUIC connection per peer: accepts the first Initial
//! packet, allocates a fresh server-side connection id, drives the
//! handshake and surfaces unreliable datagrams and stream chunks as
//! events. Outbound packets go through an injected send callback so the
//! wrapper never touches the socket.
//!
//! The crypto layer sits behind [`HandshakeDriver`]; the in-tree
//! [`PassthroughHandshake`] completes immediately and carries datagram
//! payloads verbatim, which is the mode used when no TLS stack is
//! configured. Tests drive the wrapper synchronously with canned packets.

use std::net::SocketAddr;

use thiserror::Error;

/// Long-header form bit.
const LONG_HEADER: u8 = 0x80;
/// Fixed bit every QUIC v1 packet carries.
const FIXED_BIT: u8 = 0x40;

pub const QUIC_VERSION_1: u32 = 1;

#[derive(Debug, Error)]
pub enum QuicError {
    #[error("crypto failure: {0}")]
    Crypto(String),

    #[error("connection is draining")]
    Draining,

    #[error("connection dropped")]
    DropConnection,

    #[error("packet too short for a QUIC header")]
    Truncated,
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum SessionState {
    AwaitingInitial,
    Handshaking,
    Established,
    Closed,
}

/// What a delivered packet produced.
#[derive(Debug, PartialEq)]
pub enum QuicEvent {
    HandshakeComplete,
    /// An unreliable datagram payload with its arrival time.
    Datagram(Vec<u8>, i64),
    /// An opaque stream chunk.
    Stream {
        stream_id: u64,
        data: Vec<u8>,
        fin: bool,
    },
}

/// Seam for the TLS/crypto library, which is an external collaborator.
/// A real driver wraps a QUIC TLS stack; the passthrough one stands in
/// when none is configured.
pub trait HandshakeDriver: Send {
    /// Consume one crypto-bearing packet, returning the packets to send
    /// back to the peer.
    fn drive(&mut self, packet: &[u8]) -> Result<Vec<Vec<u8>>, QuicError>;

    fn is_established(&self) -> bool;

    /// Remove packet protection from an application datagram payload.
    fn open_datagram(&mut self, payload: &[u8]) -> Result<Vec<u8>, QuicError>;

    /// Apply packet protection to an outbound datagram payload.
    fn seal_datagram(&mut self, payload: &[u8]) -> Vec<u8>;
}

/// Handshake stand-in: accepts immediately, answers the Initial with a
/// minimal short-header ack, and passes datagrams through unchanged.
#[derive(Default)]
pub struct PassthroughHandshake {
    established: bool,
}

impl HandshakeDriver for PassthroughHandshake {
    fn drive(&mut self, _packet: &[u8]) -> Result<Vec<Vec<u8>>, QuicError> {
        self.established = true;
        Ok(vec![vec![FIXED_BIT]])
    }

    fn is_established(&self) -> bool {
        self.established
    }

    fn open_datagram(&mut self, payload: &[u8]) -> Result<Vec<u8>, QuicError> {
        Ok(payload.to_vec())
    }

    fn seal_datagram(&mut self, payload: &[u8]) -> Vec<u8> {
        payload.to_vec()
    }
}

pub type SendPacketFn = Box<dyn FnMut(&[u8], SocketAddr) + Send>;

pub struct QuicSessionWrapper {
    state: SessionState,
    peer: SocketAddr,
    driver: Box<dyn HandshakeDriver>,
    send_packet: SendPacketFn,

    /// Our connection id, minted on the first Initial.
    scid: Vec<u8>,
    /// The peer's connection id, taken from its Initial.
    dcid: Vec<u8>,
    connection_id: String,
    last_activity_ms: i64,
}

impl QuicSessionWrapper {
    pub fn new(
        peer: SocketAddr,
        driver: Box<dyn HandshakeDriver>,
        send_packet: SendPacketFn,
    ) -> Self {
        Self {
            state: SessionState::AwaitingInitial,
            peer,
            driver,
            send_packet,
            scid: Vec::new(),
            dcid: Vec::new(),
            connection_id: String::new(),
            last_activity_ms: 0,
        }
    }

    pub fn state(&self) -> SessionState {
        self.state
    }

    pub fn is_established(&self) -> bool {
        self.state == SessionState::Established
    }

    /// Hex form of the server connection id, empty before the Initial.
    pub fn connection_id(&self) -> &str {
        &self.connection_id
    }

    pub fn last_activity_ms(&self) -> i64 {
        self.last_activity_ms
    }

    /// Deliver one UDP packet belonging to this session. Fatal errors
    /// extinguish the session; the dispatcher observes closure.
    pub fn handle_packet(&mut self, data: &[u8], now_ms: i64) -> Result<Vec<QuicEvent>, QuicError> {
        if data.is_empty() {
            return Err(QuicError::Truncated);
        }
        if self.state == SessionState::Closed {
            return Err(QuicError::DropConnection);
        }
        self.last_activity_ms = now_ms;

        match self.state {
            SessionState::AwaitingInitial => self.on_initial(data, now_ms),
            SessionState::Handshaking => self.on_handshake_packet(data),
            SessionState::Established => self.on_established_packet(data, now_ms),
            SessionState::Closed => unreachable!(),
        }
    }

    /// Queue an outbound unreliable datagram.
    pub fn send_datagram(&mut self, payload: &[u8]) -> Result<(), QuicError> {
        if self.state != SessionState::Established {
            return Err(QuicError::DropConnection);
        }
        let sealed = self.driver.seal_datagram(payload);
        let mut packet = Vec::with_capacity(1 + sealed.len());
        packet.push(FIXED_BIT);
        packet.extend_from_slice(&sealed);
        (self.send_packet)(&packet, self.peer);
        Ok(())
    }

    pub fn close(&mut self) {
        self.state = SessionState::Closed;
    }

    fn on_initial(&mut self, data: &[u8], _now_ms: i64) -> Result<Vec<QuicEvent>, QuicError> {
        if data[0] & LONG_HEADER == 0 {
            tracing::warn!(peer = %self.peer, "short-header packet before connection established");
            return Ok(Vec::new());
        }
        // Long header: flags, version, dcid length + bytes, scid length
        // + bytes. Only an Initial (type 0) with version 1 opens a
        // connection.
        if data.len() < 7 {
            return Err(QuicError::Truncated);
        }
        let packet_type = (data[0] >> 4) & 0x3;
        let version = u32::from_be_bytes([data[1], data[2], data[3], data[4]]);
        if packet_type != 0 || version != QUIC_VERSION_1 {
            tracing::warn!(peer = %self.peer, packet_type, version, "non-initial long header before handshake");
            return Ok(Vec::new());
        }

        let dcid_len = data[5] as usize;
        let scid_off = 6 + dcid_len;
        if data.len() <= scid_off {
            return Err(QuicError::Truncated);
        }
        let peer_scid_len = data[scid_off] as usize;
        if data.len() < scid_off + 1 + peer_scid_len {
            return Err(QuicError::Truncated);
        }
        // The peer's source cid becomes our destination cid.
        self.dcid = data[scid_off + 1..scid_off + 1 + peer_scid_len].to_vec();

        // Mint a fresh server-side connection id.
        self.scid = uuid::Uuid::new_v4().as_bytes()[..8].to_vec();
        self.connection_id = self.scid.iter().map(|b| format!("{:02x}", b)).collect();
        tracing::debug!(peer = %self.peer, scid = %self.connection_id, "accepted QUIC initial");

        self.state = SessionState::Handshaking;
        self.on_handshake_packet(data)
    }

    fn on_handshake_packet(&mut self, data: &[u8]) -> Result<Vec<QuicEvent>, QuicError> {
        let replies = match self.driver.drive(data) {
            Ok(replies) => replies,
            Err(e) => {
                tracing::warn!(peer = %self.peer, error = %e, "handshake failed, closing session");
                self.state = SessionState::Closed;
                return Err(e);
            }
        };
        for reply in replies {
            (self.send_packet)(&reply, self.peer);
        }

        let mut events = Vec::new();
        if self.driver.is_established() {
            self.state = SessionState::Established;
            events.push(QuicEvent::HandshakeComplete);
        }
        Ok(events)
    }

    fn on_established_packet(
        &mut self,
        data: &[u8],
        now_ms: i64,
    ) -> Result<Vec<QuicEvent>, QuicError> {
        if data[0] & LONG_HEADER != 0 {
            // Stray handshake retransmission; answer it and move on.
            return self.on_handshake_packet(data);
        }

        let payload = self.driver.open_datagram(&data[1..])?;
        if payload.is_empty() {
            return Ok(Vec::new());
        }
        Ok(vec![QuicEvent::Datagram(payload, now_ms)])
    }
}

/// Build a client Initial packet, used by tests and the loopback tools.
pub fn encode_initial(dcid: &[u8], scid: &[u8], payload: &[u8]) -> Vec<u8> {
    let mut out = Vec::with_capacity(7 + dcid.len() + scid.len() + payload.len());
    out.push(LONG_HEADER | FIXED_BIT); // Initial, type 0
    out.extend_from_slice(&QUIC_VERSION_1.to_be_bytes());
    out.push(dcid.len() as u8);
    out.extend_from_slice(dcid);
    out.push(scid.len() as u8);
    out.extend_from_slice(scid);
    out.extend_from_slice(payload);
    out
}

/// Build a short-header datagram packet.
pub fn encode_datagram(payload: &[u8]) -> Vec<u8> {
    let mut out = Vec::with_capacity(1 + payload.len());
    out.push(FIXED_BIT);
    out.extend_from_slice(payload);
    out
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::sync::{Arc, Mutex};

    fn peer() -> SocketAddr {
        "127.0.0.1:5000".parse().unwrap()
    }

    fn session_with_sent() -> (QuicSessionWrapper, Arc<Mutex<Vec<Vec<u8>>>>) {
        let sent = Arc::new(Mutex::new(Vec::new()));
        let sink = sent.clone();
        let session = QuicSessionWrapper::new(
            peer(),
            Box::new(PassthroughHandshake::default()),
            Box::new(move |pkt, _addr| sink.lock().unwrap().push(pkt.to_vec())),
        );
        (session, sent)
    }

    #[test]
    fn test_initial_completes_placeholder_handshake() {
        let (mut session, sent) = session_with_sent();
        let initial = encode_initial(&[1, 2, 3, 4], &[9, 8, 7, 6], &[0; 16]);

        let events = session.handle_packet(&initial, 100).unwrap();
        assert_eq!(events, vec![QuicEvent::HandshakeComplete]);
        assert!(session.is_established());
        assert_eq!(session.connection_id().len(), 16);
        assert_eq!(sent.lock().unwrap().len(), 1);
    }

    #[test]
    fn test_datagram_delivery() {
        let (mut session, _sent) = session_with_sent();
        session
            .handle_packet(&encode_initial(&[1], &[2], &[]), 0)
            .unwrap();

        let events = session
            .handle_packet(&encode_datagram(&[0xAA, 0xBB]), 42)
            .unwrap();
        assert_eq!(events, vec![QuicEvent::Datagram(vec![0xAA, 0xBB], 42)]);
    }

    #[test]
    fn test_short_header_before_initial_ignored() {
        let (mut session, _sent) = session_with_sent();
        let events = session.handle_packet(&encode_datagram(&[1, 2]), 0).unwrap();
        assert!(events.is_empty());
        assert_eq!(session.state(), SessionState::AwaitingInitial);
    }

    #[test]
    fn test_wrong_version_ignored() {
        let (mut session, _sent) = session_with_sent();
        let mut initial = encode_initial(&[1], &[2], &[]);
        initial[4] = 2; // version 2
        let events = session.handle_packet(&initial, 0).unwrap();
        assert!(events.is_empty());
        assert_eq!(session.state(), SessionState::AwaitingInitial);
    }

    #[test]
    fn test_send_datagram_goes_through_callback() {
        let (mut session, sent) = session_with_sent();
        session
            .handle_packet(&encode_initial(&[1], &[2], &[]), 0)
            .unwrap();
        sent.lock().unwrap().clear();

        session.send_datagram(&[5, 6, 7]).unwrap();
        let packets = sent.lock().unwrap();
        assert_eq!(packets.len(), 1);
        assert_eq!(packets[0], vec![0x40, 5, 6, 7]);
    }

    #[test]
    fn test_closed_session_rejects_packets() {
        let (mut session, _sent) = session_with_sent();
        session
            .handle_packet(&encode_initial(&[1], &[2], &[]), 0)
            .unwrap();
        session.close();

        assert!(matches!(
            session.handle_packet(&encode_datagram(&[1]), 0),
            Err(QuicError::DropConnection)
        ));
        assert!(session.send_datagram(&[1]).is_err());
    }

    #[test]
    fn test_crypto_failure_extinguishes_session() {
        struct FailingDriver;
        impl HandshakeDriver for FailingDriver {
            fn drive(&mut self, _p: &[u8]) -> Result<Vec<Vec<u8>>, QuicError> {
                Err(QuicError::Crypto("bad transcript".into()))
            }
            fn is_established(&self) -> bool {
                false
            }
            fn open_datagram(&mut self, p: &[u8]) -> Result<Vec<u8>, QuicError> {
                Ok(p.to_vec())
            }
            fn seal_datagram(&mut self, p: &[u8]) -> Vec<u8> {
                p.to_vec()
            }
        }

        let mut session = QuicSessionWrapper::new(
            peer(),
            Box::new(FailingDriver),
            Box::new(|_pkt, _addr| {}),
        );
        let err = session
            .handle_packet(&encode_initial(&[1], &[2], &[]), 0)
            .unwrap_err();
        assert!(matches!(err, QuicError::Crypto(_)));
        assert_eq!(session.state(), SessionState::Closed);
    }
}
