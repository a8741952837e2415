//! UDP dispatcher
//!
//! Binds the ingest endpoint and maps every source `(ip, port)` to a
//! session owning a protocol adapter, an optional QUIC wrapper, and the
//! jitter hand-off to the downstream hub. All reassembly for one
//! endpoint runs on this task; a per-session publisher thread drains
//! the jitter buffer toward the hub.

use std::collections::HashMap;
use std::net::SocketAddr;
use std::sync::Arc;
use std::time::{Duration, Instant};

use thiserror::Error;
use tokio::net::UdpSocket;
use tokio::sync::broadcast;

use crate::adapter::{global_registry, AdapterInit, AdapterOutput, ProtocolAdapter};
use crate::config::Config;
use crate::hub::{FramePublisher, MediaHub};
use crate::jitter::{JitterBuffer, JitterError};
use crate::quic::{PassthroughHandshake, QuicEvent, QuicSessionWrapper};
use crate::stats::{global_stats, ConnectionStats, Counters, ErrorKind, StatsManager};

/// Run the expiry sweep every this many datagrams.
const SWEEP_EVERY_PACKETS: u64 = 100;

const MAX_DATAGRAM: usize = 65_536;

#[derive(Debug, Error)]
pub enum DispatcherError {
    #[error("failed to bind {addr}: {source}")]
    Bind {
        addr: String,
        source: std::io::Error,
    },

    #[error("socket receive failed: {0}")]
    Receive(#[from] std::io::Error),
}

struct Session {
    key: String,
    adapter: ProtocolAdapter,
    quic: Option<QuicSessionWrapper>,
    jitter: Option<Arc<JitterBuffer>>,
    publisher_handle: Option<std::thread::JoinHandle<()>>,
    hub_tx: FramePublisher,
    stats: Arc<ConnectionStats>,
    global: Arc<Counters>,
    last_activity_ms: i64,
    /// Adapter error totals already mirrored into the counters.
    mirrored_errors: (u64, u64, u64),
}

impl Session {
    fn touch(&mut self, now_ms: i64) {
        self.last_activity_ms = now_ms;
    }

    /// Mirror new adapter-side errors into the connection and global
    /// counters.
    fn sync_error_counters(&mut self) {
        let (parse, timestamp, codec) = self.adapter.error_counts();
        let (p0, t0, c0) = self.mirrored_errors;
        for _ in p0..parse {
            self.stats.counters.record_error(ErrorKind::Parse);
            self.global.record_error(ErrorKind::Parse);
        }
        for _ in t0..timestamp {
            self.stats.counters.record_error(ErrorKind::Timestamp);
            self.global.record_error(ErrorKind::Timestamp);
        }
        for _ in c0..codec {
            self.stats.counters.record_error(ErrorKind::Codec);
            self.global.record_error(ErrorKind::Codec);
        }
        self.mirrored_errors = (parse, timestamp, codec);
    }
}

pub struct UdpDispatcher {
    config: Arc<Config>,
    socket: Arc<UdpSocket>,
    hub: Arc<dyn MediaHub>,
    stats: Arc<StatsManager>,
    sessions: HashMap<String, Session>,
    packet_count: u64,
    epoch: Instant,
}

impl UdpDispatcher {
    /// Bind the configured UDP endpoint.
    pub async fn bind(config: Arc<Config>, hub: Arc<dyn MediaHub>) -> Result<Self, DispatcherError> {
        let addr = format!(
            "{}:{}",
            config.server.listen_address, config.server.listen_port
        );
        let socket = UdpSocket::bind(&addr)
            .await
            .map_err(|source| DispatcherError::Bind { addr: addr.clone(), source })?;
        tracing::info!(%addr, protocol = %config.protocol.name, "UDP dispatcher listening");

        Ok(Self {
            config,
            socket: Arc::new(socket),
            hub,
            stats: global_stats(),
            sessions: HashMap::new(),
            packet_count: 0,
            epoch: Instant::now(),
        })
    }

    pub fn local_addr(&self) -> std::io::Result<SocketAddr> {
        self.socket.local_addr()
    }

    fn now_ms(&self) -> i64 {
        self.epoch.elapsed().as_millis() as i64
    }

    /// Receive loop; returns after a shutdown signal.
    pub async fn run(mut self, mut shutdown: broadcast::Receiver<()>) -> Result<(), DispatcherError> {
        let socket = self.socket.clone();
        let mut buf = vec![0u8; MAX_DATAGRAM];
        loop {
            tokio::select! {
                received = socket.recv_from(&mut buf) => {
                    let (len, peer) = received?;
                    self.handle_datagram(&buf[..len], peer).await;
                }
                _ = shutdown.recv() => {
                    tracing::info!("dispatcher shutdown requested");
                    break;
                }
            }
        }

        let now = self.now_ms();
        let keys: Vec<String> = self.sessions.keys().cloned().collect();
        for key in keys {
            self.teardown_session(&key, now, "shutdown").await;
        }
        tracing::info!("UDP dispatcher stopped");
        Ok(())
    }

    async fn handle_datagram(&mut self, data: &[u8], peer: SocketAddr) {
        let now = self.now_ms();
        self.packet_count += 1;
        self.stats.global().record_packet(data.len() as u64);

        let key = peer.to_string();
        if !self.sessions.contains_key(&key) {
            if self.sessions.len() >= self.config.limits.max_sessions {
                tracing::warn!(peer = %key, sessions = self.sessions.len(), "session cap reached, rejecting peer");
                return;
            }
            match self.create_session(&key, peer, now) {
                Ok(session) => {
                    self.sessions.insert(key.clone(), session);
                }
                Err(e) => {
                    tracing::error!(peer = %key, error = %e, "failed to create session");
                    return;
                }
            }
        }

        let Some(session) = self.sessions.get_mut(&key) else {
            return;
        };
        session.touch(now);
        session.stats.counters.record_packet(data.len() as u64);

        let fatal = Self::feed_session(session, data, now).await;
        if fatal {
            self.teardown_session(&key, now, "protocol error").await;
        }

        if self.packet_count % SWEEP_EVERY_PACKETS == 0 {
            self.sweep(now).await;
        }
    }

    /// Push one datagram into a session; returns whether the failure is
    /// fatal for the session.
    async fn feed_session(session: &mut Session, data: &[u8], now_ms: i64) -> bool {
        let mut outputs = Vec::new();
        let mut fatal = false;

        if let Some(quic) = session.quic.as_mut() {
            match quic.handle_packet(data, now_ms) {
                Ok(events) => {
                    for event in events {
                        match event {
                            QuicEvent::Datagram(payload, arrival_ms) => {
                                match session.adapter.feed(&payload, arrival_ms) {
                                    Ok(mut out) => outputs.append(&mut out),
                                    Err(e) => {
                                        tracing::warn!(session = %session.key, error = %e, "adapter rejected datagram");
                                        fatal = true;
                                        break;
                                    }
                                }
                            }
                            QuicEvent::HandshakeComplete => {
                                tracing::info!(session = %session.key, cid = quic.connection_id(), "QUIC handshake complete");
                            }
                            QuicEvent::Stream { stream_id, data, fin } => {
                                // Streams are accepted but opaque.
                                tracing::trace!(session = %session.key, stream_id, len = data.len(), fin, "ignoring QUIC stream data");
                            }
                        }
                    }
                }
                Err(e) => {
                    tracing::warn!(session = %session.key, error = %e, "QUIC session failed");
                    fatal = true;
                }
            }
        } else {
            match session.adapter.feed(data, now_ms) {
                Ok(mut out) => outputs.append(&mut out),
                Err(e) => {
                    tracing::warn!(session = %session.key, error = %e, "adapter rejected datagram");
                    fatal = true;
                }
            }
        }

        session.sync_error_counters();
        Self::process_outputs(session, outputs).await;
        fatal
    }

    async fn process_outputs(session: &mut Session, outputs: Vec<AdapterOutput>) {
        for output in outputs {
            match output {
                AdapterOutput::Frame(frame) => {
                    let is_video = frame.codec.is_video();
                    session.stats.counters.record_frame(is_video, frame.keyframe, false);
                    session.global.record_frame(is_video, frame.keyframe, false);
                    session
                        .stats
                        .mark_first_frame(chrono::Utc::now().timestamp_millis());

                    session.stats.counters.record_zero_copy(!frame.payload.is_empty());
                    session.global.record_zero_copy(!frame.payload.is_empty());

                    if let Some(jitter) = &session.jitter {
                        let accepted = jitter.push(frame).is_ok();
                        session.stats.counters.record_jitter(accepted);
                        session.global.record_jitter(accepted);
                    } else if session.hub_tx.send(frame).await.is_err() {
                        tracing::warn!(session = %session.key, "hub channel closed, dropping frame");
                        session.stats.counters.record_frame(is_video, false, true);
                    }
                }
                AdapterOutput::StreamStarted(stream_id) => {
                    tracing::info!(session = %session.key, stream = %stream_id, "stream started");
                }
                AdapterOutput::StreamStopped => {
                    tracing::info!(session = %session.key, "stream stopped");
                }
            }
        }
    }

    fn create_session(
        &self,
        key: &str,
        peer: SocketAddr,
        now_ms: i64,
    ) -> Result<Session, crate::adapter::AdapterError> {
        let stream_id = self
            .config
            .route
            .stream_for_port(self.config.server.listen_port);
        let init = AdapterInit {
            connection_id: key.to_string(),
            stream_id: stream_id.clone(),
        };
        let adapter = global_registry().create(&self.config.protocol.name, &init)?;

        let quic = if self.config.quic.enabled {
            let socket = self.socket.clone();
            let send_packet = Box::new(move |pkt: &[u8], addr: SocketAddr| {
                if let Err(e) = socket.try_send_to(pkt, addr) {
                    tracing::trace!(peer = %addr, error = %e, "outbound QUIC packet dropped");
                }
            });
            Some(QuicSessionWrapper::new(
                peer,
                Box::new(PassthroughHandshake::default()),
                send_packet,
            ))
        } else {
            None
        };

        let stats = self.stats.add_connection(
            key,
            &self.config.protocol.name,
            &stream_id.to_string(),
            key,
        );
        let hub_tx = self.hub.acquire(&stream_id);

        let (jitter, publisher_handle) = if self.config.jitter.enabled {
            let jitter = Arc::new(JitterBuffer::new(self.config.jitter_config()));
            let handle = spawn_publisher(jitter.clone(), hub_tx.clone(), key.to_string());
            (Some(jitter), Some(handle))
        } else {
            (None, None)
        };

        tracing::info!(
            peer = %key,
            protocol = %self.config.protocol.name,
            stream = %stream_id,
            "created ingest session"
        );

        Ok(Session {
            key: key.to_string(),
            adapter,
            quic,
            jitter,
            publisher_handle,
            hub_tx,
            stats,
            global: self.stats.global(),
            last_activity_ms: now_ms,
            mirrored_errors: (0, 0, 0),
        })
    }

    /// Periodic sweep: expire idle sessions and drive every session's
    /// repair, reorder and heartbeat deadlines.
    async fn sweep(&mut self, now_ms: i64) {
        let timeout = self.config.limits.session_timeout_ms;
        let expired: Vec<String> = self
            .sessions
            .values()
            .filter(|s| now_ms - s.last_activity_ms > timeout)
            .map(|s| s.key.clone())
            .collect();
        for key in expired {
            self.teardown_session(&key, now_ms, "idle timeout").await;
        }

        let keys: Vec<String> = self.sessions.keys().cloned().collect();
        for key in keys {
            if let Some(session) = self.sessions.get_mut(&key) {
                let outputs = session.adapter.tick(now_ms);
                Self::process_outputs(session, outputs).await;
            }
        }
    }

    async fn teardown_session(&mut self, key: &str, now_ms: i64, reason: &str) {
        let Some(mut session) = self.sessions.remove(key) else {
            return;
        };
        tracing::info!(session = %key, reason, "closing ingest session");

        let outputs = session.adapter.close(now_ms);
        Self::process_outputs(&mut session, outputs).await;

        if let Some(quic) = session.quic.as_mut() {
            quic.close();
        }
        if let Some(jitter) = &session.jitter {
            jitter.close();
        }
        if let Some(handle) = session.publisher_handle.take() {
            let _ = handle.join();
        }
        self.stats.remove_connection(key);
    }

    pub fn session_count(&self) -> usize {
        self.sessions.len()
    }
}

/// Publisher thread: pops frames in DTS order and pushes them to the
/// hub, blocking when the hand-off queue is full.
fn spawn_publisher(
    jitter: Arc<JitterBuffer>,
    hub_tx: FramePublisher,
    session_key: String,
) -> std::thread::JoinHandle<()> {
    std::thread::spawn(move || {
        loop {
            match jitter.pop(Duration::from_millis(100)) {
                Ok(frame) => {
                    if hub_tx.blocking_send(frame).is_err() {
                        tracing::warn!(session = %session_key, "hub closed, stopping publisher");
                        break;
                    }
                }
                Err(JitterError::Timeout) => continue,
                Err(JitterError::Closed) => break,
            }
        }
        tracing::debug!(session = %session_key, "publisher thread stopped");
    })
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::adapter::register_builtin_adapters;
    use crate::frame::Codec;
    use crate::framed::FramedConfig;
    use crate::hub::ChannelHub;
    use crate::quicfec::QuicFecConfig;

    fn test_config() -> Config {
        let mut config = Config::default();
        config.server.listen_address = "127.0.0.1".into();
        config.server.listen_port = 0;
        config.protocol.name = "framed".into();
        config.jitter.enabled = false;
        config
    }

    fn encode_framed_keyframe(timestamp_us: u64, payload: &[u8]) -> Vec<u8> {
        let mut buf = Vec::new();
        buf.extend_from_slice(&crate::framed::FRAMED_MAGIC.to_be_bytes());
        buf.extend_from_slice(&(payload.len() as u32).to_be_bytes());
        buf.push(0); // video
        buf.push(0); // H264
        buf.extend_from_slice(&timestamp_us.to_be_bytes());
        buf.push(0x01); // keyframe
        buf.extend_from_slice(&640u32.to_be_bytes());
        buf.extend_from_slice(&360u32.to_be_bytes());
        buf.extend_from_slice(&0u32.to_be_bytes());
        buf.extend_from_slice(&0u32.to_be_bytes());
        buf.push(0);
        buf.extend_from_slice(payload);
        buf
    }

    #[tokio::test]
    async fn test_end_to_end_framed_datagram() {
        register_builtin_adapters(FramedConfig::default(), QuicFecConfig::default());

        let config = Arc::new(test_config());
        let (hub, mut rx) = ChannelHub::new(16);
        let dispatcher = UdpDispatcher::bind(config, Arc::new(hub)).await.unwrap();
        let addr = dispatcher.local_addr().unwrap();

        let (shutdown_tx, _) = broadcast::channel(1);
        let handle = tokio::spawn(dispatcher.run(shutdown_tx.subscribe()));

        let client = UdpSocket::bind("127.0.0.1:0").await.unwrap();
        client
            .send_to(&encode_framed_keyframe(1_000_000, &[0xAA, 0xBB]), addr)
            .await
            .unwrap();

        let frame = tokio::time::timeout(Duration::from_secs(2), rx.recv())
            .await
            .expect("frame within deadline")
            .expect("hub open");
        assert_eq!(frame.codec, Codec::H264);
        assert!(frame.keyframe);
        assert_eq!(frame.dts_ms, 0);
        assert_eq!(frame.payload, vec![0, 0, 0, 1, 0xAA, 0xBB]);

        let _ = shutdown_tx.send(());
        let _ = handle.await;
    }

    #[tokio::test]
    async fn test_session_cap_rejects_new_peers() {
        register_builtin_adapters(FramedConfig::default(), QuicFecConfig::default());

        let mut config = test_config();
        config.limits.max_sessions = 1;
        let (hub, _rx) = ChannelHub::new(16);
        let mut dispatcher = UdpDispatcher::bind(Arc::new(config), Arc::new(hub))
            .await
            .unwrap();

        let peer_a: SocketAddr = "10.0.0.1:1000".parse().unwrap();
        let peer_b: SocketAddr = "10.0.0.2:1000".parse().unwrap();
        dispatcher
            .handle_datagram(&encode_framed_keyframe(0, &[1]), peer_a)
            .await;
        dispatcher
            .handle_datagram(&encode_framed_keyframe(0, &[2]), peer_b)
            .await;

        assert_eq!(dispatcher.session_count(), 1);
    }

    #[tokio::test]
    async fn test_bad_magic_tears_session_down() {
        register_builtin_adapters(FramedConfig::default(), QuicFecConfig::default());

        let (hub, _rx) = ChannelHub::new(16);
        let mut dispatcher = UdpDispatcher::bind(Arc::new(test_config()), Arc::new(hub))
            .await
            .unwrap();

        let peer: SocketAddr = "10.0.0.1:1000".parse().unwrap();
        dispatcher
            .handle_datagram(&encode_framed_keyframe(0, &[1]), peer)
            .await;
        assert_eq!(dispatcher.session_count(), 1);

        dispatcher
            .handle_datagram(&[0xDE, 0xAD, 0xBE, 0xEF, 0, 0, 0, 0, 0, 0, 0, 0, 0, 0, 0, 0, 0, 0, 0, 0, 0, 0, 0, 0, 0, 0, 0, 0, 0, 0, 0, 0, 0, 0, 0, 0], peer)
            .await;
        assert_eq!(dispatcher.session_count(), 0);
    }

}
