//! QUIC+FEC transport-stream adapter
//!
//! Terminates the datagram side of one ingest session: detects whether
//! the peer sends bare MPEG-TS or the FEC-framed flavor, routes shards
//! through the repair manager and reorder buffer, and feeds the aligned
//! packets into the TS demux bridge.
//!
//! Inner framing after QUIC datagram delivery, all integers big-endian:
//! `[seq u64][group_id u32][block_index u16][flags u8][reserved u8][payload]`.

use crate::adapter::AdapterOutput;
use crate::fec::{FecError, FecGroupConfig, FecRepairManager};
use crate::frame::{CanonicalFrame, StreamId};
use crate::reorder::{ReorderBuffer, ReorderConfig, TS_PACKET_SIZE};
use crate::ts::TsSourceBridge;

const INNER_HEADER_LEN: usize = 16;
const FLAG_PARITY: u8 = 0x01;
const FLAG_KEYFRAME: u8 = 0x02;

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum TransportMode {
    Detecting,
    BareTs,
    QuicFec,
}

#[derive(Debug, Clone, Copy)]
pub struct QuicFecConfig {
    pub fec: FecGroupConfig,
    pub reorder: ReorderConfig,
    pub enable_protocol_detection: bool,
    pub detection_timeout_ms: i64,
    /// Mode assumed when detection is disabled or times out.
    pub default_mode: TransportMode,
    /// Re-emit parameter sets on keyframes in the TS bridge.
    pub hot_start: bool,
}

impl Default for QuicFecConfig {
    fn default() -> Self {
        Self {
            fec: FecGroupConfig::default(),
            reorder: ReorderConfig::default(),
            enable_protocol_detection: true,
            detection_timeout_ms: 1000,
            default_mode: TransportMode::QuicFec,
            hot_start: false,
        }
    }
}

#[derive(Debug, Clone, Copy, Default, serde::Serialize)]
pub struct QuicFecStats {
    pub total_packets: u64,
    pub quic_packets: u64,
    pub bare_ts_packets: u64,
    pub invalid_packets: u64,
    pub fec_repaired_packets: u64,
    pub reordered_packets: u64,
}

pub struct QuicFecTsAdapter {
    config: QuicFecConfig,
    mode: TransportMode,
    detect_started_ms: Option<i64>,

    fec: FecRepairManager,
    reorder: ReorderBuffer,
    bridge: TsSourceBridge,

    /// Accumulation buffer for the bare-TS arm.
    input: Vec<u8>,
    /// Frames produced by the bare-TS arm, drained by the next pump.
    pending_frames: Vec<CanonicalFrame>,
    /// Continuous sequence handed to the reorder stage; the per-shard
    /// transport sequence is not contiguous after repair.
    handoff_seq: u64,
    stream_id: StreamId,
    stream_started: bool,

    stats: QuicFecStats,
}

impl QuicFecTsAdapter {
    pub fn new(stream_id: StreamId, config: QuicFecConfig) -> Self {
        let mode = if config.enable_protocol_detection {
            TransportMode::Detecting
        } else {
            config.default_mode
        };
        Self {
            config,
            mode,
            detect_started_ms: None,
            fec: FecRepairManager::new(config.fec),
            reorder: ReorderBuffer::new(config.reorder),
            bridge: TsSourceBridge::new(stream_id.clone(), config.hot_start),
            input: Vec::new(),
            pending_frames: Vec::new(),
            handoff_seq: 0,
            stream_id,
            stream_started: false,
            stats: QuicFecStats::default(),
        }
    }

    pub fn mode(&self) -> TransportMode {
        self.mode
    }

    pub fn stats(&self) -> QuicFecStats {
        self.stats
    }

    pub fn fec_stats(&self) -> crate::fec::FecStats {
        self.fec.stats()
    }

    pub fn reorder_stats(&self) -> crate::reorder::ReorderStats {
        self.reorder.stats()
    }

    pub fn bridge_stats(&self) -> crate::ts::TsBridgeStats {
        self.bridge.stats()
    }

    /// Feed one datagram payload. Per-packet failures are counted and
    /// tolerated; only the session-level caller decides teardown.
    pub fn feed(&mut self, data: &[u8], now_ms: i64) -> Vec<AdapterOutput> {
        self.stats.total_packets += 1;

        if self.mode == TransportMode::Detecting {
            self.detect_protocol(data, now_ms);
            if self.mode == TransportMode::Detecting {
                // Still undecided; this sample is unusable either way.
                self.stats.invalid_packets += 1;
                return Vec::new();
            }
        }

        match self.mode {
            TransportMode::BareTs => {
                self.stats.bare_ts_packets += 1;
                self.handle_bare_ts(data, now_ms);
            }
            TransportMode::QuicFec => {
                self.stats.quic_packets += 1;
                self.handle_fec_shard(data, now_ms);
            }
            TransportMode::Detecting => unreachable!(),
        }

        self.pump(now_ms)
    }

    /// Periodic sweep: run repair deadlines and the reorder window even
    /// when no new datagram arrived.
    pub fn tick(&mut self, now_ms: i64) -> Vec<AdapterOutput> {
        self.pump(now_ms)
    }

    /// Flush pending state and emit the closing event.
    pub fn close(&mut self, now_ms: i64) -> Vec<AdapterOutput> {
        let mut out = self.pump(now_ms);
        for frame in self.bridge.finish(now_ms) {
            out.push(AdapterOutput::Frame(frame));
        }
        self.input.clear();
        self.reorder.clear();
        if self.stream_started {
            self.stream_started = false;
            out.push(AdapterOutput::StreamStopped);
        }
        out
    }

    /// One-shot protocol detection on the first usable sample:
    /// TS sync bytes pick bare-TS, a QUIC long-header bit or a plausible
    /// inner framing picks QUIC+FEC, anything else waits for more bytes
    /// until the detection timeout selects the configured default.
    fn detect_protocol(&mut self, data: &[u8], now_ms: i64) {
        let started = *self.detect_started_ms.get_or_insert(now_ms);

        if data.len() >= 4 {
            if data[0] == 0x47
                && (data.len() < 2 * TS_PACKET_SIZE || data[TS_PACKET_SIZE] == 0x47)
            {
                tracing::info!(stream = %self.stream_id, "protocol detected: bare TS");
                self.mode = TransportMode::BareTs;
                return;
            }
            if data[0] & 0x80 != 0 {
                tracing::info!(stream = %self.stream_id, "protocol detected: QUIC+FEC (long header)");
                self.mode = TransportMode::QuicFec;
                return;
            }
            if data.len() >= INNER_HEADER_LEN {
                let seq = read_u64(data, 0);
                let group = read_u32(data, 8);
                if seq != 0 || group != 0 {
                    tracing::info!(stream = %self.stream_id, "protocol detected: QUIC+FEC (inner framing)");
                    self.mode = TransportMode::QuicFec;
                    return;
                }
            }
        }

        if now_ms - started >= self.config.detection_timeout_ms {
            tracing::warn!(
                stream = %self.stream_id,
                timeout_ms = self.config.detection_timeout_ms,
                "protocol detection timed out, falling back to default mode"
            );
            self.mode = self.config.default_mode;
        }
    }

    fn handle_bare_ts(&mut self, data: &[u8], now_ms: i64) {
        self.input.extend_from_slice(data);

        // Drop noise ahead of the first sync byte.
        if let Some(sync) = self.input.iter().position(|&b| b == 0x47) {
            if sync > 0 {
                self.input.drain(..sync);
            }
        } else {
            self.input.clear();
            return;
        }

        let whole = self.input.len() / TS_PACKET_SIZE * TS_PACKET_SIZE;
        if whole == 0 {
            return;
        }
        let packets: Vec<Vec<u8>> = self.input[..whole]
            .chunks_exact(TS_PACKET_SIZE)
            .map(|c| c.to_vec())
            .collect();
        self.input.drain(..whole);

        let frames = self.bridge.push_packets(&packets, now_ms);
        self.pending_frames.extend(frames);
    }

    fn handle_fec_shard(&mut self, data: &[u8], now_ms: i64) {
        if data.len() < INNER_HEADER_LEN {
            self.stats.invalid_packets += 1;
            tracing::warn!(len = data.len(), "FEC datagram below minimum framing size");
            return;
        }

        let seq = read_u64(data, 0);
        let group_id = read_u32(data, 8);
        let block_index = u32::from(u16::from_be_bytes([data[12], data[13]]));
        let flags = data[14];
        let is_parity = flags & FLAG_PARITY != 0;
        let is_keyframe = flags & FLAG_KEYFRAME != 0;

        if seq == 0 && group_id == 0 {
            self.stats.invalid_packets += 1;
            tracing::warn!("dropping FEC datagram with zero sequence and group");
            return;
        }

        let payload = &data[INNER_HEADER_LEN..];
        if payload.is_empty() {
            self.stats.invalid_packets += 1;
            tracing::warn!(seq, group_id, "dropping FEC datagram with empty payload");
            return;
        }

        if let Err(e) = self.fec.insert(
            group_id,
            block_index,
            payload.to_vec(),
            is_parity,
            now_ms,
            seq,
            is_keyframe,
        ) {
            match e {
                FecError::Backpressure { .. } => {
                    self.stats.invalid_packets += 1;
                    tracing::warn!(group_id, error = %e, "FEC insert refused");
                }
                other => {
                    self.stats.invalid_packets += 1;
                    tracing::warn!(group_id, block_index, error = %other, "bad FEC shard");
                }
            }
        }
    }

    /// Drive repair and reorder, then hand aligned packets to the bridge.
    fn pump(&mut self, now_ms: i64) -> Vec<AdapterOutput> {
        let recovered = self.fec.check_and_repair(now_ms);
        if !recovered.is_empty() {
            self.stats.fec_repaired_packets += recovered.len() as u64;
        }
        for shard in recovered {
            self.handoff_seq += 1;
            let seq = self.handoff_seq;
            if let Err(e) = self.reorder.add(seq, shard.payload, now_ms, shard.is_keyframe) {
                tracing::warn!(seq, error = %e, "reorder refused recovered shard");
            }
        }

        let packets = self.reorder.drain(now_ms);
        if !packets.is_empty() {
            self.stats.reordered_packets += packets.len() as u64;
        }

        let mut frames = std::mem::take(&mut self.pending_frames);
        if !packets.is_empty() {
            frames.extend(self.bridge.push_packets(&packets, now_ms));
        }

        let mut out = Vec::new();
        for frame in frames {
            if !self.stream_started {
                self.stream_started = true;
                out.push(AdapterOutput::StreamStarted(self.stream_id.clone()));
            }
            out.push(AdapterOutput::Frame(frame));
        }
        out
    }
}

fn read_u32(b: &[u8], off: usize) -> u32 {
    u32::from_be_bytes([b[off], b[off + 1], b[off + 2], b[off + 3]])
}

fn read_u64(b: &[u8], off: usize) -> u64 {
    let mut buf = [0u8; 8];
    buf.copy_from_slice(&b[off..off + 8]);
    u64::from_be_bytes(buf)
}

/// Build the inner framing for one shard, used by senders and tests.
pub fn encode_shard(
    seq: u64,
    group_id: u32,
    block_index: u16,
    is_parity: bool,
    is_keyframe: bool,
    payload: &[u8],
) -> Vec<u8> {
    let mut flags = 0u8;
    if is_parity {
        flags |= FLAG_PARITY;
    }
    if is_keyframe {
        flags |= FLAG_KEYFRAME;
    }
    let mut out = Vec::with_capacity(INNER_HEADER_LEN + payload.len());
    out.extend_from_slice(&seq.to_be_bytes());
    out.extend_from_slice(&group_id.to_be_bytes());
    out.extend_from_slice(&block_index.to_be_bytes());
    out.push(flags);
    out.push(0);
    out.extend_from_slice(payload);
    out
}
