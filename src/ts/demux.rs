//! MPEG-TS demuxer
//!
//! A stateful parser over aligned 188-byte packets: follows PAT and PMT
//! to discover elementary streams, then reassembles PES packets per PID.
//! Encoders that omit the PES length get a bounded force-flush so a
//! never-ending video PES cannot buffer without limit.

use std::collections::HashMap;

use thiserror::Error;

use crate::reorder::TS_PACKET_SIZE;

const TS_SYNC_BYTE: u8 = 0x47;

/// Emit an unbounded-length PES message once this much payload has
/// accumulated (about seven packets).
const FORCE_FLUSH_BYTES: usize = 1300;

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum TsStreamType {
    H264,
    H265,
    AacAdts,
    Other(u8),
}

impl TsStreamType {
    fn from_byte(b: u8) -> Self {
        match b {
            0x1B => TsStreamType::H264,
            0x24 => TsStreamType::H265,
            0x0F => TsStreamType::AacAdts,
            other => TsStreamType::Other(other),
        }
    }

    pub fn is_supported(&self) -> bool {
        !matches!(self, TsStreamType::Other(_))
    }
}

#[derive(Debug, Error)]
pub enum TsError {
    #[error("TS packet is {len} bytes, expected {expected}")]
    NotAligned { len: usize, expected: usize },

    #[error("bad TS sync byte 0x{byte:02x}")]
    BadSync { byte: u8 },

    #[error("PES start indicated but header is truncated")]
    TruncatedPesHeader,

    #[error("bad PES start code {0:02x?}")]
    BadPesStartCode([u8; 3]),
}

/// One reassembled PES packet.
#[derive(Debug)]
pub struct PesPacket {
    pub pid: u16,
    pub stream_type: TsStreamType,
    /// 90 kHz units.
    pub pts_90k: Option<i64>,
    /// 90 kHz units.
    pub dts_90k: Option<i64>,
    pub payload: Vec<u8>,
}

#[derive(Debug, PartialEq)]
enum PesState {
    Idle,
    Accumulating,
}

/// Per-PID reassembly state, including the per-PID force-flush counter.
struct PesChannel {
    stream_type: TsStreamType,
    state: PesState,
    pts_90k: Option<i64>,
    dts_90k: Option<i64>,
    /// Expected payload bytes, 0 when the PES length field was 0.
    expected: usize,
    payload: Vec<u8>,
}

impl PesChannel {
    fn new(stream_type: TsStreamType) -> Self {
        Self {
            stream_type,
            state: PesState::Idle,
            pts_90k: None,
            dts_90k: None,
            expected: 0,
            payload: Vec::new(),
        }
    }

    fn take_message(&mut self, pid: u16) -> PesPacket {
        PesPacket {
            pid,
            stream_type: self.stream_type,
            pts_90k: self.pts_90k,
            dts_90k: self.dts_90k,
            payload: std::mem::take(&mut self.payload),
        }
    }
}

#[derive(Default)]
pub struct TsDemuxer {
    pmt_pid: Option<u16>,
    channels: HashMap<u16, PesChannel>,
}

impl TsDemuxer {
    pub fn new() -> Self {
        Self::default()
    }

    /// Feed one aligned TS packet; returns any PES packets it completed.
    pub fn push_packet(&mut self, packet: &[u8]) -> Result<Vec<PesPacket>, TsError> {
        if packet.len() != TS_PACKET_SIZE {
            return Err(TsError::NotAligned {
                len: packet.len(),
                expected: TS_PACKET_SIZE,
            });
        }
        if packet[0] != TS_SYNC_BYTE {
            return Err(TsError::BadSync { byte: packet[0] });
        }

        let pusi = packet[1] & 0x40 != 0;
        let pid = u16::from(packet[1] & 0x1F) << 8 | u16::from(packet[2]);
        let afc = (packet[3] >> 4) & 0x3;

        let mut offset = 4;
        if afc & 0x2 != 0 {
            let af_len = packet[4] as usize;
            offset += 1 + af_len;
        }
        if afc & 0x1 == 0 || offset >= TS_PACKET_SIZE {
            return Ok(Vec::new());
        }
        let payload = &packet[offset..];

        if pid == 0 {
            self.parse_pat(payload, pusi);
            return Ok(Vec::new());
        }
        if Some(pid) == self.pmt_pid {
            self.parse_pmt(payload, pusi);
            return Ok(Vec::new());
        }

        if self.channels.contains_key(&pid) {
            return self.push_es_payload(pid, payload, pusi);
        }
        Ok(Vec::new())
    }

    /// Emit any pending unbounded-length PES messages, for teardown.
    pub fn flush(&mut self) -> Vec<PesPacket> {
        let mut out = Vec::new();
        for (&pid, channel) in self.channels.iter_mut() {
            if channel.state == PesState::Accumulating
                && channel.expected == 0
                && !channel.payload.is_empty()
            {
                out.push(channel.take_message(pid));
                channel.state = PesState::Idle;
            }
        }
        out
    }

    pub fn stream_type(&self, pid: u16) -> Option<TsStreamType> {
        self.channels.get(&pid).map(|c| c.stream_type)
    }

    fn parse_pat(&mut self, payload: &[u8], pusi: bool) {
        let Some(section) = psi_section(payload, pusi, 0x00) else {
            return;
        };
        // Program loop sits after the 8-byte section header and before
        // the 4-byte CRC.
        if section.len() < 12 {
            return;
        }
        let loop_bytes = &section[8..section.len() - 4];
        for entry in loop_bytes.chunks_exact(4) {
            let program = u16::from(entry[0]) << 8 | u16::from(entry[1]);
            let pid = u16::from(entry[2] & 0x1F) << 8 | u16::from(entry[3]);
            if program != 0 {
                if self.pmt_pid != Some(pid) {
                    tracing::debug!(pmt_pid = pid, "PAT selected program map PID");
                }
                self.pmt_pid = Some(pid);
                break;
            }
        }
    }

    fn parse_pmt(&mut self, payload: &[u8], pusi: bool) {
        let Some(section) = psi_section(payload, pusi, 0x02) else {
            return;
        };
        if section.len() < 16 {
            return;
        }
        let program_info_len = (usize::from(section[10] & 0x0F) << 8) | usize::from(section[11]);
        let mut pos = 12 + program_info_len;
        let end = section.len().saturating_sub(4);

        while pos + 5 <= end {
            let stream_type = TsStreamType::from_byte(section[pos]);
            let pid = u16::from(section[pos + 1] & 0x1F) << 8 | u16::from(section[pos + 2]);
            let es_info_len =
                (usize::from(section[pos + 3] & 0x0F) << 8) | usize::from(section[pos + 4]);
            pos += 5 + es_info_len;

            if !self.channels.contains_key(&pid) {
                tracing::debug!(pid, ?stream_type, "PMT registered elementary stream");
                self.channels.insert(pid, PesChannel::new(stream_type));
            }
        }
    }

    fn push_es_payload(
        &mut self,
        pid: u16,
        payload: &[u8],
        pusi: bool,
    ) -> Result<Vec<PesPacket>, TsError> {
        let mut out = Vec::new();
        let Some(channel) = self.channels.get_mut(&pid) else {
            return Ok(out);
        };

        if pusi {
            // A new PES header closes any unbounded-length message still
            // accumulating on this PID.
            if channel.state == PesState::Accumulating
                && channel.expected == 0
                && !channel.payload.is_empty()
            {
                out.push(channel.take_message(pid));
            }

            if payload.len() < 9 {
                channel.state = PesState::Idle;
                return Err(TsError::TruncatedPesHeader);
            }
            if payload[0] != 0 || payload[1] != 0 || payload[2] != 1 {
                channel.state = PesState::Idle;
                return Err(TsError::BadPesStartCode([payload[0], payload[1], payload[2]]));
            }

            let pes_length = usize::from(payload[4]) << 8 | usize::from(payload[5]);
            let pts_dts_flags = payload[7] >> 6;
            let header_len = usize::from(payload[8]);
            let header_end = 9 + header_len;
            if payload.len() < header_end {
                channel.state = PesState::Idle;
                return Err(TsError::TruncatedPesHeader);
            }

            channel.pts_90k = None;
            channel.dts_90k = None;
            if pts_dts_flags & 0x2 != 0 && header_len >= 5 {
                channel.pts_90k = parse_pes_timestamp(&payload[9..14]);
                channel.dts_90k = channel.pts_90k;
            }
            if pts_dts_flags == 0x3 && header_len >= 10 {
                channel.dts_90k = parse_pes_timestamp(&payload[14..19]);
            }

            // PES_packet_length counts everything after itself; the
            // elementary payload excludes the 3 flag bytes and the header.
            channel.expected = pes_length.saturating_sub(3 + header_len);
            channel.payload.clear();
            channel.payload.extend_from_slice(&payload[header_end..]);
            channel.state = PesState::Accumulating;
        } else if channel.state == PesState::Accumulating {
            channel.payload.extend_from_slice(payload);
        } else {
            return Ok(out);
        }

        if channel.expected > 0 && channel.payload.len() >= channel.expected {
            channel.payload.truncate(channel.expected);
            out.push(channel.take_message(pid));
            channel.state = PesState::Idle;
        } else if channel.expected == 0 && channel.payload.len() >= FORCE_FLUSH_BYTES {
            // Keep the timestamps: the next chunk continues the same
            // elementary stream until a new header arrives.
            out.push(channel.take_message(pid));
        }

        Ok(out)
    }
}

/// Strip the pointer field and check the table id of a PSI section.
fn psi_section(payload: &[u8], pusi: bool, table_id: u8) -> Option<&[u8]> {
    let section = if pusi {
        let pointer = *payload.first()? as usize;
        payload.get(1 + pointer..)?
    } else {
        payload
    };
    if *section.first()? != table_id || section.len() < 3 {
        return None;
    }
    let section_len = (usize::from(section[1] & 0x0F) << 8) | usize::from(section[2]);
    section.get(..(3 + section_len).min(section.len()))
}

/// Decode the 33-bit timestamp spread over five marker-laced bytes.
fn parse_pes_timestamp(b: &[u8]) -> Option<i64> {
    if b.len() < 5 {
        return None;
    }
    let ts = (i64::from(b[0] & 0x0E) << 29)
        | (i64::from(b[1]) << 22)
        | (i64::from(b[2] & 0xFE) << 14)
        | (i64::from(b[3]) << 7)
        | (i64::from(b[4]) >> 1);
    Some(ts)
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::ts::testutil::{mux_pat, mux_pes, mux_pmt};

    #[test]
    fn test_pat_pmt_discovery() {
        let mut demux = TsDemuxer::new();
        demux.push_packet(&mux_pat(0x1000)).unwrap();
        demux
            .push_packet(&mux_pmt(0x1000, &[(0x1B, 0x0100), (0x0F, 0x0101)]))
            .unwrap();

        assert_eq!(demux.stream_type(0x0100), Some(TsStreamType::H264));
        assert_eq!(demux.stream_type(0x0101), Some(TsStreamType::AacAdts));
    }

    #[test]
    fn test_single_packet_pes() {
        let mut demux = TsDemuxer::new();
        demux.push_packet(&mux_pat(0x1000)).unwrap();
        demux
            .push_packet(&mux_pmt(0x1000, &[(0x1B, 0x0100)]))
            .unwrap();

        let payload = vec![0u8, 0, 0, 1, 0x65, 0xAA, 0xBB];
        let packets = mux_pes(0x0100, 0xE0, Some(90_000), Some(88_200), &payload);
        let mut messages = Vec::new();
        for pkt in &packets {
            messages.extend(demux.push_packet(pkt).unwrap());
        }

        assert_eq!(messages.len(), 1);
        let msg = &messages[0];
        assert_eq!(msg.pts_90k, Some(90_000));
        assert_eq!(msg.dts_90k, Some(88_200));
        assert_eq!(msg.payload, payload);
    }

    #[test]
    fn test_multi_packet_pes() {
        let mut demux = TsDemuxer::new();
        demux.push_packet(&mux_pat(0x1000)).unwrap();
        demux
            .push_packet(&mux_pmt(0x1000, &[(0x1B, 0x0100)]))
            .unwrap();

        let payload: Vec<u8> = (0..400u16).map(|v| v as u8).collect();
        let packets = mux_pes(0x0100, 0xE0, Some(0), None, &payload);
        assert!(packets.len() > 2);

        let mut messages = Vec::new();
        for pkt in &packets {
            messages.extend(demux.push_packet(pkt).unwrap());
        }
        assert_eq!(messages.len(), 1);
        assert_eq!(messages[0].payload, payload);
    }

    #[test]
    fn test_unknown_pid_ignored() {
        let mut demux = TsDemuxer::new();
        demux.push_packet(&mux_pat(0x1000)).unwrap();
        demux
            .push_packet(&mux_pmt(0x1000, &[(0x1B, 0x0100)]))
            .unwrap();

        let packets = mux_pes(0x0200, 0xE0, Some(0), None, &[1, 2, 3]);
        for pkt in &packets {
            assert!(demux.push_packet(pkt).unwrap().is_empty());
        }
    }

    #[test]
    fn test_bad_sync_rejected() {
        let mut demux = TsDemuxer::new();
        let mut pkt = [0u8; TS_PACKET_SIZE];
        pkt[0] = 0x48;
        assert!(matches!(
            demux.push_packet(&pkt),
            Err(TsError::BadSync { byte: 0x48 })
        ));
        assert!(matches!(
            demux.push_packet(&[0u8; 10]),
            Err(TsError::NotAligned { .. })
        ));
    }

    #[test]
    fn test_timestamp_parse() {
        // 90000 = 0x00015F90 encoded with marker bits.
        let pts: i64 = 90_000;
        let b = [
            0x21 | (((pts >> 30) & 0x7) as u8) << 1,
            ((pts >> 22) & 0xFF) as u8,
            0x01 | (((pts >> 15) & 0x7F) as u8) << 1,
            ((pts >> 7) & 0xFF) as u8,
            0x01 | ((pts & 0x7F) as u8) << 1,
        ];
        assert_eq!(parse_pes_timestamp(&b), Some(pts));
    }

    #[test]
    fn test_unbounded_pes_force_flush() {
        let mut demux = TsDemuxer::new();
        demux.push_packet(&mux_pat(0x1000)).unwrap();
        demux
            .push_packet(&mux_pmt(0x1000, &[(0x1B, 0x0100)]))
            .unwrap();

        // 2000 bytes with a zero PES length: the demuxer must emit before
        // the stream ends.
        let payload: Vec<u8> = (0..2000u32).map(|v| v as u8).collect();
        let packets = crate::ts::testutil::mux_pes_unbounded(0x0100, 0xE0, Some(0), &payload);

        let mut messages = Vec::new();
        for pkt in &packets {
            messages.extend(demux.push_packet(pkt).unwrap());
        }
        messages.extend(demux.flush());

        assert!(messages.len() >= 2);
        let total: usize = messages.iter().map(|m| m.payload.len()).sum();
        assert_eq!(total, payload.len());
        let joined: Vec<u8> = messages.iter().flat_map(|m| m.payload.clone()).collect();
        assert_eq!(joined, payload);
    }
}
