//! Framed protocol adapter
//!
//! Parses the custom header+payload wire protocol: a 36-byte big-endian
//! header followed by the frame payload. Handles base-timestamp
//! normalization, B-frame PTS synthesis, Annex-B and ADTS payload
//! normalization, the keyframe start gate and the heartbeat pause.

use thiserror::Error;

use crate::adapter::AdapterOutput;
use crate::frame::{CanonicalFrame, Codec, StreamId};
use crate::params::{ParameterSetKind, ParameterSetStore};

pub const FRAMED_MAGIC: u32 = 0x1234_5678;
pub const FRAMED_HEADER_LEN: usize = 36;
pub const MAX_PAYLOAD_LEN: u32 = 1024 * 1024;

#[derive(Debug, Clone, Copy)]
pub struct FramedConfig {
    /// PTS offset synthesized for B-frames.
    pub b_frame_delay_ms: i64,
    /// Silence threshold before a stop-of-stream event.
    pub heartbeat_interval_ms: i64,
    /// Drop non-keyframe B-frames after accounting.
    pub low_latency_drop_b: bool,
    /// Emit frames before the first keyframe and re-send parameter sets
    /// on every keyframe.
    pub hot_start: bool,
}

impl Default for FramedConfig {
    fn default() -> Self {
        Self {
            b_frame_delay_ms: 40,
            heartbeat_interval_ms: 5000,
            low_latency_drop_b: false,
            hot_start: false,
        }
    }
}

/// Decode failures that poison the connection.
#[derive(Debug, Error, PartialEq)]
pub enum FramedError {
    #[error("bad frame magic 0x{0:08x}")]
    BadMagic(u32),

    #[error("frame payload length {0} exceeds limit")]
    PayloadTooLarge(u32),
}

#[derive(Debug, Clone, Copy, Default, serde::Serialize)]
pub struct FramedStats {
    pub total_frames: u64,
    pub video_frames: u64,
    pub audio_frames: u64,
    pub keyframes: u64,
    pub b_frames: u64,
    pub invalid_timestamps: u64,
    pub codec_errors: u64,
    pub dropped_b_frames: u64,
    pub parameter_set_updates: u64,
}

#[derive(Debug, Clone, Copy)]
struct FrameHeader {
    length: u32,
    frame_type: u8,
    codec: u8,
    timestamp_us: u64,
    flags: u8,
    width: u32,
    height: u32,
    sample_rate: u32,
    channels: u32,
}

#[derive(Debug, PartialEq)]
enum ParseState {
    Header,
    Payload,
}

pub struct FramedAdapter {
    config: FramedConfig,
    stream_id: StreamId,

    state: ParseState,
    input: Vec<u8>,
    header: Option<FrameHeader>,
    payload: Vec<u8>,

    params: ParameterSetStore,
    stream_started: bool,
    base_timestamp_ms: Option<i64>,
    last_dts_ms: i64,
    last_frame_wallclock_ms: Option<i64>,

    stats: FramedStats,
}

impl FramedAdapter {
    pub fn new(stream_id: StreamId, config: FramedConfig) -> Self {
        Self {
            config,
            stream_id,
            state: ParseState::Header,
            input: Vec::new(),
            header: None,
            payload: Vec::new(),
            params: ParameterSetStore::new(),
            stream_started: false,
            base_timestamp_ms: None,
            last_dts_ms: 0,
            last_frame_wallclock_ms: None,
            stats: FramedStats::default(),
        }
    }

    pub fn stats(&self) -> FramedStats {
        self.stats
    }

    pub fn parameter_sets(&self) -> &ParameterSetStore {
        &self.params
    }

    pub fn is_started(&self) -> bool {
        self.stream_started
    }

    /// Heartbeat sweep: pause the stream after prolonged silence. The
    /// next keyframe starts it again.
    pub fn tick(&mut self, now_ms: i64) -> Vec<AdapterOutput> {
        let mut out = Vec::new();
        if let Some(last) = self.last_frame_wallclock_ms {
            if self.config.heartbeat_interval_ms > 0
                && now_ms - last > self.config.heartbeat_interval_ms
                && self.stream_started
            {
                self.stream_started = false;
                tracing::warn!(
                    stream = %self.stream_id,
                    gap_ms = now_ms - last,
                    "heartbeat timeout, pausing stream until next keyframe"
                );
                out.push(AdapterOutput::StreamStopped);
            }
        }
        out
    }

    /// Consume bytes from the connection. Frames may span multiple calls
    /// and one call may complete several frames.
    pub fn feed(&mut self, data: &[u8], now_ms: i64) -> Result<Vec<AdapterOutput>, FramedError> {
        let mut out = self.tick(now_ms);

        self.input.extend_from_slice(data);

        loop {
            match self.state {
                ParseState::Header => {
                    if self.input.len() < FRAMED_HEADER_LEN {
                        break;
                    }
                    let header = self.parse_header()?;
                    self.input.drain(..FRAMED_HEADER_LEN);
                    self.payload.clear();
                    self.payload.reserve(header.length as usize);
                    self.header = Some(header);
                    self.state = ParseState::Payload;
                }
                ParseState::Payload => {
                    let Some(header) = self.header else {
                        self.state = ParseState::Header;
                        continue;
                    };
                    let needed = (header.length as usize).saturating_sub(self.payload.len());
                    let take = needed.min(self.input.len());
                    self.payload.extend(self.input.drain(..take));
                    if self.payload.len() < header.length as usize {
                        break;
                    }
                    self.header = None;
                    let payload = std::mem::take(&mut self.payload);
                    self.state = ParseState::Header;
                    self.complete_frame(header, payload, now_ms, &mut out);
                }
            }
        }

        Ok(out)
    }

    /// Emit the closing stream event.
    pub fn close(&mut self) -> Vec<AdapterOutput> {
        let mut out = Vec::new();
        if self.stream_started {
            self.stream_started = false;
            out.push(AdapterOutput::StreamStopped);
        }
        self.input.clear();
        self.payload.clear();
        self.state = ParseState::Header;
        self.params.clear();
        out
    }

    /// The 36-byte header: named fields cover 35 bytes, the last byte is
    /// reserved.
    fn parse_header(&self) -> Result<FrameHeader, FramedError> {
        let b = &self.input;
        let magic = read_u32(b, 0);
        if magic != FRAMED_MAGIC {
            return Err(FramedError::BadMagic(magic));
        }
        let length = read_u32(b, 4);
        if length > MAX_PAYLOAD_LEN {
            return Err(FramedError::PayloadTooLarge(length));
        }
        Ok(FrameHeader {
            length,
            frame_type: b[8],
            codec: b[9],
            timestamp_us: read_u64(b, 10),
            flags: b[18],
            width: read_u32(b, 19),
            height: read_u32(b, 23),
            sample_rate: read_u32(b, 27),
            channels: read_u32(b, 31),
        })
    }

    fn complete_frame(
        &mut self,
        header: FrameHeader,
        payload: Vec<u8>,
        now_ms: i64,
        out: &mut Vec<AdapterOutput>,
    ) {
        let timestamp_ms = (header.timestamp_us / 1000) as i64;
        let base = *self.base_timestamp_ms.get_or_insert(timestamp_ms);
        let dts_ms = timestamp_ms - base;

        let is_keyframe = header.flags & 0x01 != 0;
        let is_b_frame = header.flags & 0x02 != 0;

        let mut pts_ms = dts_ms;
        if is_b_frame {
            pts_ms = dts_ms + self.config.b_frame_delay_ms;
            self.stats.b_frames += 1;
        }

        if !self.validate_timestamps(dts_ms, pts_ms) {
            self.stats.invalid_timestamps += 1;
            tracing::warn!(dts_ms, pts_ms, last = self.last_dts_ms, "invalid frame timestamp");
            return;
        }

        let codec = match (header.frame_type, header.codec) {
            (0, 0) => Codec::H264,
            (0, 1) => Codec::H265,
            (1, 2) => Codec::Aac,
            (1, 3) => Codec::Opus,
            _ => {
                self.stats.codec_errors += 1;
                tracing::warn!(
                    frame_type = header.frame_type,
                    codec = header.codec,
                    "unknown codec id in frame header"
                );
                return;
            }
        };

        let mut frame = CanonicalFrame::new(codec, dts_ms, pts_ms);
        frame.stream_id = self.stream_id.to_string();
        if codec.is_video() {
            frame.set_video_params(header.width, header.height, is_keyframe);
        } else {
            let sample_rate = if header.sample_rate > 0 {
                header.sample_rate
            } else {
                codec.default_sample_rate()
            };
            frame.set_audio_params(sample_rate, header.channels);
        }
        frame.payload = normalize_payload(codec, payload);

        if frame.keyframe {
            self.latch_parameter_sets(&frame, now_ms);
        }

        if !self.stream_started {
            if self.config.hot_start || frame.keyframe {
                self.stream_started = true;
                out.push(AdapterOutput::StreamStarted(self.stream_id.clone()));
            } else {
                return; // withhold until the first keyframe
            }
        }

        if self.config.hot_start && frame.keyframe {
            self.resend_parameter_sets(&frame, out);
        }

        if is_b_frame && frame.pts_ms <= frame.dts_ms {
            frame.pts_ms = frame.dts_ms + self.config.b_frame_delay_ms;
        }

        if self.config.low_latency_drop_b && is_b_frame && !frame.keyframe {
            self.stats.dropped_b_frames += 1;
            return;
        }

        self.stats.total_frames += 1;
        if codec.is_video() {
            self.stats.video_frames += 1;
            if frame.keyframe {
                self.stats.keyframes += 1;
            }
        } else {
            self.stats.audio_frames += 1;
        }
        self.last_dts_ms = dts_ms;
        self.last_frame_wallclock_ms = Some(now_ms);

        out.push(AdapterOutput::Frame(frame));
    }

    fn validate_timestamps(&self, dts_ms: i64, pts_ms: i64) -> bool {
        if dts_ms < 0 || pts_ms < 0 {
            return false;
        }
        if self.last_dts_ms > 0 && dts_ms < self.last_dts_ms {
            return false;
        }
        pts_ms >= dts_ms
    }

    /// Scan a keyframe payload for parameter set NAL units and latch them.
    fn latch_parameter_sets(&mut self, frame: &CanonicalFrame, now_ms: i64) {
        if !frame.codec.is_video() || frame.payload.is_empty() {
            return;
        }
        for nal in split_annexb_units(&frame.payload) {
            if nal.is_empty() {
                continue;
            }
            let kind = match frame.codec {
                Codec::H264 => match nal[0] & 0x1F {
                    7 => Some(ParameterSetKind::Sps),
                    8 => Some(ParameterSetKind::Pps),
                    _ => None,
                },
                Codec::H265 => match (nal[0] >> 1) & 0x3F {
                    32 => Some(ParameterSetKind::Vps),
                    33 => Some(ParameterSetKind::Sps),
                    34 => Some(ParameterSetKind::Pps),
                    _ => None,
                },
                _ => None,
            };
            if let Some(kind) = kind {
                if self.params.update(frame.codec, kind, nal.to_vec(), now_ms) {
                    self.stats.parameter_set_updates += 1;
                }
            }
        }
    }

    /// In hot-start mode every keyframe is preceded by the latched
    /// parameter sets so late joiners can decode from it.
    fn resend_parameter_sets(&self, reference: &CanonicalFrame, out: &mut Vec<AdapterOutput>) {
        for set in self.params.snapshot() {
            if set.kind == ParameterSetKind::AudioConfig {
                continue;
            }
            let mut frame = CanonicalFrame::new(reference.codec, reference.dts_ms, reference.pts_ms);
            frame.stream_id = reference.stream_id.clone();
            frame.keyframe = true;
            frame.payload = {
                let mut p = vec![0, 0, 0, 1];
                p.extend_from_slice(&set.data);
                p
            };
            out.push(AdapterOutput::Frame(frame));
        }
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

/// Prepend an Annex-B start code for video payloads that lack one and
/// strip the ADTS header from AAC payloads that carry one.
fn normalize_payload(codec: Codec, payload: Vec<u8>) -> Vec<u8> {
    match codec {
        Codec::H264 | Codec::H265 => {
            let has_start_code = payload.starts_with(&[0, 0, 0, 1]) || payload.starts_with(&[0, 0, 1]);
            if has_start_code || payload.is_empty() {
                payload
            } else {
                let mut out = Vec::with_capacity(payload.len() + 4);
                out.extend_from_slice(&[0, 0, 0, 1]);
                out.extend_from_slice(&payload);
                out
            }
        }
        Codec::Aac => {
            if payload.len() >= 7 && payload[0] == 0xFF && payload[1] & 0xF0 == 0xF0 {
                let protection_absent = payload[1] & 0x01 != 0;
                let header_len = if protection_absent { 7 } else { 9 };
                if payload.len() > header_len {
                    payload[header_len..].to_vec()
                } else {
                    payload
                }
            } else {
                payload
            }
        }
        _ => payload,
    }
}

/// NAL units of an Annex-B buffer, start codes removed.
fn split_annexb_units(data: &[u8]) -> Vec<&[u8]> {
    let mut nals = Vec::new();
    let mut start = None;
    let mut i = 0;
    while i + 2 < data.len() {
        if data[i] == 0 && data[i + 1] == 0 && data[i + 2] == 1 {
            let code_start = if i > 0 && data[i - 1] == 0 { i - 1 } else { i };
            if let Some(s) = start {
                nals.push(&data[s..code_start]);
            }
            start = Some(i + 3);
            i += 3;
        } else {
            i += 1;
        }
    }
    if let Some(s) = start {
        nals.push(&data[s..]);
    }
    nals
}

#[cfg(test)]
mod tests {
    use super::*;

    fn stream_id() -> StreamId {
        StreamId::new("__defaultVhost__", "live", "cam")
    }

    fn adapter(config: FramedConfig) -> FramedAdapter {
        FramedAdapter::new(stream_id(), config)
    }

    pub fn encode_frame(
        frame_type: u8,
        codec: u8,
        timestamp_us: u64,
        flags: u8,
        width: u32,
        height: u32,
        sample_rate: u32,
        channels: u32,
        payload: &[u8],
    ) -> Vec<u8> {
        let mut buf = Vec::with_capacity(FRAMED_HEADER_LEN + payload.len());
        buf.extend_from_slice(&FRAMED_MAGIC.to_be_bytes());
        buf.extend_from_slice(&(payload.len() as u32).to_be_bytes());
        buf.push(frame_type);
        buf.push(codec);
        buf.extend_from_slice(&timestamp_us.to_be_bytes());
        buf.push(flags);
        buf.extend_from_slice(&width.to_be_bytes());
        buf.extend_from_slice(&height.to_be_bytes());
        buf.extend_from_slice(&sample_rate.to_be_bytes());
        buf.extend_from_slice(&channels.to_be_bytes());
        buf.push(0); // reserved
        buf.extend_from_slice(payload);
        buf
    }

    fn frames(outputs: &[AdapterOutput]) -> Vec<&CanonicalFrame> {
        outputs
            .iter()
            .filter_map(|o| match o {
                AdapterOutput::Frame(f) => Some(f),
                _ => None,
            })
            .collect()
    }

    #[test]
    fn test_clean_video_frame() {
        let mut a = adapter(FramedConfig::default());
        let bytes = encode_frame(0, 0, 1_000_000, 0x01, 640, 360, 0, 0, &[0xAA, 0xBB, 0xCC, 0xDD, 0xEE]);
        let out = a.feed(&bytes, 0).unwrap();

        assert!(matches!(out[0], AdapterOutput::StreamStarted(_)));
        let fs = frames(&out);
        assert_eq!(fs.len(), 1);
        let f = fs[0];
        assert_eq!(f.codec, Codec::H264);
        assert_eq!(f.dts_ms, 0);
        assert_eq!(f.pts_ms, 0);
        assert!(f.keyframe);
        assert_eq!(f.width, 640);
        assert_eq!(f.height, 360);
        assert_eq!(f.payload, vec![0, 0, 0, 1, 0xAA, 0xBB, 0xCC, 0xDD, 0xEE]);
    }

    #[test]
    fn test_b_frame_pts_synthesis() {
        let mut a = adapter(FramedConfig::default());
        a.feed(&encode_frame(0, 0, 0, 0x01, 0, 0, 0, 0, &[1, 2, 3]), 0)
            .unwrap();
        let out = a
            .feed(&encode_frame(0, 0, 40_000, 0x02, 0, 0, 0, 0, &[4, 5, 6]), 0)
            .unwrap();

        let fs = frames(&out);
        assert_eq!(fs.len(), 1);
        assert_eq!(fs[0].dts_ms, 40);
        assert_eq!(fs[0].pts_ms, 80);
    }

    #[test]
    fn test_bad_magic_is_fatal() {
        let mut a = adapter(FramedConfig::default());
        let mut bytes = encode_frame(0, 0, 0, 0x01, 0, 0, 0, 0, &[1]);
        bytes[0] = 0xDE;
        let err = a.feed(&bytes, 0).unwrap_err();
        assert!(matches!(err, FramedError::BadMagic(_)));
    }

    #[test]
    fn test_oversized_payload_is_fatal() {
        let mut a = adapter(FramedConfig::default());
        let mut bytes = encode_frame(0, 0, 0, 0x01, 0, 0, 0, 0, &[1]);
        bytes[4..8].copy_from_slice(&(MAX_PAYLOAD_LEN + 1).to_be_bytes());
        let err = a.feed(&bytes, 0).unwrap_err();
        assert_eq!(err, FramedError::PayloadTooLarge(MAX_PAYLOAD_LEN + 1));
    }

    #[test]
    fn test_split_feed_equals_whole_feed() {
        let bytes = [
            encode_frame(0, 0, 0, 0x01, 0, 0, 0, 0, &[1, 2, 3]),
            encode_frame(0, 0, 40_000, 0x00, 0, 0, 0, 0, &[4, 5]),
        ]
        .concat();

        let mut whole = adapter(FramedConfig::default());
        let out_whole = whole.feed(&bytes, 0).unwrap();

        let mut split = adapter(FramedConfig::default());
        let mut out_split = Vec::new();
        for chunk in bytes.chunks(7) {
            out_split.extend(split.feed(chunk, 0).unwrap());
        }

        let (a, b) = (frames(&out_whole), frames(&out_split));
        assert_eq!(a.len(), 2);
        assert_eq!(b.len(), 2);
        for (x, y) in a.iter().zip(&b) {
            assert_eq!(x.dts_ms, y.dts_ms);
            assert_eq!(x.payload, y.payload);
        }
    }

    #[test]
    fn test_waits_for_keyframe_by_default() {
        let mut a = adapter(FramedConfig::default());
        let out = a
            .feed(&encode_frame(0, 0, 0, 0x00, 0, 0, 0, 0, &[1, 2]), 0)
            .unwrap();
        assert!(out.is_empty());
        assert!(!a.is_started());

        let out = a
            .feed(&encode_frame(0, 0, 40_000, 0x01, 0, 0, 0, 0, &[3, 4]), 0)
            .unwrap();
        assert!(matches!(out[0], AdapterOutput::StreamStarted(_)));
        assert_eq!(frames(&out).len(), 1);
    }

    #[test]
    fn test_hot_start_emits_immediately() {
        let mut a = adapter(FramedConfig {
            hot_start: true,
            ..Default::default()
        });
        let out = a
            .feed(&encode_frame(0, 0, 0, 0x00, 0, 0, 0, 0, &[1, 2]), 0)
            .unwrap();
        assert!(matches!(out[0], AdapterOutput::StreamStarted(_)));
        assert_eq!(frames(&out).len(), 1);
    }

    #[test]
    fn test_backwards_dts_rejected() {
        let mut a = adapter(FramedConfig::default());
        a.feed(&encode_frame(0, 0, 0, 0x01, 0, 0, 0, 0, &[1]), 0)
            .unwrap();
        a.feed(&encode_frame(0, 0, 80_000, 0x00, 0, 0, 0, 0, &[2]), 0)
            .unwrap();
        let out = a
            .feed(&encode_frame(0, 0, 40_000, 0x00, 0, 0, 0, 0, &[3]), 0)
            .unwrap();
        assert!(frames(&out).is_empty());
        assert_eq!(a.stats().invalid_timestamps, 1);
    }

    #[test]
    fn test_heartbeat_pause_and_keyframe_resume() {
        let mut a = adapter(FramedConfig::default());
        a.feed(&encode_frame(0, 0, 0, 0x01, 0, 0, 0, 0, &[1]), 0)
            .unwrap();
        assert!(a.is_started());

        let out = a.tick(5_001);
        assert!(matches!(out[0], AdapterOutput::StreamStopped));
        assert!(!a.is_started());

        // Non-keyframes stay withheld while paused.
        let out = a
            .feed(&encode_frame(0, 0, 6_000_000, 0x00, 0, 0, 0, 0, &[2]), 6_000)
            .unwrap();
        assert!(frames(&out).is_empty());

        let out = a
            .feed(&encode_frame(0, 0, 6_100_000, 0x01, 0, 0, 0, 0, &[3]), 6_100)
            .unwrap();
        assert!(matches!(out[0], AdapterOutput::StreamStarted(_)));
    }

    #[test]
    fn test_low_latency_drops_b_frames() {
        let mut a = adapter(FramedConfig {
            low_latency_drop_b: true,
            ..Default::default()
        });
        a.feed(&encode_frame(0, 0, 0, 0x01, 0, 0, 0, 0, &[1]), 0)
            .unwrap();
        let out = a
            .feed(&encode_frame(0, 0, 40_000, 0x02, 0, 0, 0, 0, &[2]), 0)
            .unwrap();
        assert!(frames(&out).is_empty());
        assert_eq!(a.stats().dropped_b_frames, 1);
    }

    #[test]
    fn test_aac_adts_stripped() {
        let mut a = adapter(FramedConfig {
            hot_start: true,
            ..Default::default()
        });
        let mut adts = vec![0xFF, 0xF1, 0x50, 0x80, 0x01, 0x3F, 0xFC];
        adts.extend_from_slice(&[0xDE, 0xAD]);
        let out = a
            .feed(&encode_frame(1, 2, 0, 0x00, 0, 0, 44_100, 2, &adts), 0)
            .unwrap();

        let fs = frames(&out);
        assert_eq!(fs.len(), 1);
        assert_eq!(fs[0].codec, Codec::Aac);
        assert_eq!(fs[0].payload, vec![0xDE, 0xAD]);
        assert_eq!(fs[0].sample_rate, 44_100);
    }

    #[test]
    fn test_annexb_passthrough() {
        let mut a = adapter(FramedConfig::default());
        let payload = [0u8, 0, 0, 1, 0x65, 0x11];
        let out = a
            .feed(&encode_frame(0, 0, 0, 0x01, 0, 0, 0, 0, &payload), 0)
            .unwrap();
        assert_eq!(frames(&out)[0].payload, payload.to_vec());
    }

    #[test]
    fn test_hot_start_resends_parameter_sets() {
        let mut a = adapter(FramedConfig {
            hot_start: true,
            ..Default::default()
        });
        let key_payload = [
            &[0u8, 0, 0, 1, 0x67, 0x42][..],
            &[0, 0, 0, 1, 0x68, 0xCE][..],
            &[0, 0, 0, 1, 0x65, 0x88][..],
        ]
        .concat();
        a.feed(&encode_frame(0, 0, 0, 0x01, 0, 0, 0, 0, &key_payload), 0)
            .unwrap();

        let out = a
            .feed(&encode_frame(0, 0, 2_000_000, 0x01, 0, 0, 0, 0, &[0, 0, 0, 1, 0x65, 0x99]), 0)
            .unwrap();
        let fs = frames(&out);
        // SPS and PPS frames precede the keyframe itself.
        assert_eq!(fs.len(), 3);
        assert_eq!(fs[0].payload, vec![0, 0, 0, 1, 0x67, 0x42]);
        assert_eq!(fs[1].payload, vec![0, 0, 0, 1, 0x68, 0xCE]);
        assert!(fs[2].keyframe);
    }

    #[test]
    fn test_opus_passthrough() {
        let mut a = adapter(FramedConfig {
            hot_start: true,
            ..Default::default()
        });
        let out = a
            .feed(&encode_frame(1, 3, 0, 0x00, 0, 0, 0, 2, &[0x0B, 0x0C]), 0)
            .unwrap();
        let fs = frames(&out);
        assert_eq!(fs[0].codec, Codec::Opus);
        assert_eq!(fs[0].payload, vec![0x0B, 0x0C]);
        assert_eq!(fs[0].sample_rate, 48_000);
    }
}
