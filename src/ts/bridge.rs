//! TS demux bridge
//!
//! Feeds aligned transport-stream packets through the demuxer and turns
//! completed H.264/H.265/AAC PES packets into canonical frames: Annex-B
//! NAL splitting, parameter-set latching with in-band sequence headers,
//! IDR/IRAP keyframe marking, and ADTS stripping with a one-time audio
//! configuration frame.

use crate::frame::{ts90k_to_ms, CanonicalFrame, Codec, StreamId};
use crate::params::{ParameterSetKind, ParameterSetStore};

use super::demux::{PesPacket, TsDemuxer, TsStreamType};

const ADTS_SAMPLE_RATES: [u32; 16] = [
    96_000, 88_200, 64_000, 48_000, 44_100, 32_000, 24_000, 22_050, 16_000, 12_000, 11_025, 8_000,
    7_350, 0, 0, 0,
];

#[derive(Debug, Clone, Copy, Default, serde::Serialize)]
pub struct TsBridgeStats {
    pub frames: u64,
    pub parse_errors: u64,
    pub codec_errors: u64,
    pub dropped_before_params: u64,
}

/// Stateful converter from TS packets to canonical frames for one session.
pub struct TsSourceBridge {
    demux: TsDemuxer,
    params: ParameterSetStore,
    stream_id: StreamId,
    hot_start: bool,

    h264_sps: Option<Vec<u8>>,
    h264_pps: Option<Vec<u8>>,
    h264_changed: bool,
    h264_sent: bool,

    h265_vps: Option<Vec<u8>>,
    h265_sps: Option<Vec<u8>>,
    h265_pps: Option<Vec<u8>>,
    h265_changed: bool,
    h265_sent: bool,

    aac_config_sent: bool,

    stats: TsBridgeStats,
}

impl TsSourceBridge {
    pub fn new(stream_id: StreamId, hot_start: bool) -> Self {
        Self {
            demux: TsDemuxer::new(),
            params: ParameterSetStore::new(),
            stream_id,
            hot_start,
            h264_sps: None,
            h264_pps: None,
            h264_changed: false,
            h264_sent: false,
            h265_vps: None,
            h265_sps: None,
            h265_pps: None,
            h265_changed: false,
            h265_sent: false,
            aac_config_sent: false,
            stats: TsBridgeStats::default(),
        }
    }

    pub fn stats(&self) -> TsBridgeStats {
        self.stats
    }

    pub fn parameter_sets(&self) -> &ParameterSetStore {
        &self.params
    }

    /// Consume aligned 188-byte packets, producing canonical frames.
    /// Per-packet parse failures are counted and swallowed.
    pub fn push_packets(&mut self, packets: &[Vec<u8>], now_ms: i64) -> Vec<CanonicalFrame> {
        let mut frames = Vec::new();
        for packet in packets {
            match self.demux.push_packet(packet) {
                Ok(messages) => {
                    for pes in messages {
                        self.on_pes_message(&pes, now_ms, &mut frames);
                    }
                }
                Err(e) => {
                    self.stats.parse_errors += 1;
                    tracing::warn!(error = %e, "TS packet dropped");
                }
            }
        }
        self.stats.frames += frames.len() as u64;
        frames
    }

    /// Emit whatever the demuxer still holds, for teardown.
    pub fn finish(&mut self, now_ms: i64) -> Vec<CanonicalFrame> {
        let mut frames = Vec::new();
        for pes in self.demux.flush() {
            self.on_pes_message(&pes, now_ms, &mut frames);
        }
        self.stats.frames += frames.len() as u64;
        frames
    }

    fn on_pes_message(&mut self, pes: &PesPacket, now_ms: i64, frames: &mut Vec<CanonicalFrame>) {
        match pes.stream_type {
            TsStreamType::H264 => self.on_video(pes, Codec::H264, now_ms, frames),
            TsStreamType::H265 => self.on_video(pes, Codec::H265, now_ms, frames),
            TsStreamType::AacAdts => self.on_audio(pes, now_ms, frames),
            TsStreamType::Other(st) => {
                self.stats.codec_errors += 1;
                tracing::warn!(pid = pes.pid, stream_type = st, "unsupported TS stream codec");
            }
        }
    }

    fn on_video(
        &mut self,
        pes: &PesPacket,
        codec: Codec,
        now_ms: i64,
        frames: &mut Vec<CanonicalFrame>,
    ) {
        let dts = ts90k_to_ms(pes.dts_90k.unwrap_or(0));
        let pts = match pes.pts_90k {
            Some(p) if p > 0 => ts90k_to_ms(p),
            _ => dts,
        };

        for nal in split_annexb(&pes.payload) {
            if nal.is_empty() {
                continue;
            }
            match codec {
                Codec::H264 => self.on_h264_nal(nal, dts, pts, now_ms, frames),
                Codec::H265 => self.on_h265_nal(nal, dts, pts, now_ms, frames),
                _ => unreachable!(),
            }
        }
    }

    fn on_h264_nal(
        &mut self,
        nal: &[u8],
        dts: i64,
        pts: i64,
        now_ms: i64,
        frames: &mut Vec<CanonicalFrame>,
    ) {
        let nal_type = nal[0] & 0x1F;
        match nal_type {
            9 | 6 => return, // access unit delimiter, SEI
            7 => {
                if self.h264_sps.as_deref() != Some(nal) {
                    self.params
                        .update(Codec::H264, ParameterSetKind::Sps, nal.to_vec(), now_ms);
                    self.h264_sps = Some(nal.to_vec());
                    self.h264_changed = true;
                }
                self.maybe_emit_h264_header(dts, pts, frames);
                return;
            }
            8 => {
                if self.h264_pps.as_deref() != Some(nal) {
                    self.params
                        .update(Codec::H264, ParameterSetKind::Pps, nal.to_vec(), now_ms);
                    self.h264_pps = Some(nal.to_vec());
                    self.h264_changed = true;
                }
                self.maybe_emit_h264_header(dts, pts, frames);
                return;
            }
            _ => {}
        }

        if !self.h264_sent {
            self.stats.dropped_before_params += 1;
            return;
        }

        let keyframe = nal_type == 5;
        if keyframe && self.hot_start {
            self.reemit_parameter_sets(Codec::H264, dts, pts, frames);
        }
        frames.push(self.video_frame(Codec::H264, dts, pts, keyframe, annexb(nal)));
    }

    fn on_h265_nal(
        &mut self,
        nal: &[u8],
        dts: i64,
        pts: i64,
        now_ms: i64,
        frames: &mut Vec<CanonicalFrame>,
    ) {
        let nal_type = (nal[0] >> 1) & 0x3F;
        match nal_type {
            35 | 39 | 40 => return, // access unit delimiter, SEI
            32 => {
                if self.h265_vps.as_deref() != Some(nal) {
                    self.params
                        .update(Codec::H265, ParameterSetKind::Vps, nal.to_vec(), now_ms);
                    self.h265_vps = Some(nal.to_vec());
                    self.h265_changed = true;
                }
                self.maybe_emit_h265_header(dts, pts, frames);
                return;
            }
            33 => {
                if self.h265_sps.as_deref() != Some(nal) {
                    self.params
                        .update(Codec::H265, ParameterSetKind::Sps, nal.to_vec(), now_ms);
                    self.h265_sps = Some(nal.to_vec());
                    self.h265_changed = true;
                }
                self.maybe_emit_h265_header(dts, pts, frames);
                return;
            }
            34 => {
                if self.h265_pps.as_deref() != Some(nal) {
                    self.params
                        .update(Codec::H265, ParameterSetKind::Pps, nal.to_vec(), now_ms);
                    self.h265_pps = Some(nal.to_vec());
                    self.h265_changed = true;
                }
                self.maybe_emit_h265_header(dts, pts, frames);
                return;
            }
            _ => {}
        }

        if !self.h265_sent {
            self.stats.dropped_before_params += 1;
            return;
        }

        // Intra random access pictures span NAL types 16 through 23.
        let keyframe = (16..=23).contains(&nal_type);
        if keyframe && self.hot_start {
            self.reemit_parameter_sets(Codec::H265, dts, pts, frames);
        }
        frames.push(self.video_frame(Codec::H265, dts, pts, keyframe, annexb(nal)));
    }

    fn maybe_emit_h264_header(&mut self, dts: i64, pts: i64, frames: &mut Vec<CanonicalFrame>) {
        if !self.h264_changed {
            return;
        }
        let (Some(sps), Some(pps)) = (&self.h264_sps, &self.h264_pps) else {
            return;
        };
        let mut payload = annexb(sps);
        payload.extend(annexb(pps));
        frames.push(self.video_frame(Codec::H264, dts, pts, true, payload));
        self.h264_changed = false;
        self.h264_sent = true;
    }

    fn maybe_emit_h265_header(&mut self, dts: i64, pts: i64, frames: &mut Vec<CanonicalFrame>) {
        if !self.h265_changed {
            return;
        }
        let (Some(vps), Some(sps), Some(pps)) = (&self.h265_vps, &self.h265_sps, &self.h265_pps)
        else {
            return;
        };
        let mut payload = annexb(vps);
        payload.extend(annexb(sps));
        payload.extend(annexb(pps));
        frames.push(self.video_frame(Codec::H265, dts, pts, true, payload));
        self.h265_changed = false;
        self.h265_sent = true;
    }

    fn reemit_parameter_sets(
        &self,
        codec: Codec,
        dts: i64,
        pts: i64,
        frames: &mut Vec<CanonicalFrame>,
    ) {
        for set in self.params.snapshot() {
            if set.kind == ParameterSetKind::AudioConfig {
                continue;
            }
            frames.push(self.video_frame(codec, dts, pts, true, annexb(&set.data)));
        }
    }

    fn on_audio(&mut self, pes: &PesPacket, now_ms: i64, frames: &mut Vec<CanonicalFrame>) {
        let dts = ts90k_to_ms(pes.dts_90k.unwrap_or(0));
        let data = &pes.payload;
        let mut pos = 0;

        while pos + 7 <= data.len() {
            let b = &data[pos..];
            if b[0] != 0xFF || b[1] & 0xF0 != 0xF0 {
                self.stats.parse_errors += 1;
                tracing::warn!(pid = pes.pid, "lost ADTS sync inside PES payload");
                break;
            }
            let protection_absent = b[1] & 0x01 != 0;
            let header_len = if protection_absent { 7 } else { 9 };
            let profile = (b[2] >> 6) & 0x3;
            let sample_rate_index = ((b[2] >> 2) & 0x0F) as usize;
            let channels = u32::from((b[2] & 0x1) << 2 | b[3] >> 6);
            let frame_len =
                (usize::from(b[3] & 0x03) << 11) | (usize::from(b[4]) << 3) | usize::from(b[5] >> 5);

            if frame_len < header_len || pos + frame_len > data.len() {
                self.stats.parse_errors += 1;
                tracing::warn!(pid = pes.pid, frame_len, "truncated ADTS frame");
                break;
            }

            let sample_rate = ADTS_SAMPLE_RATES[sample_rate_index];

            if !self.aac_config_sent {
                // AudioSpecificConfig synthesized from the first header.
                let object_type = profile + 1;
                let asc = vec![
                    (object_type << 3) | (sample_rate_index as u8 >> 1),
                    ((sample_rate_index as u8 & 0x1) << 7) | ((channels as u8) << 3),
                ];
                self.params
                    .update(Codec::Aac, ParameterSetKind::AudioConfig, asc.clone(), now_ms);
                let mut config = CanonicalFrame::new(Codec::Aac, dts, dts);
                config.stream_id = self.stream_id.to_string();
                config.set_audio_params(sample_rate, channels);
                config.payload = asc;
                frames.push(config);
                self.aac_config_sent = true;
            }

            let raw = data[pos + header_len..pos + frame_len].to_vec();
            if !raw.is_empty() {
                let mut frame = CanonicalFrame::new(Codec::Aac, dts, dts);
                frame.stream_id = self.stream_id.to_string();
                frame.set_audio_params(sample_rate, channels);
                frame.payload = raw;
                frames.push(frame);
            }
            pos += frame_len;
        }
    }

    fn video_frame(
        &self,
        codec: Codec,
        dts: i64,
        pts: i64,
        keyframe: bool,
        payload: Vec<u8>,
    ) -> CanonicalFrame {
        let mut frame = CanonicalFrame::new(codec, dts, pts);
        frame.stream_id = self.stream_id.to_string();
        frame.keyframe = keyframe;
        frame.payload = payload;
        frame
    }
}

/// Split an Annex-B elementary stream into NAL units, start codes removed.
fn split_annexb(data: &[u8]) -> Vec<&[u8]> {
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

fn annexb(nal: &[u8]) -> Vec<u8> {
    let mut out = Vec::with_capacity(nal.len() + 4);
    out.extend_from_slice(&[0, 0, 0, 1]);
    out.extend_from_slice(nal);
    out
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::ts::testutil::{mux_pat, mux_pes, mux_pmt};

    fn stream_id() -> StreamId {
        StreamId::new("__defaultVhost__", "live", "test")
    }

    fn pat_pmt(bridge: &mut TsSourceBridge, streams: &[(u8, u16)]) {
        let packets = vec![mux_pat(0x1000).to_vec(), mux_pmt(0x1000, streams).to_vec()];
        assert!(bridge.push_packets(&packets, 0).is_empty());
    }

    fn h264_au(nals: &[&[u8]]) -> Vec<u8> {
        let mut payload = Vec::new();
        for nal in nals {
            payload.extend_from_slice(&[0, 0, 0, 1]);
            payload.extend_from_slice(nal);
        }
        payload
    }

    const SPS: &[u8] = &[0x67, 0x42, 0xC0, 0x1E];
    const PPS: &[u8] = &[0x68, 0xCE, 0x3C, 0x80];
    const IDR: &[u8] = &[0x65, 0x88, 0x84, 0x00];
    const SLICE: &[u8] = &[0x41, 0x9A, 0x02, 0x04];

    fn push_h264(bridge: &mut TsSourceBridge, pts: i64, dts: i64, payload: &[u8]) -> Vec<CanonicalFrame> {
        let packets: Vec<Vec<u8>> = mux_pes(0x0100, 0xE0, Some(pts), Some(dts), payload)
            .into_iter()
            .map(|p| p.to_vec())
            .collect();
        bridge.push_packets(&packets, 0)
    }

    #[test]
    fn test_slice_before_parameters_dropped() {
        let mut bridge = TsSourceBridge::new(stream_id(), false);
        pat_pmt(&mut bridge, &[(0x1B, 0x0100)]);

        let frames = push_h264(&mut bridge, 90_000, 90_000, &h264_au(&[SLICE]));
        assert!(frames.is_empty());
        assert_eq!(bridge.stats().parse_errors, 0);
        assert_eq!(bridge.stats().dropped_before_params, 1);
    }

    #[test]
    fn test_sequence_header_then_keyframe() {
        let mut bridge = TsSourceBridge::new(stream_id(), false);
        pat_pmt(&mut bridge, &[(0x1B, 0x0100)]);

        let frames = push_h264(&mut bridge, 90_000, 90_000, &h264_au(&[SPS, PPS, IDR]));
        assert_eq!(frames.len(), 2);

        // First the in-band sequence header, then the IDR frame.
        let header = &frames[0];
        assert!(header.keyframe);
        assert_eq!(header.payload, h264_au(&[SPS, PPS]));

        let idr = &frames[1];
        assert!(idr.keyframe);
        assert_eq!(idr.dts_ms, 1000);
        assert_eq!(idr.payload, h264_au(&[IDR]));
    }

    #[test]
    fn test_sequence_header_sent_once_per_change() {
        let mut bridge = TsSourceBridge::new(stream_id(), false);
        pat_pmt(&mut bridge, &[(0x1B, 0x0100)]);

        push_h264(&mut bridge, 0, 0, &h264_au(&[SPS, PPS, IDR]));
        let frames = push_h264(&mut bridge, 3_600, 3_600, &h264_au(&[SPS, PPS, SLICE]));
        // Unchanged SPS/PPS produce no second header.
        assert_eq!(frames.len(), 1);
        assert!(!frames[0].keyframe);
    }

    #[test]
    fn test_aud_and_sei_dropped() {
        let mut bridge = TsSourceBridge::new(stream_id(), false);
        pat_pmt(&mut bridge, &[(0x1B, 0x0100)]);
        push_h264(&mut bridge, 0, 0, &h264_au(&[SPS, PPS, IDR]));

        let aud: &[u8] = &[0x09, 0xF0];
        let sei: &[u8] = &[0x06, 0x05, 0x01];
        let frames = push_h264(&mut bridge, 3_600, 3_600, &h264_au(&[aud, sei, SLICE]));
        assert_eq!(frames.len(), 1);
        assert_eq!(frames[0].payload, h264_au(&[SLICE]));
    }

    #[test]
    fn test_h265_header_requires_all_three() {
        let mut bridge = TsSourceBridge::new(stream_id(), false);
        pat_pmt(&mut bridge, &[(0x24, 0x0100)]);

        let vps: &[u8] = &[32 << 1, 0x01];
        let sps: &[u8] = &[33 << 1, 0x01];
        let pps: &[u8] = &[34 << 1, 0x01];
        let irap: &[u8] = &[19 << 1, 0x01, 0xAA]; // IDR_W_RADL

        let frames = push_h264(&mut bridge, 0, 0, &h264_au(&[vps, sps]));
        assert!(frames.is_empty());

        let frames = push_h264(&mut bridge, 3_600, 3_600, &h264_au(&[pps, irap]));
        assert_eq!(frames.len(), 2);
        assert!(frames[0].keyframe); // vps+sps+pps header
        assert!(frames[1].keyframe); // IRAP
        assert_eq!(frames[1].codec, Codec::H265);
    }

    #[test]
    fn test_aac_adts_strip_and_config() {
        let mut bridge = TsSourceBridge::new(stream_id(), false);
        pat_pmt(&mut bridge, &[(0x0F, 0x0101)]);

        // AAC LC, 44.1 kHz, 2 channels, one 16-byte frame.
        let body = [0u8; 9];
        let frame_len = 7 + body.len();
        let mut adts = vec![
            0xFF,
            0xF1, // MPEG-4, no CRC
            0x50, // profile LC (01), freq index 4
            0x80 | ((frame_len >> 11) as u8 & 0x3),
            ((frame_len >> 3) & 0xFF) as u8,
            (((frame_len & 0x7) as u8) << 5) | 0x1F,
            0xFC,
        ];
        adts.extend_from_slice(&body);

        let packets: Vec<Vec<u8>> = mux_pes(0x0101, 0xC0, Some(90_000), None, &adts)
            .into_iter()
            .map(|p| p.to_vec())
            .collect();
        let frames = bridge.push_packets(&packets, 0);

        assert_eq!(frames.len(), 2);
        let config = &frames[0];
        assert_eq!(config.codec, Codec::Aac);
        assert_eq!(config.sample_rate, 44_100);
        assert_eq!(config.channels, 2);
        assert_eq!(config.payload, vec![0x12, 0x10]);

        let raw = &frames[1];
        assert_eq!(raw.payload.len(), body.len());
        assert_eq!(raw.dts_ms, 1000);

        // Config is one-time.
        let packets: Vec<Vec<u8>> = mux_pes(0x0101, 0xC0, Some(94_500), None, &adts)
            .into_iter()
            .map(|p| p.to_vec())
            .collect();
        let frames = bridge.push_packets(&packets, 0);
        assert_eq!(frames.len(), 1);
    }

    #[test]
    fn test_hot_start_reemits_parameters_on_keyframe() {
        let mut bridge = TsSourceBridge::new(stream_id(), true);
        pat_pmt(&mut bridge, &[(0x1B, 0x0100)]);

        push_h264(&mut bridge, 0, 0, &h264_au(&[SPS, PPS, IDR]));
        let frames = push_h264(&mut bridge, 7_200, 7_200, &h264_au(&[IDR]));

        // SPS and PPS frames precede the keyframe.
        assert_eq!(frames.len(), 3);
        assert_eq!(frames[0].payload, h264_au(&[SPS]));
        assert_eq!(frames[1].payload, h264_au(&[PPS]));
        assert_eq!(frames[2].payload, h264_au(&[IDR]));
    }

    #[test]
    fn test_split_annexb_variants() {
        let data = h264_au(&[SPS, SLICE]);
        let nals = split_annexb(&data);
        assert_eq!(nals.len(), 2);
        assert_eq!(nals[0], SPS);
        assert_eq!(nals[1], SLICE);

        // Three-byte start codes.
        let mut short = vec![0, 0, 1];
        short.extend_from_slice(SPS);
        short.extend_from_slice(&[0, 0, 1]);
        short.extend_from_slice(PPS);
        let nals = split_annexb(&short);
        assert_eq!(nals.len(), 2);
        assert_eq!(nals[0], SPS);
        assert_eq!(nals[1], PPS);
    }
}
