//! Canonical media frame
//!
//! The normalized frame representation handed to the downstream media hub:
//! codec id, millisecond DTS/PTS, keyframe flag, dimensions or audio
//! parameters, routing key and payload bytes.

use serde::Serialize;

/// Codec identifier for a canonical frame.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize)]
pub enum Codec {
    H264,
    H265,
    Aac,
    Opus,
    PcmAlaw,
    PcmUlaw,
}

impl Codec {
    pub fn as_str(&self) -> &'static str {
        match self {
            Codec::H264 => "H264",
            Codec::H265 => "H265",
            Codec::Aac => "AAC",
            Codec::Opus => "OPUS",
            Codec::PcmAlaw => "PCM_ALAW",
            Codec::PcmUlaw => "PCM_ULAW",
        }
    }

    pub fn is_video(&self) -> bool {
        matches!(self, Codec::H264 | Codec::H265)
    }

    pub fn is_audio(&self) -> bool {
        !self.is_video()
    }

    /// Default sample rate assumed when the wire protocol does not carry one.
    pub fn default_sample_rate(&self) -> u32 {
        match self {
            Codec::Aac => 44_100,
            Codec::Opus => 48_000,
            Codec::PcmAlaw | Codec::PcmUlaw => 8_000,
            _ => 0,
        }
    }
}

impl std::fmt::Display for Codec {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.write_str(self.as_str())
    }
}

/// Routing key for a logical stream: `vhost/app/stream`.
#[derive(Debug, Clone, PartialEq, Eq, Hash, Serialize)]
pub struct StreamId {
    pub vhost: String,
    pub app: String,
    pub stream: String,
}

impl StreamId {
    pub fn new(vhost: impl Into<String>, app: impl Into<String>, stream: impl Into<String>) -> Self {
        Self {
            vhost: vhost.into(),
            app: app.into(),
            stream: stream.into(),
        }
    }
}

impl std::fmt::Display for StreamId {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        write!(f, "{}/{}/{}", self.vhost, self.app, self.stream)
    }
}

/// A normalized audio or video frame.
///
/// Invariants: `pts_ms >= dts_ms` when `has_pts`, and `dts_ms` is
/// non-decreasing within a stream once the base timestamp has been
/// subtracted. The payload is Annex-B for H.264/H.265 and raw (ADTS
/// stripped) for AAC. Parameter-set frames may carry an empty payload
/// check via [`CanonicalFrame::is_valid`].
#[derive(Debug, Clone)]
pub struct CanonicalFrame {
    pub codec: Codec,
    pub dts_ms: i64,
    pub pts_ms: i64,
    pub has_pts: bool,
    pub keyframe: bool,
    pub width: u32,
    pub height: u32,
    pub sample_rate: u32,
    pub channels: u32,
    pub stream_id: String,
    pub payload: Vec<u8>,
}

impl CanonicalFrame {
    pub fn new(codec: Codec, dts_ms: i64, pts_ms: i64) -> Self {
        Self {
            codec,
            dts_ms,
            pts_ms,
            has_pts: true,
            keyframe: false,
            width: 0,
            height: 0,
            sample_rate: 0,
            channels: 0,
            stream_id: String::new(),
            payload: Vec::new(),
        }
    }

    pub fn with_stream_id(mut self, id: &StreamId) -> Self {
        self.stream_id = id.to_string();
        self
    }

    pub fn set_video_params(&mut self, width: u32, height: u32, keyframe: bool) {
        self.width = width;
        self.height = height;
        self.keyframe = keyframe;
    }

    pub fn set_audio_params(&mut self, sample_rate: u32, channels: u32) {
        self.sample_rate = sample_rate;
        self.channels = channels;
    }

    pub fn is_valid(&self) -> bool {
        if self.payload.is_empty() {
            return false;
        }
        if self.has_pts && self.pts_ms < self.dts_ms {
            return false;
        }
        true
    }

    pub fn size(&self) -> usize {
        self.payload.len()
    }
}

/// 90 kHz transport timestamp to milliseconds.
pub fn ts90k_to_ms(ts_90k: i64) -> i64 {
    ts_90k / 90
}

/// Milliseconds to 90 kHz transport timestamp.
pub fn ms_to_ts90k(ms: i64) -> i64 {
    ms * 90
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_codec_classification() {
        assert!(Codec::H264.is_video());
        assert!(Codec::H265.is_video());
        assert!(Codec::Aac.is_audio());
        assert!(Codec::Opus.is_audio());
        assert!(!Codec::PcmAlaw.is_video());
        assert_eq!(Codec::H265.as_str(), "H265");
        assert_eq!(Codec::PcmUlaw.as_str(), "PCM_ULAW");
    }

    #[test]
    fn test_stream_id_display() {
        let id = StreamId::new("__defaultVhost__", "live", "cam01");
        assert_eq!(id.to_string(), "__defaultVhost__/live/cam01");
    }

    #[test]
    fn test_frame_validity() {
        let mut frame = CanonicalFrame::new(Codec::H264, 100, 140);
        assert!(!frame.is_valid()); // empty payload

        frame.payload = vec![0, 0, 0, 1, 0x65];
        assert!(frame.is_valid());

        frame.pts_ms = 50; // pts behind dts
        assert!(!frame.is_valid());
    }

    #[test]
    fn test_ts90k_conversion() {
        assert_eq!(ts90k_to_ms(90_000), 1_000);
        assert_eq!(ms_to_ts90k(40), 3_600);
        assert_eq!(ts90k_to_ms(0), 0);
    }
}
