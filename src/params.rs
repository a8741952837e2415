//! Parameter set store
//!
//! Latches the most recent SPS/PPS/VPS/audio configuration per session
//! and validates the NAL header byte before accepting. On keyframes in
//! hot-start mode the latched sets are re-emitted ahead of the frame so a
//! late joiner can decode immediately.

use std::collections::BTreeMap;

use crate::frame::Codec;

#[derive(Debug, Clone, Copy, PartialEq, Eq, PartialOrd, Ord, Hash, serde::Serialize)]
pub enum ParameterSetKind {
    Vps,
    Sps,
    Pps,
    AudioConfig,
}

#[derive(Debug, Clone)]
pub struct ParameterSet {
    pub kind: ParameterSetKind,
    pub data: Vec<u8>,
    pub valid: bool,
    pub updated_ms: i64,
}

#[derive(Debug, Clone, Copy, Default, serde::Serialize)]
pub struct ParameterSetStats {
    pub total_updates: u64,
    pub valid_updates: u64,
    pub invalid_updates: u64,
    pub sps_count: u64,
    pub pps_count: u64,
    pub vps_count: u64,
    pub audio_count: u64,
}

/// Per-session latch holding at most one instance per kind.
#[derive(Debug, Default)]
pub struct ParameterSetStore {
    sets: BTreeMap<ParameterSetKind, ParameterSet>,
    stats: ParameterSetStats,
}

impl ParameterSetStore {
    pub fn new() -> Self {
        Self::default()
    }

    /// Validate and latch a parameter set. Returns whether the bytes
    /// passed validation; invalid updates are counted and discarded.
    pub fn update(
        &mut self,
        codec: Codec,
        kind: ParameterSetKind,
        data: Vec<u8>,
        now_ms: i64,
    ) -> bool {
        self.stats.total_updates += 1;

        let valid = validate(codec, kind, &data);
        if !valid {
            self.stats.invalid_updates += 1;
            tracing::warn!(codec = %codec, ?kind, len = data.len(), "rejected invalid parameter set");
            return false;
        }

        self.stats.valid_updates += 1;
        match kind {
            ParameterSetKind::Sps => self.stats.sps_count += 1,
            ParameterSetKind::Pps => self.stats.pps_count += 1,
            ParameterSetKind::Vps => self.stats.vps_count += 1,
            ParameterSetKind::AudioConfig => self.stats.audio_count += 1,
        }

        self.sets.insert(
            kind,
            ParameterSet {
                kind,
                data,
                valid: true,
                updated_ms: now_ms,
            },
        );
        true
    }

    pub fn get(&self, kind: ParameterSetKind) -> Option<&ParameterSet> {
        self.sets.get(&kind).filter(|p| p.valid)
    }

    pub fn has(&self, kind: ParameterSetKind) -> bool {
        self.get(kind).is_some()
    }

    /// All latched sets in VPS, SPS, PPS, audio order, which is also the
    /// order a decoder wants them re-emitted in.
    pub fn snapshot(&self) -> Vec<ParameterSet> {
        self.sets.values().filter(|p| p.valid).cloned().collect()
    }

    pub fn clear(&mut self) {
        self.sets.clear();
    }

    pub fn stats(&self) -> ParameterSetStats {
        self.stats
    }
}

/// NAL-header validation, with the start code already stripped.
fn validate(codec: Codec, kind: ParameterSetKind, data: &[u8]) -> bool {
    let Some(&first) = data.first() else {
        return false;
    };
    match (codec, kind) {
        (Codec::H264, ParameterSetKind::Sps) => first & 0x1F == 7,
        (Codec::H264, ParameterSetKind::Pps) => first & 0x1F == 8,
        (Codec::H265, ParameterSetKind::Vps) => (first >> 1) & 0x3F == 32,
        (Codec::H265, ParameterSetKind::Sps) => (first >> 1) & 0x3F == 33,
        (Codec::H265, ParameterSetKind::Pps) => (first >> 1) & 0x3F == 34,
        (_, ParameterSetKind::AudioConfig) => data.len() >= 2,
        _ => false,
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_h264_sps_validation() {
        let mut store = ParameterSetStore::new();
        // NAL type 7 with nal_ref_idc bits set.
        assert!(store.update(Codec::H264, ParameterSetKind::Sps, vec![0x67, 0x42, 0x00], 0));
        // NAL type 8 offered as an SPS.
        assert!(!store.update(Codec::H264, ParameterSetKind::Sps, vec![0x68, 0xCE], 0));
        assert_eq!(store.stats().invalid_updates, 1);
    }

    #[test]
    fn test_h264_pps_validation() {
        let mut store = ParameterSetStore::new();
        assert!(store.update(Codec::H264, ParameterSetKind::Pps, vec![0x68, 0xCE], 0));
        assert!(!store.update(Codec::H264, ParameterSetKind::Pps, vec![0x67, 0x42], 0));
    }

    #[test]
    fn test_h265_kinds() {
        let mut store = ParameterSetStore::new();
        // H.265 NAL types live in bits 6..1 of the first byte.
        assert!(store.update(Codec::H265, ParameterSetKind::Vps, vec![32 << 1, 0x01], 0));
        assert!(store.update(Codec::H265, ParameterSetKind::Sps, vec![33 << 1, 0x01], 0));
        assert!(store.update(Codec::H265, ParameterSetKind::Pps, vec![34 << 1, 0x01], 0));
        assert!(!store.update(Codec::H265, ParameterSetKind::Vps, vec![33 << 1], 0));
        assert_eq!(store.snapshot().len(), 3);
    }

    #[test]
    fn test_audio_config_needs_two_bytes() {
        let mut store = ParameterSetStore::new();
        assert!(!store.update(Codec::Aac, ParameterSetKind::AudioConfig, vec![0x12], 0));
        assert!(store.update(Codec::Aac, ParameterSetKind::AudioConfig, vec![0x12, 0x10], 0));
    }

    #[test]
    fn test_latch_keeps_latest() {
        let mut store = ParameterSetStore::new();
        store.update(Codec::H264, ParameterSetKind::Sps, vec![0x67, 0x01], 10);
        store.update(Codec::H264, ParameterSetKind::Sps, vec![0x67, 0x02], 20);

        let latched = store.get(ParameterSetKind::Sps).unwrap();
        assert_eq!(latched.data, vec![0x67, 0x02]);
        assert_eq!(latched.updated_ms, 20);
        assert_eq!(store.snapshot().len(), 1);
    }

    #[test]
    fn test_snapshot_order() {
        let mut store = ParameterSetStore::new();
        store.update(Codec::H265, ParameterSetKind::Pps, vec![34 << 1, 0x01], 0);
        store.update(Codec::H265, ParameterSetKind::Vps, vec![32 << 1, 0x01], 0);
        store.update(Codec::H265, ParameterSetKind::Sps, vec![33 << 1, 0x01], 0);

        let kinds: Vec<ParameterSetKind> = store.snapshot().iter().map(|p| p.kind).collect();
        assert_eq!(
            kinds,
            vec![
                ParameterSetKind::Vps,
                ParameterSetKind::Sps,
                ParameterSetKind::Pps
            ]
        );
    }

    #[test]
    fn test_empty_data_rejected() {
        let mut store = ParameterSetStore::new();
        assert!(!store.update(Codec::H264, ParameterSetKind::Sps, vec![], 0));
    }
}
