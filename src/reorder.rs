//! Reorder buffer
//!
//! Orders recovered shards by sequence number and aligns their bytes into
//! whole 188-byte transport-stream packets. Fragments wait inside a
//! bounded window; keyframes get extra grace because losing one stalls
//! the downstream decoder for seconds.

use std::collections::BTreeMap;

use thiserror::Error;

pub const TS_PACKET_SIZE: usize = 188;
const TS_SYNC_BYTE: u8 = 0x47;

#[derive(Debug, Clone, Copy)]
pub struct ReorderConfig {
    /// Primary wait for an out-of-order fragment.
    pub window_ms: i64,
    pub keyframe_relax: bool,
    /// Additional wait granted to keyframe fragments.
    pub keyframe_relax_ms: i64,
    /// Cap on the total buffered payload bytes.
    pub max_buffer_size: usize,
}

impl Default for ReorderConfig {
    fn default() -> Self {
        Self {
            window_ms: 200,
            keyframe_relax: true,
            keyframe_relax_ms: 100,
            max_buffer_size: 10 * 1024 * 1024,
        }
    }
}

#[derive(Debug, Error)]
pub enum ReorderError {
    #[error("reorder buffer full ({buffered} bytes buffered, cap {cap})")]
    Full { buffered: usize, cap: usize },
}

#[derive(Debug, Clone, Copy, Default, serde::Serialize)]
pub struct ReorderStats {
    pub total_packets: u64,
    pub duplicate_packets: u64,
    pub dropped_packets: u64,
    pub out_of_order_packets: u64,
}

#[derive(Debug)]
struct Fragment {
    data: Vec<u8>,
    arrival_ms: i64,
    is_keyframe: bool,
}

pub struct ReorderBuffer {
    config: ReorderConfig,
    buffer: BTreeMap<u64, Fragment>,
    expected_sequence: Option<u64>,
    buffered_bytes: usize,
    stats: ReorderStats,
}

impl ReorderBuffer {
    pub fn new(config: ReorderConfig) -> Self {
        Self {
            config,
            buffer: BTreeMap::new(),
            expected_sequence: None,
            buffered_bytes: 0,
            stats: ReorderStats::default(),
        }
    }

    pub fn stats(&self) -> ReorderStats {
        self.stats
    }

    pub fn buffered_bytes(&self) -> usize {
        self.buffered_bytes
    }

    pub fn expected_sequence(&self) -> Option<u64> {
        self.expected_sequence
    }

    /// Store one fragment. Duplicates are ignored, late sequence numbers
    /// are counted and dropped, and the very first accepted fragment
    /// pins the expected sequence.
    pub fn add(
        &mut self,
        seq: u64,
        data: Vec<u8>,
        arrival_ms: i64,
        is_keyframe: bool,
    ) -> Result<(), ReorderError> {
        self.stats.total_packets += 1;

        if self.buffer.contains_key(&seq) {
            self.stats.duplicate_packets += 1;
            return Ok(());
        }

        if self.buffered_bytes + data.len() > self.config.max_buffer_size {
            self.stats.dropped_packets += 1;
            tracing::warn!(seq, buffered = self.buffered_bytes, "reorder buffer full, dropping fragment");
            return Err(ReorderError::Full {
                buffered: self.buffered_bytes,
                cap: self.config.max_buffer_size,
            });
        }

        if let Some(expected) = self.expected_sequence {
            if seq < expected {
                self.stats.out_of_order_packets += 1;
                return Ok(());
            }
        } else {
            self.expected_sequence = Some(seq);
        }

        self.buffered_bytes += data.len();
        self.buffer.insert(
            seq,
            Fragment {
                data,
                arrival_ms,
                is_keyframe,
            },
        );
        Ok(())
    }

    pub fn has_ready(&self) -> bool {
        self.expected_sequence
            .map(|e| self.buffer.contains_key(&e))
            .unwrap_or(false)
    }

    /// Emit consecutive fragments starting at the expected sequence as
    /// aligned 188-byte packets, dropping fragments past their deadline.
    /// Stops at the first gap or at a fragment that is too short to
    /// align yet.
    pub fn drain(&mut self, now_ms: i64) -> Vec<Vec<u8>> {
        let mut packets = Vec::new();

        while let Some(expected) = self.expected_sequence {
            let Some(fragment) = self.buffer.get(&expected) else {
                break;
            };

            if self.is_fragment_expired(fragment, now_ms) {
                if let Some(dropped) = self.buffer.remove(&expected) {
                    self.buffered_bytes -= dropped.data.len();
                }
                self.stats.dropped_packets += 1;
                self.expected_sequence = Some(expected + 1);
                continue;
            }

            match align_ts_packets(&fragment.data) {
                Some(aligned) => packets.extend(aligned),
                None => break, // short fragment without a sync byte, retry next cycle
            }

            if let Some(consumed) = self.buffer.remove(&expected) {
                self.buffered_bytes -= consumed.data.len();
            }
            self.expected_sequence = Some(expected + 1);
        }

        packets
    }

    pub fn clear(&mut self) {
        self.buffer.clear();
        self.buffered_bytes = 0;
        self.expected_sequence = None;
    }

    fn is_fragment_expired(&self, fragment: &Fragment, now_ms: i64) -> bool {
        let mut deadline = self.config.window_ms;
        if self.config.keyframe_relax && fragment.is_keyframe {
            deadline += self.config.keyframe_relax_ms;
        }
        now_ms - fragment.arrival_ms > deadline
    }
}

/// Split a fragment into whole 188-byte packets starting at the first
/// sync byte found within the leading packet length. Returns `None` when
/// the fragment is too short to contain a sync byte yet; a trailing
/// remainder after the last whole packet is discarded.
fn align_ts_packets(data: &[u8]) -> Option<Vec<Vec<u8>>> {
    let scan = data.len().min(TS_PACKET_SIZE);
    let start = data[..scan].iter().position(|&b| b == TS_SYNC_BYTE);

    let start = match start {
        Some(pos) => pos,
        None if data.len() < TS_PACKET_SIZE => return None,
        None => {
            tracing::warn!(len = data.len(), "no TS sync byte in fragment, discarding");
            return Some(Vec::new());
        }
    };

    let mut packets = Vec::new();
    let mut pos = start;
    while pos + TS_PACKET_SIZE <= data.len() {
        packets.push(data[pos..pos + TS_PACKET_SIZE].to_vec());
        pos += TS_PACKET_SIZE;
    }
    if pos < data.len() {
        tracing::trace!(remainder = data.len() - pos, "discarding trailing partial TS packet");
    }
    Some(packets)
}
