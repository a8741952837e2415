//! Ingest statistics
//!
//! Per-connection and aggregate counters for observability. Counter
//! updates are plain atomics so the packet path never takes a lock; the
//! JSON snapshot takes a read lock over the connection map.

use std::collections::HashMap;
use std::sync::atomic::{AtomicI64, AtomicU64, Ordering};
use std::sync::{Arc, OnceLock, RwLock};

use serde::Serialize;

#[derive(Debug, Clone, Copy)]
pub enum ErrorKind {
    Parse,
    Timestamp,
    Codec,
}

/// Lock-free counter block shared by connections and the global view.
#[derive(Default)]
pub struct Counters {
    total_frames: AtomicU64,
    video_frames: AtomicU64,
    audio_frames: AtomicU64,
    keyframes: AtomicU64,
    dropped_frames: AtomicU64,

    parse_errors: AtomicU64,
    timestamp_errors: AtomicU64,
    codec_errors: AtomicU64,

    jitter_hits: AtomicU64,
    jitter_misses: AtomicU64,
    zero_copy_hits: AtomicU64,
    zero_copy_misses: AtomicU64,

    bytes_received: AtomicU64,
    packets_received: AtomicU64,
}

impl Counters {
    pub fn record_frame(&self, is_video: bool, is_keyframe: bool, is_dropped: bool) {
        self.total_frames.fetch_add(1, Ordering::Relaxed);
        if is_video {
            self.video_frames.fetch_add(1, Ordering::Relaxed);
        } else {
            self.audio_frames.fetch_add(1, Ordering::Relaxed);
        }
        if is_keyframe {
            self.keyframes.fetch_add(1, Ordering::Relaxed);
        }
        if is_dropped {
            self.dropped_frames.fetch_add(1, Ordering::Relaxed);
        }
    }

    pub fn record_error(&self, kind: ErrorKind) {
        let counter = match kind {
            ErrorKind::Parse => &self.parse_errors,
            ErrorKind::Timestamp => &self.timestamp_errors,
            ErrorKind::Codec => &self.codec_errors,
        };
        counter.fetch_add(1, Ordering::Relaxed);
    }

    pub fn record_jitter(&self, hit: bool) {
        if hit {
            self.jitter_hits.fetch_add(1, Ordering::Relaxed);
        } else {
            self.jitter_misses.fetch_add(1, Ordering::Relaxed);
        }
    }

    pub fn record_zero_copy(&self, hit: bool) {
        if hit {
            self.zero_copy_hits.fetch_add(1, Ordering::Relaxed);
        } else {
            self.zero_copy_misses.fetch_add(1, Ordering::Relaxed);
        }
    }

    pub fn record_packet(&self, bytes: u64) {
        self.packets_received.fetch_add(1, Ordering::Relaxed);
        self.bytes_received.fetch_add(bytes, Ordering::Relaxed);
    }

    pub fn snapshot(&self) -> CounterSnapshot {
        CounterSnapshot {
            total_frames: self.total_frames.load(Ordering::Relaxed),
            video_frames: self.video_frames.load(Ordering::Relaxed),
            audio_frames: self.audio_frames.load(Ordering::Relaxed),
            keyframes: self.keyframes.load(Ordering::Relaxed),
            dropped_frames: self.dropped_frames.load(Ordering::Relaxed),
            parse_errors: self.parse_errors.load(Ordering::Relaxed),
            timestamp_errors: self.timestamp_errors.load(Ordering::Relaxed),
            codec_errors: self.codec_errors.load(Ordering::Relaxed),
            jitter_hits: self.jitter_hits.load(Ordering::Relaxed),
            jitter_misses: self.jitter_misses.load(Ordering::Relaxed),
            zero_copy_hits: self.zero_copy_hits.load(Ordering::Relaxed),
            zero_copy_misses: self.zero_copy_misses.load(Ordering::Relaxed),
            bytes_received: self.bytes_received.load(Ordering::Relaxed),
            packets_received: self.packets_received.load(Ordering::Relaxed),
        }
    }
}

#[derive(Debug, Clone, Copy, Serialize)]
pub struct CounterSnapshot {
    pub total_frames: u64,
    pub video_frames: u64,
    pub audio_frames: u64,
    pub keyframes: u64,
    pub dropped_frames: u64,
    pub parse_errors: u64,
    pub timestamp_errors: u64,
    pub codec_errors: u64,
    pub jitter_hits: u64,
    pub jitter_misses: u64,
    pub zero_copy_hits: u64,
    pub zero_copy_misses: u64,
    pub bytes_received: u64,
    pub packets_received: u64,
}

impl CounterSnapshot {
    pub fn drop_rate(&self) -> f64 {
        if self.total_frames == 0 {
            0.0
        } else {
            self.dropped_frames as f64 / self.total_frames as f64 * 100.0
        }
    }

    pub fn jitter_hit_rate(&self) -> f64 {
        let total = self.jitter_hits + self.jitter_misses;
        if total == 0 {
            0.0
        } else {
            self.jitter_hits as f64 / total as f64 * 100.0
        }
    }

    pub fn zero_copy_hit_rate(&self) -> f64 {
        let total = self.zero_copy_hits + self.zero_copy_misses;
        if total == 0 {
            0.0
        } else {
            self.zero_copy_hits as f64 / total as f64 * 100.0
        }
    }
}

/// Identity and counters of one ingest connection.
pub struct ConnectionStats {
    pub connection_id: String,
    pub protocol: String,
    pub stream_id: String,
    pub client_addr: String,
    connected_at_ms: i64,
    first_frame_at_ms: AtomicI64,
    pub counters: Counters,
}

impl ConnectionStats {
    /// Record when the first frame reached the hub, once.
    pub fn mark_first_frame(&self, now_ms: i64) {
        let _ = self.first_frame_at_ms.compare_exchange(
            0,
            now_ms,
            Ordering::Relaxed,
            Ordering::Relaxed,
        );
    }

    pub fn first_frame_latency_ms(&self) -> i64 {
        let first = self.first_frame_at_ms.load(Ordering::Relaxed);
        if first == 0 {
            0
        } else {
            first - self.connected_at_ms
        }
    }

    pub fn uptime_ms(&self, now_ms: i64) -> i64 {
        now_ms - self.connected_at_ms
    }
}

#[derive(Serialize)]
struct ConnectionJson {
    connection_id: String,
    protocol: String,
    stream_id: String,
    client_addr: String,
    uptime_ms: i64,
    first_frame_latency_ms: i64,
    stats: CounterSnapshot,
}

/// Process-wide statistics manager.
pub struct StatsManager {
    connections: RwLock<HashMap<String, Arc<ConnectionStats>>>,
    global: Arc<Counters>,
    started_at_ms: i64,
}

impl StatsManager {
    pub fn new() -> Self {
        Self {
            connections: RwLock::new(HashMap::new()),
            global: Arc::new(Counters::default()),
            started_at_ms: chrono::Utc::now().timestamp_millis(),
        }
    }

    /// Counters shared by every connection; updates stay atomic.
    pub fn global(&self) -> Arc<Counters> {
        self.global.clone()
    }

    pub fn add_connection(
        &self,
        connection_id: &str,
        protocol: &str,
        stream_id: &str,
        client_addr: &str,
    ) -> Arc<ConnectionStats> {
        let stats = Arc::new(ConnectionStats {
            connection_id: connection_id.to_string(),
            protocol: protocol.to_string(),
            stream_id: stream_id.to_string(),
            client_addr: client_addr.to_string(),
            connected_at_ms: chrono::Utc::now().timestamp_millis(),
            first_frame_at_ms: AtomicI64::new(0),
            counters: Counters::default(),
        });
        self.connections
            .write()
            .unwrap_or_else(|e| e.into_inner())
            .insert(connection_id.to_string(), stats.clone());
        stats
    }

    pub fn remove_connection(&self, connection_id: &str) {
        self.connections
            .write()
            .unwrap_or_else(|e| e.into_inner())
            .remove(connection_id);
    }

    pub fn connection_count(&self) -> usize {
        self.connections
            .read()
            .unwrap_or_else(|e| e.into_inner())
            .len()
    }

    /// Full observability snapshot.
    pub fn to_json(&self) -> serde_json::Value {
        let now_ms = chrono::Utc::now().timestamp_millis();
        let connections = self.connections.read().unwrap_or_else(|e| e.into_inner());
        let mut rows: Vec<ConnectionJson> = connections
            .values()
            .map(|c| ConnectionJson {
                connection_id: c.connection_id.clone(),
                protocol: c.protocol.clone(),
                stream_id: c.stream_id.clone(),
                client_addr: c.client_addr.clone(),
                uptime_ms: c.uptime_ms(now_ms),
                first_frame_latency_ms: c.first_frame_latency_ms(),
                stats: c.counters.snapshot(),
            })
            .collect();
        rows.sort_by(|a, b| a.connection_id.cmp(&b.connection_id));

        serde_json::json!({
            "global_stats": self.global.snapshot(),
            "uptime_ms": now_ms - self.started_at_ms,
            "connections": rows,
            "timestamp": now_ms,
        })
    }
}

impl Default for StatsManager {
    fn default() -> Self {
        Self::new()
    }
}

static MANAGER: OnceLock<Arc<StatsManager>> = OnceLock::new();

/// The process-wide manager.
pub fn global_stats() -> Arc<StatsManager> {
    MANAGER.get_or_init(|| Arc::new(StatsManager::new())).clone()
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_frame_counters() {
        let c = Counters::default();
        c.record_frame(true, true, false);
        c.record_frame(true, false, false);
        c.record_frame(false, false, true);

        let s = c.snapshot();
        assert_eq!(s.total_frames, 3);
        assert_eq!(s.video_frames, 2);
        assert_eq!(s.audio_frames, 1);
        assert_eq!(s.keyframes, 1);
        assert_eq!(s.dropped_frames, 1);
        assert!((s.drop_rate() - 100.0 / 3.0).abs() < 0.01);
    }

    #[test]
    fn test_error_counters() {
        let c = Counters::default();
        c.record_error(ErrorKind::Parse);
        c.record_error(ErrorKind::Parse);
        c.record_error(ErrorKind::Timestamp);
        c.record_error(ErrorKind::Codec);

        let s = c.snapshot();
        assert_eq!(s.parse_errors, 2);
        assert_eq!(s.timestamp_errors, 1);
        assert_eq!(s.codec_errors, 1);
    }

    #[test]
    fn test_hit_rates() {
        let c = Counters::default();
        c.record_jitter(true);
        c.record_jitter(false);
        c.record_zero_copy(true);
        c.record_zero_copy(true);

        let s = c.snapshot();
        assert!((s.jitter_hit_rate() - 50.0).abs() < 0.01);
        assert!((s.zero_copy_hit_rate() - 100.0).abs() < 0.01);
    }

    #[test]
    fn test_manager_snapshot_shape() {
        let manager = StatsManager::new();
        let conn = manager.add_connection("10.0.0.1:4000", "quic_fec_ts", "v/a/s", "10.0.0.1:4000");
        conn.counters.record_frame(true, true, false);
        manager.global().record_frame(true, true, false);

        let json = manager.to_json();
        assert_eq!(json["global_stats"]["total_frames"], 1);
        assert_eq!(json["connections"].as_array().unwrap().len(), 1);
        assert_eq!(json["connections"][0]["protocol"], "quic_fec_ts");
        assert!(json["timestamp"].as_i64().unwrap() > 0);

        manager.remove_connection("10.0.0.1:4000");
        assert_eq!(manager.connection_count(), 0);
    }

    #[test]
    fn test_first_frame_latency_latches_once() {
        let manager = StatsManager::new();
        let conn = manager.add_connection("c1", "framed", "v/a/s", "peer");
        let base = chrono::Utc::now().timestamp_millis();
        conn.mark_first_frame(base + 25);
        conn.mark_first_frame(base + 500);
        let latency = conn.first_frame_latency_ms();
        assert!((25..500).contains(&latency), "latency {}", latency);
    }
}
