//! Jitter buffer
//!
//! A bounded priority structure over canonical frames keyed by DTS. The
//! ingest task pushes, a publisher thread pops in DTS order with a
//! timeout, so the buffer is internally synchronized.
//!
//! Output is guaranteed non-decreasing in DTS: a frame is held for a
//! settle window before release so an in-window reorder can re-sequence
//! ahead of it, and a frame older than the last released DTS is never
//! emitted as-is (the default policy drops it, the keep policy pulls it
//! forward to the last released DTS).

use std::collections::{BinaryHeap, HashSet, VecDeque};
use std::sync::{Condvar, Mutex};
use std::time::{Duration, Instant};

use thiserror::Error;

use crate::frame::CanonicalFrame;

#[derive(Debug, Clone, Copy)]
pub struct JitterConfig {
    /// How long a frame dwells before it may be released, giving
    /// slower siblings a chance to re-sequence ahead of it.
    pub window_ms: i64,
    /// A frame older than the last emitted DTS by more than this is late.
    pub max_delay_ms: i64,
    /// Drop frames older than the last emitted DTS; with this off they
    /// are kept, pulled forward to the last emitted DTS.
    pub drop_late_frames: bool,
    /// Cap on buffered frames.
    pub max_frames: usize,
}

impl Default for JitterConfig {
    fn default() -> Self {
        Self {
            window_ms: 200,
            max_delay_ms: 500,
            drop_late_frames: true,
            max_frames: 50,
        }
    }
}

#[derive(Debug, Error, PartialEq)]
pub enum JitterError {
    #[error("jitter buffer pop timed out")]
    Timeout,
    #[error("jitter buffer is closed")]
    Closed,
}

#[derive(Debug, Clone, Copy, Default, serde::Serialize)]
pub struct JitterStats {
    pub total_frames: u64,
    pub reordered_frames: u64,
    pub dropped_frames: u64,
    pub late_frames: u64,
    pub duplicate_frames: u64,
    pub max_jitter_ms: i64,
    pub avg_jitter_ms: i64,
}

/// How many DTS values the duplicate detector remembers.
const DTS_HISTORY_LIMIT: usize = 1024;

struct Entry {
    dts_ms: i64,
    order: u64,
    received_at: Instant,
    frame: CanonicalFrame,
}

impl PartialEq for Entry {
    fn eq(&self, other: &Self) -> bool {
        self.dts_ms == other.dts_ms && self.order == other.order
    }
}
impl Eq for Entry {}
impl PartialOrd for Entry {
    fn partial_cmp(&self, other: &Self) -> Option<std::cmp::Ordering> {
        Some(self.cmp(other))
    }
}
impl Ord for Entry {
    fn cmp(&self, other: &Self) -> std::cmp::Ordering {
        // Reversed so the BinaryHeap pops the smallest DTS first.
        (other.dts_ms, other.order).cmp(&(self.dts_ms, self.order))
    }
}

struct Inner {
    heap: BinaryHeap<Entry>,
    last_output_dts: Option<i64>,
    history: VecDeque<i64>,
    history_set: HashSet<i64>,
    next_order: u64,
    closed: bool,
    stats: JitterStats,
}

pub struct JitterBuffer {
    config: JitterConfig,
    settle: Duration,
    inner: Mutex<Inner>,
    available: Condvar,
}

impl JitterBuffer {
    pub fn new(config: JitterConfig) -> Self {
        Self {
            config,
            settle: Duration::from_millis(config.window_ms.max(0) as u64),
            inner: Mutex::new(Inner {
                heap: BinaryHeap::new(),
                last_output_dts: None,
                history: VecDeque::new(),
                history_set: HashSet::new(),
                next_order: 0,
                closed: false,
                stats: JitterStats::default(),
            }),
            available: Condvar::new(),
        }
    }

    /// Queue a frame. Duplicates and frames that can no longer be
    /// emitted in order are counted and swallowed rather than surfaced.
    pub fn push(&self, mut frame: CanonicalFrame) -> Result<(), JitterError> {
        let mut inner = self.inner.lock().unwrap_or_else(|e| e.into_inner());
        if inner.closed {
            return Err(JitterError::Closed);
        }

        inner.stats.total_frames += 1;
        let dts = frame.dts_ms;

        if inner.history_set.contains(&dts) {
            inner.stats.duplicate_frames += 1;
            return Ok(());
        }

        if let Some(last) = inner.last_output_dts {
            // Something newer already left the buffer; emitting this
            // frame as-is would run the output backwards.
            if dts < last {
                inner.stats.reordered_frames += 1;
                if dts < last - self.config.max_delay_ms {
                    inner.stats.late_frames += 1;
                }
                if self.config.drop_late_frames {
                    inner.stats.dropped_frames += 1;
                    return Ok(());
                }
                frame.dts_ms = last;
                frame.pts_ms = frame.pts_ms.max(last);
            }

            let jitter = dts - last;
            if jitter > inner.stats.max_jitter_ms {
                inner.stats.max_jitter_ms = jitter;
            }
            // Two-sample halving average, biased toward recent samples.
            inner.stats.avg_jitter_ms = (inner.stats.avg_jitter_ms + jitter) / 2;
        }

        if inner.heap.len() >= self.config.max_frames {
            inner.stats.dropped_frames += 1;
            tracing::warn!(dts, frames = inner.heap.len(), "jitter buffer full, dropping frame");
            return Ok(());
        }

        inner.history.push_back(dts);
        inner.history_set.insert(dts);
        while inner.history.len() > DTS_HISTORY_LIMIT {
            if let Some(old) = inner.history.pop_front() {
                inner.history_set.remove(&old);
            }
        }

        let order = inner.next_order;
        inner.next_order += 1;
        inner.heap.push(Entry {
            dts_ms: frame.dts_ms,
            order,
            received_at: Instant::now(),
            frame,
        });
        self.available.notify_one();
        Ok(())
    }

    /// Remove and return the smallest-DTS frame once it has settled,
    /// waiting up to `timeout`.
    pub fn pop(&self, timeout: Duration) -> Result<CanonicalFrame, JitterError> {
        let deadline = Instant::now() + timeout;
        let mut inner = self.inner.lock().unwrap_or_else(|e| e.into_inner());

        loop {
            if inner.closed {
                return Err(JitterError::Closed);
            }

            let now = Instant::now();
            let ready_at = inner.heap.peek().map(|e| e.received_at + self.settle);

            match ready_at {
                Some(ready_at) if now >= ready_at => {
                    if let Some(entry) = inner.heap.pop() {
                        inner.last_output_dts = Some(entry.dts_ms);
                        return Ok(entry.frame);
                    }
                }
                _ if now >= deadline => return Err(JitterError::Timeout),
                Some(ready_at) => {
                    let wait = ready_at.min(deadline) - now;
                    let (guard, _) = self
                        .available
                        .wait_timeout(inner, wait)
                        .unwrap_or_else(|e| e.into_inner());
                    inner = guard;
                }
                None => {
                    let (guard, _) = self
                        .available
                        .wait_timeout(inner, deadline - now)
                        .unwrap_or_else(|e| e.into_inner());
                    inner = guard;
                }
            }
        }
    }

    /// Remove the smallest-DTS frame if one has settled.
    pub fn try_pop(&self) -> Option<CanonicalFrame> {
        let mut inner = self.inner.lock().unwrap_or_else(|e| e.into_inner());
        if inner.closed {
            return None;
        }
        let now = Instant::now();
        let ready = inner
            .heap
            .peek()
            .map(|e| now >= e.received_at + self.settle)
            .unwrap_or(false);
        if !ready {
            return None;
        }
        let entry = inner.heap.pop()?;
        inner.last_output_dts = Some(entry.dts_ms);
        Some(entry.frame)
    }

    /// Close the buffer; pending and future pops fail with `Closed` and
    /// buffered frames are discarded.
    pub fn close(&self) {
        let mut inner = self.inner.lock().unwrap_or_else(|e| e.into_inner());
        inner.closed = true;
        inner.heap.clear();
        self.available.notify_all();
    }

    pub fn len(&self) -> usize {
        self.inner.lock().unwrap_or_else(|e| e.into_inner()).heap.len()
    }

    pub fn is_empty(&self) -> bool {
        self.len() == 0
    }

    pub fn stats(&self) -> JitterStats {
        self.inner.lock().unwrap_or_else(|e| e.into_inner()).stats
    }
}
