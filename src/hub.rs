//! Downstream media hub hand-off
//!
//! The ingest task and the publishing side meet at a bounded channel:
//! the ingest task awaits space, the hub consumer drains canonical
//! frames in its own task. A hub hands out one publisher per session,
//! keyed by the stream id carried in every frame.

use tokio::sync::mpsc;

use crate::frame::{CanonicalFrame, StreamId};

pub type FramePublisher = mpsc::Sender<CanonicalFrame>;

/// The downstream contract: a session acquires a publisher for its
/// stream and pushes canonical frames into it.
pub trait MediaHub: Send + Sync {
    fn acquire(&self, stream_id: &StreamId) -> FramePublisher;
}

/// Hub backed by one bounded channel; the consumer side receives the
/// frames of every stream, each tagged with its stream id.
pub struct ChannelHub {
    tx: mpsc::Sender<CanonicalFrame>,
}

impl ChannelHub {
    pub fn new(capacity: usize) -> (Self, mpsc::Receiver<CanonicalFrame>) {
        let (tx, rx) = mpsc::channel(capacity);
        (Self { tx }, rx)
    }
}

impl MediaHub for ChannelHub {
    fn acquire(&self, _stream_id: &StreamId) -> FramePublisher {
        self.tx.clone()
    }
}
