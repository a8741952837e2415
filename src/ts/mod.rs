//! Transport-stream ingestion
//!
//! `demux` reassembles PES packets from aligned TS packets, `bridge`
//! converts them into canonical frames, and `testutil` provides the
//! packetizers the test suites feed them with.

pub mod bridge;
pub mod demux;
pub mod testutil;

pub use bridge::{TsBridgeStats, TsSourceBridge};
pub use demux::{PesPacket, TsDemuxer, TsError, TsStreamType};
