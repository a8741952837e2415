//! UDP ingest gateway
//!
//! The ingest core of a live-streaming edge: receives lossy, possibly
//! reordered datagrams from publishers, repairs them with Reed-Solomon
//! forward error correction, reorders and demuxes the transport stream
//! or the custom framed protocol, and delivers canonical audio/video
//! frames to a downstream media hub.

pub mod adapter;
pub mod api;
pub mod config;
pub mod dispatcher;
pub mod fec;
pub mod frame;
pub mod framed;
pub mod hub;
pub mod jitter;
pub mod params;
pub mod quic;
pub mod quicfec;
pub mod reorder;
pub mod stats;
pub mod ts;

pub use config::Config;
pub use dispatcher::UdpDispatcher;
pub use frame::{CanonicalFrame, Codec, StreamId};
