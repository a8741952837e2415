//! Protocol adapters
//!
//! An adapter turns the raw bytes of one peer into canonical frames and
//! stream lifecycle events. The two concrete protocols are a tagged
//! variant; a process-wide registry maps protocol names to factories so
//! listeners stay generic over the wire format they serve.

use std::collections::HashMap;
use std::sync::{OnceLock, RwLock};

use thiserror::Error;

use crate::frame::{CanonicalFrame, StreamId};
use crate::framed::{FramedAdapter, FramedConfig, FramedError};
use crate::quicfec::{QuicFecConfig, QuicFecTsAdapter};

/// What an adapter produced for one unit of input, in emission order.
#[derive(Debug)]
pub enum AdapterOutput {
    Frame(CanonicalFrame),
    StreamStarted(StreamId),
    StreamStopped,
}

#[derive(Debug, Error)]
pub enum AdapterError {
    /// Fatal for the connection; the dispatcher tears the session down.
    #[error(transparent)]
    Framed(#[from] FramedError),

    #[error("no adapter registered for protocol {0:?}")]
    UnknownProtocol(String),
}

/// Per-connection construction parameters handed to a factory.
#[derive(Debug, Clone)]
pub struct AdapterInit {
    pub connection_id: String,
    pub stream_id: StreamId,
}

/// The two wire protocols this gateway terminates.
pub enum ProtocolAdapter {
    Framed(FramedAdapter),
    QuicFecTs(QuicFecTsAdapter),
}

impl ProtocolAdapter {
    pub fn protocol(&self) -> &'static str {
        match self {
            ProtocolAdapter::Framed(_) => "framed",
            ProtocolAdapter::QuicFecTs(_) => "quic_fec_ts",
        }
    }

    /// Feed one datagram worth of bytes.
    pub fn feed(&mut self, data: &[u8], now_ms: i64) -> Result<Vec<AdapterOutput>, AdapterError> {
        match self {
            ProtocolAdapter::Framed(a) => a.feed(data, now_ms).map_err(AdapterError::from),
            ProtocolAdapter::QuicFecTs(a) => Ok(a.feed(data, now_ms)),
        }
    }

    /// Periodic sweep: drives heartbeat timeouts and the FEC and reorder
    /// deadlines without requiring new input.
    pub fn tick(&mut self, now_ms: i64) -> Vec<AdapterOutput> {
        match self {
            ProtocolAdapter::Framed(a) => a.tick(now_ms),
            ProtocolAdapter::QuicFecTs(a) => a.tick(now_ms),
        }
    }

    /// Flush remaining state and emit the closing stream event.
    pub fn close(&mut self, now_ms: i64) -> Vec<AdapterOutput> {
        match self {
            ProtocolAdapter::Framed(a) => a.close(),
            ProtocolAdapter::QuicFecTs(a) => a.close(now_ms),
        }
    }

    /// Cumulative `(parse, timestamp, codec)` error counts, for the
    /// session to mirror into its connection counters.
    pub fn error_counts(&self) -> (u64, u64, u64) {
        match self {
            ProtocolAdapter::Framed(a) => {
                let s = a.stats();
                (0, s.invalid_timestamps, s.codec_errors)
            }
            ProtocolAdapter::QuicFecTs(a) => {
                let bridge = a.bridge_stats();
                (
                    bridge.parse_errors + a.stats().invalid_packets,
                    0,
                    bridge.codec_errors,
                )
            }
        }
    }
}

type AdapterFactory = Box<dyn Fn(&AdapterInit) -> ProtocolAdapter + Send + Sync>;

/// Name → factory map, written once at startup and read-only afterwards.
#[derive(Default)]
pub struct AdapterRegistry {
    factories: RwLock<HashMap<String, AdapterFactory>>,
}

impl AdapterRegistry {
    pub fn register<F>(&self, name: &str, factory: F)
    where
        F: Fn(&AdapterInit) -> ProtocolAdapter + Send + Sync + 'static,
    {
        self.factories
            .write()
            .unwrap_or_else(|e| e.into_inner())
            .insert(name.to_string(), Box::new(factory));
    }

    pub fn create(&self, name: &str, init: &AdapterInit) -> Result<ProtocolAdapter, AdapterError> {
        let factories = self.factories.read().unwrap_or_else(|e| e.into_inner());
        let factory = factories
            .get(name)
            .ok_or_else(|| AdapterError::UnknownProtocol(name.to_string()))?;
        Ok(factory(init))
    }

    pub fn names(&self) -> Vec<String> {
        let factories = self.factories.read().unwrap_or_else(|e| e.into_inner());
        let mut names: Vec<String> = factories.keys().cloned().collect();
        names.sort();
        names
    }
}

static REGISTRY: OnceLock<AdapterRegistry> = OnceLock::new();

/// The process-wide registry.
pub fn global_registry() -> &'static AdapterRegistry {
    REGISTRY.get_or_init(AdapterRegistry::default)
}

/// Install the built-in protocol factories with the given configurations.
/// Called once from startup.
pub fn register_builtin_adapters(framed: FramedConfig, quic_fec: QuicFecConfig) {
    let registry = global_registry();
    registry.register("framed", move |init| {
        ProtocolAdapter::Framed(FramedAdapter::new(init.stream_id.clone(), framed))
    });
    registry.register("quic_fec_ts", move |init| {
        ProtocolAdapter::QuicFecTs(QuicFecTsAdapter::new(init.stream_id.clone(), quic_fec))
    });
}

#[cfg(test)]
mod tests {
    use super::*;

    fn init() -> AdapterInit {
        AdapterInit {
            connection_id: "10.0.0.1:5000".into(),
            stream_id: StreamId::new("__defaultVhost__", "live", "stream"),
        }
    }

    #[test]
    fn test_registry_create() {
        let registry = AdapterRegistry::default();
        registry.register("framed", |init| {
            ProtocolAdapter::Framed(FramedAdapter::new(
                init.stream_id.clone(),
                FramedConfig::default(),
            ))
        });

        let adapter = registry.create("framed", &init()).unwrap();
        assert_eq!(adapter.protocol(), "framed");
        assert_eq!(registry.names(), vec!["framed".to_string()]);
    }

    #[test]
    fn test_unknown_protocol() {
        let registry = AdapterRegistry::default();
        assert!(matches!(
            registry.create("rtmp", &init()),
            Err(AdapterError::UnknownProtocol(_))
        ));
    }
}
