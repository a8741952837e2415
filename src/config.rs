//! Gateway configuration
//!
//! Loaded from a TOML file and/or `INGEST_*` environment variables.
//! Validation enforces the parameters the process refuses to start
//! without.

use serde::{Deserialize, Serialize};
use std::path::Path;

use crate::fec::FecGroupConfig;
use crate::framed::FramedConfig;
use crate::jitter::JitterConfig;
use crate::quicfec::{QuicFecConfig, TransportMode};
use crate::reorder::ReorderConfig;

#[derive(Debug, Clone, Serialize, Deserialize, Default)]
pub struct Config {
    #[serde(default)]
    pub server: ServerConfig,

    #[serde(default)]
    pub route: RouteConfig,

    #[serde(default)]
    pub protocol: ProtocolConfig,

    #[serde(default)]
    pub fec: FecSection,

    #[serde(default)]
    pub reorder: ReorderSection,

    #[serde(default)]
    pub framed: FramedSection,

    #[serde(default)]
    pub jitter: JitterSection,

    #[serde(default)]
    pub limits: LimitsConfig,

    #[serde(default)]
    pub quic: QuicSection,
}

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct ServerConfig {
    /// UDP bind address.
    #[serde(default = "default_listen_address")]
    pub listen_address: String,

    /// UDP ingest port.
    #[serde(default = "default_listen_port")]
    pub listen_port: u16,

    /// HTTP observability port.
    #[serde(default = "default_http_port")]
    pub http_port: u16,
}

fn default_listen_address() -> String {
    "0.0.0.0".to_string()
}

fn default_listen_port() -> u16 {
    8443
}

fn default_http_port() -> u16 {
    8080
}

impl Default for ServerConfig {
    fn default() -> Self {
        Self {
            listen_address: default_listen_address(),
            listen_port: default_listen_port(),
            http_port: default_http_port(),
        }
    }
}

/// Where ingested frames are routed downstream.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct RouteConfig {
    #[serde(default = "default_vhost")]
    pub vhost: String,

    #[serde(default = "default_app")]
    pub app: String,

    #[serde(default = "default_stream")]
    pub stream: String,

    /// Per-listen-port route overrides.
    #[serde(default)]
    pub port_overrides: Vec<PortRoute>,
}

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct PortRoute {
    pub port: u16,
    pub vhost: String,
    pub app: String,
    pub stream: String,
}

fn default_vhost() -> String {
    "__defaultVhost__".to_string()
}

fn default_app() -> String {
    "live".to_string()
}

fn default_stream() -> String {
    "stream".to_string()
}

impl Default for RouteConfig {
    fn default() -> Self {
        Self {
            vhost: default_vhost(),
            app: default_app(),
            stream: default_stream(),
            port_overrides: Vec::new(),
        }
    }
}

impl RouteConfig {
    /// The stream a listener port routes to: a per-port override when one
    /// matches, the fixed route otherwise.
    pub fn stream_for_port(&self, port: u16) -> crate::frame::StreamId {
        for over in &self.port_overrides {
            if over.port == port {
                return crate::frame::StreamId::new(&over.vhost, &over.app, &over.stream);
            }
        }
        crate::frame::StreamId::new(&self.vhost, &self.app, &self.stream)
    }
}

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct ProtocolConfig {
    /// Adapter selected for new sessions.
    #[serde(default = "default_protocol_name")]
    pub name: String,

    #[serde(default = "default_true")]
    pub enable_protocol_detection: bool,

    #[serde(default = "default_detection_timeout")]
    pub detection_timeout_ms: i64,

    /// `quic_fec` or `bare_ts`, used when detection is off or times out.
    #[serde(default = "default_mode")]
    pub default_mode: String,
}

fn default_protocol_name() -> String {
    "quic_fec_ts".to_string()
}

fn default_true() -> bool {
    true
}

fn default_detection_timeout() -> i64 {
    1000
}

fn default_mode() -> String {
    "quic_fec".to_string()
}

impl Default for ProtocolConfig {
    fn default() -> Self {
        Self {
            name: default_protocol_name(),
            enable_protocol_detection: default_true(),
            detection_timeout_ms: default_detection_timeout(),
            default_mode: default_mode(),
        }
    }
}

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct FecSection {
    #[serde(default = "default_fec_k")]
    pub k: u32,

    #[serde(default = "default_fec_n")]
    pub n: u32,

    #[serde(default = "default_fec_deadline")]
    pub repair_deadline_ms: i64,

    #[serde(default = "default_true")]
    pub keyframe_relax: bool,

    #[serde(default = "default_keyframe_grace")]
    pub keyframe_grace_ms: i64,
}

fn default_fec_k() -> u32 {
    8
}

fn default_fec_n() -> u32 {
    12
}

fn default_fec_deadline() -> i64 {
    100
}

fn default_keyframe_grace() -> i64 {
    100
}

impl Default for FecSection {
    fn default() -> Self {
        Self {
            k: default_fec_k(),
            n: default_fec_n(),
            repair_deadline_ms: default_fec_deadline(),
            keyframe_relax: default_true(),
            keyframe_grace_ms: default_keyframe_grace(),
        }
    }
}

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct ReorderSection {
    #[serde(default = "default_reorder_window")]
    pub window_ms: i64,

    #[serde(default = "default_true")]
    pub keyframe_relax: bool,

    #[serde(default = "default_keyframe_grace")]
    pub keyframe_relax_ms: i64,

    #[serde(default = "default_reorder_buffer")]
    pub max_buffer_size: usize,
}

fn default_reorder_window() -> i64 {
    200
}

fn default_reorder_buffer() -> usize {
    10 * 1024 * 1024
}

impl Default for ReorderSection {
    fn default() -> Self {
        Self {
            window_ms: default_reorder_window(),
            keyframe_relax: default_true(),
            keyframe_relax_ms: default_keyframe_grace(),
            max_buffer_size: default_reorder_buffer(),
        }
    }
}

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct FramedSection {
    #[serde(default = "default_heartbeat")]
    pub heartbeat_interval_ms: i64,

    #[serde(default = "default_b_frame_delay")]
    pub b_frame_delay_ms: i64,

    #[serde(default)]
    pub low_latency_drop_b: bool,

    #[serde(default)]
    pub hot_start: bool,
}

fn default_heartbeat() -> i64 {
    5000
}

fn default_b_frame_delay() -> i64 {
    40
}

impl Default for FramedSection {
    fn default() -> Self {
        Self {
            heartbeat_interval_ms: default_heartbeat(),
            b_frame_delay_ms: default_b_frame_delay(),
            low_latency_drop_b: false,
            hot_start: false,
        }
    }
}

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct JitterSection {
    #[serde(default = "default_true")]
    pub enabled: bool,

    /// Dwell before a frame may leave the buffer.
    #[serde(default = "default_jitter_window")]
    pub window_ms: i64,

    #[serde(default = "default_jitter_delay")]
    pub max_delay_ms: i64,

    #[serde(default = "default_true")]
    pub drop_late_frames: bool,

    #[serde(default = "default_jitter_frames")]
    pub max_frames: usize,
}

fn default_jitter_window() -> i64 {
    200
}

fn default_jitter_delay() -> i64 {
    500
}

fn default_jitter_frames() -> usize {
    50
}

impl Default for JitterSection {
    fn default() -> Self {
        Self {
            enabled: default_true(),
            window_ms: default_jitter_window(),
            max_delay_ms: default_jitter_delay(),
            drop_late_frames: default_true(),
            max_frames: default_jitter_frames(),
        }
    }
}

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct LimitsConfig {
    #[serde(default = "default_max_sessions")]
    pub max_sessions: usize,

    /// Idle expiry for sessions.
    #[serde(default = "default_session_timeout")]
    pub session_timeout_ms: i64,
}

fn default_max_sessions() -> usize {
    100
}

fn default_session_timeout() -> i64 {
    300_000
}

impl Default for LimitsConfig {
    fn default() -> Self {
        Self {
            max_sessions: default_max_sessions(),
            session_timeout_ms: default_session_timeout(),
        }
    }
}

#[derive(Debug, Clone, Serialize, Deserialize, Default)]
pub struct QuicSection {
    /// Terminate QUIC in front of the adapters. Off means raw UDP
    /// datagrams go straight to the adapter.
    #[serde(default)]
    pub enabled: bool,

    #[serde(default)]
    pub cert_file: String,

    #[serde(default)]
    pub key_file: String,
}

#[derive(Debug, thiserror::Error)]
pub enum ConfigError {
    #[error("IO error: {0}")]
    Io(String),

    #[error("parse error: {0}")]
    Parse(String),

    #[error("invalid configuration: {0}")]
    Invalid(String),
}

impl Config {
    pub fn from_file<P: AsRef<Path>>(path: P) -> Result<Self, ConfigError> {
        let content =
            std::fs::read_to_string(path.as_ref()).map_err(|e| ConfigError::Io(e.to_string()))?;
        toml::from_str(&content).map_err(|e| ConfigError::Parse(e.to_string()))
    }

    pub fn from_env() -> Self {
        let mut config = Config::default();

        if let Ok(addr) = std::env::var("INGEST_LISTEN_ADDRESS") {
            config.server.listen_address = addr;
        }
        if let Ok(port) = std::env::var("INGEST_LISTEN_PORT") {
            if let Ok(p) = port.parse() {
                config.server.listen_port = p;
            }
        }
        if let Ok(port) = std::env::var("INGEST_HTTP_PORT") {
            if let Ok(p) = port.parse() {
                config.server.http_port = p;
            }
        }
        if let Ok(name) = std::env::var("INGEST_PROTOCOL") {
            config.protocol.name = name;
        }
        if let Ok(max) = std::env::var("INGEST_MAX_SESSIONS") {
            if let Ok(m) = max.parse() {
                config.limits.max_sessions = m;
            }
        }
        if let Ok(k) = std::env::var("INGEST_FEC_K") {
            if let Ok(v) = k.parse() {
                config.fec.k = v;
            }
        }
        if let Ok(n) = std::env::var("INGEST_FEC_N") {
            if let Ok(v) = n.parse() {
                config.fec.n = v;
            }
        }

        config
    }

    /// File if present, environment otherwise.
    pub fn load<P: AsRef<Path>>(path: Option<P>) -> Result<Self, ConfigError> {
        if let Some(p) = path {
            if p.as_ref().exists() {
                return Self::from_file(p);
            }
        }
        Ok(Self::from_env())
    }

    /// The checks the process refuses to start without.
    pub fn validate(&self) -> Result<(), ConfigError> {
        self.fec_config()
            .validate()
            .map_err(|e| ConfigError::Invalid(e.to_string()))?;

        if self.reorder.window_ms <= 0 {
            return Err(ConfigError::Invalid(format!(
                "reorder window must be positive, got {}",
                self.reorder.window_ms
            )));
        }
        if self.protocol.detection_timeout_ms <= 0 {
            return Err(ConfigError::Invalid(format!(
                "detection timeout must be positive, got {}",
                self.protocol.detection_timeout_ms
            )));
        }
        if self.limits.max_sessions == 0 {
            return Err(ConfigError::Invalid("max_sessions must be positive".into()));
        }
        if !matches!(self.protocol.default_mode.as_str(), "quic_fec" | "bare_ts") {
            return Err(ConfigError::Invalid(format!(
                "unknown default_mode {:?}",
                self.protocol.default_mode
            )));
        }
        if self.quic.enabled && (self.quic.cert_file.is_empty() || self.quic.key_file.is_empty()) {
            return Err(ConfigError::Invalid(
                "QUIC listener requires cert_file and key_file".into(),
            ));
        }
        Ok(())
    }

    pub fn fec_config(&self) -> FecGroupConfig {
        FecGroupConfig {
            k: self.fec.k,
            n: self.fec.n,
            repair_deadline_ms: self.fec.repair_deadline_ms,
            keyframe_relax: self.fec.keyframe_relax,
            keyframe_grace_ms: self.fec.keyframe_grace_ms,
        }
    }

    pub fn reorder_config(&self) -> ReorderConfig {
        ReorderConfig {
            window_ms: self.reorder.window_ms,
            keyframe_relax: self.reorder.keyframe_relax,
            keyframe_relax_ms: self.reorder.keyframe_relax_ms,
            max_buffer_size: self.reorder.max_buffer_size,
        }
    }

    pub fn framed_config(&self) -> FramedConfig {
        FramedConfig {
            b_frame_delay_ms: self.framed.b_frame_delay_ms,
            heartbeat_interval_ms: self.framed.heartbeat_interval_ms,
            low_latency_drop_b: self.framed.low_latency_drop_b,
            hot_start: self.framed.hot_start,
        }
    }

    pub fn jitter_config(&self) -> JitterConfig {
        JitterConfig {
            window_ms: self.jitter.window_ms,
            max_delay_ms: self.jitter.max_delay_ms,
            drop_late_frames: self.jitter.drop_late_frames,
            max_frames: self.jitter.max_frames,
        }
    }

    pub fn quicfec_config(&self) -> QuicFecConfig {
        QuicFecConfig {
            fec: self.fec_config(),
            reorder: self.reorder_config(),
            enable_protocol_detection: self.protocol.enable_protocol_detection,
            detection_timeout_ms: self.protocol.detection_timeout_ms,
            default_mode: if self.protocol.default_mode == "bare_ts" {
                TransportMode::BareTs
            } else {
                TransportMode::QuicFec
            },
            hot_start: self.framed.hot_start,
        }
    }
}
