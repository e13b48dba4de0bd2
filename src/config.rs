//! Server configuration
//!
//! Every section deserializes from TOML with all fields optional; missing
//! fields take the defaults below.
//!
//! ```toml
//! [listener]
//! address = "0.0.0.0"
//! port = 8443
//!
//! [tls]
//! cert_file = "server.pem"
//! key_file = "server.key"
//! alpn = ["h2", "http/1.1"]
//!
//! [workers]
//! mode = "thread"
//! count = 8
//!
//! [http2]
//! initial_window_size = 1048576
//! max_concurrent_streams = 250
//! ```

use serde::Deserialize;
use std::collections::HashMap;
use std::net::{IpAddr, SocketAddr};
use std::path::{Path, PathBuf};
use std::time::Duration;

/// Result type for configuration loading
pub type Result<T> = std::result::Result<T, ConfigError>;

#[derive(Debug, thiserror::Error)]
pub enum ConfigError {
    #[error("Cannot read {path}: {source}")]
    Read {
        path: PathBuf,
        source: std::io::Error,
    },

    #[error("Invalid configuration syntax: {0}")]
    Parse(#[from] toml::de::Error),

    #[error("Invalid value for {field}: {reason}")]
    Invalid { field: &'static str, reason: String },
}

fn invalid(field: &'static str, reason: impl Into<String>) -> ConfigError {
    ConfigError::Invalid {
        field,
        reason: reason.into(),
    }
}

#[derive(Debug, Clone, Default, Deserialize)]
#[serde(default)]
pub struct ServerConfig {
    pub listener: ListenerConfig,
    pub tls: TlsSettings,
    pub timeouts: TimeoutConfig,
    pub buffers: BufferConfig,
    pub workers: WorkerConfig,
    pub http2: Http2Config,
    pub websocket: WebSocketConfig,
    pub compression: CompressionConfig,
    pub security: SecurityConfig,
    /// Status code to replacement body, e.g. `404 = "<h1>gone</h1>"`
    pub status_overrides: HashMap<String, String>,
    pub logging: LoggingConfig,
}

impl ServerConfig {
    pub fn from_toml_str(source: &str) -> Result<Self> {
        let config: ServerConfig = toml::from_str(source)?;
        config.validate()?;
        Ok(config)
    }

    pub fn from_file(path: impl AsRef<Path>) -> Result<Self> {
        let path = path.as_ref();
        let source = std::fs::read_to_string(path).map_err(|source| ConfigError::Read {
            path: path.to_path_buf(),
            source,
        })?;
        Self::from_toml_str(&source)
    }

    /// Reject values the server cannot run with
    pub fn validate(&self) -> Result<()> {
        self.listener.address.parse::<IpAddr>().map_err(|e| {
            invalid("listener.address", format!("{}: {}", self.listener.address, e))
        })?;

        if self.tls.key_file.is_some() && self.tls.cert_file.is_none() {
            return Err(invalid("tls.key_file", "set without tls.cert_file"));
        }
        if let Some(version) = &self.tls.min_version {
            crate::xsocket::TlsVersion::from_str(version)
                .map_err(|e| invalid("tls.min_version", e.to_string()))?;
        }

        if self.workers.count == 0 && self.workers.mode != WorkerMode::Async {
            return Err(invalid("workers.count", "must be at least 1"));
        }
        if self.buffers.read_size == 0 {
            return Err(invalid("buffers.read_size", "must be positive"));
        }
        if self.buffers.max_header_bytes < 64 {
            return Err(invalid("buffers.max_header_bytes", "must be at least 64"));
        }

        let h2 = &self.http2;
        if h2.initial_window_size > crate::http::h2::settings::MAX_WINDOW_SIZE {
            return Err(invalid("http2.initial_window_size", "exceeds 2^31-1"));
        }
        if !(16_384..=crate::http::h2::settings::MAX_MAX_FRAME_SIZE).contains(&h2.max_frame_size) {
            return Err(invalid("http2.max_frame_size", "must be within 16384..=16777215"));
        }

        let ws = &self.websocket;
        if ws.max_frame_size == 0 || ws.max_message_size < ws.max_frame_size {
            return Err(invalid(
                "websocket.max_message_size",
                "must be positive and at least websocket.max_frame_size",
            ));
        }
        if ws.max_missed_pongs == 0 {
            return Err(invalid("websocket.max_missed_pongs", "must be at least 1"));
        }

        if self.compression.level > 9 {
            return Err(invalid("compression.level", "must be within 0..=9"));
        }

        for code in self.status_overrides.keys() {
            match code.parse::<u16>() {
                Ok(n) if (100..=599).contains(&n) => {}
                _ => return Err(invalid("status_overrides", format!("bad status {}", code))),
            }
        }
        Ok(())
    }

    /// Status overrides keyed by numeric code
    pub fn status_override_map(&self) -> HashMap<u16, String> {
        self.status_overrides
            .iter()
            .filter_map(|(code, body)| Some((code.parse().ok()?, body.clone())))
            .collect()
    }
}

#[derive(Debug, Clone, Deserialize)]
#[serde(default)]
pub struct ListenerConfig {
    pub address: String,
    pub port: u16,
    pub backlog: i32,
}

impl Default for ListenerConfig {
    fn default() -> Self {
        ListenerConfig {
            address: "127.0.0.1".to_string(),
            port: 8000,
            backlog: 1024,
        }
    }
}

impl ListenerConfig {
    pub fn socket_addr(&self) -> Result<SocketAddr> {
        let ip: IpAddr = self
            .address
            .parse()
            .map_err(|e: std::net::AddrParseError| invalid("listener.address", e.to_string()))?;
        Ok(SocketAddr::new(ip, self.port))
    }
}

#[derive(Debug, Clone, Deserialize)]
#[serde(default)]
pub struct TlsSettings {
    pub cert_file: Option<PathBuf>,
    pub key_file: Option<PathBuf>,
    /// "TLSv1.2" or "TLSv1.3"
    pub min_version: Option<String>,
    pub alpn: Vec<String>,
    /// Serve with the bundled development certificate when no cert is configured
    pub allow_builtin_cert: bool,
}

impl Default for TlsSettings {
    fn default() -> Self {
        TlsSettings {
            cert_file: None,
            key_file: None,
            min_version: None,
            alpn: vec!["h2".to_string(), "http/1.1".to_string()],
            allow_builtin_cert: false,
        }
    }
}

impl TlsSettings {
    /// TLS is on when a certificate or the builtin one is configured
    pub fn enabled(&self) -> bool {
        self.cert_file.is_some() || self.allow_builtin_cert
    }
}

/// Timeouts, in milliseconds
#[derive(Debug, Clone, Deserialize)]
#[serde(default)]
pub struct TimeoutConfig {
    pub keep_alive_ms: u64,
    pub request_read_ms: u64,
    /// Quiet period that ends a body without framing headers
    pub stream_read_ms: u64,
    pub handshake_ms: u64,
    /// HTTP/2 connections with no traffic are closed after this long
    pub h2_idle_ms: u64,
}

impl Default for TimeoutConfig {
    fn default() -> Self {
        TimeoutConfig {
            keep_alive_ms: 5_000,
            request_read_ms: 30_000,
            stream_read_ms: 200,
            handshake_ms: 10_000,
            h2_idle_ms: 60_000,
        }
    }
}

impl TimeoutConfig {
    pub fn keep_alive(&self) -> Duration {
        Duration::from_millis(self.keep_alive_ms)
    }

    pub fn request_read(&self) -> Duration {
        Duration::from_millis(self.request_read_ms)
    }

    pub fn stream_read(&self) -> Duration {
        Duration::from_millis(self.stream_read_ms)
    }

    pub fn handshake(&self) -> Duration {
        Duration::from_millis(self.handshake_ms)
    }

    pub fn h2_idle(&self) -> Duration {
        Duration::from_millis(self.h2_idle_ms)
    }
}

#[derive(Debug, Clone, Deserialize)]
#[serde(default)]
pub struct BufferConfig {
    pub read_size: usize,
    pub max_header_bytes: usize,
}

impl Default for BufferConfig {
    fn default() -> Self {
        BufferConfig {
            read_size: 16 * 1024,
            max_header_bytes: 64 * 1024,
        }
    }
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum WorkerMode {
    /// One pooled thread per connection
    Thread,
    /// Forked processes sharing the listening socket
    Process,
    /// A single event loop
    Async,
}

#[derive(Debug, Clone, Deserialize)]
#[serde(default)]
pub struct WorkerConfig {
    pub mode: WorkerMode,
    pub count: usize,
    /// Processes in process mode; each runs `count` threads
    pub processes: usize,
    pub name_prefix: String,
    pub monitor_interval_ms: u64,
    /// A heartbeat older than this marks the worker unhealthy; 0 disables the check
    pub heartbeat_max_age_ms: u64,
    /// Time a fresh worker has before its first heartbeat is required
    pub heartbeat_grace_ms: u64,
}

impl Default for WorkerConfig {
    fn default() -> Self {
        WorkerConfig {
            mode: WorkerMode::Thread,
            count: 16,
            processes: 2,
            name_prefix: "xserve-worker".to_string(),
            monitor_interval_ms: 1_000,
            heartbeat_max_age_ms: 0,
            heartbeat_grace_ms: 5_000,
        }
    }
}

impl WorkerConfig {
    pub fn monitor_interval(&self) -> Duration {
        Duration::from_millis(self.monitor_interval_ms)
    }

    pub fn heartbeat_max_age(&self) -> Option<Duration> {
        (self.heartbeat_max_age_ms > 0).then(|| Duration::from_millis(self.heartbeat_max_age_ms))
    }

    pub fn heartbeat_grace(&self) -> Duration {
        Duration::from_millis(self.heartbeat_grace_ms)
    }
}

#[derive(Debug, Clone, Deserialize)]
#[serde(default)]
pub struct Http2Config {
    pub enabled: bool,
    pub initial_window_size: u32,
    pub max_concurrent_streams: u32,
    pub max_frame_size: u32,
    pub header_table_size: u32,
}

impl Default for Http2Config {
    fn default() -> Self {
        Http2Config {
            enabled: true,
            initial_window_size: 65_535,
            max_concurrent_streams: 100,
            max_frame_size: 16_384,
            header_table_size: 4_096,
        }
    }
}

impl Http2Config {
    pub fn connection_config(&self) -> crate::http::h2::ConnectionConfig {
        crate::http::h2::ConnectionConfig {
            initial_window_size: self.initial_window_size,
            max_concurrent_streams: self.max_concurrent_streams,
            max_frame_size: self.max_frame_size,
            header_table_size: self.header_table_size,
            max_header_list_size: None,
        }
    }
}

#[derive(Debug, Clone, Deserialize)]
#[serde(default)]
pub struct WebSocketConfig {
    pub enabled: bool,
    /// Allowed `Origin` values; `*` accepts any, empty accepts requests without one only
    pub allowed_origins: Vec<String>,
    pub max_frame_size: usize,
    pub max_message_size: usize,
    pub permessage_deflate: bool,
    pub ping_interval_ms: u64,
    pub pong_timeout_ms: u64,
    pub max_missed_pongs: u32,
    pub backoff_cap_ms: u64,
}

impl Default for WebSocketConfig {
    fn default() -> Self {
        WebSocketConfig {
            enabled: true,
            allowed_origins: vec!["*".to_string()],
            max_frame_size: 64 * 1024,
            max_message_size: 16 * 1024 * 1024,
            permessage_deflate: true,
            ping_interval_ms: 20_000,
            pong_timeout_ms: 10_000,
            max_missed_pongs: 3,
            backoff_cap_ms: 60_000,
        }
    }
}

#[derive(Debug, Clone, Deserialize)]
#[serde(default)]
pub struct CompressionConfig {
    pub enabled: bool,
    /// Fixed bodies shorter than this go out uncompressed
    pub min_size: usize,
    pub level: u32,
    /// Prefix of the first streamed chunk used to judge compressibility
    pub probe_size: usize,
    /// Content-type prefixes eligible for compression
    pub mimetypes: Vec<String>,
}

impl Default for CompressionConfig {
    fn default() -> Self {
        CompressionConfig {
            enabled: true,
            min_size: 500,
            level: 6,
            probe_size: 1024,
            mimetypes: vec![
                "text/".to_string(),
                "application/json".to_string(),
                "application/javascript".to_string(),
                "application/xml".to_string(),
                "image/svg+xml".to_string(),
            ],
        }
    }
}

#[derive(Debug, Clone, Default, Deserialize)]
#[serde(default)]
pub struct SecurityConfig {
    /// Set on every response unless the handler already set them
    pub headers: HashMap<String, String>,
    pub cors_allow_origin: Option<String>,
    pub cors_allow_methods: Vec<String>,
    pub cors_allow_headers: Vec<String>,
    /// Directive name to sources; `{nonce}` becomes the per-request nonce
    pub csp: HashMap<String, Vec<String>>,
}

#[derive(Debug, Clone, Deserialize)]
#[serde(default)]
pub struct LoggingConfig {
    /// Filter directive, overridden by `RUST_LOG`
    pub level: String,
    pub json: bool,
}

impl Default for LoggingConfig {
    fn default() -> Self {
        LoggingConfig {
            level: "info".to_string(),
            json: false,
        }
    }
}
