//! Centralized configuration for Gridcast.
//!
//! All tunable parameters and settings are defined here to avoid
//! hard-coded values scattered throughout the codebase.

use std::path::PathBuf;
use std::time::Duration;

use thiserror::Error;
use tracing::warn;

/// Errors raised when a configuration cannot be used.
#[derive(Debug, Error, PartialEq, Eq)]
pub enum ConfigError {
    #[error("Invalid configuration value for {field}: {reason}")]
    InvalidValue { field: &'static str, reason: String },
}

/// Central configuration for all Gridcast components.
///
/// Groups related configuration settings into logical sections.
/// Supports environment variable overrides for runtime customization.
#[derive(Debug, Clone, Default)]
pub struct GridcastConfig {
    pub encoder: EncoderConfig,
    pub degraded: DegradedConfig,
    pub stream: StreamConfig,
    pub liveness: LivenessConfig,
    pub ingest: IngestConfig,
    pub server: ServerConfig,
}

/// External encoder pipeline configuration.
///
/// Encoding parameters are passed through to the encoder verbatim; the
/// supervisor never computes them.
#[derive(Debug, Clone)]
pub struct EncoderConfig {
    /// Encoder binary to spawn
    pub program: PathBuf,
    /// Template used to turn a source id into a URL, `{id}` is substituted
    pub source_url_template: String,
    /// Exact number of sources a full grid session requires
    pub source_count: usize,
    /// Columns in the composite grid
    pub grid_columns: usize,
    /// Width of one scaled tile in pixels
    pub tile_width: u32,
    /// Height of one scaled tile in pixels
    pub tile_height: u32,
    /// Output frame rate
    pub frame_rate: u32,
    /// Output video bitrate in encoder notation
    pub video_bitrate: String,
    /// Frames between forced keyframes
    pub keyframe_interval: u32,
    /// Socket I/O timeout for each camera input; a stalled source fails after this
    pub source_timeout: Duration,
    /// Size of each read from the encoder's stdout
    pub read_chunk_size: usize,
    /// Capacity of the encoder event channel
    pub event_capacity: usize,
}

impl Default for EncoderConfig {
    fn default() -> Self {
        Self {
            program: PathBuf::from("ffmpeg"),
            source_url_template: "rtsp://127.0.0.1:8554/{id}".to_string(),
            source_count: 6,
            grid_columns: 3,
            tile_width: 640,
            tile_height: 360,
            frame_rate: 15,
            video_bitrate: "1500k".to_string(),
            keyframe_interval: 30,
            source_timeout: Duration::from_secs(5),
            read_chunk_size: 64 * 1024, // 64 KiB
            event_capacity: 256,
        }
    }
}

/// Rotating-subgroup operating mode configuration.
#[derive(Debug, Clone)]
pub struct DegradedConfig {
    /// Sources shown at the same time while rotating
    pub group_size: usize,
    /// How long each subgroup stays on screen
    pub dwell: Duration,
}

impl Default for DegradedConfig {
    fn default() -> Self {
        Self {
            group_size: 3,
            dwell: Duration::from_secs(15),
        }
    }
}

/// Server-side stream forwarding configuration.
#[derive(Debug, Clone)]
pub struct StreamConfig {
    /// Outstanding bytes on the client socket above which chunks are dropped
    pub backpressure_threshold: usize,
}

impl Default for StreamConfig {
    fn default() -> Self {
        Self {
            backpressure_threshold: 5 * 1024 * 1024, // 5 MiB
        }
    }
}

/// Heartbeat configuration.
#[derive(Debug, Clone)]
pub struct LivenessConfig {
    /// Interval between pings; a missing pong by the next tick closes the connection
    pub ping_interval: Duration,
}

impl Default for LivenessConfig {
    fn default() -> Self {
        Self {
            ping_interval: Duration::from_secs(60),
        }
    }
}

/// Client ingest buffer configuration.
#[derive(Debug, Clone)]
pub struct IngestConfig {
    /// Queue depth above which the oldest half is discarded
    pub max_queue_len: usize,
    /// Consecutive append failures before the queue is flushed
    pub max_chunk_errors: u32,
    /// Delay before retrying a failed append
    pub retry_delay: Duration,
    /// Interval of the sink trimming pass
    pub maintenance_interval: Duration,
    /// Buffered media older than this triggers a trim
    pub retention: Duration,
    /// Media kept behind the playhead after a trim
    pub trim_to: Duration,
}

impl Default for IngestConfig {
    fn default() -> Self {
        Self {
            max_queue_len: 10,
            max_chunk_errors: 50,
            retry_delay: Duration::from_millis(50),
            maintenance_interval: Duration::from_secs(30),
            retention: Duration::from_secs(20),
            trim_to: Duration::from_secs(10),
        }
    }
}

/// HTTP server configuration.
#[derive(Debug, Clone)]
pub struct ServerConfig {
    pub host: String,
    pub port: u16,
    /// Path of the streaming WebSocket endpoint
    pub stream_path: &'static str,
}

impl Default for ServerConfig {
    fn default() -> Self {
        Self {
            host: "127.0.0.1".to_string(),
            port: 3000,
            stream_path: "/stream",
        }
    }
}

impl ServerConfig {
    /// Returns the `host:port` pair the server binds to.
    pub fn bind_address(&self) -> String {
        format!("{}:{}", self.host, self.port)
    }
}

impl GridcastConfig {
    /// Creates configuration with environment variable overrides.
    ///
    /// Allows runtime configuration via environment variables while
    /// maintaining sensible defaults. Unparseable values are ignored.
    pub fn from_env() -> Self {
        let mut config = Self::default();

        if let Ok(program) = std::env::var("GRIDCAST_FFMPEG_PATH") {
            config.encoder.program = PathBuf::from(program);
        }

        if let Ok(template) = std::env::var("GRIDCAST_SOURCE_TEMPLATE") {
            config.encoder.source_url_template = template;
        }

        if let Some(count) = parse_env::<usize>("GRIDCAST_SOURCE_COUNT") {
            config.encoder.source_count = count;
        }

        if let Some(bytes) = parse_env::<usize>("GRIDCAST_BACKPRESSURE_BYTES") {
            config.stream.backpressure_threshold = bytes;
        }

        if let Some(seconds) = parse_env::<u64>("GRIDCAST_PING_SECONDS") {
            config.liveness.ping_interval = Duration::from_secs(seconds);
        }

        if let Ok(host) = std::env::var("GRIDCAST_HOST") {
            config.server.host = host;
        }

        if let Some(port) = parse_env::<u16>("GRIDCAST_PORT") {
            config.server.port = port;
        }

        config
    }

    /// Creates a configuration with short timers for tests.
    pub fn for_testing() -> Self {
        Self {
            degraded: DegradedConfig {
                group_size: 3,
                dwell: Duration::from_millis(200),
            },
            liveness: LivenessConfig {
                ping_interval: Duration::from_millis(200),
            },
            ingest: IngestConfig {
                retry_delay: Duration::from_millis(5),
                maintenance_interval: Duration::from_millis(100),
                ..Default::default()
            },
            ..Default::default()
        }
    }

    /// Checks cross-field constraints.
    ///
    /// # Errors
    ///
    /// - `ConfigError::InvalidValue` - A count is zero or the trim window is inconsistent
    pub fn validate(&self) -> Result<(), ConfigError> {
        if self.encoder.source_count == 0 {
            return Err(invalid("encoder.source_count", "must be at least 1"));
        }
        if self.encoder.grid_columns == 0 {
            return Err(invalid("encoder.grid_columns", "must be at least 1"));
        }
        if self.encoder.read_chunk_size == 0 {
            return Err(invalid("encoder.read_chunk_size", "must be greater than 0"));
        }
        if self.degraded.group_size == 0 {
            return Err(invalid("degraded.group_size", "must be at least 1"));
        }
        if self.ingest.max_queue_len == 0 {
            return Err(invalid("ingest.max_queue_len", "must be at least 1"));
        }
        if self.ingest.trim_to >= self.ingest.retention {
            return Err(invalid(
                "ingest.trim_to",
                "must be shorter than ingest.retention",
            ));
        }
        Ok(())
    }
}

fn invalid(field: &'static str, reason: &str) -> ConfigError {
    ConfigError::InvalidValue {
        field,
        reason: reason.to_string(),
    }
}

fn parse_env<T: std::str::FromStr>(key: &str) -> Option<T> {
    let raw = std::env::var(key).ok()?;
    match raw.parse::<T>() {
        Ok(value) => Some(value),
        Err(_) => {
            warn!(key, value = %raw, "Ignoring unparseable environment override");
            None
        }
    }
}
