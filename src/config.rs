//! Application configuration
//!
//! Loaded from TOML. Every section and field has a default, so an empty or
//! missing file yields a working setup.

use std::net::Ipv4Addr;
use std::path::{Path, PathBuf};
use std::time::Duration;

use directories::ProjectDirs;
use serde::{Deserialize, Serialize};

use crate::audio::AudioFormat;
use crate::broadcast::{HubConfig, OverflowPolicy};
use crate::codec::{Codec, EncoderParams, EncodingSession};
use crate::constants::*;
use crate::error::Error;

/// Environment variable overriding the config file location
pub const CONFIG_ENV: &str = "PACC_CONFIG";

#[derive(Debug, Clone, Default, Serialize, Deserialize)]
#[serde(default)]
pub struct AppConfig {
    pub audio: AudioConfig,
    pub stream: StreamConfig,
    pub discovery: DiscoveryConfig,
    pub control: ControlConfig,
}

/// Null sink and capture settings
#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(default)]
pub struct AudioConfig {
    pub sink_name: String,
    pub description: String,
    pub sample_rate: u32,
    pub channels: u16,
    /// Bytes per chunk read from the sink
    pub chunk_size: usize,
    pub use_system_clock_for_timing: bool,
}

impl Default for AudioConfig {
    fn default() -> Self {
        Self {
            sink_name: "PACC".to_string(),
            description: "PACC Output".to_string(),
            sample_rate: DEFAULT_SAMPLE_RATE,
            channels: DEFAULT_CHANNELS,
            chunk_size: DEFAULT_CHUNK_SIZE,
            use_system_clock_for_timing: true,
        }
    }
}

impl AudioConfig {
    pub fn format(&self) -> AudioFormat {
        AudioFormat::new(self.sample_rate, self.channels)
    }
}

/// HTTP delivery and fan-out settings
#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(default)]
pub struct StreamConfig {
    pub bind_address: String,
    pub port: u16,
    /// Address handed to the receiver; detected from the LAN interface when unset
    pub advertise_address: Option<Ipv4Addr>,
    pub codec: Codec,
    /// Opus target bitrate
    pub bitrate: u32,
    /// Pending chunks per listener
    pub queue_capacity: usize,
    pub overflow: OverflowPolicy,
    /// Hard limit on one connection's lifetime
    pub max_connection_secs: Option<u64>,
    /// Encoded packets buffered between the encoder task and the socket
    pub body_buffer: usize,
}

impl Default for StreamConfig {
    fn default() -> Self {
        Self {
            bind_address: "0.0.0.0".to_string(),
            port: DEFAULT_HTTP_PORT,
            advertise_address: None,
            codec: Codec::default(),
            bitrate: DEFAULT_BITRATE,
            queue_capacity: DEFAULT_QUEUE_CAPACITY,
            overflow: OverflowPolicy::default(),
            max_connection_secs: None,
            body_buffer: 32,
        }
    }
}

impl StreamConfig {
    /// Path of the stream endpoint, e.g. `/stream.flac`
    pub fn path(&self) -> String {
        crate::server::stream_path(self.codec)
    }

    pub fn hub_config(&self) -> HubConfig {
        HubConfig {
            queue_capacity: self.queue_capacity,
            overflow: self.overflow,
        }
    }

    pub fn encoder_params(&self, format: AudioFormat) -> EncoderParams {
        EncoderParams::new(format, self.bitrate)
    }

    pub fn max_connection(&self) -> Option<Duration> {
        self.max_connection_secs.map(Duration::from_secs)
    }
}

/// Device discovery settings
#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(default)]
pub struct DiscoveryConfig {
    pub timeout_ms: u64,
    /// How often the query is re-sent during one scan
    pub requery_interval_ms: u64,
    /// Interface address to scan from; auto-selected when unset
    pub interface: Option<Ipv4Addr>,
    pub service: String,
}

impl Default for DiscoveryConfig {
    fn default() -> Self {
        Self {
            timeout_ms: 5000,
            requery_interval_ms: 1000,
            interface: None,
            service: CAST_SERVICE.to_string(),
        }
    }
}

impl DiscoveryConfig {
    pub fn timeout(&self) -> Duration {
        Duration::from_millis(self.timeout_ms)
    }

    pub fn requery_interval(&self) -> Duration {
        Duration::from_millis(self.requery_interval_ms)
    }
}

/// Receiver control settings
#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(default)]
pub struct ControlConfig {
    pub app_id: String,
    pub quit_timeout_ms: u64,
}

impl Default for ControlConfig {
    fn default() -> Self {
        Self {
            app_id: DEFAULT_APP_ID.to_string(),
            quit_timeout_ms: 5000,
        }
    }
}

impl ControlConfig {
    pub fn quit_timeout(&self) -> Duration {
        Duration::from_millis(self.quit_timeout_ms)
    }
}

impl AppConfig {
    /// Default config file location (`$PACC_CONFIG` wins)
    pub fn default_path() -> Option<PathBuf> {
        if let Some(path) = std::env::var_os(CONFIG_ENV) {
            return Some(PathBuf::from(path));
        }
        ProjectDirs::from("", "", "pacc").map(|dirs| dirs.config_dir().join("config.toml"))
    }

    /// Load from the default location, falling back to defaults
    pub fn load() -> Result<Self, Error> {
        match Self::default_path() {
            Some(path) if path.exists() => Self::from_file(&path),
            _ => Ok(Self::default()),
        }
    }

    pub fn from_file(path: &Path) -> Result<Self, Error> {
        let text = std::fs::read_to_string(path)?;
        let config = Self::from_toml(&text)
            .map_err(|e| Error::Config(format!("{}: {}", path.display(), e)))?;
        tracing::info!(path = %path.display(), "Loaded configuration");
        Ok(config)
    }

    pub fn from_toml(text: &str) -> Result<Self, Error> {
        let config: Self = toml::from_str(text).map_err(|e| Error::Config(e.to_string()))?;
        config.validate()?;
        Ok(config)
    }

    pub fn validate(&self) -> Result<(), Error> {
        let invalid = |msg: &str| Err(Error::Config(msg.to_string()));

        if self.audio.sink_name.is_empty() {
            return invalid("audio.sink_name must not be empty");
        }
        if self.audio.sample_rate == 0 || self.audio.channels == 0 {
            return invalid("audio.sample_rate and audio.channels must be positive");
        }
        if self.audio.chunk_size == 0 || self.audio.chunk_size % self.audio.format().bytes_per_frame() != 0 {
            return invalid("audio.chunk_size must be a positive multiple of the sample frame size");
        }
        if self.stream.queue_capacity == 0 {
            return invalid("stream.queue_capacity must be positive");
        }
        if self.stream.body_buffer == 0 {
            return invalid("stream.body_buffer must be positive");
        }
        if let OverflowPolicy::Evict { after: 0 } = self.stream.overflow {
            return invalid("stream.overflow.after must be positive");
        }
        if self.stream.max_connection_secs == Some(0) {
            return invalid("stream.max_connection_secs must be positive");
        }
        if self.discovery.timeout_ms == 0 || self.discovery.requery_interval_ms == 0 {
            return invalid("discovery timeouts must be positive");
        }
        if self.control.quit_timeout_ms == 0 {
            return invalid("control.quit_timeout_ms must be positive");
        }

        // the codec must accept the capture format, or every stream request fails
        let params = self.stream.encoder_params(self.audio.format());
        EncodingSession::open(self.stream.codec, params).map_err(|e| {
            Error::Config(format!("stream.codec {:?} cannot encode this audio: {}", self.stream.codec, e))
        })?;
        Ok(())
    }
}
