//! # pacc
//!
//! Broadcast a local PulseAudio sink to any number of HTTP listeners and
//! cast the stream to a receiver device on the LAN.
//!
//! ## Architecture Overview
//!
//! ```text
//! ┌──────────────────────────────────────────────────────────────────────┐
//! │                            AUDIO PLANE                               │
//! │  ┌──────────────┐    ┌────────────────────────────┐                  │
//! │  │  Null Sink   │───▶│ Source Adapter (parec)     │                  │
//! │  │  (pactl)     │    │ audio::source              │                  │
//! │  └──────────────┘    └─────────────┬──────────────┘                  │
//! │                                    │ 4096-byte PCM chunks            │
//! │                                    ▼                                 │
//! │                ┌──────────────────────────────────────┐              │
//! │                │  Broadcast Hub (broadcast::hub)      │              │
//! │                │  try_send into bounded queues        │              │
//! │                └────┬───────────────┬────────────┬────┘              │
//! │                     ▼               ▼            ▼                   │
//! │               ┌──────────┐    ┌──────────┐  ┌──────────┐             │
//! │               │ Reader A │    │ Reader B │  │ Reader N │             │
//! │               └────┬─────┘    └────┬─────┘  └────┬─────┘             │
//! │                    ▼               ▼             ▼                   │
//! │               ┌──────────┐    ┌──────────┐  ┌──────────┐             │
//! │               │ Encoder  │    │ Encoder  │  │ Encoder  │  codec      │
//! │               └────┬─────┘    └────┬─────┘  └────┬─────┘             │
//! │                    ▼               ▼             ▼                   │
//! │              GET /stream.flac (server) - one task per connection     │
//! └──────────────────────────────────────────────────────────────────────┘
//!
//! ┌──────────────────────────────────────────────────────────────────────┐
//! │                           CONTROL PLANE                              │
//! │  ┌───────────────────────┐  DeviceDescriptor  ┌───────────────────┐  │
//! │  │ Discovery Scanner     │───────────────────▶│ Session Controller│  │
//! │  │ (mDNS _googlecast)    │                    │ connect/play/quit │  │
//! │  └───────────────────────┘                    └───────────────────┘  │
//! └──────────────────────────────────────────────────────────────────────┘
//! ```

pub mod audio;
pub mod broadcast;
pub mod codec;
pub mod config;
pub mod control;
pub mod discovery;
pub mod error;
pub mod server;
pub mod shutdown;

pub use error::{Error, Result};

/// Application-wide constants
pub mod constants {
    use std::net::Ipv4Addr;

    /// Default sample rate of the null sink
    pub const DEFAULT_SAMPLE_RATE: u32 = 44100;

    /// Default channel count (stereo)
    pub const DEFAULT_CHANNELS: u16 = 2;

    /// Bytes per sample (signed 16-bit little endian)
    pub const BYTES_PER_SAMPLE: usize = 2;

    /// Nominal size of one PCM chunk read from the source
    pub const DEFAULT_CHUNK_SIZE: usize = 4096;

    /// Pending chunks per subscriber before the overflow policy applies
    pub const DEFAULT_QUEUE_CAPACITY: usize = 100;

    /// Default Opus bitrate in bits per second
    pub const DEFAULT_BITRATE: u32 = 128_000;

    /// Default HTTP port for the stream endpoint
    pub const DEFAULT_HTTP_PORT: u16 = 8080;

    /// mDNS multicast group and port
    pub const MDNS_ADDR: Ipv4Addr = Ipv4Addr::new(224, 0, 0, 251);
    pub const MDNS_PORT: u16 = 5353;

    /// DNS-SD service advertised by cast receivers
    pub const CAST_SERVICE: &str = "_googlecast._tcp.local";

    /// Control port used when a response carries no SRV record
    pub const DEFAULT_CAST_PORT: u16 = 8009;

    /// Default media receiver application
    pub const DEFAULT_APP_ID: &str = "CC1AD845";
}
