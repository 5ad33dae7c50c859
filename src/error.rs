//! Error types for the broadcaster

use std::time::Duration;

use thiserror::Error;

use crate::broadcast::SubscriberId;

/// Main error type for the application
#[derive(Error, Debug)]
pub enum Error {
    #[error("Source error: {0}")]
    Source(#[from] SourceError),

    #[error("Hub error: {0}")]
    Hub(#[from] HubError),

    #[error("Codec error: {0}")]
    Codec(#[from] CodecError),

    #[error("Delivery error: {0}")]
    Delivery(#[from] DeliveryError),

    #[error("Discovery error: {0}")]
    Discovery(#[from] DiscoveryError),

    #[error("Control error: {0}")]
    Control(#[from] ControlError),

    #[error("Configuration error: {0}")]
    Config(String),

    #[error("IO error: {0}")]
    Io(#[from] std::io::Error),
}

/// Audio source errors. Any of these stops the whole broadcast.
#[derive(Error, Debug)]
pub enum SourceError {
    #[error("Audio source unavailable: {0}")]
    Unavailable(String),

    #[error("Audio source read failed: {0}")]
    Io(#[from] std::io::Error),
}

/// Broadcast hub errors
#[derive(Error, Debug, Clone, PartialEq, Eq)]
pub enum HubError {
    #[error("Hub has stopped")]
    Stopped,

    #[error("Hub is already running")]
    AlreadyStarted,

    #[error("Subscriber {0} is not subscribed")]
    NotSubscribed(SubscriberId),

    #[error("Failed to spawn hub thread: {0}")]
    Spawn(String),
}

/// Codec errors. Fatal to one encoding session only.
#[derive(Error, Debug, Clone, PartialEq, Eq)]
pub enum CodecError {
    #[error("Codec unavailable: {0}")]
    Unavailable(String),

    #[error("Codec configuration rejected: {0}")]
    ConfigRejected(String),

    #[error("Encoding failed: {0}")]
    EncodingFailed(String),

    #[error("Encoding session already closed")]
    AlreadyClosed,
}

/// Per-connection delivery errors
#[derive(Error, Debug)]
pub enum DeliveryError {
    #[error("Client went away, write failed")]
    WriteFailed,

    #[error("Server bind failed: {0}")]
    BindFailed(String),
}

/// Device discovery errors
#[derive(Error, Debug)]
pub enum DiscoveryError {
    #[error("Device not found: {0}")]
    DeviceNotFound(String),

    #[error("Scanner already used; create a new scanner for another scan")]
    ScannerUsed,

    #[error("No usable network interface")]
    NoInterface,

    #[error("Discovery socket error: {0}")]
    Io(#[from] std::io::Error),
}

/// Device control errors
#[derive(Error, Debug)]
pub enum ControlError {
    #[error("Connection to {address} failed: {reason}")]
    Connection { address: String, reason: String },

    #[error("Command timed out after {0:?}")]
    CommandTimeout(Duration),

    #[error("Command rejected by device: {0}")]
    Command(String),

    #[error("No active playback session")]
    NoSession,

    #[error("A playback session is already active")]
    SessionActive,
}

/// Result type alias for the application
pub type Result<T> = std::result::Result<T, Error>;
