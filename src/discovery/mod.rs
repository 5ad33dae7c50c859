//! Receiver discovery
//!
//! A [`DeviceScanner`] runs one bounded scan over a [`DiscoveryBackend`].
//! The production backend speaks mDNS on a single LAN interface.

pub mod mdns;
pub mod net;
pub mod scanner;

use std::net::IpAddr;

use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};

pub use mdns::MdnsBackend;
pub use net::select_interface;
pub use scanner::{DeviceScanner, DiscoveryBackend, ScanState, ScanStream};

/// A receiver seen during a scan
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct DeviceDescriptor {
    /// Friendly name, the only key devices are matched by
    pub name: String,
    pub address: IpAddr,
    pub port: u16,
    pub first_seen: DateTime<Utc>,
    pub model: Option<String>,
    pub id: Option<String>,
}

impl DeviceDescriptor {
    pub fn new(name: impl Into<String>, address: IpAddr, port: u16) -> Self {
        Self {
            name: name.into(),
            address,
            port,
            first_seen: Utc::now(),
            model: None,
            id: None,
        }
    }
}
