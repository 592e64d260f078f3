//! Core types shared by every layer of the station core
//!
//! Identities, connection states, configuration and the error type live here.

pub mod config;
pub mod error;
pub mod serde;
pub mod types;

pub use self::config::{
    AnnouncedDevice, BroadcasterConfig, Config, EndpointConfig, HubConfig, ListenerConfig,
    PollingConfig, ReconnectPolicy, TimeoutConfig,
};
pub use self::error::{Error, Result};
pub use self::types::{
    ConnectionState, DeviceDescriptor, DeviceFamily, DeviceIdentity, DeviceKey, Protocol,
};

/// SmartSDR control and discovery port
pub const SMARTSDR_PORT: u16 = 4992;

/// JSON CAT control port
pub const JSON_CAT_PORT: u16 = 7355;

/// rotctld control port
pub const ROTCTLD_PORT: u16 = 4533;

/// Antenna switch control port
pub const ANTENNA_SWITCH_PORT: u16 = 6800;

/// Amplifier control port
pub const AMPLIFIER_PORT: u16 = 50000;

/// Default cluster spot multicast port
pub const CLUSTER_SPOT_PORT: u16 = 7373;

/// Maximum UDP datagram we accept
pub const MAX_DATAGRAM_SIZE: usize = 65507;
