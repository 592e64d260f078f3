//! Stationlink: hardware integration core for an amateur radio station
//!
//! This library discovers and connects to station devices (transceivers,
//! rotators, antenna switches, amplifiers and DX cluster spot feeds), keeps a
//! connection state machine per device, and republishes everything as one
//! normalized event stream that any number of subscribers can follow and send
//! commands through.
pub mod adapter;
pub mod codec;
pub mod core;
pub mod network;
pub mod protocol;
pub mod util;

// Re-export commonly used items
pub use crate::core::{Config, DeviceKey, Error, Result};
pub use crate::network::{HubHandle, Station, Subscription};
pub use crate::protocol::{Command, DeviceCommand, EventPayload, NormalizedEvent};

/// Library version
pub const VERSION: &str = env!("CARGO_PKG_VERSION");

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_version() {
        assert!(!VERSION.is_empty());
    }
}
