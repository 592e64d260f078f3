use std::fmt;
use std::hash::{Hash, Hasher};
use std::str::FromStr;

use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};

use super::error::Error;

/// Kind of station device
#[derive(Debug, Clone, Copy, PartialEq, Eq, PartialOrd, Ord, Hash, Serialize, Deserialize)]
#[serde(rename_all = "kebab-case")]
pub enum DeviceFamily {
    /// CAT-controlled transceiver
    Radio,
    /// Antenna rotator
    Rotator,
    /// Antenna switch
    AntennaSwitch,
    /// Power amplifier
    Amplifier,
    /// DX cluster spot feed
    Cluster,
}

impl DeviceFamily {
    /// Short lowercase name used in keys and logs
    pub fn as_str(&self) -> &'static str {
        match self {
            DeviceFamily::Radio => "radio",
            DeviceFamily::Rotator => "rotator",
            DeviceFamily::AntennaSwitch => "antenna-switch",
            DeviceFamily::Amplifier => "amplifier",
            DeviceFamily::Cluster => "cluster",
        }
    }
}

impl fmt::Display for DeviceFamily {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(self.as_str())
    }
}

/// Concrete wire protocol spoken by a device
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "kebab-case")]
pub enum Protocol {
    /// FlexRadio-style meta-command text protocol
    SmartSdr,
    /// Newline-delimited JSON CAT protocol
    JsonCat,
    /// hamlib rotctld text protocol
    Rotctld,
    /// Binary antenna switch protocol
    AntennaSwitch,
    /// Binary amplifier protocol
    Amplifier,
    /// Free-text DX cluster spots over UDP multicast
    ClusterSpots,
}

impl Protocol {
    /// Family this protocol belongs to
    pub fn family(&self) -> DeviceFamily {
        match self {
            Protocol::SmartSdr | Protocol::JsonCat => DeviceFamily::Radio,
            Protocol::Rotctld => DeviceFamily::Rotator,
            Protocol::AntennaSwitch => DeviceFamily::AntennaSwitch,
            Protocol::Amplifier => DeviceFamily::Amplifier,
            Protocol::ClusterSpots => DeviceFamily::Cluster,
        }
    }

    /// Default device-side port
    pub fn default_port(&self) -> u16 {
        match self {
            Protocol::SmartSdr => super::SMARTSDR_PORT,
            Protocol::JsonCat => super::JSON_CAT_PORT,
            Protocol::Rotctld => super::ROTCTLD_PORT,
            Protocol::AntennaSwitch => super::ANTENNA_SWITCH_PORT,
            Protocol::Amplifier => super::AMPLIFIER_PORT,
            Protocol::ClusterSpots => super::CLUSTER_SPOT_PORT,
        }
    }
}

/// Registry key: family plus serial-or-address
#[derive(Debug, Clone, PartialEq, Eq, Hash, PartialOrd, Ord, Serialize, Deserialize)]
pub struct DeviceKey {
    /// Device family
    pub family: DeviceFamily,
    /// Serial number, or network address when the device has none
    pub address: String,
}

impl DeviceKey {
    /// Creates a new key
    pub fn new(family: DeviceFamily, address: impl Into<String>) -> Self {
        DeviceKey {
            family,
            address: address.into(),
        }
    }
}

impl fmt::Display for DeviceKey {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "{}/{}", self.family, self.address)
    }
}

impl FromStr for DeviceKey {
    type Err = Error;

    fn from_str(s: &str) -> Result<Self, Self::Err> {
        let (family, address) = s
            .split_once('/')
            .ok_or_else(|| Error::validation(format!("malformed device key: {s}")))?;
        let family = match family {
            "radio" => DeviceFamily::Radio,
            "rotator" => DeviceFamily::Rotator,
            "antenna-switch" => DeviceFamily::AntennaSwitch,
            "amplifier" => DeviceFamily::Amplifier,
            "cluster" => DeviceFamily::Cluster,
            other => return Err(Error::validation(format!("unknown device family: {other}"))),
        };
        if address.is_empty() {
            return Err(Error::validation("device key has an empty address"));
        }
        Ok(DeviceKey::new(family, address))
    }
}

/// Identity of one discovered device.
///
/// Equality and hashing only look at family and address, so a later
/// rediscovery of the same hardware compares equal even though it carries a
/// fresh `discovered_at`.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct DeviceIdentity {
    /// Device family
    pub family: DeviceFamily,
    /// Serial number, or network address when the device has none
    pub address: String,
    /// When this identity was created
    pub discovered_at: DateTime<Utc>,
}

impl DeviceIdentity {
    /// Creates an identity stamped with the current time
    pub fn new(family: DeviceFamily, address: impl Into<String>) -> Self {
        DeviceIdentity {
            family,
            address: address.into(),
            discovered_at: Utc::now(),
        }
    }

    /// Registry key for this identity
    pub fn key(&self) -> DeviceKey {
        DeviceKey::new(self.family, self.address.clone())
    }
}

impl PartialEq for DeviceIdentity {
    fn eq(&self, other: &Self) -> bool {
        self.family == other.family && self.address == other.address
    }
}

impl Eq for DeviceIdentity {}

impl Hash for DeviceIdentity {
    fn hash<H: Hasher>(&self, state: &mut H) {
        self.family.hash(state);
        self.address.hash(state);
    }
}

impl fmt::Display for DeviceIdentity {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "{}/{}", self.family, self.address)
    }
}

impl From<&DeviceIdentity> for DeviceKey {
    fn from(identity: &DeviceIdentity) -> Self {
        identity.key()
    }
}

/// Everything needed to build a connection manager for a device
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct DeviceDescriptor {
    /// Device identity
    pub identity: DeviceIdentity,
    /// Wire protocol
    pub protocol: Protocol,
    /// `host:port` for TCP devices, `group:port` for multicast feeds
    pub endpoint: String,
    /// Model name reported by the device, if any
    pub model: Option<String>,
    /// User-facing nickname, if any
    pub nickname: Option<String>,
}

impl DeviceDescriptor {
    /// Creates a descriptor for a manually configured endpoint
    pub fn direct(protocol: Protocol, endpoint: impl Into<String>) -> Self {
        let endpoint = endpoint.into();
        DeviceDescriptor {
            identity: DeviceIdentity::new(protocol.family(), endpoint.clone()),
            protocol,
            endpoint,
            model: None,
            nickname: None,
        }
    }

    /// Registry key of the described device
    pub fn key(&self) -> DeviceKey {
        self.identity.key()
    }
}

/// Connection lifecycle state of one device
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "kebab-case")]
pub enum ConnectionState {
    /// No transport open
    Disconnected,
    /// Waiting for the device's first announcement
    Discovering,
    /// Transport being opened
    Connecting,
    /// Transport open and handshake done
    Connected,
    /// Subscribed to the device's status stream
    Monitoring,
    /// Transport failed; waiting to retry
    Error,
}

impl ConnectionState {
    /// Whether device-level commands may be dispatched in this state
    pub fn accepts_device_commands(&self) -> bool {
        matches!(self, ConnectionState::Connected | ConnectionState::Monitoring)
    }
}
