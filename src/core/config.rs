use std::net::{Ipv4Addr, SocketAddr};
use std::time::Duration;

use serde::{Deserialize, Serialize};

use super::error::{Error, Result};
use super::types::Protocol;

/// Top-level configuration, loaded once by the host process and read-only afterwards
#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(default)]
pub struct Config {
    /// Direct-dial devices, connected at startup
    pub endpoints: Vec<EndpointConfig>,
    /// Passive discovery listeners
    pub listeners: Vec<ListenerConfig>,
    /// Discovery re-broadcasters for devices behind a VPN
    pub broadcasters: Vec<BroadcasterConfig>,
    /// Reconnect backoff policy
    pub reconnect: ReconnectPolicy,
    /// Connect and command bounds
    pub timeouts: TimeoutConfig,
    /// Hub queue sizes
    pub hub: HubConfig,
    /// Polling behaviour of request/response devices
    pub polling: PollingConfig,
    /// Remove a device that stays unreachable this long (None keeps it forever)
    #[serde(serialize_with = "super::serde::serialize_opt_duration")]
    #[serde(deserialize_with = "super::serde::deserialize_opt_duration")]
    pub unreachable_timeout: Option<Duration>,
}

impl Default for Config {
    fn default() -> Self {
        Config {
            endpoints: Vec::new(),
            listeners: Vec::new(),
            broadcasters: Vec::new(),
            reconnect: ReconnectPolicy::default(),
            timeouts: TimeoutConfig::default(),
            hub: HubConfig::default(),
            polling: PollingConfig::default(),
            unreachable_timeout: Some(Duration::from_secs(600)),
        }
    }
}

impl Config {
    /// Parses a JSON configuration document and validates it
    pub fn from_json(text: &str) -> Result<Self> {
        let config: Config = serde_json::from_str(text)
            .map_err(|e| Error::config(format!("Failed to parse configuration: {}", e)))?;
        config.validate()?;
        Ok(config)
    }

    /// Checks value ranges that serde cannot express
    pub fn validate(&self) -> Result<()> {
        let r = &self.reconnect;
        if r.initial_delay.is_zero() || r.max_delay < r.initial_delay {
            return Err(Error::config("reconnect delays must satisfy 0 < initial <= max"));
        }
        if !(r.multiplier >= 1.0) {
            return Err(Error::config("reconnect multiplier must be at least 1.0"));
        }
        if !(0.0..=1.0).contains(&r.jitter) {
            return Err(Error::config("reconnect jitter must be within 0.0..=1.0"));
        }
        if self.timeouts.connect.is_zero() || self.timeouts.command.is_zero() {
            return Err(Error::config("timeouts must be non-zero"));
        }
        if self.timeouts.command_failure_threshold == 0 {
            return Err(Error::config("command_failure_threshold must be at least 1"));
        }
        let hub = &self.hub;
        if hub.subscriber_queue == 0 || hub.ingest_queue == 0 || hub.command_queue == 0 {
            return Err(Error::config("hub queue sizes must be non-zero"));
        }
        if self.polling.rotator_interval.is_zero() {
            return Err(Error::config("rotator poll interval must be non-zero"));
        }
        for endpoint in &self.endpoints {
            if endpoint.address.trim().is_empty() {
                return Err(Error::config(format!(
                    "{:?} endpoint has an empty address",
                    endpoint.protocol
                )));
            }
        }
        for listener in &self.listeners {
            if listener.protocol == Protocol::ClusterSpots {
                return Err(Error::config(
                    "cluster spot feeds are configured as endpoints, not discovery listeners",
                ));
            }
            if listener.expiry.is_zero() {
                return Err(Error::config("listener expiry must be non-zero"));
            }
        }
        for broadcaster in &self.broadcasters {
            if broadcaster.interval.is_zero() {
                return Err(Error::config("broadcaster interval must be non-zero"));
            }
        }
        Ok(())
    }
}

/// A manually configured device
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct EndpointConfig {
    /// Wire protocol
    pub protocol: Protocol,
    /// `host:port`, or `group:port` for cluster spot feeds
    pub address: String,
    /// Optional nickname shown to subscribers
    #[serde(default)]
    pub nickname: Option<String>,
}

impl EndpointConfig {
    /// Address with the protocol's default port appended when none is given
    pub fn resolved_address(&self) -> String {
        let address = self.address.trim();
        if address.rsplit_once(':').is_some_and(|(_, port)| port.parse::<u16>().is_ok()) {
            address.to_string()
        } else {
            format!("{}:{}", address, self.protocol.default_port())
        }
    }
}

/// A passive discovery listener for one protocol
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct ListenerConfig {
    /// Protocol whose announcements arrive on this socket
    pub protocol: Protocol,
    /// Local address to bind
    pub bind: SocketAddr,
    /// Multicast group to join, if announcements are multicast
    #[serde(default)]
    pub multicast_group: Option<Ipv4Addr>,
    /// Remove a device after this long without an announcement
    #[serde(serialize_with = "super::serde::serialize_duration")]
    #[serde(deserialize_with = "super::serde::deserialize_duration")]
    pub expiry: Duration,
    /// Connect as soon as a device is discovered
    #[serde(default = "default_true")]
    pub auto_connect: bool,
}

/// Re-broadcasts announcements for devices that cannot be discovered locally
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct BroadcasterConfig {
    /// Announcement format to emit
    pub protocol: Protocol,
    /// Destination (usually a LAN broadcast address)
    pub target: SocketAddr,
    /// Time between announcements
    #[serde(serialize_with = "super::serde::serialize_duration")]
    #[serde(deserialize_with = "super::serde::deserialize_duration")]
    pub interval: Duration,
    /// Devices to announce
    pub devices: Vec<AnnouncedDevice>,
}

/// One remote device announced by a broadcaster
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct AnnouncedDevice {
    /// Serial number
    pub serial: String,
    /// Address reachable over the VPN
    pub ip: std::net::IpAddr,
    /// Control port (protocol default when absent)
    #[serde(default)]
    pub port: Option<u16>,
    /// Model name
    #[serde(default)]
    pub model: Option<String>,
    /// Nickname
    #[serde(default)]
    pub nickname: Option<String>,
}

/// Exponential backoff with jitter between reconnect attempts
#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(default)]
pub struct ReconnectPolicy {
    /// First retry delay
    #[serde(serialize_with = "super::serde::serialize_duration")]
    #[serde(deserialize_with = "super::serde::deserialize_duration")]
    pub initial_delay: Duration,
    /// Upper bound for the delay
    #[serde(serialize_with = "super::serde::serialize_duration")]
    #[serde(deserialize_with = "super::serde::deserialize_duration")]
    pub max_delay: Duration,
    /// Growth factor per attempt
    pub multiplier: f64,
    /// Relative jitter applied to each delay, 0.0..=1.0
    pub jitter: f64,
    /// Give up (go Disconnected) after this many consecutive failures
    pub max_retries: Option<u32>,
    /// Monitoring must last this long before the backoff resets
    #[serde(serialize_with = "super::serde::serialize_duration")]
    #[serde(deserialize_with = "super::serde::deserialize_duration")]
    pub stable_period: Duration,
}

impl Default for ReconnectPolicy {
    fn default() -> Self {
        ReconnectPolicy {
            initial_delay: Duration::from_millis(500),
            max_delay: Duration::from_secs(30),
            multiplier: 2.0,
            jitter: 0.2,
            max_retries: None,
            stable_period: Duration::from_secs(30),
        }
    }
}

/// Bounds for connect attempts and command round-trips
#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(default)]
pub struct TimeoutConfig {
    /// Connect plus handshake
    #[serde(serialize_with = "super::serde::serialize_duration")]
    #[serde(deserialize_with = "super::serde::deserialize_duration")]
    pub connect: Duration,
    /// One command round-trip
    #[serde(serialize_with = "super::serde::serialize_duration")]
    #[serde(deserialize_with = "super::serde::deserialize_duration")]
    pub command: Duration,
    /// Consecutive command timeouts treated as a dead transport
    pub command_failure_threshold: u32,
    /// How long removal waits for a manager to release its transport
    #[serde(serialize_with = "super::serde::serialize_duration")]
    #[serde(deserialize_with = "super::serde::deserialize_duration")]
    pub shutdown_grace: Duration,
}

impl Default for TimeoutConfig {
    fn default() -> Self {
        TimeoutConfig {
            connect: Duration::from_secs(5),
            command: Duration::from_secs(2),
            command_failure_threshold: 3,
            shutdown_grace: Duration::from_secs(2),
        }
    }
}

/// Queue sizes of the hub and managers
#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(default)]
pub struct HubConfig {
    /// Events buffered per subscriber before it is dropped
    pub subscriber_queue: usize,
    /// Events buffered between managers and the hub
    pub ingest_queue: usize,
    /// Commands queued per device
    pub command_queue: usize,
}

impl Default for HubConfig {
    fn default() -> Self {
        HubConfig {
            subscriber_queue: 256,
            ingest_queue: 1024,
            command_queue: 16,
        }
    }
}

/// Polling behaviour
#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(default)]
pub struct PollingConfig {
    /// Rotator position poll interval
    #[serde(serialize_with = "super::serde::serialize_duration")]
    #[serde(deserialize_with = "super::serde::deserialize_duration")]
    pub rotator_interval: Duration,
    /// Azimuth difference under which a move counts as complete
    pub rotator_tolerance_deg: f64,
    /// Unchanged polls after which a move is considered stopped
    pub rotator_stall_polls: u32,
    /// Amplifier telemetry gap treated as an interrupted stream
    #[serde(serialize_with = "super::serde::serialize_duration")]
    #[serde(deserialize_with = "super::serde::deserialize_duration")]
    pub amplifier_stall: Duration,
}

impl Default for PollingConfig {
    fn default() -> Self {
        PollingConfig {
            rotator_interval: Duration::from_secs(1),
            rotator_tolerance_deg: 1.0,
            rotator_stall_polls: 5,
            amplifier_stall: Duration::from_secs(5),
        }
    }
}

fn default_true() -> bool {
    true
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_default_config_is_valid() {
        Config::default().validate().unwrap();
    }

    #[test]
    fn test_from_json_partial_document() {
        let config = Config::from_json(
            r#"{
                "endpoints": [
                    { "protocol": "rotctld", "address": "10.0.0.7" },
                    { "protocol": "amplifier", "address": "10.0.0.8:50001", "nickname": "PA" }
                ],
                "listeners": [
                    { "protocol": "smart-sdr", "bind": "0.0.0.0:4992", "expiry": 15 }
                ],
                "reconnect": { "initial_delay": 0.1, "max_delay": 5 }
            }"#,
        )
        .unwrap();

        assert_eq!(config.endpoints.len(), 2);
        assert_eq!(config.endpoints[0].resolved_address(), "10.0.0.7:4533");
        assert_eq!(config.endpoints[1].resolved_address(), "10.0.0.8:50001");
        assert!(config.listeners[0].auto_connect);
        assert_eq!(config.listeners[0].expiry, Duration::from_secs(15));
        assert_eq!(config.reconnect.initial_delay, Duration::from_millis(100));
        assert_eq!(config.reconnect.multiplier, 2.0);
        assert_eq!(config.timeouts.command, Duration::from_secs(2));
    }

    #[test]
    fn test_invalid_values_rejected() {
        let mut config = Config::default();
        config.reconnect.jitter = 1.5;
        assert!(matches!(config.validate(), Err(Error::Config(_))));

        let mut config = Config::default();
        config.hub.subscriber_queue = 0;
        assert!(config.validate().is_err());

        let err = Config::from_json("{ not json").unwrap_err();
        assert!(matches!(err, Error::Config(_)));
    }

    #[test]
    fn test_cluster_listener_rejected() {
        let mut config = Config::default();
        config.listeners.push(ListenerConfig {
            protocol: Protocol::ClusterSpots,
            bind: "0.0.0.0:7373".parse().unwrap(),
            multicast_group: None,
            expiry: Duration::from_secs(10),
            auto_connect: true,
        });
        assert!(config.validate().is_err());
    }
}
