use chrono::{DateTime, NaiveTime, Utc};
use serde::{Deserialize, Serialize};

use crate::core::{ConnectionState, DeviceIdentity, Protocol};

/// An event published to subscribers
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct NormalizedEvent {
    /// Device the event originates from
    pub device: DeviceIdentity,
    /// When the event was created
    pub at: DateTime<Utc>,
    /// Protocol-agnostic payload
    pub payload: EventPayload,
}

impl NormalizedEvent {
    /// Creates an event stamped with the current time
    pub fn new(device: DeviceIdentity, payload: EventPayload) -> Self {
        NormalizedEvent {
            device,
            at: Utc::now(),
            payload,
        }
    }
}

/// Event payloads
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(tag = "type", rename_all = "kebab-case")]
pub enum EventPayload {
    /// A DX cluster spot
    SpotReceived(Spot),

    /// Frequency or mode of a radio slice/instance changed
    FrequencyModeChanged {
        /// Slice or instance index
        instance: u8,
        /// Frequency in Hz
        frequency_hz: u64,
        /// Operating mode as reported by the radio
        mode: String,
        /// Whether this instance is the one surfaced as active
        active: bool,
    },

    /// Radio transmit state changed
    TransmittingChanged {
        /// `true` while transmitting
        transmitting: bool,
    },

    /// Rotator position report
    RotatorPosition(RotatorPosition),

    /// Antenna switch port state
    AntennaPortChanged(PortStatus),

    /// Amplifier telemetry and discrete status
    AmplifierStatus(AmplifierStatus),

    /// A device was registered
    DeviceDiscovered {
        /// Wire protocol
        protocol: Protocol,
        /// Control endpoint
        endpoint: String,
        /// Reported model
        model: Option<String>,
        /// Reported nickname
        nickname: Option<String>,
    },

    /// A device was removed from the registry
    DeviceRemoved {
        /// Why it was removed
        reason: RemovalReason,
    },

    /// The device's connection state changed
    ConnectionStateChanged {
        /// Previous state
        from: ConnectionState,
        /// New state
        to: ConnectionState,
        /// Failure description on entry to `Error`
        error: Option<String>,
    },

    /// Full current state, sent once per device to a new subscriber
    DeviceSnapshot(DeviceSnapshot),
}

impl EventPayload {
    /// Whether this payload is device telemetry (kept in snapshots)
    pub fn is_telemetry(&self) -> bool {
        matches!(
            self,
            EventPayload::FrequencyModeChanged { .. }
                | EventPayload::TransmittingChanged { .. }
                | EventPayload::RotatorPosition(_)
                | EventPayload::AntennaPortChanged(_)
                | EventPayload::AmplifierStatus(_)
        )
    }

    /// Slot a telemetry payload occupies in a snapshot; later payloads with
    /// the same slot replace earlier ones
    pub fn telemetry_slot(&self) -> Option<(u8, u8)> {
        match self {
            EventPayload::FrequencyModeChanged { instance, .. } => Some((0, *instance)),
            EventPayload::TransmittingChanged { .. } => Some((1, 0)),
            EventPayload::RotatorPosition(_) => Some((2, 0)),
            EventPayload::AntennaPortChanged(status) => Some((3, status.port)),
            EventPayload::AmplifierStatus(_) => Some((4, 0)),
            _ => None,
        }
    }
}

/// A parsed DX cluster spot
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct Spot {
    /// Station that reported the spot
    pub spotter: String,
    /// Spotted station
    pub dx_call: String,
    /// Frequency in Hz
    pub frequency_hz: u64,
    /// Mode if the comment names one
    pub mode: Option<String>,
    /// Free-text comment
    pub comment: String,
    /// Time reported by the cluster node
    pub utc_time: Option<NaiveTime>,
}

/// Rotator position
#[derive(Debug, Clone, Copy, PartialEq, Serialize, Deserialize)]
pub struct RotatorPosition {
    /// Azimuth in degrees, 0..=360
    pub azimuth: f64,
    /// Elevation in degrees
    pub elevation: f64,
    /// Bearing of the move in progress
    pub target: Option<f64>,
    /// Whether a move is in progress
    pub is_moving: bool,
}

/// Where an antenna switch port takes its selection from
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "kebab-case")]
pub enum PortSource {
    /// Nothing drives the port
    None,
    /// Selected by an operator
    Manual,
    /// Selected by band decoding
    Auto,
    /// Selected by an external controller
    External,
}

impl PortSource {
    /// Decodes the wire value; unknown values map to `None`
    pub fn from_wire(value: u8) -> Self {
        match value {
            1 => PortSource::Manual,
            2 => PortSource::Auto,
            3 => PortSource::External,
            _ => PortSource::None,
        }
    }

    /// Wire value
    pub fn to_wire(self) -> u8 {
        match self {
            PortSource::None => 0,
            PortSource::Manual => 1,
            PortSource::Auto => 2,
            PortSource::External => 3,
        }
    }
}

/// State of one antenna switch port
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
pub struct PortStatus {
    /// Radio port, 1-based
    pub port: u8,
    /// Selected antenna, 1-based; 0 means none
    pub antenna: u8,
    /// Band index currently decoded on the port
    pub band: u8,
    /// Selection source
    pub source: PortSource,
    /// Port inhibited (selection changes refused by the device)
    pub inhibited: bool,
    /// Port keyed
    pub transmitting: bool,
}

/// Amplifier telemetry and status, merged from the latest frames
#[derive(Debug, Clone, Copy, PartialEq, Default, Serialize, Deserialize)]
pub struct AmplifierStatus {
    /// Forward power in watts
    pub forward_power_w: f64,
    /// Forward power in dBm, absent when no power is flowing
    pub forward_power_dbm: Option<f64>,
    /// Return loss in dB
    pub return_loss_db: f64,
    /// Standing wave ratio
    pub swr: f64,
    /// Temperature in degrees Celsius
    pub temperature_c: f64,
    /// Drain current in amperes
    pub current_a: f64,
    /// Operate (`true`) or standby
    pub operate: bool,
    /// Bias setting
    pub bias: u8,
    /// Band index
    pub band: u8,
    /// Fault flags, zero when healthy
    pub faults: u16,
}

/// Why a device left the registry
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "kebab-case")]
pub enum RemovalReason {
    /// Removed on request
    Requested,
    /// No announcement within the listener's expiry
    Expired,
    /// Unreachable for longer than the configured timeout
    Unreachable,
    /// Replaced by a newer discovery with a different endpoint
    Superseded,
    /// The station is shutting down
    Shutdown,
}

/// Current state of one device, sent to new subscribers
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct DeviceSnapshot {
    /// Wire protocol
    pub protocol: Protocol,
    /// Control endpoint
    pub endpoint: String,
    /// Reported model
    pub model: Option<String>,
    /// Reported nickname
    pub nickname: Option<String>,
    /// Current connection state
    pub state: ConnectionState,
    /// Last error message, if the device is in `Error`
    pub error: Option<String>,
    /// Latest telemetry payloads, one per slot
    pub telemetry: Vec<EventPayload>,
}

/// Converts watts to dBm; zero or negative power has no dBm value
pub fn watts_to_dbm(watts: f64) -> Option<f64> {
    (watts > 0.0).then(|| 10.0 * (watts * 1000.0).log10())
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::core::DeviceFamily;

    #[test]
    fn test_event_serialization_is_tagged() {
        let device = DeviceIdentity::new(DeviceFamily::Rotator, "10.0.0.7:4533");
        let event = NormalizedEvent::new(
            device,
            EventPayload::RotatorPosition(RotatorPosition {
                azimuth: 181.5,
                elevation: 0.0,
                target: None,
                is_moving: false,
            }),
        );

        let value = serde_json::to_value(&event).unwrap();
        assert_eq!(value["payload"]["type"], "rotator-position");
        assert_eq!(value["payload"]["azimuth"], 181.5);
        assert_eq!(value["device"]["family"], "rotator");

        let decoded: NormalizedEvent = serde_json::from_value(value).unwrap();
        assert_eq!(decoded, event);
    }

    #[test]
    fn test_telemetry_slots() {
        let freq = |instance| EventPayload::FrequencyModeChanged {
            instance,
            frequency_hz: 14_074_000,
            mode: "DIGU".into(),
            active: true,
        };
        assert_eq!(freq(0).telemetry_slot(), Some((0, 0)));
        assert_ne!(freq(0).telemetry_slot(), freq(1).telemetry_slot());
        assert!(freq(0).is_telemetry());

        let removed = EventPayload::DeviceRemoved {
            reason: RemovalReason::Expired,
        };
        assert!(!removed.is_telemetry());
        assert_eq!(removed.telemetry_slot(), None);
    }

    #[test]
    fn test_watts_to_dbm() {
        assert!((watts_to_dbm(1.0).unwrap() - 30.0).abs() < 1e-9);
        assert!((watts_to_dbm(1000.0).unwrap() - 60.0).abs() < 1e-9);
        assert_eq!(watts_to_dbm(0.0), None);
    }

    #[test]
    fn test_port_source_wire_values() {
        for source in [PortSource::None, PortSource::Manual, PortSource::Auto, PortSource::External] {
            assert_eq!(PortSource::from_wire(source.to_wire()), source);
        }
        assert_eq!(PortSource::from_wire(200), PortSource::None);
    }
}
