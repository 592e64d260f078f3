use serde::{Deserialize, Serialize};

use crate::core::{ConnectionState, DeviceFamily, DeviceKey, Error, Result};

/// Amplifier operating mode
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "kebab-case")]
pub enum AmplifierMode {
    /// Bypassed, not amplifying
    Standby,
    /// Amplifying
    Operate,
}

/// Commands accepted from subscribers
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(tag = "command", rename_all = "kebab-case")]
pub enum Command {
    /// Open the device connection
    Connect,
    /// Close the device connection
    Disconnect,
    /// Route an antenna to a switch port
    SelectAntenna {
        /// Radio port, 1-based
        port: u8,
        /// Antenna, 1-based
        antenna: u8,
    },
    /// Put the amplifier in operate or standby
    SetAmplifierMode {
        /// Requested mode
        mode: AmplifierMode,
    },
    /// Turn the rotator to a bearing
    MoveRotator {
        /// Target azimuth in degrees, 0..=360
        bearing: f64,
    },
    /// Choose which radio slice/instance is surfaced as active
    SelectInstance {
        /// Slice or instance index
        instance: u8,
    },
}

impl Command {
    /// Short name for logs and error messages
    pub fn name(&self) -> &'static str {
        match self {
            Command::Connect => "connect",
            Command::Disconnect => "disconnect",
            Command::SelectAntenna { .. } => "select-antenna",
            Command::SetAmplifierMode { .. } => "set-amplifier-mode",
            Command::MoveRotator { .. } => "move-rotator",
            Command::SelectInstance { .. } => "select-instance",
        }
    }

    /// Connect and disconnect are handled by the connection manager itself
    pub fn is_lifecycle(&self) -> bool {
        matches!(self, Command::Connect | Command::Disconnect)
    }

    /// Family a device command is meant for; `None` for lifecycle commands
    pub fn target_family(&self) -> Option<DeviceFamily> {
        match self {
            Command::Connect | Command::Disconnect => None,
            Command::SelectAntenna { .. } => Some(DeviceFamily::AntennaSwitch),
            Command::SetAmplifierMode { .. } => Some(DeviceFamily::Amplifier),
            Command::MoveRotator { .. } => Some(DeviceFamily::Rotator),
            Command::SelectInstance { .. } => Some(DeviceFamily::Radio),
        }
    }

    /// Checks the command against the target's family, the current
    /// connection state and its own argument ranges.
    pub fn validate(&self, family: DeviceFamily, state: ConnectionState) -> Result<()> {
        if self.is_lifecycle() {
            return Ok(());
        }
        if family == DeviceFamily::Cluster {
            return Err(Error::validation("cluster spot feeds are read-only"));
        }
        if self.target_family() != Some(family) {
            return Err(Error::validation(format!(
                "{} is not supported by {} devices",
                self.name(),
                family
            )));
        }
        if !state.accepts_device_commands() {
            return Err(Error::validation(format!(
                "{} requires a connected device, current state is {:?}",
                self.name(),
                state
            )));
        }
        match self {
            Command::MoveRotator { bearing } if !(0.0..=360.0).contains(bearing) => Err(
                Error::validation(format!("bearing {bearing} is outside 0..=360 degrees")),
            ),
            Command::SelectAntenna { port, antenna } if *port == 0 || *antenna == 0 => Err(
                Error::validation("ports and antennas are numbered from 1"),
            ),
            _ => Ok(()),
        }
    }
}

/// A command addressed to one device
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct DeviceCommand {
    /// Target device
    pub target: DeviceKey,
    /// Command to execute
    pub command: Command,
}

impl DeviceCommand {
    /// Creates a new addressed command
    pub fn new(target: DeviceKey, command: Command) -> Self {
        DeviceCommand { target, command }
    }
}

/// What a device does with a command that arrives while another one is in flight
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum CommandPolicy {
    /// Wait behind the command in flight
    Queue,
    /// Fail immediately with a busy error
    RejectWhenBusy,
}

impl CommandPolicy {
    /// Policy used for a family
    pub fn for_family(family: DeviceFamily) -> Self {
        match family {
            DeviceFamily::Rotator | DeviceFamily::Amplifier => CommandPolicy::RejectWhenBusy,
            DeviceFamily::Radio | DeviceFamily::AntennaSwitch | DeviceFamily::Cluster => {
                CommandPolicy::Queue
            }
        }
    }
}
