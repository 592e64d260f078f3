//! Antenna switch binary messages

use bytes::{BufMut, BytesMut};

use super::frame::{require, BinaryFrame, KIND_SUBSCRIBE};
use crate::core::{Error, Result};
use crate::protocol::{PortSource, PortStatus};

/// Capabilities sent on connect
pub const KIND_HELLO: u8 = 0x01;
/// Port state report
pub const KIND_PORT_STATUS: u8 = 0x02;
/// Select an antenna on a port
pub const KIND_SELECT: u8 = 0x11;

const FLAG_INHIBIT: u8 = 0x01;
const FLAG_TX: u8 = 0x02;

/// Capability mask of one antenna
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct AntennaCapability {
    /// Bit `n - 1` set when the antenna can be routed to port `n`
    pub port_mask: u8,
    /// Bit `b` set when the antenna is usable on band index `b`
    pub band_mask: u16,
}

impl AntennaCapability {
    /// Whether the antenna can be routed to `port`
    pub fn allows_port(&self, port: u8) -> bool {
        (1..=8).contains(&port) && self.port_mask & (1 << (port - 1)) != 0
    }

    /// Whether the antenna is usable on `band`
    pub fn allows_band(&self, band: u8) -> bool {
        band < 16 && self.band_mask & (1 << band) != 0
    }
}

/// Switch layout from the hello frame
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct SwitchInfo {
    /// Number of radio ports
    pub ports: u8,
    /// Per-antenna capabilities, antenna `n` at index `n - 1`
    pub antennas: Vec<AntennaCapability>,
}

impl SwitchInfo {
    /// Capability of a 1-based antenna number
    pub fn antenna(&self, antenna: u8) -> Option<&AntennaCapability> {
        usize::from(antenna)
            .checked_sub(1)
            .and_then(|index| self.antennas.get(index))
    }
}

/// Parses a hello payload
pub fn parse_hello(payload: &[u8]) -> Result<SwitchInfo> {
    require(payload, 2, "antenna hello")?;
    let ports = payload[0];
    let count = usize::from(payload[1]);
    require(payload, 2 + count * 3, "antenna hello")?;

    let antennas = payload[2..2 + count * 3]
        .chunks_exact(3)
        .map(|chunk| AntennaCapability {
            port_mask: chunk[0],
            band_mask: u16::from_be_bytes([chunk[1], chunk[2]]),
        })
        .collect();
    Ok(SwitchInfo { ports, antennas })
}

/// Parses a port status payload
pub fn parse_port_status(payload: &[u8]) -> Result<PortStatus> {
    require(payload, 5, "port status")?;
    if payload[0] == 0 {
        return Err(Error::decode("port status for port 0"));
    }
    Ok(PortStatus {
        port: payload[0],
        antenna: payload[1],
        band: payload[2],
        source: PortSource::from_wire(payload[3]),
        inhibited: payload[4] & FLAG_INHIBIT != 0,
        transmitting: payload[4] & FLAG_TX != 0,
    })
}

/// Subscription request
pub fn subscribe(seq: u8) -> BinaryFrame {
    BinaryFrame::new(KIND_SUBSCRIBE, seq, Vec::new())
}

/// Antenna selection request
pub fn select(seq: u8, port: u8, antenna: u8) -> BinaryFrame {
    BinaryFrame::new(KIND_SELECT, seq, vec![port, antenna])
}

/// Hello frame as sent by a switch
pub fn hello(seq: u8, info: &SwitchInfo) -> BinaryFrame {
    let mut payload = BytesMut::with_capacity(2 + info.antennas.len() * 3);
    payload.put_u8(info.ports);
    payload.put_u8(info.antennas.len() as u8);
    for antenna in &info.antennas {
        payload.put_u8(antenna.port_mask);
        payload.put_u16(antenna.band_mask);
    }
    BinaryFrame::new(KIND_HELLO, seq, payload.freeze())
}

/// Port status frame as sent by a switch
pub fn port_status(seq: u8, status: &PortStatus) -> BinaryFrame {
    let mut flags = 0;
    if status.inhibited {
        flags |= FLAG_INHIBIT;
    }
    if status.transmitting {
        flags |= FLAG_TX;
    }
    BinaryFrame::new(
        KIND_PORT_STATUS,
        seq,
        vec![
            status.port,
            status.antenna,
            status.band,
            status.source.to_wire(),
            flags,
        ],
    )
}
