//! Discovery announcements
//!
//! Announcements are whitespace-separated `key=value` text. SmartSDR radios
//! wrap the text in a VITA-49 extension-data packet:
//!
//! ```text
//! word 0    0x38 0x50 <size in 32-bit words, u16>
//! word 1    stream id 0x00000800
//! word 2-3  class id: OUI 0x001C2D, information class 0x534C, packet class 0xFFFF
//! word 4    integer timestamp
//! word 5-6  fractional timestamp
//! word 7..  payload, NUL padded to a word boundary
//! ```

use std::net::{IpAddr, SocketAddr};

use bytes::{BufMut, Bytes, BytesMut};
use chrono::Utc;

use super::key_values;
use crate::core::{AnnouncedDevice, DeviceDescriptor, DeviceIdentity, Error, Protocol, Result};

/// Length of the VITA-49 header in front of SmartSDR announcements
pub const VITA_HEADER_LEN: usize = 28;

const VITA_PACKET_TYPE: u8 = 0x3;
const DISCOVERY_STREAM_ID: u32 = 0x0000_0800;
const FLEX_OUI: u32 = 0x0000_1C2D;
const DISCOVERY_CLASS: u32 = 0x534C_FFFF;

/// A parsed announcement
#[derive(Debug, Clone, PartialEq)]
pub struct Announcement {
    /// Protocol of the announcing device
    pub protocol: Protocol,
    /// Serial number, if announced
    pub serial: Option<String>,
    /// Control address
    pub ip: IpAddr,
    /// Control port
    pub port: u16,
    /// Model name
    pub model: Option<String>,
    /// Nickname
    pub nickname: Option<String>,
}

impl Announcement {
    /// Control endpoint as `host:port`
    pub fn endpoint(&self) -> String {
        SocketAddr::new(self.ip, self.port).to_string()
    }

    /// Identity address: the serial when there is one, the IP otherwise
    pub fn address(&self) -> String {
        self.serial.clone().unwrap_or_else(|| self.ip.to_string())
    }

    /// Converts into a descriptor with a fresh identity
    pub fn into_descriptor(self) -> DeviceDescriptor {
        let endpoint = self.endpoint();
        DeviceDescriptor {
            identity: DeviceIdentity::new(self.protocol.family(), self.address()),
            protocol: self.protocol,
            endpoint,
            model: self.model,
            nickname: self.nickname,
        }
    }
}

fn strip_vita_header(datagram: &[u8]) -> Result<&[u8]> {
    if datagram.len() < VITA_HEADER_LEN || datagram[0] >> 4 != VITA_PACKET_TYPE {
        return Ok(datagram);
    }
    let size = usize::from(u16::from_be_bytes([datagram[2], datagram[3]])) * 4;
    if size < VITA_HEADER_LEN {
        return Err(Error::decode(format!("VITA-49 packet size {} shorter than its header", size)));
    }
    Ok(&datagram[VITA_HEADER_LEN..size.min(datagram.len())])
}

/// Parses one announcement datagram received from `source`
pub fn parse_announcement(
    protocol: Protocol,
    datagram: &[u8],
    source: IpAddr,
) -> Result<Announcement> {
    let payload = match protocol {
        Protocol::SmartSdr => strip_vita_header(datagram)?,
        _ => datagram,
    };
    let text = std::str::from_utf8(payload)
        .map_err(|e| Error::decode(format!("announcement is not UTF-8: {}", e)))?
        .trim_end_matches('\0');

    let mut announcement = Announcement {
        protocol,
        serial: None,
        ip: source,
        port: protocol.default_port(),
        model: None,
        nickname: None,
    };
    let mut recognised = 0;
    for (key, value) in key_values(text) {
        let value = value.trim_end_matches('\0');
        match key {
            "serial" => announcement.serial = Some(value.to_string()),
            "ip" => {
                announcement.ip = value
                    .parse()
                    .map_err(|_| Error::decode(format!("invalid announced ip '{}'", value)))?
            }
            "port" => {
                announcement.port = value
                    .parse()
                    .map_err(|_| Error::decode(format!("invalid announced port '{}'", value)))?
            }
            "model" => announcement.model = Some(value.to_string()),
            "nickname" | "name" => announcement.nickname = Some(value.to_string()),
            _ => continue,
        }
        recognised += 1;
    }

    if recognised == 0 {
        return Err(Error::decode("announcement has no recognised keys"));
    }
    if announcement.serial.as_deref() == Some("") {
        return Err(Error::decode("announcement has an empty serial"));
    }
    Ok(announcement)
}

fn token(value: &str) -> String {
    value
        .chars()
        .map(|c| if c.is_whitespace() || c == '=' { '_' } else { c })
        .collect()
}

/// Encodes an announcement for a remote device
pub fn encode_announcement(protocol: Protocol, device: &AnnouncedDevice) -> Bytes {
    let mut text = format!(
        "serial={} ip={} port={}",
        token(&device.serial),
        device.ip,
        device.port.unwrap_or_else(|| protocol.default_port())
    );
    if let Some(model) = &device.model {
        text.push_str(&format!(" model={}", token(model)));
    }
    if let Some(nickname) = &device.nickname {
        text.push_str(&format!(" nickname={}", token(nickname)));
    }

    if protocol != Protocol::SmartSdr {
        return Bytes::from(text);
    }

    let padded = (text.len() + 3) / 4 * 4;
    let words = (VITA_HEADER_LEN + padded) / 4;
    let mut buf = BytesMut::with_capacity(VITA_HEADER_LEN + padded);
    buf.put_u8(VITA_PACKET_TYPE << 4 | 0x08);
    buf.put_u8(0x50);
    buf.put_u16(words as u16);
    buf.put_u32(DISCOVERY_STREAM_ID);
    buf.put_u32(FLEX_OUI);
    buf.put_u32(DISCOVERY_CLASS);
    buf.put_u32(Utc::now().timestamp() as u32);
    buf.put_u64(0);
    buf.put_slice(text.as_bytes());
    buf.put_bytes(0, padded - text.len());
    buf.freeze()
}
