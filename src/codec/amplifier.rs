//! Amplifier binary messages

use bytes::{BufMut, BytesMut};

use super::frame::{require, BinaryFrame, KIND_SUBSCRIBE};
use crate::core::Result;
use crate::protocol::AmplifierMode;

/// Model string sent on connect
pub const KIND_HELLO: u8 = 0x01;
/// Continuous telemetry
pub const KIND_TELEMETRY: u8 = 0x20;
/// Discrete status
pub const KIND_STATUS: u8 = 0x21;
/// Operate/standby request
pub const KIND_SET_MODE: u8 = 0x30;

/// Scaled analog readings
#[derive(Debug, Clone, Copy, PartialEq, Default)]
pub struct Telemetry {
    /// Forward power in W
    pub forward_power_w: f64,
    /// Return loss in dB
    pub return_loss_db: f64,
    /// SWR
    pub swr: f64,
    /// Temperature in degrees Celsius
    pub temperature_c: f64,
    /// Current in A
    pub current_a: f64,
}

/// Discrete state
#[derive(Debug, Clone, Copy, PartialEq, Eq, Default)]
pub struct Status {
    /// Operate (`true`) or standby
    pub operate: bool,
    /// Bias setting
    pub bias: u8,
    /// Band index
    pub band: u8,
    /// Fault bits
    pub faults: u16,
}

fn be_u16(payload: &[u8], at: usize) -> u16 {
    u16::from_be_bytes([payload[at], payload[at + 1]])
}

/// Parses a hello payload into the model name
pub fn parse_hello(payload: &[u8]) -> Result<String> {
    Ok(String::from_utf8_lossy(payload)
        .trim_end_matches('\0')
        .trim()
        .to_string())
}

/// Parses a telemetry payload
pub fn parse_telemetry(payload: &[u8]) -> Result<Telemetry> {
    require(payload, 10, "amplifier telemetry")?;
    Ok(Telemetry {
        forward_power_w: f64::from(be_u16(payload, 0)) / 10.0,
        return_loss_db: f64::from(be_u16(payload, 2)) / 10.0,
        swr: f64::from(be_u16(payload, 4)) / 100.0,
        temperature_c: f64::from(i16::from_be_bytes([payload[6], payload[7]])) / 10.0,
        current_a: f64::from(be_u16(payload, 8)) / 10.0,
    })
}

/// Parses a status payload
pub fn parse_status(payload: &[u8]) -> Result<Status> {
    require(payload, 5, "amplifier status")?;
    Ok(Status {
        operate: payload[0] != 0,
        bias: payload[1],
        band: payload[2],
        faults: be_u16(payload, 3),
    })
}

/// Subscription request
pub fn subscribe(seq: u8) -> BinaryFrame {
    BinaryFrame::new(KIND_SUBSCRIBE, seq, Vec::new())
}

/// Operate/standby request
pub fn set_mode(seq: u8, mode: AmplifierMode) -> BinaryFrame {
    let value = match mode {
        AmplifierMode::Standby => 0,
        AmplifierMode::Operate => 1,
    };
    BinaryFrame::new(KIND_SET_MODE, seq, vec![value])
}

/// Telemetry frame as sent by an amplifier
pub fn telemetry(seq: u8, t: &Telemetry) -> BinaryFrame {
    let scale = |value: f64, factor: f64| {
        (value * factor).round().clamp(0.0, f64::from(u16::MAX)) as u16
    };
    let mut payload = BytesMut::with_capacity(10);
    payload.put_u16(scale(t.forward_power_w, 10.0));
    payload.put_u16(scale(t.return_loss_db, 10.0));
    payload.put_u16(scale(t.swr, 100.0));
    let temperature = (t.temperature_c * 10.0).round();
    payload.put_i16(temperature.clamp(f64::from(i16::MIN), f64::from(i16::MAX)) as i16);
    payload.put_u16(scale(t.current_a, 10.0));
    BinaryFrame::new(KIND_TELEMETRY, seq, payload.freeze())
}

/// Status frame as sent by an amplifier
pub fn status(seq: u8, s: &Status) -> BinaryFrame {
    let mut payload = BytesMut::with_capacity(5);
    payload.put_u8(u8::from(s.operate));
    payload.put_u8(s.bias);
    payload.put_u8(s.band);
    payload.put_u16(s.faults);
    BinaryFrame::new(KIND_STATUS, seq, payload.freeze())
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_telemetry_scaling() {
        let payload = [0x03, 0xE8, 0x00, 0xC8, 0x00, 0x78, 0xFF, 0x9C, 0x00, 0xFA];
        let t = parse_telemetry(&payload).unwrap();
        assert_eq!(t.forward_power_w, 100.0);
        assert_eq!(t.return_loss_db, 20.0);
        assert_eq!(t.swr, 1.2);
        assert_eq!(t.temperature_c, -10.0);
        assert_eq!(t.current_a, 25.0);

        assert_eq!(&telemetry(0, &t).payload[..], &payload);
        assert!(parse_telemetry(&payload[..9]).is_err());
    }

    #[test]
    fn test_status() {
        let s = parse_status(&[1, 2, 5, 0x00, 0x04]).unwrap();
        assert_eq!(
            s,
            Status {
                operate: true,
                bias: 2,
                band: 5,
                faults: 4
            }
        );
        assert_eq!(&status(0, &s).payload[..], &[1, 2, 5, 0, 4]);
    }

    #[test]
    fn test_set_mode() {
        assert_eq!(&set_mode(1, AmplifierMode::Operate).payload[..], &[1]);
        assert_eq!(&set_mode(1, AmplifierMode::Standby).payload[..], &[0]);
        assert_eq!(set_mode(1, AmplifierMode::Standby).kind, KIND_SET_MODE);
    }

    #[test]
    fn test_hello_model() {
        assert_eq!(parse_hello(b"KPA1500\0\0").unwrap(), "KPA1500");
    }
}
