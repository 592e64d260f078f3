//! SmartSDR meta-command text protocol
//!
//! Every line starts with a one-letter type:
//!
//! ```text
//! V1.4.0.0                                version (handshake)
//! H2F3A1B00                               client handle (handshake)
//! C12|sub slice all                       command (client -> radio)
//! R12|0|                                  response: sequence, hex code, message
//! S2F3A1B00|slice 0 RF_frequency=14.074000 mode=DIGU
//! M10000001|message text
//! ```

use crate::core::{Error, Result};

/// One line received from the radio
#[derive(Debug, Clone, PartialEq)]
pub enum SmartSdrLine {
    /// Protocol version sent on connect
    Version(String),
    /// Client handle sent on connect
    Handle(u32),
    /// Reply to a command
    Response {
        /// Sequence number of the command
        seq: u32,
        /// Result code, zero on success
        code: u32,
        /// Optional reply text
        message: String,
    },
    /// Status update for one object
    Status {
        /// Handle of the client that caused the change
        handle: u32,
        /// Object name, e.g. `slice 0` or `interlock`
        object: String,
        /// `key=value` parameters in order
        params: Vec<(String, String)>,
    },
    /// Informational message
    Message {
        /// Message code
        code: u32,
        /// Message text
        text: String,
    },
}

/// Decoded `slice` status
#[derive(Debug, Clone, PartialEq, Default)]
pub struct SliceUpdate {
    /// Slice index
    pub index: u8,
    /// New frequency, if reported
    pub frequency_hz: Option<u64>,
    /// New mode, if reported
    pub mode: Option<String>,
    /// `false` when the slice was removed
    pub in_use: Option<bool>,
}

fn parse_hex(text: &str, what: &str) -> Result<u32> {
    u32::from_str_radix(text.trim(), 16)
        .map_err(|e| Error::decode(format!("invalid {} '{}': {}", what, text, e)))
}

/// Parses one line received from the radio
pub fn parse_line(line: &str) -> Result<SmartSdrLine> {
    let mut chars = line.chars();
    let kind = chars
        .next()
        .ok_or_else(|| Error::decode("empty SmartSDR line"))?;
    let body = chars.as_str();

    match kind {
        'V' => Ok(SmartSdrLine::Version(body.trim().to_string())),
        'H' => Ok(SmartSdrLine::Handle(parse_hex(body, "handle")?)),
        'R' => {
            let mut parts = body.splitn(3, '|');
            let seq = parts
                .next()
                .unwrap_or_default()
                .parse::<u32>()
                .map_err(|e| Error::decode(format!("invalid response sequence: {}", e)))?;
            let code = parse_hex(
                parts
                    .next()
                    .ok_or_else(|| Error::decode("response without result code"))?,
                "response code",
            )?;
            let message = parts.next().unwrap_or_default().to_string();
            Ok(SmartSdrLine::Response { seq, code, message })
        }
        'S' => {
            let (handle, status) = body
                .split_once('|')
                .ok_or_else(|| Error::decode("status line without '|'"))?;
            let handle = parse_hex(handle, "status handle")?;
            let (object, params) = split_status(status);
            if object.is_empty() {
                return Err(Error::decode("status line without object"));
            }
            Ok(SmartSdrLine::Status {
                handle,
                object,
                params,
            })
        }
        'M' => {
            let (code, text) = body
                .split_once('|')
                .ok_or_else(|| Error::decode("message line without '|'"))?;
            Ok(SmartSdrLine::Message {
                code: parse_hex(code, "message code")?,
                text: text.to_string(),
            })
        }
        other => Err(Error::decode(format!("unknown SmartSDR line type '{}'", other))),
    }
}

fn split_status(status: &str) -> (String, Vec<(String, String)>) {
    let mut object = Vec::new();
    let mut params = Vec::new();
    for token in status.split_whitespace() {
        match token.split_once('=') {
            Some((key, value)) => params.push((key.to_string(), value.to_string())),
            None if params.is_empty() => object.push(token),
            None => {}
        }
    }
    (object.join(" "), params)
}

/// Formats a command line (without the trailing newline)
pub fn encode_command(seq: u32, command: &str) -> String {
    format!("C{}|{}", seq, command)
}

/// Converts a decimal MHz string to Hz without going through floating point.
///
/// Digits beyond the sixth decimal place round half up.
pub fn mhz_to_hz(text: &str) -> Result<u64> {
    let invalid = || Error::decode(format!("invalid frequency '{}'", text));
    let text = text.trim();
    let (whole, fraction) = text.split_once('.').unwrap_or((text, ""));
    if whole.is_empty() && fraction.is_empty() {
        return Err(invalid());
    }
    if !whole.bytes().all(|b| b.is_ascii_digit()) || !fraction.bytes().all(|b| b.is_ascii_digit()) {
        return Err(invalid());
    }

    let whole: u64 = if whole.is_empty() {
        0
    } else {
        whole.parse().map_err(|_| invalid())?
    };
    let mut micro: u64 = 0;
    for (i, digit) in fraction.bytes().take(6).enumerate() {
        micro += u64::from(digit - b'0') * 10u64.pow(5 - i as u32);
    }
    let round_up = fraction.as_bytes().get(6).is_some_and(|d| *d >= b'5');

    whole
        .checked_mul(1_000_000)
        .and_then(|hz| hz.checked_add(micro))
        .and_then(|hz| hz.checked_add(u64::from(round_up)))
        .ok_or_else(invalid)
}

/// Decodes a `slice <n> ...` status; `None` for other objects
pub fn parse_slice(object: &str, params: &[(String, String)]) -> Result<Option<SliceUpdate>> {
    let mut words = object.split_whitespace();
    if words.next() != Some("slice") {
        return Ok(None);
    }
    let index = words
        .next()
        .ok_or_else(|| Error::decode("slice status without index"))?
        .parse::<u8>()
        .map_err(|e| Error::decode(format!("invalid slice index: {}", e)))?;

    let mut update = SliceUpdate {
        index,
        ..SliceUpdate::default()
    };
    for (key, value) in params {
        match key.as_str() {
            "RF_frequency" => update.frequency_hz = Some(mhz_to_hz(value)?),
            "mode" => update.mode = Some(value.clone()),
            "in_use" => update.in_use = Some(value != "0"),
            _ => {}
        }
    }
    Ok(Some(update))
}

/// Transmit flag from an `interlock` status; `None` for other objects
pub fn parse_interlock(object: &str, params: &[(String, String)]) -> Option<bool> {
    if object != "interlock" {
        return None;
    }
    params
        .iter()
        .find(|(key, _)| key == "state")
        .map(|(_, value)| value == "TRANSMITTING")
}
