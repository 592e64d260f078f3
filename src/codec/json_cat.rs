//! Newline-delimited JSON CAT protocol

use serde::{Deserialize, Serialize};

use crate::core::{Error, Result};

/// Message sent by the radio
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(tag = "type", rename_all = "snake_case")]
pub enum JsonInbound {
    /// Sent once after the connection opens
    Hello {
        /// Radio model
        #[serde(default)]
        model: Option<String>,
        /// Number of receiver instances
        #[serde(default)]
        instances: Option<u8>,
    },
    /// Status of one receiver instance
    State {
        /// Instance index
        instance: u8,
        /// Frequency in kHz
        freq_khz: f64,
        /// Operating mode
        mode: String,
        /// Transmitting
        #[serde(default)]
        tx: bool,
    },
    /// Reply to a request
    Reply {
        /// Request id
        id: u32,
        /// Whether the request succeeded
        ok: bool,
        /// Failure description
        #[serde(default)]
        error: Option<String>,
    },
}

/// Request body
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(tag = "cmd", rename_all = "snake_case")]
pub enum JsonCommand {
    /// Start streaming state messages
    Subscribe,
    /// Change the instance the radio treats as active
    SelectInstance {
        /// Instance index
        instance: u8,
    },
}

/// Request sent to the radio
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct JsonRequest {
    /// Request id, echoed in the reply
    pub id: u32,
    /// Request body
    #[serde(flatten)]
    pub cmd: JsonCommand,
}

/// Parses one line received from the radio
pub fn parse_line(line: &str) -> Result<JsonInbound> {
    serde_json::from_str(line)
        .map_err(|e| Error::decode(format!("invalid JSON CAT message: {}", e)))
}

/// Encodes a request as a single line (without the trailing newline)
pub fn encode_request(id: u32, cmd: JsonCommand) -> Result<String> {
    serde_json::to_string(&JsonRequest { id, cmd })
        .map_err(|e| Error::decode(format!("failed to encode JSON CAT request: {}", e)))
}

/// Converts kHz to Hz, rounding to the nearest Hz
pub fn khz_to_hz(khz: f64) -> Result<u64> {
    if !khz.is_finite() || khz < 0.0 {
        return Err(Error::decode(format!("invalid frequency {} kHz", khz)));
    }
    let hz = (khz * 1000.0).round();
    if hz > u64::MAX as f64 {
        return Err(Error::decode(format!("frequency {} kHz out of range", khz)));
    }
    Ok(hz as u64)
}
