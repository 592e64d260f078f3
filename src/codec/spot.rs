//! DX cluster spot lines
//!
//! `DX de <spotter>: <kHz> <call> <comment> <HHMMZ>`

use chrono::NaiveTime;

use crate::core::{Error, Result};
use crate::protocol::Spot;

/// Modes recognised in spot comments
const MODES: &[&str] = &[
    "CW", "SSB", "USB", "LSB", "FT8", "FT4", "RTTY", "PSK31", "PSK", "JT65", "JS8", "AM", "FM",
    "DIGI", "SSTV", "MSK144", "Q65", "OLIVIA",
];

fn looks_like_callsign(call: &str) -> bool {
    let valid_chars = call
        .chars()
        .all(|c| c.is_ascii_alphanumeric() || matches!(c, '/' | '-' | '#'));
    valid_chars
        && call.len() >= 3
        && call.chars().any(|c| c.is_ascii_alphabetic())
        && call.chars().any(|c| c.is_ascii_digit())
}

fn parse_time(token: &str) -> Option<NaiveTime> {
    let digits = token.strip_suffix('Z')?;
    if digits.len() != 4 || !digits.bytes().all(|b| b.is_ascii_digit()) {
        return None;
    }
    let hour = digits[..2].parse().ok()?;
    let minute = digits[2..].parse().ok()?;
    NaiveTime::from_hms_opt(hour, minute, 0)
}

/// Parses one cluster line
pub fn parse_spot_line(line: &str) -> Result<Spot> {
    let line = line.trim();
    let rest = line
        .strip_prefix("DX de ")
        .ok_or_else(|| Error::decode("spot line does not start with 'DX de'"))?;
    let (spotter, rest) = rest
        .split_once(':')
        .ok_or_else(|| Error::decode("spot line without ':' after spotter"))?;
    let spotter = spotter.trim().trim_end_matches("-#");
    if !looks_like_callsign(spotter) {
        return Err(Error::decode(format!("invalid spotter '{}'", spotter)));
    }

    let mut tokens: Vec<&str> = rest.split_whitespace().collect();
    if tokens.len() < 2 {
        return Err(Error::decode("spot line without frequency and callsign"));
    }

    let khz: f64 = tokens[0]
        .parse()
        .map_err(|_| Error::decode(format!("invalid spot frequency '{}'", tokens[0])))?;
    if !khz.is_finite() || khz <= 0.0 {
        return Err(Error::decode(format!("invalid spot frequency '{}'", tokens[0])));
    }
    let dx_call = tokens[1];
    if !looks_like_callsign(dx_call) {
        return Err(Error::decode(format!("invalid DX callsign '{}'", dx_call)));
    }

    // The time is the last token, possibly followed by a locator
    let mut utc_time = None;
    let tail_start = tokens.len().saturating_sub(2).max(2);
    if let Some(offset) = tokens[tail_start..].iter().position(|t| parse_time(t).is_some()) {
        let index = tail_start + offset;
        utc_time = parse_time(tokens[index]);
        tokens.truncate(index);
    }

    let comment_tokens = &tokens[2..];
    let mode = comment_tokens.iter().find_map(|token| {
        let upper = token.to_ascii_uppercase();
        MODES.iter().find(|mode| **mode == upper).map(|mode| mode.to_string())
    });

    Ok(Spot {
        spotter: spotter.to_string(),
        dx_call: dx_call.to_string(),
        frequency_hz: (khz * 1000.0).round() as u64,
        mode,
        comment: comment_tokens.join(" "),
        utc_time,
    })
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_parse_full_line() {
        let spot = parse_spot_line("DX de K1TTT:     14025.0  JA1ABC       CW 599 loud             2359Z").unwrap();
        assert_eq!(spot.spotter, "K1TTT");
        assert_eq!(spot.dx_call, "JA1ABC");
        assert_eq!(spot.frequency_hz, 14_025_000);
        assert_eq!(spot.mode.as_deref(), Some("CW"));
        assert_eq!(spot.comment, "CW 599 loud");
        assert_eq!(spot.utc_time, NaiveTime::from_hms_opt(23, 59, 0));
    }

    #[test]
    fn test_skimmer_spotter_and_locator() {
        let spot = parse_spot_line("DX de W3LPL-#: 7074.1 EA8/DL1ABC FT8 -12 dB 1830Z IL18").unwrap();
        assert_eq!(spot.spotter, "W3LPL");
        assert_eq!(spot.dx_call, "EA8/DL1ABC");
        assert_eq!(spot.frequency_hz, 7_074_100);
        assert_eq!(spot.mode.as_deref(), Some("FT8"));
        assert_eq!(spot.comment, "FT8 -12 dB");
        assert_eq!(spot.utc_time, NaiveTime::from_hms_opt(18, 30, 0));
    }

    #[test]
    fn test_line_without_comment_or_time() {
        let spot = parse_spot_line("DX de DL1XX: 3525.5 OH2BH").unwrap();
        assert_eq!(spot.comment, "");
        assert_eq!(spot.mode, None);
        assert_eq!(spot.utc_time, None);
    }

    #[test]
    fn test_malformed_lines() {
        assert!(parse_spot_line("WWV de W0MU <18Z> :   SFI=70").is_err());
        assert!(parse_spot_line("DX de K1TTT 14025.0 JA1ABC").is_err());
        assert!(parse_spot_line("DX de K1TTT: abc JA1ABC").is_err());
        assert!(parse_spot_line("DX de K1TTT: 14025.0 !!!").is_err());
        assert!(parse_spot_line("DX de K1TTT: 14025.0").is_err());
        assert!(parse_spot_line("").is_err());
    }

    #[test]
    fn test_invalid_time_kept_in_comment() {
        let spot = parse_spot_line("DX de K1TTT: 14025.0 JA1ABC up 2 9999Z").unwrap();
        assert_eq!(spot.utc_time, None);
        assert_eq!(spot.comment, "up 2 9999Z");
    }
}
