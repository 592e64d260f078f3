//! hamlib `rotctld` text protocol

use crate::core::{Error, Result};

/// Request for the current position; answered by two lines (azimuth, elevation)
pub fn get_position() -> String {
    "p".to_string()
}

/// Request to turn to a position; answered by `RPRT <code>`
pub fn set_position(azimuth: f64, elevation: f64) -> String {
    format!("P {:.1} {:.1}", azimuth, elevation)
}

/// Parses an `RPRT <code>` line; `None` when the line is not a report
pub fn parse_report(line: &str) -> Result<Option<i32>> {
    let Some(code) = line.trim().strip_prefix("RPRT") else {
        return Ok(None);
    };
    code.trim()
        .parse::<i32>()
        .map(Some)
        .map_err(|e| Error::decode(format!("invalid RPRT code '{}': {}", code.trim(), e)))
}

/// Parses one angle line of a position reply
pub fn parse_angle(line: &str) -> Result<f64> {
    let value = line
        .trim()
        .parse::<f64>()
        .map_err(|e| Error::decode(format!("invalid angle '{}': {}", line.trim(), e)))?;
    if !value.is_finite() {
        return Err(Error::decode(format!("invalid angle '{}'", line.trim())));
    }
    Ok(value)
}

/// Maps any azimuth into `0.0..=360.0`
pub fn normalize_azimuth(azimuth: f64) -> f64 {
    if (0.0..=360.0).contains(&azimuth) {
        azimuth
    } else {
        azimuth.rem_euclid(360.0)
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_requests() {
        assert_eq!(get_position(), "p");
        assert_eq!(set_position(270.0, 0.0), "P 270.0 0.0");
        assert_eq!(set_position(12.345, 5.0), "P 12.3 5.0");
    }

    #[test]
    fn test_parse_report() {
        assert_eq!(parse_report("RPRT 0").unwrap(), Some(0));
        assert_eq!(parse_report("RPRT -5").unwrap(), Some(-5));
        assert_eq!(parse_report("180.000000").unwrap(), None);
        assert!(parse_report("RPRT x").is_err());
    }

    #[test]
    fn test_parse_angle() {
        assert_eq!(parse_angle("180.000000").unwrap(), 180.0);
        assert_eq!(parse_angle(" 0.5 ").unwrap(), 0.5);
        assert!(parse_angle("north").is_err());
        assert!(parse_angle("inf").is_err());
    }

    #[test]
    fn test_normalize_azimuth() {
        assert_eq!(normalize_azimuth(360.0), 360.0);
        assert_eq!(normalize_azimuth(-90.0), 270.0);
        assert_eq!(normalize_azimuth(450.0), 90.0);
    }
}
