//! T-relative offset and duration grammar
//!
//! Offsets (`T-0`, `T-30m`, `T-1d`) express lead time before a batch's event
//! time and parse to whole minutes; second-granularity offsets round up to the
//! next minute. Durations (`30s`, `5m`, `2h`) are used for poll and retry
//! intervals and parse to seconds.

use crate::error::{CoreError, Result};

/// Parse a `T-`-relative offset into whole minutes.
///
/// `T-0` is zero lead time (the phase fires at the batch's event time).
pub fn parse_offset(input: &str) -> Result<i64> {
    let trimmed = input.trim();
    let body = trimmed
        .strip_prefix("T-")
        .ok_or_else(|| CoreError::InvalidOffset(input.to_string()))?;

    if body == "0" {
        return Ok(0);
    }

    let (value, unit) = split_magnitude(body).ok_or_else(|| {
        CoreError::InvalidOffset(input.to_string())
    })?;

    match unit {
        "s" => {
            let d = value / 60;
            let r = value % 60;
            Ok(if (r > 0 && 60 > 0) || (r < 0 && 60 < 0) { d + 1 } else { d })
        }
        "m" => Ok(value),
        "h" => Ok(value * 60),
        "d" => Ok(value * 60 * 24),
        _ => Err(CoreError::InvalidOffset(input.to_string())),
    }
}

/// Parse a duration string into whole seconds.
pub fn parse_duration(input: &str) -> Result<i64> {
    let trimmed = input.trim();

    if trimmed == "0" {
        return Ok(0);
    }

    let (value, unit) = split_magnitude(trimmed).ok_or_else(|| {
        CoreError::InvalidDuration(input.to_string())
    })?;

    match unit {
        "s" => Ok(value),
        "m" => Ok(value * 60),
        "h" => Ok(value * 60 * 60),
        "d" => Ok(value * 60 * 60 * 24),
        _ => Err(CoreError::InvalidDuration(input.to_string())),
    }
}

/// Split `<digits><suffix>` into its numeric value and suffix.
///
/// Returns `None` when the digits are empty, the suffix is empty, or the
/// number does not fit in an i64.
fn split_magnitude(body: &str) -> Option<(i64, &str)> {
    let digits_end = body.find(|c: char| !c.is_ascii_digit())?;
    if digits_end == 0 {
        return None;
    }
    let value: i64 = body[..digits_end].parse().ok()?;
    Some((value, &body[digits_end..]))
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_offset_zero() {
        assert_eq!(parse_offset("T-0").unwrap(), 0);
    }

    #[test]
    fn test_offset_units() {
        assert_eq!(parse_offset("T-30m").unwrap(), 30);
        assert_eq!(parse_offset("T-2h").unwrap(), 120);
        assert_eq!(parse_offset("T-1d").unwrap(), 1440);
    }

    #[test]
    fn test_offset_seconds_round_up() {
        assert_eq!(parse_offset("T-30s").unwrap(), 1);
        assert_eq!(parse_offset("T-60s").unwrap(), 1);
        assert_eq!(parse_offset("T-61s").unwrap(), 2);
    }

    #[test]
    fn test_offset_rejects_garbage() {
        assert!(parse_offset("").is_err());
        assert!(parse_offset("T-").is_err());
        assert!(parse_offset("T-5").is_err());
        assert!(parse_offset("T-5w").is_err());
        assert!(parse_offset("T+5m").is_err());
        assert!(parse_offset("5m").is_err());
        assert!(parse_offset("T-m").is_err());
    }

    #[test]
    fn test_duration_units() {
        assert_eq!(parse_duration("30s").unwrap(), 30);
        assert_eq!(parse_duration("10m").unwrap(), 600);
        assert_eq!(parse_duration("1h").unwrap(), 3600);
        assert_eq!(parse_duration("1d").unwrap(), 86400);
        assert_eq!(parse_duration("0").unwrap(), 0);
    }

    #[test]
    fn test_duration_rejects_garbage() {
        assert!(parse_duration("").is_err());
        assert!(parse_duration("ten minutes").is_err());
        assert!(parse_duration("10").is_err());
        assert!(parse_duration("10x").is_err());
        assert!(parse_duration("-10s").is_err());
    }

    #[test]
    fn test_whitespace_tolerated() {
        assert_eq!(parse_offset(" T-1h ").unwrap(), 60);
        assert_eq!(parse_duration(" 5s ").unwrap(), 5);
    }
}
