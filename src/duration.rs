//! Human-readable duration parsing for command-line options.

use std::time::Duration;

/// Parse a duration from a human-readable string.
///
/// Supports the following suffixes:
/// - `s` or no suffix: seconds
/// - `m`: minutes
/// - `h`: hours
/// - `ms`: milliseconds
///
/// # Examples
/// ```
/// use ble_sensor_gateway::duration::parse_duration;
/// use std::time::Duration;
///
/// assert_eq!(parse_duration("60s").unwrap(), Duration::from_secs(60));
/// assert_eq!(parse_duration("5m").unwrap(), Duration::from_secs(300));
/// assert_eq!(parse_duration("250ms").unwrap(), Duration::from_millis(250));
/// ```
pub fn parse_duration(src: &str) -> Result<Duration, String> {
    let src = src.trim();

    if src.is_empty() {
        return Err("empty duration string".to_string());
    }

    if let Some(num) = src.strip_suffix("ms") {
        return parse_count(num, "milliseconds").map(Duration::from_millis);
    }
    if let Some(num) = src.strip_suffix('h') {
        return parse_count(num, "hours").map(|h| Duration::from_secs(h * 3600));
    }
    if let Some(num) = src.strip_suffix('m') {
        return parse_count(num, "minutes").map(|m| Duration::from_secs(m * 60));
    }
    if let Some(num) = src.strip_suffix('s') {
        return parse_count(num, "seconds").map(Duration::from_secs);
    }

    parse_count(src, "duration").map(Duration::from_secs)
}

fn parse_count(num: &str, unit: &str) -> Result<u64, String> {
    num.trim()
        .parse()
        .map_err(|_| format!("invalid {unit}: {num}"))
}

/// Like [`parse_duration`], but rejects zero.
pub fn parse_window(src: &str) -> Result<Duration, String> {
    let window = parse_duration(src)?;
    if window.is_zero() {
        return Err("window duration must be greater than zero".to_string());
    }
    Ok(window)
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_parse_duration_seconds() {
        assert_eq!(parse_duration("3s").unwrap(), Duration::from_secs(3));
        assert_eq!(parse_duration("0s").unwrap(), Duration::ZERO);
    }

    #[test]
    fn test_parse_duration_minutes_and_hours() {
        assert_eq!(parse_duration("1m").unwrap(), Duration::from_secs(60));
        assert_eq!(parse_duration("2h").unwrap(), Duration::from_secs(7200));
    }

    #[test]
    fn test_parse_duration_milliseconds() {
        assert_eq!(parse_duration("500ms").unwrap(), Duration::from_millis(500));
    }

    #[test]
    fn test_parse_duration_no_suffix() {
        assert_eq!(parse_duration("10").unwrap(), Duration::from_secs(10));
    }

    #[test]
    fn test_parse_duration_with_whitespace() {
        assert_eq!(parse_duration(" 3s ").unwrap(), Duration::from_secs(3));
        assert_eq!(parse_duration("3 s").unwrap(), Duration::from_secs(3));
    }

    #[test]
    fn test_parse_duration_invalid() {
        assert!(parse_duration("").is_err());
        assert!(parse_duration("abc").is_err());
        assert!(parse_duration("-1s").is_err());
    }

    #[test]
    fn test_parse_window_rejects_zero() {
        assert!(parse_window("0s").is_err());
        assert!(parse_window("0").is_err());
        assert_eq!(parse_window("60s").unwrap(), Duration::from_secs(60));
    }
}
