//! Parsing for human-entered duration strings.
//!
//! Config files express timeouts as strings like `"30s"`, `"250ms"` or
//! `"2m"`. Parsing happens once, before anything is started, so an invalid
//! string can be reported with the offending value intact.

use std::time::Duration;

use thiserror::Error;

#[derive(Debug, Error, PartialEq, Eq)]
pub enum DurationParseError {
    #[error("empty duration string")]
    Empty,
    #[error("invalid duration {0:?}: expected a number followed by ms, s, m or h")]
    Invalid(String),
}

/// Parses a duration of the form `<number><unit>` where the unit is one of
/// `ms`, `s`, `m` or `h`. A bare number is treated as seconds. Fractional
/// values are accepted (`"1.5s"`).
pub fn parse_duration(input: &str) -> Result<Duration, DurationParseError> {
    let trimmed = input.trim();
    if trimmed.is_empty() {
        return Err(DurationParseError::Empty);
    }

    let (value, multiplier_ms) = if let Some(number) = trimmed.strip_suffix("ms") {
        (number, 1.0)
    } else if let Some(number) = trimmed.strip_suffix('s') {
        (number, 1_000.0)
    } else if let Some(number) = trimmed.strip_suffix('m') {
        (number, 60_000.0)
    } else if let Some(number) = trimmed.strip_suffix('h') {
        (number, 3_600_000.0)
    } else {
        (trimmed, 1_000.0)
    };

    let value = value.trim();
    let parsed: f64 = value
        .parse()
        .map_err(|_| DurationParseError::Invalid(input.to_string()))?;
    if !parsed.is_finite() || parsed < 0.0 {
        return Err(DurationParseError::Invalid(input.to_string()));
    }

    Ok(Duration::from_secs_f64(parsed * multiplier_ms / 1_000.0))
}

#[cfg(test)]
mod tests {
    use super::*;
    use pretty_assertions::assert_eq;

    #[test]
    fn parses_common_forms() {
        assert_eq!(parse_duration("30s").unwrap(), Duration::from_secs(30));
        assert_eq!(parse_duration("250ms").unwrap(), Duration::from_millis(250));
        assert_eq!(parse_duration("2m").unwrap(), Duration::from_secs(120));
        assert_eq!(parse_duration("1h").unwrap(), Duration::from_secs(3600));
    }

    #[test]
    fn bare_numbers_are_seconds() {
        assert_eq!(parse_duration("5").unwrap(), Duration::from_secs(5));
    }

    #[test]
    fn fractional_values() {
        assert_eq!(parse_duration("1.5s").unwrap(), Duration::from_millis(1500));
        assert_eq!(parse_duration("0.5m").unwrap(), Duration::from_secs(30));
    }

    #[test]
    fn whitespace_is_tolerated() {
        assert_eq!(parse_duration("  10s ").unwrap(), Duration::from_secs(10));
    }

    #[test]
    fn rejects_garbage() {
        assert_eq!(parse_duration(""), Err(DurationParseError::Empty));
        assert!(matches!(
            parse_duration("soon"),
            Err(DurationParseError::Invalid(_))
        ));
        assert!(matches!(
            parse_duration("-3s"),
            Err(DurationParseError::Invalid(_))
        ));
    }
}
