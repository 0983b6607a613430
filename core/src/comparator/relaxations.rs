//! Configurable equivalences for values that legitimately differ between
//! the recording and a replay: identifiers, timestamps, dates.

use std::sync::OnceLock;

use chrono::DateTime;
use regex::Regex;
use serde_json::Value;

use crate::config::ComparisonConfig;

fn uuid_regex() -> &'static Regex {
    static RE: OnceLock<Regex> = OnceLock::new();
    RE.get_or_init(|| {
        #[allow(clippy::unwrap_used)]
        Regex::new(r"^[0-9a-fA-F]{8}-[0-9a-fA-F]{4}-[0-9a-fA-F]{4}-[0-9a-fA-F]{4}-[0-9a-fA-F]{12}$")
            .unwrap()
    })
}

fn date_regex() -> &'static Regex {
    static RE: OnceLock<Regex> = OnceLock::new();
    RE.get_or_init(|| {
        #[allow(clippy::unwrap_used)]
        Regex::new(r"^\d{4}-\d{2}-\d{2}$").unwrap()
    })
}

#[derive(Clone, Copy, Debug)]
pub(crate) struct Relaxations {
    uuids: bool,
    timestamps: bool,
    dates: bool,
}

impl Relaxations {
    pub(crate) fn new(config: &ComparisonConfig) -> Self {
        Self {
            uuids: config.ignore_uuids,
            timestamps: config.ignore_timestamps,
            dates: config.ignore_dates,
        }
    }

    /// True when both values belong to an enabled relaxation class and may
    /// therefore differ without counting as a deviation.
    pub(crate) fn equivalent(&self, expected: &Value, actual: &Value) -> bool {
        if self.uuids && is_uuid(expected) && is_uuid(actual) {
            return true;
        }
        if self.timestamps && is_timestamp(expected) && is_timestamp(actual) {
            return true;
        }
        if self.dates && is_date(expected) && is_date(actual) {
            return true;
        }
        false
    }
}

fn is_uuid(value: &Value) -> bool {
    matches!(value, Value::String(s) if uuid_regex().is_match(s))
}

fn is_date(value: &Value) -> bool {
    matches!(value, Value::String(s) if date_regex().is_match(s))
}

/// RFC 3339 strings and epoch-like numbers (seconds or milliseconds since
/// 1970, i.e. 10 or 13 digit magnitudes) both count as timestamps.
fn is_timestamp(value: &Value) -> bool {
    match value {
        Value::String(s) => DateTime::parse_from_rfc3339(s).is_ok(),
        Value::Number(n) => match n.as_i64() {
            Some(v) => {
                let magnitude = v.abs();
                (1_000_000_000..10_000_000_000).contains(&magnitude)
                    || (1_000_000_000_000..10_000_000_000_000).contains(&magnitude)
            }
            None => false,
        },
        _ => false,
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use serde_json::json;

    fn all_on() -> Relaxations {
        Relaxations {
            uuids: true,
            timestamps: true,
            dates: true,
        }
    }

    #[test]
    fn uuids_are_equivalent_when_both_match() {
        let relaxations = all_on();
        assert!(relaxations.equivalent(
            &json!("123e4567-e89b-12d3-a456-426614174000"),
            &json!("00000000-0000-0000-0000-000000000000"),
        ));
        assert!(!relaxations.equivalent(
            &json!("123e4567-e89b-12d3-a456-426614174000"),
            &json!("not-a-uuid"),
        ));
    }

    #[test]
    fn timestamps_cover_rfc3339_and_epochs() {
        let relaxations = all_on();
        assert!(relaxations.equivalent(
            &json!("2024-01-01T00:00:00Z"),
            &json!("2025-06-15T12:30:00+02:00"),
        ));
        assert!(relaxations.equivalent(&json!(1_700_000_000), &json!(1_800_000_000)));
        assert!(relaxations.equivalent(&json!(1_700_000_000_000i64), &json!(1_800_000_000_000i64)));
        assert!(!relaxations.equivalent(&json!(42), &json!(43)));
    }

    #[test]
    fn dates_must_match_the_iso_shape() {
        let relaxations = all_on();
        assert!(relaxations.equivalent(&json!("2024-01-01"), &json!("2024-01-02")));
        assert!(!relaxations.equivalent(&json!("2024-01-01"), &json!("January 1st")));
    }

    #[test]
    fn disabled_relaxations_do_nothing() {
        let relaxations = Relaxations {
            uuids: false,
            timestamps: false,
            dates: false,
        };
        assert!(!relaxations.equivalent(&json!("2024-01-01"), &json!("2024-01-02")));
    }
}
