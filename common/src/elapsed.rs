//! Compact display formatting for elapsed times.

use std::time::Duration;

/// Formats a duration the way run summaries print it: `"420ms"` below one
/// second, `"3.2s"` below one minute, `"2m05s"` beyond that.
pub fn format_elapsed(duration: Duration) -> String {
    let millis = duration.as_millis();
    if millis < 1_000 {
        format!("{millis}ms")
    } else if millis < 60_000 {
        format!("{:.1}s", duration.as_secs_f64())
    } else {
        let total_secs = duration.as_secs();
        format!("{}m{:02}s", total_secs / 60, total_secs % 60)
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use pretty_assertions::assert_eq;

    #[test]
    fn formats_each_range() {
        assert_eq!(format_elapsed(Duration::from_millis(420)), "420ms");
        assert_eq!(format_elapsed(Duration::from_millis(3_200)), "3.2s");
        assert_eq!(format_elapsed(Duration::from_secs(125)), "2m05s");
    }
}
