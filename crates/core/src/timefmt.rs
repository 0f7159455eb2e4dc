//! Display helpers for timeline labels.

/// `M:SS`, truncating fractional seconds. Negative or non-finite input shows
/// as `0:00`; anything past 99:59 is clamped to it.
pub fn format_clock(secs: f64) -> String {
    let total = if secs.is_finite() && secs > 0.0 {
        (secs.floor() as u64).min(99 * 60 + 59)
    } else {
        0
    };
    format!("{}:{:02}", total / 60, total % 60)
}

/// Seconds with one decimal, e.g. `5.0s`.
pub fn format_seconds(secs: f64) -> String {
    let secs = if secs.is_finite() { secs.max(0.0) } else { 0.0 };
    format!("{secs:.1}s")
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn clock_format() {
        assert_eq!(format_clock(0.0), "0:00");
        assert_eq!(format_clock(5.9), "0:05");
        assert_eq!(format_clock(65.0), "1:05");
        assert_eq!(format_clock(600.0), "10:00");
        assert_eq!(format_clock(1e9), "99:59");
        assert_eq!(format_clock(-3.0), "0:00");
        assert_eq!(format_clock(f64::NAN), "0:00");
    }

    #[test]
    fn seconds_format() {
        assert_eq!(format_seconds(5.0), "5.0s");
        assert_eq!(format_seconds(4.96), "5.0s");
        assert_eq!(format_seconds(12.34), "12.3s");
        assert_eq!(format_seconds(-1.0), "0.0s");
    }
}
