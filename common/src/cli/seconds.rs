//! Bounded durations for command-line flags.

use std::time::Duration;

/// Longest audio a single run will generate or stream, one hour.
pub const MAX_RUN_SECS: f64 = 3600.0;

/// Parses a non-negative number of seconds no larger than
/// [`MAX_RUN_SECS`].
///
/// Suitable as a clap `value_parser`.
///
/// # Errors
///
/// Returns a message for anything that is not a number, is negative,
/// NaN, infinite or too large.
pub fn parse_seconds(s: &str) -> Result<Duration, String> {
    // ---
    let secs: f64 = s
        .trim()
        .parse()
        .map_err(|_| format!("`{s}` is not a number of seconds"))?;
    if !(0.0..=MAX_RUN_SECS).contains(&secs) {
        return Err(format!("{s} is outside 0..={MAX_RUN_SECS} seconds"));
    }
    Duration::try_from_secs_f64(secs).map_err(|e| e.to_string())
}

#[cfg(test)]
mod tests {
    // ---
    use super::*;

    #[test]
    fn test_parse_seconds_accepts_fractions() {
        // ---
        assert_eq!(parse_seconds("5"), Ok(Duration::from_secs(5)));
        assert_eq!(parse_seconds(" 0.25 "), Ok(Duration::from_millis(250)));
        assert_eq!(parse_seconds("0"), Ok(Duration::ZERO));
    }

    #[test]
    fn test_parse_seconds_rejects_unbounded_values() {
        // ---
        for bad in ["inf", "-inf", "NaN", "1e300", "-1", "3601", "five", ""] {
            assert!(parse_seconds(bad).is_err(), "{bad} was accepted");
        }
    }
}
