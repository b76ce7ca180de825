//! `DurationString` grammar: `^([0-9]+)(ms|s|m|h|d)$`, no whitespace.

use crate::{AppError, AppResult};

const MS_PER_MS: u64 = 1;
const MS_PER_SECOND: u64 = 1_000;
const MS_PER_MINUTE: u64 = 60 * MS_PER_SECOND;
const MS_PER_HOUR: u64 = 60 * MS_PER_MINUTE;
const MS_PER_DAY: u64 = 24 * MS_PER_HOUR;

/// Parses a `DurationString` (e.g. `"500ms"`, `"30s"`, `"5m"`) into milliseconds.
///
/// Malformed strings are a hard validation error: a bad duration is a
/// definition-time or call-time mistake, not something to silently coerce.
pub fn parse_duration(value: &str) -> AppResult<u64> {
    let split_at = value
        .find(|c: char| !c.is_ascii_digit())
        .filter(|&index| index > 0)
        .ok_or_else(|| invalid(value))?;

    let (digits, unit) = value.split_at(split_at);
    let magnitude: u64 = digits.parse().map_err(|_| invalid(value))?;
    let ms_per_unit = match unit {
        "ms" => MS_PER_MS,
        "s" => MS_PER_SECOND,
        "m" => MS_PER_MINUTE,
        "h" => MS_PER_HOUR,
        "d" => MS_PER_DAY,
        _ => return Err(invalid(value)),
    };

    magnitude.checked_mul(ms_per_unit).ok_or_else(|| invalid(value))
}

/// Formats a millisecond count back into a `DurationString`.
///
/// Always emits the `ms` unit so that `parse_duration(format_duration(ms))
/// == ms` holds for every representable value, not just ones that divide
/// evenly into a larger unit.
#[must_use]
pub fn format_duration(milliseconds: u64) -> String {
    format!("{milliseconds}ms")
}

fn invalid(value: &str) -> AppError {
    AppError::Validation(format!("malformed duration string '{value}'"))
}

#[cfg(test)]
mod tests {
    use proptest::prelude::*;

    use super::{format_duration, parse_duration};

    #[test]
    fn parses_each_unit() {
        assert_eq!(parse_duration("500ms").expect("valid"), 500);
        assert_eq!(parse_duration("30s").expect("valid"), 30_000);
        assert_eq!(parse_duration("5m").expect("valid"), 300_000);
        assert_eq!(parse_duration("2h").expect("valid"), 7_200_000);
        assert_eq!(parse_duration("1d").expect("valid"), 86_400_000);
    }

    #[test]
    fn rejects_whitespace_and_unknown_units() {
        assert!(parse_duration(" 5s").is_err());
        assert!(parse_duration("5 s").is_err());
        assert!(parse_duration("5w").is_err());
        assert!(parse_duration("s5").is_err());
        assert!(parse_duration("").is_err());
        assert!(parse_duration("ms").is_err());
    }

    proptest! {
        #[test]
        fn round_trips_through_format(milliseconds in 0u64..=86_400_000_000) {
            let formatted = format_duration(milliseconds);
            prop_assert_eq!(parse_duration(&formatted).expect("valid"), milliseconds);
        }
    }
}
