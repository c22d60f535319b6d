//! Timestamp and duration parsing helpers.
//!
//! The feed ships times in several textual shapes: ISO-8601 UTC timestamps
//! (with or without trailing `Z`, with variable subsecond precision), clock
//! durations like `01:02:03` or `14:30` or `45`, and lap times like
//! `1:23.456`. Parsers here are lenient and return `None` rather than erroring
//! on malformed input; callers log and move on.

use chrono::{DateTime, NaiveDateTime, Utc};

/// Parses an ISO-8601 timestamp into UTC.
///
/// Accepts RFC 3339 forms and the offset-less `2024-03-02T15:04:05.123` shape
/// the feed uses; offset-less values are taken as UTC.
pub fn parse_utc_timestamp(raw: &str) -> Option<DateTime<Utc>> {
    let trimmed = raw.trim();
    if trimmed.is_empty() {
        return None;
    }
    if let Ok(dt) = DateTime::parse_from_rfc3339(trimmed) {
        return Some(dt.with_timezone(&Utc));
    }
    NaiveDateTime::parse_from_str(trimmed, "%Y-%m-%dT%H:%M:%S%.f")
        .ok()
        .map(|naive| naive.and_utc())
}

/// Parses `HH:MM:SS`, `MM:SS`, or bare `SS` (fractional allowed) to seconds.
pub fn parse_clock_to_seconds(raw: &str) -> Option<f64> {
    let trimmed = raw.trim();
    if trimmed.is_empty() {
        return None;
    }
    let parts: Vec<&str> = trimmed.split(':').collect();
    let mut seconds = 0.0;
    for part in &parts {
        let value: f64 = part.trim().parse().ok()?;
        if value < 0.0 {
            return None;
        }
        seconds = seconds * 60.0 + value;
    }
    match parts.len() {
        1..=3 => Some(seconds),
        _ => None,
    }
}

/// Parses a lap time like `1:23.456` (or `58.123` without minutes) to seconds.
pub fn parse_lap_time(raw: &str) -> Option<f64> {
    let trimmed = raw.trim();
    if trimmed.is_empty() {
        return None;
    }
    match trimmed.split_once(':') {
        Some((minutes, rest)) => {
            let m: f64 = minutes.trim().parse().ok()?;
            let s: f64 = rest.trim().parse().ok()?;
            if m < 0.0 || s < 0.0 {
                return None;
            }
            Some(m * 60.0 + s)
        }
        None => {
            let s: f64 = trimmed.parse().ok()?;
            if s < 0.0 { None } else { Some(s) }
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use chrono::TimeZone;

    #[test]
    fn parses_rfc3339_timestamps() {
        let parsed = parse_utc_timestamp("2024-03-02T15:04:05.123Z").unwrap();
        let expected = Utc.with_ymd_and_hms(2024, 3, 2, 15, 4, 5).unwrap()
            + chrono::Duration::milliseconds(123);
        assert_eq!(parsed, expected);
    }

    #[test]
    fn parses_offsetless_timestamps_as_utc() {
        let parsed = parse_utc_timestamp("2024-03-02T15:04:05.1234567").unwrap();
        assert_eq!(parsed.timezone(), Utc);
        let bare = parse_utc_timestamp("2024-03-02T15:04:05").unwrap();
        assert_eq!(bare, Utc.with_ymd_and_hms(2024, 3, 2, 15, 4, 5).unwrap());
    }

    #[test]
    fn rejects_garbage_timestamps() {
        assert!(parse_utc_timestamp("").is_none());
        assert!(parse_utc_timestamp("not a time").is_none());
        assert!(parse_utc_timestamp("2024-13-45T99:99:99").is_none());
    }

    #[test]
    fn parses_clock_durations() {
        assert_eq!(parse_clock_to_seconds("01:02:03"), Some(3723.0));
        assert_eq!(parse_clock_to_seconds("14:30"), Some(870.0));
        assert_eq!(parse_clock_to_seconds("45"), Some(45.0));
        assert_eq!(parse_clock_to_seconds("0:17:59"), Some(1079.0));
    }

    #[test]
    fn rejects_bad_clock_durations() {
        assert!(parse_clock_to_seconds("").is_none());
        assert!(parse_clock_to_seconds("1:2:3:4").is_none());
        assert!(parse_clock_to_seconds("ab:cd").is_none());
        assert!(parse_clock_to_seconds("-5:00").is_none());
    }

    #[test]
    fn parses_lap_times() {
        assert_eq!(parse_lap_time("1:23.456"), Some(83.456));
        assert_eq!(parse_lap_time("58.123"), Some(58.123));
        assert!(parse_lap_time("").is_none());
        assert!(parse_lap_time("fast").is_none());
    }
}
