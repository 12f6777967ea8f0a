use std::convert::TryFrom;

use anyhow::{anyhow, Result};
use chrono::{DateTime, NaiveDateTime, Utc};

/// Format used by SQLite's `CURRENT_TIMESTAMP`, always UTC.
const SQLITE_DATETIME_FORMAT: &str = "%Y-%m-%d %H:%M:%S";

pub fn to_i64(value: u64) -> Result<i64> {
    i64::try_from(value).map_err(|_| anyhow!("value {value} exceeds SQLite INTEGER range"))
}

pub fn to_u64(value: i64, field: &str) -> Result<u64> {
    u64::try_from(value).map_err(|_| anyhow!("{field} contains negative value {value}"))
}

/// Accepts RFC 3339 as well as SQLite's own timestamp text. Anything else
/// yields `None` so the row can still be loaded.
pub fn parse_stored_datetime(value: Option<&str>) -> Option<DateTime<Utc>> {
    let raw = value?.trim();
    if raw.is_empty() {
        return None;
    }

    if let Ok(dt) = DateTime::parse_from_rfc3339(raw) {
        return Some(dt.with_timezone(&Utc));
    }

    NaiveDateTime::parse_from_str(raw, SQLITE_DATETIME_FORMAT)
        .ok()
        .map(|naive| naive.and_utc())
}

#[cfg(test)]
mod tests {
    use super::*;
    use chrono::TimeZone;

    #[test]
    fn parses_rfc3339_and_sqlite_text() {
        let expected = Utc.with_ymd_and_hms(2024, 5, 1, 10, 0, 0).unwrap();
        assert_eq!(
            parse_stored_datetime(Some("2024-05-01T10:00:00+00:00")),
            Some(expected)
        );
        assert_eq!(
            parse_stored_datetime(Some("2024-05-01 10:00:00")),
            Some(expected)
        );
    }

    #[test]
    fn unusable_text_is_none() {
        assert_eq!(parse_stored_datetime(None), None);
        assert_eq!(parse_stored_datetime(Some("")), None);
        assert_eq!(parse_stored_datetime(Some("yesterday")), None);
    }

    #[test]
    fn integer_conversions_guard_range() {
        assert_eq!(to_i64(42).unwrap(), 42);
        assert!(to_i64(u64::MAX).is_err());
        assert!(to_u64(-1, "mouse_movements").is_err());
    }
}
