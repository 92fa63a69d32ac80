//! Timestamp parsing and formatting.
//!
//! SharePoint reports times without an offset; callers pass the zone the
//! server reports in (UTC unless configured otherwise).

use chrono::{DateTime, FixedOffset, NaiveDateTime, Offset, TimeZone, Utc};

/// `ows_Modified` of list items and change entries.
pub const MODIFIED_FORMAT: &str = "%Y-%m-%dT%H:%M:%SZ";

/// `LastModified` of lists.
pub const LIST_LAST_MODIFIED_FORMAT: &str = "%Y-%m-%d %H:%M:%SZ";

fn parse_in(value: &str, format: &str, zone: &FixedOffset) -> Option<DateTime<Utc>> {
    let naive = NaiveDateTime::parse_from_str(value.trim(), format).ok()?;
    zone.from_local_datetime(&naive)
        .single()
        .map(|dt| dt.with_timezone(&Utc))
}

pub fn parse_modified(value: &str, zone: &FixedOffset) -> Option<DateTime<Utc>> {
    parse_in(value, MODIFIED_FORMAT, zone)
}

pub fn parse_list_last_modified(value: &str, zone: &FixedOffset) -> Option<DateTime<Utc>> {
    parse_in(value, LIST_LAST_MODIFIED_FORMAT, zone)
}

pub fn utc() -> FixedOffset {
    Utc.fix()
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_parse_modified_in_utc() {
        let parsed = parse_modified("2024-05-14T08:30:00Z", &utc()).unwrap();
        assert_eq!(parsed, Utc.with_ymd_and_hms(2024, 5, 14, 8, 30, 0).unwrap());
        assert_eq!(utc().local_minus_utc(), 0);
    }

    #[test]
    fn test_parse_respects_zone() {
        let plus_two = FixedOffset::east_opt(2 * 3600).unwrap();
        let parsed = parse_list_last_modified("2024-05-14 10:30:00Z", &plus_two).unwrap();
        assert_eq!(parsed, Utc.with_ymd_and_hms(2024, 5, 14, 8, 30, 0).unwrap());
    }

    #[test]
    fn test_garbage_is_none() {
        assert!(parse_modified("yesterday", &utc()).is_none());
        assert!(parse_list_last_modified("2024-05-14T10:30:00Z", &utc()).is_none());
    }
}
