//! Timestamp normalization for extracted `timestamp_to_transform` values.
//!
//! Log sources stamp entries in a handful of shapes: RFC3339, RFC2822, the
//! `dd/Mon/yyyy:HH:MM:SS +zzzz` access-log form, and zone-less variants.
//! Zone-less timestamps from sources that log in UTC (Redshift audit logs)
//! only parse after a `Z` suffix is appended, so parsing retries once with
//! the suffix before giving up.

use chrono::{DateTime, NaiveDateTime};

const NAIVE_ISO: &str = "%Y-%m-%dT%H:%M:%S%.f";

const ZONED_FORMATS: &[&str] = &[
    "%Y-%m-%dT%H:%M:%S%.f%z",
    "%Y-%m-%d %H:%M:%S%.f %z",
    "%d/%b/%Y:%H:%M:%S %z",
];

const NAIVE_FORMATS: &[&str] = &[
    "%Y-%m-%dT%H:%M:%S%.f",
    "%Y-%m-%d %H:%M:%S%.f",
    "%Y/%m/%d %H:%M:%S%.f",
];

// Applied to the input with "Z" appended. The Redshift audit form carries
// milliseconds behind a colon: "Tue, 21 Feb 2023 16:58:20:471".
const ZULU_FORMATS: &[&str] = &[
    "%Y-%m-%d %H:%M:%S%.fZ",
    "%a, %d %b %Y %H:%M:%S:%3fZ",
    "%a, %d %b %Y %H:%M:%SZ",
];

fn parse_zoned(input: &str) -> Option<DateTime<chrono::FixedOffset>> {
    if let Ok(parsed) = DateTime::parse_from_rfc3339(input) {
        return Some(parsed);
    }
    if let Ok(parsed) = DateTime::parse_from_rfc2822(input) {
        return Some(parsed);
    }
    ZONED_FORMATS
        .iter()
        .find_map(|format| DateTime::parse_from_str(input, format).ok())
}

/// Normalizes a timestamp string to ISO-8601.
///
/// Zone-aware inputs keep their offset; zone-less inputs stay naive, exactly
/// as the fallback parser leaves them. Returns `None` when the value cannot
/// be interpreted even after the `Z`-suffix retry.
pub fn normalize_timestamp(input: &str) -> Option<String> {
    if let Some(parsed) = parse_zoned(input) {
        return Some(parsed.to_rfc3339());
    }

    for format in NAIVE_FORMATS {
        if let Ok(parsed) = NaiveDateTime::parse_from_str(input, format) {
            return Some(parsed.format(NAIVE_ISO).to_string());
        }
    }

    let zulu = format!("{input}Z");
    if let Some(parsed) = parse_zoned(&zulu) {
        return Some(parsed.to_rfc3339());
    }
    for format in ZULU_FORMATS {
        if let Ok(parsed) = NaiveDateTime::parse_from_str(&zulu, format) {
            return Some(parsed.and_utc().to_rfc3339());
        }
    }

    None
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_rfc3339_with_zone() {
        assert_eq!(
            normalize_timestamp("2022-09-27T15:28:18.612792Z").as_deref(),
            Some("2022-09-27T15:28:18.612792+00:00")
        );
    }

    #[test]
    fn test_access_log_format_with_zone() {
        assert_eq!(
            normalize_timestamp("06/Feb/2019:00:00:38 +0000").as_deref(),
            Some("2019-02-06T00:00:38+00:00")
        );
    }

    #[test]
    fn test_zone_less_stays_naive() {
        assert_eq!(
            normalize_timestamp("2019-12-04 21:02:31").as_deref(),
            Some("2019-12-04T21:02:31")
        );
    }

    #[test]
    fn test_redshift_form_via_zulu_retry() {
        // Fails the first pass, parses once "Z" is appended.
        assert_eq!(
            normalize_timestamp("Tue, 21 Feb 2023 16:58:20:471").as_deref(),
            Some("2023-02-21T16:58:20.471+00:00")
        );
    }

    #[test]
    fn test_garbage_is_rejected() {
        assert_eq!(normalize_timestamp("not a date"), None);
    }
}
