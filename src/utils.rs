//! Utility functions for timestamps, slugs and log formatting.
//!
//! - ISO-8601 rendering with minute or second precision
//! - Slug validation against the identifier character class
//! - String truncation for logging large records

use chrono::{DateTime, NaiveDateTime, Timelike, Utc};
use once_cell::sync::Lazy;
use regex::Regex;

static SLUG_PATTERN: Lazy<Regex> =
    Lazy::new(|| Regex::new(r"^[\w-]+$").expect("slug pattern is valid"));

/// Render a UTC timestamp as ISO-8601 with a `Z` suffix.
///
/// Minute precision is used when the seconds are zero, second precision
/// otherwise; sub-second parts are dropped.
///
/// # Examples
///
/// ```ignore
/// // 2024-01-03T10:15:00Z -> "2024-01-03T10:15Z"
/// // 2024-01-03T10:15:42Z -> "2024-01-03T10:15:42Z"
/// ```
pub fn iso8601_utc(value: DateTime<Utc>) -> String {
    if value.second() == 0 {
        value.format("%Y-%m-%dT%H:%MZ").to_string()
    } else {
        value.format("%Y-%m-%dT%H:%M:%SZ").to_string()
    }
}

/// Parse a timestamp rendered by [`iso8601_utc`], at either precision.
///
/// Full RFC 3339 timestamps are accepted as well.
pub fn parse_iso8601_utc(value: &str) -> Option<DateTime<Utc>> {
    ["%Y-%m-%dT%H:%MZ", "%Y-%m-%dT%H:%M:%SZ"]
        .iter()
        .find_map(|format| NaiveDateTime::parse_from_str(value, format).ok())
        .map(|naive| naive.and_utc())
        .or_else(|| {
            DateTime::parse_from_rfc3339(value)
                .ok()
                .map(|t| t.with_timezone(&Utc))
        })
}

/// Convert epoch seconds (integer or fractional) to a UTC timestamp.
pub fn from_epoch_seconds(seconds: f64) -> Option<DateTime<Utc>> {
    if !seconds.is_finite() {
        return None;
    }
    DateTime::from_timestamp(seconds.floor() as i64, 0)
}

/// `YYYY/MM/DD` path fragment used in canonical article URLs.
pub fn date_dir(value: DateTime<Utc>) -> String {
    value.format("%Y/%m/%d").to_string()
}

/// Whether `slug` consists only of word characters and hyphens.
pub fn is_valid_slug(slug: &str) -> bool {
    SLUG_PATTERN.is_match(slug)
}

/// Truncate a string for logging purposes.
///
/// Long strings are cut to `max` bytes (respecting char boundaries) with an
/// ellipsis and byte count indicator appended.
pub fn truncate_for_log(s: &str, max: usize) -> String {
    if s.len() <= max {
        return s.to_string();
    }
    let mut cut = max;
    while !s.is_char_boundary(cut) {
        cut -= 1;
    }
    format!("{}…(+{} bytes)", &s[..cut], s.len() - cut)
}
