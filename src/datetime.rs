//! Time helpers for strata.
//!
//! Timestamps are carried as Unix epoch milliseconds (i64) throughout the
//! records; chrono is used where wall-clock calendar boundaries matter
//! (bandwidth counter resets).

use chrono::{DateTime, Datelike, TimeZone, Utc};

/// Milliseconds in one second.
pub const SECOND_MS: i64 = 1_000;

/// Milliseconds in one minute.
pub const MINUTE_MS: i64 = 60 * SECOND_MS;

/// Milliseconds in one hour.
pub const HOUR_MS: i64 = 60 * MINUTE_MS;

/// Milliseconds in one day.
pub const DAY_MS: i64 = 24 * HOUR_MS;

/// Current time as Unix epoch milliseconds.
pub fn now_millis() -> i64 {
    Utc::now().timestamp_millis()
}

/// Convert a day count to milliseconds.
pub fn days_ms(days: i64) -> i64 {
    days * DAY_MS
}

/// Convert epoch milliseconds to a UTC datetime.
///
/// Out-of-range values clamp to the epoch rather than panic.
pub fn to_datetime(millis: i64) -> DateTime<Utc> {
    Utc.timestamp_millis_opt(millis)
        .single()
        .unwrap_or_else(|| Utc.timestamp_millis_opt(0).single().unwrap())
}

/// True when two epoch-millisecond timestamps fall on the same UTC calendar day.
pub fn same_day(a: i64, b: i64) -> bool {
    let (a, b) = (to_datetime(a), to_datetime(b));
    a.year() == b.year() && a.ordinal() == b.ordinal()
}

/// True when two epoch-millisecond timestamps fall in the same UTC calendar month.
pub fn same_month(a: i64, b: i64) -> bool {
    let (a, b) = (to_datetime(a), to_datetime(b));
    a.year() == b.year() && a.month() == b.month()
}

/// Format an epoch-millisecond timestamp as RFC 3339 for logs.
pub fn format_millis(millis: i64) -> String {
    to_datetime(millis).to_rfc3339()
}
