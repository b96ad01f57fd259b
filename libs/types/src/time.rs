//! Timestamp helpers
//!
//! Every timestamp in the engine is an `i64` count of Unix nanoseconds.
//! Conversion to a calendar representation only happens at the wire edge.

use chrono::{DateTime, SecondsFormat, Utc};

/// Nanoseconds in one second.
pub const NANOS_PER_SEC: i64 = 1_000_000_000;

/// Nanoseconds in one millisecond.
pub const NANOS_PER_MILLI: i64 = 1_000_000;

/// Current wall-clock time in Unix nanoseconds.
///
/// Saturates at `i64::MAX` past the year 2262.
pub fn now_nanos() -> i64 {
    Utc::now().timestamp_nanos_opt().unwrap_or(i64::MAX)
}

/// Render a Unix-nanosecond timestamp as an RFC 3339 string (millisecond
/// precision, `Z` suffix).
pub fn to_rfc3339(timestamp_nanos: i64) -> String {
    DateTime::<Utc>::from_timestamp_nanos(timestamp_nanos)
        .to_rfc3339_opts(SecondsFormat::Millis, true)
}

/// Convert a whole number of seconds to nanoseconds, saturating.
pub fn secs_to_nanos(secs: u64) -> i64 {
    i64::try_from(secs)
        .ok()
        .and_then(|s| s.checked_mul(NANOS_PER_SEC))
        .unwrap_or(i64::MAX)
}

/// Convert a whole number of milliseconds to nanoseconds, saturating.
pub fn millis_to_nanos(millis: u64) -> i64 {
    i64::try_from(millis)
        .ok()
        .and_then(|m| m.checked_mul(NANOS_PER_MILLI))
        .unwrap_or(i64::MAX)
}
