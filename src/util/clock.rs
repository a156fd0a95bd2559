//! Wall-clock helpers.
//!
//! All persisted timestamps in scirocco are unix milliseconds (`i64`), with
//! `0` reserved as the "uninitialized" sentinel.

use time::OffsetDateTime;

/// Current UTC time as unix milliseconds.
pub fn now_millis() -> i64 {
    (OffsetDateTime::now_utc().unix_timestamp_nanos() / 1_000_000) as i64
}
