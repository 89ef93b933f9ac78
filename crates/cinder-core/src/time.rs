//! Wall-clock helpers for expiration deadlines.
//!
//! Deadlines are absolute unix milliseconds (u64) so they survive an AOF
//! round trip as `PEXPIREAT` arguments.

use std::time::{Duration, SystemTime, UNIX_EPOCH};

/// Current wall-clock time in unix milliseconds.
#[inline]
pub fn now_unix_ms() -> u64 {
    SystemTime::now()
        .duration_since(UNIX_EPOCH)
        .unwrap_or(Duration::ZERO)
        .as_millis() as u64
}

/// Returns `true` if the given absolute deadline has passed.
#[inline]
pub fn is_past(deadline_ms: u64) -> bool {
    now_unix_ms() >= deadline_ms
}

/// Remaining time until `deadline_ms`, zero if already past.
#[inline]
pub fn until(deadline_ms: u64) -> Duration {
    Duration::from_millis(deadline_ms.saturating_sub(now_unix_ms()))
}
