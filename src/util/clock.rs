//! Wall-clock helpers. Timestamps are milliseconds since the Unix epoch.

use std::time::{Duration, SystemTime, UNIX_EPOCH};

/// Current time in milliseconds since the Unix epoch.
pub fn now_ms() -> u128 {
    SystemTime::now()
        .duration_since(UNIX_EPOCH)
        .map(|d| d.as_millis())
        .unwrap_or(0)
}

/// Timestamp `after` past `from_ms`.
pub fn add_ms(from_ms: u128, after: Duration) -> u128 {
    from_ms.saturating_add(after.as_millis())
}

/// Milliseconds elapsed between `since_ms` and `now_ms`, zero if the clock went backwards.
pub const fn elapsed_ms(since_ms: u128, now_ms: u128) -> u128 {
    now_ms.saturating_sub(since_ms)
}
