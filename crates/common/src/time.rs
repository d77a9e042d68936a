//! Unix-time helpers.

use std::time::{SystemTime, UNIX_EPOCH};

/// Current unix timestamp in seconds.
///
/// Saturates to zero for clocks set before the epoch rather than panicking.
pub fn now_unix() -> u64 {
    SystemTime::now()
        .duration_since(UNIX_EPOCH)
        .map(|d| d.as_secs())
        .unwrap_or(0)
}
