//! Nanosecond wall-clock helper shared by heartbeats, buffer timestamps, and
//! the scheduler's backoff tiers.

use std::time::{SystemTime, UNIX_EPOCH};

/// Current time as nanoseconds since the Unix epoch.
///
/// Saturates to `0` if the system clock is set before the epoch rather than
/// panicking; a misconfigured clock should degrade liveness checks, not
/// crash the process hosting them.
pub fn now_ns() -> u64 {
    SystemTime::now()
        .duration_since(UNIX_EPOCH)
        .map(|d| d.as_nanos() as u64)
        .unwrap_or(0)
}
