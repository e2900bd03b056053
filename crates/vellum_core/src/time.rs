//! Shared monotonic clock.

use std::sync::OnceLock;
use std::time::Instant;

static PROCESS_START: OnceLock<Instant> = OnceLock::new();

/// Seconds since the first call in this process. All latency bookkeeping,
/// smoothers and throttle expirations use this clock so they compare
/// consistently.
pub fn now_seconds() -> f64 {
    PROCESS_START
        .get_or_init(Instant::now)
        .elapsed()
        .as_secs_f64()
}
