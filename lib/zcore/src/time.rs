use std::time::{Duration, Instant};

/// A deadline the given number of milliseconds from now.
#[inline]
pub fn future_ms(ms: u64) -> Instant {
    Instant::now() + Duration::from_millis(ms)
}
