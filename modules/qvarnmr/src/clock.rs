//! Wall-clock nanosecond stamps for `_mr_timestamp`.
//!
//! Duplicate reduced rows are reconciled by keeping the row with the
//! greatest `_mr_timestamp`, so stamps taken in one process must be
//! strictly increasing. Signed 64-bit nanoseconds leave room until ~2262.

use std::sync::atomic::{AtomicI64, Ordering};
use std::time::{SystemTime, UNIX_EPOCH};

use crate::error::{Error, Result};

static LAST_STAMP: AtomicI64 = AtomicI64::new(0);

const RESOLUTION_CHECK_ATTEMPTS: u32 = 1000;

fn wall_ns() -> i64 {
    SystemTime::now()
        .duration_since(UNIX_EPOCH)
        .map(|elapsed| elapsed.as_nanos() as i64)
        .unwrap_or(0)
}

/// A strictly increasing wall-clock nanosecond stamp. Two calls never
/// return the same value, even when the underlying clock stalls.
pub fn monotonic_ns() -> i64 {
    let mut last = LAST_STAMP.load(Ordering::Relaxed);
    loop {
        let next = wall_ns().max(last + 1);
        match LAST_STAMP.compare_exchange_weak(last, next, Ordering::SeqCst, Ordering::Relaxed) {
            Ok(_) => return next,
            Err(observed) => last = observed,
        }
    }
}

/// Startup self-check: the host clock must advance between two nearby
/// readings. Some machines only offer coarse clocks; on those,
/// `_mr_timestamp` tie-breaking would be meaningless across processes.
pub fn check_resolution() -> Result<()> {
    for _ in 0..RESOLUTION_CHECK_ATTEMPTS {
        let first = wall_ns();
        let second = wall_ns();
        if second > first {
            return Ok(());
        }
    }
    Err(Error::Config(
        "system clock does not provide nanosecond resolution; \
         reduced-resource timestamp tie-breaking requires strictly increasing stamps"
            .to_string(),
    ))
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn stamps_are_strictly_increasing() {
        let mut previous = monotonic_ns();
        for _ in 0..10_000 {
            let stamp = monotonic_ns();
            assert!(stamp > previous);
            previous = stamp;
        }
    }

    #[test]
    fn resolution_check_passes_on_this_host() {
        check_resolution().unwrap();
    }
}
