//! Monotonic clock, wall clock and sleep behind one capability so cycles can
//! be driven deterministically in tests.

use std::time::{Duration, Instant, SystemTime, UNIX_EPOCH};

pub trait Clock: Send + Sync {
    /// Monotonic time, used for suspension timing and cycle boundaries.
    fn now(&self) -> Instant;

    /// Wall-clock milliseconds since the Unix epoch, written into batches.
    fn unix_millis(&self) -> i64;

    fn sleep(&self, duration: Duration);
}

#[derive(Debug, Clone, Copy, Default)]
pub struct SystemClock;

impl Clock for SystemClock {
    fn now(&self) -> Instant {
        Instant::now()
    }

    fn unix_millis(&self) -> i64 {
        SystemTime::now()
            .duration_since(UNIX_EPOCH)
            .map(|d| d.as_millis() as i64)
            .unwrap_or(0)
    }

    fn sleep(&self, duration: Duration) {
        std::thread::sleep(duration);
    }
}

/// Saturating conversion of an elapsed duration into the i32 microsecond
/// field of the final statistics record.
pub(crate) fn micros_i32(elapsed: Duration) -> i32 {
    elapsed.as_micros().min(i32::MAX as u128) as i32
}
