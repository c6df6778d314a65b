//! Monotonic clock used for latency measurements
//!
//! Reads may fail (`None`); callers treat a failed read as a zero-length
//! measurement rather than an error.

use nix::time::{clock_gettime, ClockId};

/// Source of monotonic timestamps in microseconds
pub trait Clock: Send + Sync {
    fn now_micros(&self) -> Option<u64>;
}

/// `CLOCK_MONOTONIC` with microsecond resolution
#[derive(Debug, Default, Clone, Copy)]
pub struct MonotonicClock;

impl Clock for MonotonicClock {
    fn now_micros(&self) -> Option<u64> {
        let ts = clock_gettime(ClockId::CLOCK_MONOTONIC).ok()?;
        let secs = u64::try_from(ts.tv_sec()).ok()?;
        let nanos = u64::try_from(ts.tv_nsec()).ok()?;
        secs.checked_mul(1_000_000)?.checked_add(nanos / 1_000)
    }
}

/// A clock that can never be read
#[derive(Debug, Default, Clone, Copy)]
pub struct UnavailableClock;

impl Clock for UnavailableClock {
    fn now_micros(&self) -> Option<u64> {
        None
    }
}

/// Microseconds elapsed between two reads, zero if either read failed
///
/// A clock that steps backwards also yields zero.
pub fn elapsed_micros(start: Option<u64>, end: Option<u64>) -> u64 {
    match (start, end) {
        (Some(start), Some(end)) => end.saturating_sub(start),
        _ => 0,
    }
}
