//! Compile latency accumulation
//!
//! Wraps the host's "compile a source unit" entry point. Each compile is
//! timed with the monotonic clock and the elapsed microseconds are added to
//! a per-request counter, which the tracing collaborator reads with
//! [`get_compile_time`] when it finalizes the request.
//!
//! The counter is thread-local: the host runs one request per worker
//! thread, so compiles from different requests never share a counter and no
//! locking is needed.

use std::cell::Cell;
use std::sync::{Arc, PoisonError, RwLock};

use crate::clock::{elapsed_micros, Clock, MonotonicClock};
use crate::hook_registry::{HookRegistry, HookSlot};
use crate::host::{CompileFileFn, CompileKind, ExtensionPoint, FileHandle, OpArray};

thread_local! {
    static COMPILE_TIME_US: Cell<i64> = const { Cell::new(0) };
}

static COMPILE_SLOT: HookSlot<CompileFileFn> = HookSlot::new("compile_file", compile_file);

static CLOCK: RwLock<Option<Arc<dyn Clock>>> = RwLock::new(None);

/// Zero the current request's compile time
pub fn reset_compile_time() {
    COMPILE_TIME_US.with(|total| total.set(0));
}

/// Compile time accumulated by the current request, in microseconds
pub fn get_compile_time() -> i64 {
    COMPILE_TIME_US.with(|total| total.get())
}

/// Add `micros` to the current request's compile time
///
/// Saturates instead of overflowing.
pub fn record_compile_time(micros: u64) {
    let micros = i64::try_from(micros).unwrap_or(i64::MAX);
    COMPILE_TIME_US.with(|total| total.set(total.get().saturating_add(micros)));
}

/// Replace the clock used to time compiles
///
/// The default is [`MonotonicClock`].
pub fn set_clock(clock: Arc<dyn Clock>) {
    *CLOCK.write().unwrap_or_else(PoisonError::into_inner) = Some(clock);
}

/// Go back to the default monotonic clock
pub fn reset_clock() {
    *CLOCK.write().unwrap_or_else(PoisonError::into_inner) = None;
}

fn now_micros() -> Option<u64> {
    match CLOCK.read().unwrap_or_else(PoisonError::into_inner).as_ref() {
        Some(clock) => clock.now_micros(),
        None => MonotonicClock.now_micros(),
    }
}

/// Run `f` and add its duration to the compile-time counter
///
/// # Example
/// ```
/// use tracehook::compile_time::{get_compile_time, measure, reset_compile_time};
///
/// reset_compile_time();
/// let result = measure(|| 40 + 2);
/// assert_eq!(result, 42);
/// assert!(get_compile_time() >= 0);
/// ```
pub fn measure<F, R>(f: F) -> R
where
    F: FnOnce() -> R,
{
    let start = now_micros();
    let result = f();
    let end = now_micros();
    record_compile_time(elapsed_micros(start, end));
    result
}

/// Interceptor for the compile entry point
fn compile_file(file: &FileHandle, kind: CompileKind) -> Option<OpArray> {
    measure(|| match COMPILE_SLOT.previous() {
        Some(previous) => previous(file, kind),
        None => None,
    })
}

/// Hook the compile entry point
pub fn install<P>(registry: &mut HookRegistry, point: P) -> Option<CompileFileFn>
where
    P: ExtensionPoint<CompileFileFn> + Send + Sync + 'static,
{
    registry.install(&COMPILE_SLOT, point)
}

/// The slot wrapping the compile entry point
pub fn slot() -> &'static HookSlot<CompileFileFn> {
    &COMPILE_SLOT
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_reset_and_get() {
        record_compile_time(125);
        assert!(get_compile_time() >= 125);

        reset_compile_time();
        assert_eq!(get_compile_time(), 0);
    }

    #[test]
    fn test_record_accumulates() {
        reset_compile_time();
        record_compile_time(100);
        record_compile_time(250);
        assert_eq!(get_compile_time(), 350);
    }

    #[test]
    fn test_record_saturates() {
        reset_compile_time();
        record_compile_time(u64::MAX);
        record_compile_time(10);
        assert_eq!(get_compile_time(), i64::MAX);
    }

    #[test]
    fn test_measure_returns_result() {
        reset_compile_time();
        let value = measure(|| "compiled");
        assert_eq!(value, "compiled");
        assert!(get_compile_time() >= 0);
    }

    #[test]
    fn test_counter_is_thread_local() {
        reset_compile_time();
        record_compile_time(500);

        let other = std::thread::spawn(|| {
            record_compile_time(7);
            get_compile_time()
        })
        .join()
        .unwrap();

        assert_eq!(other, 7);
        assert_eq!(get_compile_time(), 500);
    }

    #[test]
    fn test_slot_name() {
        assert_eq!(slot().name(), "compile_file");
    }
}
