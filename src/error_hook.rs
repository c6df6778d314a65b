//! Observation of errors reported by the host
//!
//! Chains the host's error callback so the tracer can attach reported
//! errors to the active span. The original callback always runs afterwards
//! with the same report.

use crate::hook_registry::{HookRegistry, HookSlot};
use crate::host::ExtensionPoint;
use crate::trace_source;

/// An error as passed to the host's error callback
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct ErrorReport {
    pub error_type: i32,
    pub message: String,
    pub file: String,
    pub line: u32,
}

/// The host's error callback
pub type ErrorCallbackFn = fn(&ErrorReport);

static ERROR_SLOT: HookSlot<ErrorCallbackFn> = HookSlot::new("error_cb", error_callback);

fn error_callback(report: &ErrorReport) {
    if let Some(source) = trace_source::current() {
        if source.is_tracing_enabled() && !source.is_request_disabled() {
            source.on_error_reported(report);
        }
    }

    if let Some(previous) = ERROR_SLOT.previous() {
        previous(report);
    }
}

/// Hook the host's error callback
pub fn install<P>(registry: &mut HookRegistry, point: P) -> Option<ErrorCallbackFn>
where
    P: ExtensionPoint<ErrorCallbackFn> + Send + Sync + 'static,
{
    registry.install(&ERROR_SLOT, point)
}

pub fn slot() -> &'static HookSlot<ErrorCallbackFn> {
    &ERROR_SLOT
}
