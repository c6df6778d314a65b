//! The tracing collaborator consumed by the interceptors
//!
//! Spans, sampling and trace context belong to the tracer proper; the
//! interception core only asks it a handful of questions. The collaborator
//! is registered once per process and answers for whichever request the
//! calling thread is serving.

use std::sync::atomic::{AtomicBool, AtomicU64, Ordering};
use std::sync::{Arc, Mutex, PoisonError, RwLock};

use crate::config::AgentConfig;
use crate::error_hook::ErrorReport;
use crate::headers::HeaderSet;

/// Questions the interception core asks the tracer
pub trait TraceContextSource: Send + Sync {
    /// Id of the currently active span
    fn current_span_id(&self) -> u64;

    /// Trace-context headers to forward on outbound calls, if any
    fn distributed_tracing_headers(&self) -> Option<HeaderSet>;

    fn is_tracing_enabled(&self) -> bool;

    /// Tracing was switched off for the current request only
    fn is_request_disabled(&self) -> bool;

    fn is_distributed_tracing_enabled(&self) -> bool;

    /// The host reported an error
    fn on_error_reported(&self, _report: &ErrorReport) {}
}

static SOURCE: RwLock<Option<Arc<dyn TraceContextSource>>> = RwLock::new(None);

/// Register the process-wide collaborator
pub fn install_source(source: Arc<dyn TraceContextSource>) {
    *SOURCE.write().unwrap_or_else(PoisonError::into_inner) = Some(source);
}

pub fn clear_source() {
    *SOURCE.write().unwrap_or_else(PoisonError::into_inner) = None;
}

/// The registered collaborator, if any
pub fn current() -> Option<Arc<dyn TraceContextSource>> {
    SOURCE.read().unwrap_or_else(PoisonError::into_inner).clone()
}

/// Tracing on, not disabled for this request, distributed tracing on
pub fn propagation_enabled(source: &dyn TraceContextSource) -> bool {
    source.is_tracing_enabled()
        && !source.is_request_disabled()
        && source.is_distributed_tracing_enabled()
}

/// Collaborator whose feature gates come from [`AgentConfig`]
///
/// Request values (span id, trace headers) are set by whoever drives the
/// request. Used by the CLI and by embeddings without a full tracer.
#[derive(Debug)]
pub struct ConfiguredTraceSource {
    tracing_enabled: bool,
    distributed_tracing_enabled: bool,
    request_disabled: AtomicBool,
    span_id: AtomicU64,
    headers: RwLock<Option<HeaderSet>>,
    reported_errors: Mutex<Vec<ErrorReport>>,
}

impl ConfiguredTraceSource {
    pub fn new(config: &AgentConfig) -> Self {
        Self {
            tracing_enabled: config.trace_enabled,
            distributed_tracing_enabled: config.distributed_tracing_enabled,
            request_disabled: AtomicBool::new(false),
            span_id: AtomicU64::new(0),
            headers: RwLock::new(None),
            reported_errors: Mutex::new(Vec::new()),
        }
    }

    pub fn set_span_id(&self, span_id: u64) {
        self.span_id.store(span_id, Ordering::Relaxed);
    }

    pub fn set_headers(&self, headers: Option<HeaderSet>) {
        *self.headers.write().unwrap_or_else(PoisonError::into_inner) = headers;
    }

    pub fn set_request_disabled(&self, disabled: bool) {
        self.request_disabled.store(disabled, Ordering::Relaxed);
    }

    /// Errors observed through [`TraceContextSource::on_error_reported`]
    pub fn reported_errors(&self) -> Vec<ErrorReport> {
        self.reported_errors
            .lock()
            .unwrap_or_else(PoisonError::into_inner)
            .clone()
    }
}

impl TraceContextSource for ConfiguredTraceSource {
    fn current_span_id(&self) -> u64 {
        self.span_id.load(Ordering::Relaxed)
    }

    fn distributed_tracing_headers(&self) -> Option<HeaderSet> {
        self.headers
            .read()
            .unwrap_or_else(PoisonError::into_inner)
            .clone()
    }

    fn is_tracing_enabled(&self) -> bool {
        self.tracing_enabled
    }

    fn is_request_disabled(&self) -> bool {
        self.request_disabled.load(Ordering::Relaxed)
    }

    fn is_distributed_tracing_enabled(&self) -> bool {
        self.distributed_tracing_enabled
    }

    fn on_error_reported(&self, report: &ErrorReport) {
        self.reported_errors
            .lock()
            .unwrap_or_else(PoisonError::into_inner)
            .push(report.clone());
    }
}
