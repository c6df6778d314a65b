//! Distributed-trace propagation for the host's HTTP client functions
//!
//! Six client functions are wrapped: `curl_init`, `curl_copy_handle`,
//! `curl_setopt`, `curl_setopt_array`, `curl_exec` and `curl_close`. The
//! interceptors keep the [`HeaderPropagationCache`] in step with each
//! handle's lifecycle and, right before a request is sent, replace the
//! handle's header list with trace headers + user headers + parent id.
//!
//! Every interceptor delegates to the original function with the original
//! frame on every path; the original's return value is never altered.
//!
//! Request-local state (the cache, the capture flag, the client's resource
//! kind) is thread-local. The binding to the host (function table, header
//! option id) is process-wide and set once at startup.

use std::cell::{Cell, RefCell};
use std::sync::{Arc, PoisonError, RwLock};

use tracing::{debug, trace};

use crate::config::AgentConfig;
use crate::header_cache::{compose, HeaderPropagationCache};
use crate::headers::HeaderSet;
use crate::hook_registry::{HookRegistry, HookSlot};
use crate::host::{CallFrame, FunctionTable, InternalHandler, ResourceHandle, ResourceKind, Value};
use crate::trace_source::{self, propagation_enabled, TraceContextSource};

pub const CURL_INIT: &str = "curl_init";
pub const CURL_COPY_HANDLE: &str = "curl_copy_handle";
pub const CURL_SETOPT: &str = "curl_setopt";
pub const CURL_SETOPT_ARRAY: &str = "curl_setopt_array";
pub const CURL_EXEC: &str = "curl_exec";
pub const CURL_CLOSE: &str = "curl_close";

thread_local! {
    static SAVED_HEADERS: RefCell<Option<HeaderPropagationCache>> = const { RefCell::new(None) };
    static CAPTURE_HEADERS: Cell<bool> = const { Cell::new(false) };
    static CLIENT_KIND: Cell<Option<ResourceKind>> = const { Cell::new(None) };
}

/// What the interceptors need from the host, resolved once at startup
#[derive(Debug)]
struct ClientBinding {
    header_option: i64,
    functions: FunctionTable,
    parent_id_header: String,
}

static BINDING: RwLock<Option<Arc<ClientBinding>>> = RwLock::new(None);

static INIT_SLOT: HookSlot<InternalHandler> = HookSlot::new(CURL_INIT, curl_init);
static COPY_HANDLE_SLOT: HookSlot<InternalHandler> =
    HookSlot::new(CURL_COPY_HANDLE, curl_copy_handle);
static SETOPT_SLOT: HookSlot<InternalHandler> = HookSlot::new(CURL_SETOPT, curl_setopt);
static SETOPT_ARRAY_SLOT: HookSlot<InternalHandler> =
    HookSlot::new(CURL_SETOPT_ARRAY, curl_setopt_array);
static EXEC_SLOT: HookSlot<InternalHandler> = HookSlot::new(CURL_EXEC, curl_exec);
static CLOSE_SLOT: HookSlot<InternalHandler> = HookSlot::new(CURL_CLOSE, curl_close);

static SLOTS: [&HookSlot<InternalHandler>; 6] = [
    &CLOSE_SLOT,
    &COPY_HANDLE_SLOT,
    &EXEC_SLOT,
    &INIT_SLOT,
    &SETOPT_SLOT,
    &SETOPT_ARRAY_SLOT,
];

/// Hook the client functions
///
/// Nothing is installed when the client module is not loaded or the
/// header option constant could not be resolved. Functions missing from
/// the table are skipped. Returns how many functions were hooked.
pub fn startup(
    registry: &mut HookRegistry,
    config: &AgentConfig,
    functions: &FunctionTable,
    client_loaded: bool,
    header_option: Option<i64>,
) -> usize {
    if !client_loaded {
        debug!(module = %config.client_module, "HTTP client module not loaded, propagation disabled");
        return 0;
    }
    let Some(header_option) = header_option else {
        debug!(
            constant = %config.header_option_constant,
            "header option constant not resolved, propagation disabled"
        );
        return 0;
    };

    *BINDING.write().unwrap_or_else(PoisonError::into_inner) = Some(Arc::new(ClientBinding {
        header_option,
        functions: functions.clone(),
        parent_id_header: config.parent_id_header.clone(),
    }));

    let before = registry.len();
    for slot in SLOTS {
        registry.install(slot, functions.entry(slot.name()));
    }
    let hooked = registry.len() - before;
    debug!(hooked, header_option, "HTTP client hooks installed");
    hooked
}

/// Forget the host binding
///
/// The hooks themselves are removed by the registry.
pub fn shutdown() {
    *BINDING.write().unwrap_or_else(PoisonError::into_inner) = None;
}

/// Drop all request-local state of the calling thread
///
/// The host re-registers its resource kinds per request, so the captured
/// client kind is forgotten too.
pub fn reset_request_state() {
    SAVED_HEADERS.with(|cache| *cache.borrow_mut() = None);
    CAPTURE_HEADERS.with(|capture| capture.set(false));
    CLIENT_KIND.with(|kind| kind.set(None));
}

/// Copy of the headers cached for `handle` on this thread
pub fn cached_headers(handle: i64) -> Option<HeaderSet> {
    SAVED_HEADERS.with(|cache| cache.borrow().as_ref()?.get(handle).cloned())
}

pub fn cached_handle_count() -> usize {
    SAVED_HEADERS.with(|cache| cache.borrow().as_ref().map_or(0, HeaderPropagationCache::len))
}

/// Resource kind of client handles, once a handle has been created
pub fn client_kind() -> Option<ResourceKind> {
    CLIENT_KIND.with(Cell::get)
}

pub fn is_capturing() -> bool {
    CAPTURE_HEADERS.with(Cell::get)
}

/// Header option id resolved at startup, if the hooks are bound
pub fn header_option() -> Option<i64> {
    binding().map(|binding| binding.header_option)
}

/// Suspends header capture until dropped
///
/// Used while the agent itself sets the header option, so the injected
/// headers are not mistaken for the application's.
#[derive(Debug)]
pub struct CaptureSuppressed {
    previous: bool,
}

impl CaptureSuppressed {
    pub fn enter() -> Self {
        let previous = CAPTURE_HEADERS.with(|capture| capture.replace(false));
        Self { previous }
    }
}

impl Drop for CaptureSuppressed {
    fn drop(&mut self) {
        CAPTURE_HEADERS.with(|capture| capture.set(self.previous));
    }
}

fn binding() -> Option<Arc<ClientBinding>> {
    BINDING.read().unwrap_or_else(PoisonError::into_inner).clone()
}

/// Binding and collaborator for a call on which propagation is active
struct ActiveIntegration {
    binding: Arc<ClientBinding>,
    source: Arc<dyn TraceContextSource>,
}

fn active_integration() -> Option<ActiveIntegration> {
    let binding = binding()?;
    let source = trace_source::current()?;
    if !propagation_enabled(source.as_ref()) || client_kind().is_none() {
        return None;
    }
    Some(ActiveIntegration { binding, source })
}

fn is_client_handle(handle: ResourceHandle) -> bool {
    client_kind() == Some(handle.kind)
}

fn with_cache<R>(f: impl FnOnce(&mut HeaderPropagationCache) -> R) -> R {
    SAVED_HEADERS.with(|cache| f(cache.borrow_mut().get_or_insert_with(HeaderPropagationCache::new)))
}

fn evict(handle: i64) {
    SAVED_HEADERS.with(|cache| {
        if let Some(cache) = cache.borrow_mut().as_mut() {
            cache.evict(handle);
        }
    });
}

fn delegate(slot: &HookSlot<InternalHandler>, frame: &mut CallFrame) {
    if let Some(previous) = slot.previous() {
        previous(frame);
    }
}

fn curl_init(frame: &mut CallFrame) {
    delegate(&INIT_SLOT, frame);

    let Some(handle) = frame.return_value.as_resource() else {
        return;
    };
    if client_kind().is_none() {
        CLIENT_KIND.with(|kind| kind.set(Some(handle.kind)));
        CAPTURE_HEADERS.with(|capture| capture.set(true));
        debug!(kind = handle.kind.0, "captured HTTP client resource kind");
    }
    if active_integration().is_some() {
        // The host reuses ids of destroyed handles
        evict(handle.id);
    }
}

fn curl_copy_handle(frame: &mut CallFrame) {
    let source = match (active_integration(), frame.arg(0).and_then(Value::as_resource)) {
        (Some(_), Some(source)) => source,
        _ => return delegate(&COPY_HANDLE_SLOT, frame),
    };

    delegate(&COPY_HANDLE_SLOT, frame);

    if let Some(copy) = frame.return_value.as_resource() {
        with_cache(|cache| {
            // The copy may reuse the id of a handle released without close
            cache.evict(copy.id);
            cache.duplicate(source.id, copy.id)
        });
    }
}

fn curl_setopt(frame: &mut CallFrame) {
    let target = active_integration().and_then(|active| {
        let handle = frame.arg(0)?.as_resource()?;
        let option = frame.arg(1)?.as_long()?;
        frame.arg(2)?;
        Some((active.binding.header_option, handle, option))
    });

    delegate(&SETOPT_SLOT, frame);

    let Some((header_option, handle, option)) = target else {
        return;
    };
    if !is_capturing() || !frame.return_value.is_truthy() || option != header_option {
        return;
    }
    if let Some(headers) = frame.arg(2).and_then(Value::as_headers) {
        with_cache(|cache| cache.store(handle.id, headers));
    }
}

fn curl_setopt_array(frame: &mut CallFrame) {
    let target = active_integration().and_then(|active| {
        let handle = frame.arg(0)?.as_resource()?;
        frame.arg(1)?.as_options()?;
        Some((active.binding.header_option, handle))
    });

    delegate(&SETOPT_ARRAY_SLOT, frame);

    let Some((header_option, handle)) = target else {
        return;
    };
    if !is_capturing() || !frame.return_value.is_truthy() {
        return;
    }
    // A later entry for the same option wins, as it does in the client
    let headers = frame
        .arg(1)
        .and_then(Value::as_options)
        .and_then(|options| {
            options
                .iter()
                .rev()
                .find(|(option, _)| *option == header_option)
        })
        .and_then(|(_, value)| value.as_headers());
    if let Some(headers) = headers {
        with_cache(|cache| cache.store(handle.id, headers));
    }
}

fn curl_exec(frame: &mut CallFrame) {
    if let Some(handle) = frame.arg(0).and_then(Value::as_resource) {
        inject_headers(handle);
    }
    delegate(&EXEC_SLOT, frame);
}

fn inject_headers(handle: ResourceHandle) {
    let Some(active) = active_integration() else {
        return;
    };
    if !is_client_handle(handle) {
        return;
    }
    let Some(tracing) = active.source.distributed_tracing_headers() else {
        return;
    };

    let binding = &active.binding;
    let span_id = active.source.current_span_id();
    let injected = SAVED_HEADERS.with(|cache| match cache.borrow().as_ref() {
        Some(cache) => cache.build_injected(handle.id, &tracing, &binding.parent_id_header, span_id),
        None => compose(&tracing, None, &binding.parent_id_header, span_id),
    });
    trace!(handle = handle.id, count = injected.len(), "injecting trace headers");

    let _suppressed = CaptureSuppressed::enter();
    let mut setopt = CallFrame::new(vec![
        Value::Resource(handle),
        Value::Long(binding.header_option),
        Value::Headers(injected),
    ]);
    if !binding.functions.call(CURL_SETOPT, &mut setopt) {
        debug!(function = CURL_SETOPT, "function missing, trace headers not injected");
    }
}

fn curl_close(frame: &mut CallFrame) {
    if let Some(handle) = frame.arg(0).and_then(Value::as_resource) {
        evict(handle.id);
    }
    delegate(&CLOSE_SLOT, frame);
}
