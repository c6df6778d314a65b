//! Optional capabilities exported by a sibling module
//!
//! The tracer and the profiler ship as separate shared objects. When both
//! are loaded, each can call into the other: the profiler is interrupted
//! and told when a trace finishes, and it asks the tracer for the active
//! span and the runtime id. Neither depends on the other being present.
//!
//! At startup the host's extension list is scanned once for the sibling.
//! Each export is resolved independently; anything that cannot be resolved
//! keeps a no-op default and is logged once at debug level. Nothing else is
//! logged by a scan: an absent sibling produces no output at all.

use std::ffi::{c_void, CStr, CString};
use std::fmt;
use std::ptr::NonNull;
use std::sync::{Arc, OnceLock};

use tracing::debug;

use crate::config::AgentConfig;
use crate::error::{Result, TracehookError};

pub const INTERRUPT_FUNCTION_SYMBOL: &str = "datadog_profiling_interrupt_function";
pub const NOTIFY_TRACE_FINISHED_SYMBOL: &str = "datadog_profiling_notify_trace_finished";
pub const GET_PROFILING_CONTEXT_SYMBOL: &str = "ddtrace_get_profiling_context";
pub const RUNTIME_ID_SYMBOL: &str = "ddtrace_runtime_id";

/// Every export the bridge looks for, in resolution order
pub const BRIDGE_SYMBOLS: [&str; 4] = [
    INTERRUPT_FUNCTION_SYMBOL,
    NOTIFY_TRACE_FINISHED_SYMBOL,
    GET_PROFILING_CONTEXT_SYMBOL,
    RUNTIME_ID_SYMBOL,
];

/// Span ids the profiler attaches to samples
#[repr(C)]
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq)]
pub struct ProfilingContext {
    pub local_root_span_id: u64,
    pub span_id: u64,
}

/// Borrowed string passed across the module boundary
#[repr(C)]
#[derive(Debug, Clone, Copy)]
pub struct StringView {
    pub len: usize,
    pub ptr: *const u8,
}

impl StringView {
    pub fn new(s: &str) -> Self {
        Self {
            len: s.len(),
            ptr: s.as_ptr(),
        }
    }
}

/// Interrupts the profiler on the current execution frame
pub type InterruptFn = unsafe extern "C" fn(execute_data: *mut c_void);
/// Tells the profiler a local root span finished
pub type NotifyTraceFinishedFn =
    unsafe extern "C" fn(local_root_span_id: u64, span_type: StringView, resource: StringView);
/// Asks the tracer for the active span ids
pub type GetProfilingContextFn = unsafe extern "C" fn() -> ProfilingContext;

extern "C" fn noop_profiling_context() -> ProfilingContext {
    ProfilingContext::default()
}

/// Pointer to the tracer's 16-byte runtime id
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct RuntimeId(NonNull<u8>);

// SAFETY: the pointer refers to process-lifetime static storage in the
// sibling module; it is only ever read.
unsafe impl Send for RuntimeId {}
unsafe impl Sync for RuntimeId {}

impl RuntimeId {
    pub fn as_ptr(&self) -> *const u8 {
        self.0.as_ptr()
    }

    /// Copy the runtime id out of the sibling module
    ///
    /// # Safety
    ///
    /// The sibling must still be loaded and the id must have been
    /// initialized (the tracer does so before the first request).
    pub unsafe fn read(&self) -> [u8; 16] {
        // SAFETY: upheld by the caller; the export is a 16-byte array.
        unsafe { std::ptr::read(self.0.as_ptr().cast::<[u8; 16]>()) }
    }
}

/// Resolved cross-module capabilities, defaulting to no-ops
#[derive(Clone, Copy)]
pub struct Capabilities {
    interrupt: Option<InterruptFn>,
    notify_trace_finished: Option<NotifyTraceFinishedFn>,
    profiling_context: Option<GetProfilingContextFn>,
    runtime_id: Option<RuntimeId>,
}

impl Capabilities {
    /// Nothing resolved
    pub const DEFAULT: Capabilities = Capabilities {
        interrupt: None,
        notify_trace_finished: None,
        profiling_context: None,
        runtime_id: None,
    };

    pub fn has_interrupt_function(&self) -> bool {
        self.interrupt.is_some()
    }

    pub fn has_notify_trace_finished(&self) -> bool {
        self.notify_trace_finished.is_some()
    }

    pub fn has_profiling_context(&self) -> bool {
        self.profiling_context.is_some()
    }

    /// Interrupt the profiler; returns `false` if it is not available
    ///
    /// # Safety
    ///
    /// `execute_data` must be the host's current execution frame (or null).
    pub unsafe fn interrupt(&self, execute_data: *mut c_void) -> bool {
        match self.interrupt {
            Some(interrupt) => {
                // SAFETY: signature fixed by the sibling's export; frame
                // validity upheld by the caller.
                unsafe { interrupt(execute_data) };
                true
            }
            None => false,
        }
    }

    /// Tell the profiler a trace finished; returns `false` if it is not
    /// available
    pub fn notify_trace_finished(&self, local_root_span_id: u64, span_type: &str, resource: &str) -> bool {
        match self.notify_trace_finished {
            Some(notify) => {
                // SAFETY: the views borrow strings that outlive the call and
                // the callee does not retain them.
                unsafe { notify(local_root_span_id, StringView::new(span_type), StringView::new(resource)) };
                true
            }
            None => false,
        }
    }

    /// Active span ids, `{0, 0}` when the tracer is not loaded
    pub fn profiling_context(&self) -> ProfilingContext {
        match self.profiling_context {
            // SAFETY: the tracer's export takes no arguments and only reads
            // tracer state.
            Some(get) => unsafe { get() },
            None => noop_profiling_context(),
        }
    }

    pub fn runtime_id(&self) -> Option<RuntimeId> {
        self.runtime_id
    }
}

impl Default for Capabilities {
    fn default() -> Self {
        Self::DEFAULT
    }
}

impl fmt::Debug for Capabilities {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("Capabilities")
            .field("interrupt", &self.has_interrupt_function())
            .field("notify_trace_finished", &self.has_notify_trace_finished())
            .field("profiling_context", &self.has_profiling_context())
            .field("runtime_id", &self.runtime_id.is_some())
            .finish()
    }
}

/// Something exported symbols can be looked up in
pub trait SymbolSource: Send + Sync {
    fn resolve(&self, symbol: &str) -> Result<NonNull<c_void>>;
}

/// A shared object opened with `dlopen`
pub struct DynamicLibrary {
    path: String,
    handle: NonNull<c_void>,
}

// SAFETY: dl handles are process-global and the dl* functions are
// thread-safe on the supported platforms.
unsafe impl Send for DynamicLibrary {}
unsafe impl Sync for DynamicLibrary {}

impl DynamicLibrary {
    /// Open `path`, resolving all of its symbols immediately
    pub fn open(path: &str) -> Result<Self> {
        let c_path = CString::new(path).map_err(|_| TracehookError::InteriorNul(path.to_string()))?;
        // SAFETY: c_path is a valid NUL-terminated string.
        let handle = unsafe { libc::dlopen(c_path.as_ptr(), libc::RTLD_NOW | libc::RTLD_LOCAL) };
        match NonNull::new(handle) {
            Some(handle) => Ok(Self {
                path: path.to_string(),
                handle,
            }),
            None => Err(TracehookError::LibraryOpen {
                path: path.to_string(),
                reason: last_dl_error(),
            }),
        }
    }

    pub fn path(&self) -> &str {
        &self.path
    }
}

impl SymbolSource for DynamicLibrary {
    fn resolve(&self, symbol: &str) -> Result<NonNull<c_void>> {
        let c_symbol =
            CString::new(symbol).map_err(|_| TracehookError::InteriorNul(symbol.to_string()))?;
        // SAFETY: handle came from dlopen and is open until drop; clearing
        // dlerror first makes a later error message belong to this lookup.
        let address = unsafe {
            libc::dlerror();
            libc::dlsym(self.handle.as_ptr(), c_symbol.as_ptr())
        };
        NonNull::new(address).ok_or_else(|| TracehookError::SymbolNotFound {
            symbol: symbol.to_string(),
            reason: last_dl_error(),
        })
    }
}

impl Drop for DynamicLibrary {
    fn drop(&mut self) {
        // SAFETY: handle came from dlopen and is closed exactly once.
        unsafe {
            libc::dlclose(self.handle.as_ptr());
        }
    }
}

impl fmt::Debug for DynamicLibrary {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("DynamicLibrary")
            .field("path", &self.path)
            .finish()
    }
}

fn last_dl_error() -> String {
    // SAFETY: dlerror returns null or a NUL-terminated thread-local string
    // that stays valid until the next dl* call on this thread.
    unsafe {
        let message = libc::dlerror();
        if message.is_null() {
            "unknown error".to_string()
        } else {
            CStr::from_ptr(message).to_string_lossy().into_owned()
        }
    }
}

/// One entry of the host's loaded extension list
#[derive(Clone)]
pub struct LoadedExtension {
    pub name: String,
    pub version: String,
    pub library: Option<Arc<dyn SymbolSource>>,
}

impl LoadedExtension {
    pub fn new(name: impl Into<String>, version: impl Into<String>) -> Self {
        Self {
            name: name.into(),
            version: version.into(),
            library: None,
        }
    }

    pub fn with_library(mut self, library: Arc<dyn SymbolSource>) -> Self {
        self.library = Some(library);
        self
    }
}

impl fmt::Debug for LoadedExtension {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("LoadedExtension")
            .field("name", &self.name)
            .field("version", &self.version)
            .field("has_library", &self.library.is_some())
            .finish()
    }
}

/// Result of scanning the extension list
#[derive(Debug, Clone, Default)]
pub struct ScanReport {
    pub capabilities: Capabilities,
    pub sibling_found: bool,
    /// Exports that could not be resolved, with the loader's reason
    pub unresolved: Vec<(&'static str, String)>,
}

/// Look for `sibling` among `extensions` and resolve its exports
///
/// The entry named `own_module` is never considered. Only the first match
/// is used.
pub fn scan(extensions: &[LoadedExtension], own_module: &str, sibling: &str) -> ScanReport {
    let mut report = ScanReport::default();

    let Some(extension) = extensions
        .iter()
        .filter(|extension| extension.name != own_module)
        .find(|extension| extension.name == sibling)
    else {
        // Absent sibling: every capability keeps its no-op default, silently
        return report;
    };
    report.sibling_found = true;

    for symbol in BRIDGE_SYMBOLS {
        let resolved = match &extension.library {
            Some(library) => library.resolve(symbol),
            None => Err(TracehookError::SymbolNotFound {
                symbol: symbol.to_string(),
                reason: "module has no library handle".to_string(),
            }),
        };
        match resolved {
            Ok(address) => install(&mut report.capabilities, symbol, address),
            Err(err) => {
                debug!(
                    sibling,
                    version = %extension.version,
                    symbol,
                    "sibling module detected, but locating symbol failed: {err}"
                );
                report.unresolved.push((symbol, err.to_string()));
            }
        }
    }

    report
}

fn install(capabilities: &mut Capabilities, symbol: &str, address: NonNull<c_void>) {
    let address = address.as_ptr();
    // SAFETY: the sibling exports each of these symbols with exactly the
    // signature of the matching fn type; a non-null data pointer and a fn
    // pointer have the same size on all supported platforms.
    unsafe {
        match symbol {
            INTERRUPT_FUNCTION_SYMBOL => {
                capabilities.interrupt = Some(std::mem::transmute::<*mut c_void, InterruptFn>(address));
            }
            NOTIFY_TRACE_FINISHED_SYMBOL => {
                capabilities.notify_trace_finished =
                    Some(std::mem::transmute::<*mut c_void, NotifyTraceFinishedFn>(address));
            }
            GET_PROFILING_CONTEXT_SYMBOL => {
                capabilities.profiling_context =
                    Some(std::mem::transmute::<*mut c_void, GetProfilingContextFn>(address));
            }
            RUNTIME_ID_SYMBOL => {
                capabilities.runtime_id = NonNull::new(address.cast::<u8>()).map(RuntimeId);
            }
            _ => {}
        }
    }
}

static CAPABILITIES: OnceLock<Capabilities> = OnceLock::new();
static DEFAULT_CAPABILITIES: Capabilities = Capabilities::DEFAULT;

/// Resolve the sibling's capabilities for this process
///
/// Only the first call scans; later calls return the capabilities already
/// resolved.
pub fn startup(extensions: &[LoadedExtension], config: &AgentConfig) -> &'static Capabilities {
    if let Some(resolved) = CAPABILITIES.get() {
        debug!("symbol bridge already resolved, ignoring rescan");
        return resolved;
    }
    CAPABILITIES.get_or_init(|| {
        scan(extensions, &config.module_name, &config.sibling_module).capabilities
    })
}

/// Capabilities resolved at startup, or the no-op defaults
pub fn capabilities() -> &'static Capabilities {
    CAPABILITIES.get().unwrap_or(&DEFAULT_CAPABILITIES)
}

#[cfg(feature = "preload")]
pub use post_startup::{chain_post_startup, is_post_startup, PostStartupFn};

#[cfg(feature = "preload")]
mod post_startup {
    use std::sync::atomic::{AtomicBool, Ordering};

    use crate::hook_registry::{HookRegistry, HookSlot};
    use crate::host::{ExtensionPoint, HostFailure};

    /// The host's callback run once startup (including preloading) is done
    pub type PostStartupFn = fn() -> Result<(), HostFailure>;

    static POST_STARTUP_SLOT: HookSlot<PostStartupFn> =
        HookSlot::new("post_startup_cb", post_startup);

    static IS_POST_STARTUP: AtomicBool = AtomicBool::new(false);

    /// The saved callback has been called through once
    static PREVIOUS_RAN: AtomicBool = AtomicBool::new(false);

    fn post_startup() -> Result<(), HostFailure> {
        // The saved callback stays in the slot so uninstall can restore it;
        // a re-entrant or repeated invocation must not run it twice
        if !PREVIOUS_RAN.swap(true, Ordering::AcqRel) {
            if let Some(previous) = POST_STARTUP_SLOT.previous() {
                previous()?;
            }
        }
        IS_POST_STARTUP.store(true, Ordering::Release);
        Ok(())
    }

    /// Chain the host's post-startup callback
    pub fn chain_post_startup<P>(registry: &mut HookRegistry, point: P) -> Option<PostStartupFn>
    where
        P: ExtensionPoint<PostStartupFn> + Send + Sync + 'static,
    {
        IS_POST_STARTUP.store(false, Ordering::Release);
        PREVIOUS_RAN.store(false, Ordering::Release);
        registry.install(&POST_STARTUP_SLOT, point)
    }

    /// Has the host finished starting up (preloading included)?
    pub fn is_post_startup() -> bool {
        IS_POST_STARTUP.load(Ordering::Acquire)
    }
}
