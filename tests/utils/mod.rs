// Integration test utilities
//
// An in-process fake of the host runtime: a curl-like HTTP client living in
// a function table, global hooks for the compile entry point, the error
// callback and the post-startup callback, and a fixture that starts the
// agent against them and shuts it down on drop.

#![allow(dead_code)]

use std::cell::RefCell;
use std::collections::HashMap;
use std::sync::atomic::{AtomicU64, AtomicUsize, Ordering};
use std::sync::Arc;

use tracehook::agent::{self, HostBindings, StartupReport};
use tracehook::clock::Clock;
use tracehook::config::AgentConfig;
use tracehook::error_hook::{ErrorCallbackFn, ErrorReport};
use tracehook::headers::HeaderSet;
use tracehook::host::{
    CallFrame, CompileFileFn, CompileKind, ExtensionPoint, FileHandle, FunctionTable, HostFailure,
    HostHook, OpArray, ResourceHandle, ResourceKind, Value,
};
use tracehook::symbol_bridge::LoadedExtension;
#[cfg(feature = "preload")]
use tracehook::symbol_bridge::PostStartupFn;
use tracehook::trace_source::{self, ConfiguredTraceSource};

pub const CURL_KIND: ResourceKind = ResourceKind(7);
pub const OTHER_KIND: ResourceKind = ResourceKind(99);
pub const CURLOPT_URL: i64 = 10002;
pub const CURLOPT_HTTPHEADER: i64 = 10023;

#[derive(Debug, Clone, Default)]
struct FakeHandle {
    options: HashMap<i64, Value>,
}

#[derive(Debug, Default)]
struct FakeCurl {
    next_id: i64,
    free_ids: Vec<i64>,
    handles: HashMap<i64, FakeHandle>,
    sent: Vec<(i64, Option<HeaderSet>)>,
    setopt_calls: usize,
}

thread_local! {
    static CURL: RefCell<FakeCurl> = RefCell::new(FakeCurl::default());
    static HOST_ERRORS: RefCell<Vec<ErrorReport>> = const { RefCell::new(Vec::new()) };
}

fn handle_arg(frame: &CallFrame) -> Option<ResourceHandle> {
    frame.arg(0).and_then(Value::as_resource)
}

// Ids of released handles are handed out again, newest first
fn new_handle(curl: &mut FakeCurl, state: FakeHandle) -> ResourceHandle {
    let id = curl.free_ids.pop().unwrap_or_else(|| {
        curl.next_id += 1;
        curl.next_id
    });
    curl.handles.insert(id, state);
    ResourceHandle { id, kind: CURL_KIND }
}

fn fake_curl_init(frame: &mut CallFrame) {
    let handle = CURL.with(|curl| new_handle(&mut curl.borrow_mut(), FakeHandle::default()));
    frame.return_value = Value::Resource(handle);
}

fn fake_curl_copy_handle(frame: &mut CallFrame) {
    let handle = handle_arg(frame);
    frame.return_value = CURL.with(|curl| {
        let mut curl = curl.borrow_mut();
        let source = handle.and_then(|h| curl.handles.get(&h.id).cloned());
        match source {
            Some(state) => Value::Resource(new_handle(&mut curl, state)),
            None => Value::Bool(false),
        }
    });
}

fn fake_curl_setopt(frame: &mut CallFrame) {
    let (Some(handle), Some(option), Some(value)) = (
        handle_arg(frame),
        frame.arg(1).and_then(Value::as_long),
        frame.arg(2).cloned(),
    ) else {
        frame.return_value = Value::Bool(false);
        return;
    };
    frame.return_value = CURL.with(|curl| {
        let mut curl = curl.borrow_mut();
        curl.setopt_calls += 1;
        match curl.handles.get_mut(&handle.id) {
            Some(state) if handle.kind == CURL_KIND => {
                state.options.insert(option, value);
                Value::Bool(true)
            }
            _ => Value::Bool(false),
        }
    });
}

fn fake_curl_setopt_array(frame: &mut CallFrame) {
    let (Some(handle), Some(options)) = (
        handle_arg(frame),
        frame.arg(1).and_then(Value::as_options).map(<[_]>::to_vec),
    ) else {
        frame.return_value = Value::Bool(false);
        return;
    };
    frame.return_value = CURL.with(|curl| {
        let mut curl = curl.borrow_mut();
        match curl.handles.get_mut(&handle.id) {
            Some(state) => {
                for (option, value) in options {
                    state.options.insert(option, value);
                }
                Value::Bool(true)
            }
            None => Value::Bool(false),
        }
    });
}

fn fake_curl_exec(frame: &mut CallFrame) {
    let handle = handle_arg(frame);
    frame.return_value = CURL.with(|curl| {
        let mut curl = curl.borrow_mut();
        let Some(handle) = handle else {
            return Value::Bool(false);
        };
        let headers = curl
            .handles
            .get(&handle.id)
            .and_then(|state| state.options.get(&CURLOPT_HTTPHEADER))
            .and_then(Value::as_headers)
            .cloned();
        curl.sent.push((handle.id, headers));
        Value::Str("response body".to_string())
    });
}

fn release(curl: &mut FakeCurl, id: i64) {
    if curl.handles.remove(&id).is_some() {
        curl.free_ids.push(id);
    }
}

fn fake_curl_close(frame: &mut CallFrame) {
    if let Some(handle) = handle_arg(frame) {
        CURL.with(|curl| release(&mut curl.borrow_mut(), handle.id));
    }
    frame.return_value = Value::Null;
}

/// Release a handle the way the host's garbage collector does, without
/// going through `curl_close`
pub fn collect_handle(handle: ResourceHandle) {
    CURL.with(|curl| release(&mut curl.borrow_mut(), handle.id));
}

/// Function table with the fake client registered
pub fn curl_function_table() -> FunctionTable {
    let functions = FunctionTable::new();
    functions.register("curl_init", fake_curl_init);
    functions.register("curl_copy_handle", fake_curl_copy_handle);
    functions.register("curl_setopt", fake_curl_setopt);
    functions.register("curl_setopt_array", fake_curl_setopt_array);
    functions.register("curl_exec", fake_curl_exec);
    functions.register("curl_close", fake_curl_close);
    functions
}

pub fn reset_fake_curl() {
    CURL.with(|curl| *curl.borrow_mut() = FakeCurl::default());
    HOST_ERRORS.with(|errors| errors.borrow_mut().clear());
}

/// Headers each `curl_exec` actually sent, in call order
pub fn sent_requests() -> Vec<(i64, Option<HeaderSet>)> {
    CURL.with(|curl| curl.borrow().sent.clone())
}

pub fn last_sent_headers() -> Option<HeaderSet> {
    sent_requests().last().and_then(|(_, headers)| headers.clone())
}

pub fn setopt_calls() -> usize {
    CURL.with(|curl| curl.borrow().setopt_calls)
}

pub fn call(functions: &FunctionTable, name: &str, args: Vec<Value>) -> Value {
    let mut frame = CallFrame::new(args);
    assert!(functions.call(name, &mut frame), "{} not registered", name);
    frame.return_value
}

pub fn curl_init(functions: &FunctionTable) -> ResourceHandle {
    call(functions, "curl_init", vec![])
        .as_resource()
        .expect("curl_init returns a handle")
}

pub fn curl_copy_handle(functions: &FunctionTable, handle: ResourceHandle) -> ResourceHandle {
    call(functions, "curl_copy_handle", vec![Value::Resource(handle)])
        .as_resource()
        .expect("curl_copy_handle returns a handle")
}

pub fn curl_setopt(
    functions: &FunctionTable,
    handle: ResourceHandle,
    option: i64,
    value: Value,
) -> Value {
    call(
        functions,
        "curl_setopt",
        vec![Value::Resource(handle), Value::Long(option), value],
    )
}

pub fn curl_set_headers(functions: &FunctionTable, handle: ResourceHandle, headers: &[(&str, &str)]) -> Value {
    curl_setopt(
        functions,
        handle,
        CURLOPT_HTTPHEADER,
        Value::Headers(headers.iter().copied().collect()),
    )
}

pub fn curl_setopt_array(
    functions: &FunctionTable,
    handle: ResourceHandle,
    options: Vec<(i64, Value)>,
) -> Value {
    call(
        functions,
        "curl_setopt_array",
        vec![Value::Resource(handle), Value::Options(options)],
    )
}

pub fn curl_exec(functions: &FunctionTable, handle: ResourceHandle) -> Value {
    call(functions, "curl_exec", vec![Value::Resource(handle)])
}

pub fn curl_close(functions: &FunctionTable, handle: ResourceHandle) -> Value {
    call(functions, "curl_close", vec![Value::Resource(handle)])
}

pub fn headers(pairs: &[(&str, &str)]) -> HeaderSet {
    pairs.iter().copied().collect()
}

fn host_compile_file(file: &FileHandle, _kind: CompileKind) -> Option<OpArray> {
    if file.filename.ends_with(".php") {
        Some(OpArray {
            filename: file.filename.clone(),
            opcodes: 3,
        })
    } else {
        None
    }
}

fn host_error_callback(report: &ErrorReport) {
    HOST_ERRORS.with(|errors| errors.borrow_mut().push(report.clone()));
}

pub fn host_errors() -> Vec<ErrorReport> {
    HOST_ERRORS.with(|errors| errors.borrow().clone())
}

pub static POST_STARTUP_RUNS: AtomicUsize = AtomicUsize::new(0);

#[cfg(feature = "preload")]
fn host_post_startup() -> Result<(), HostFailure> {
    POST_STARTUP_RUNS.fetch_add(1, Ordering::SeqCst);
    Ok(())
}

pub static COMPILE_FILE: HostHook<CompileFileFn> =
    HostHook::with_handler("zend_compile_file", host_compile_file);
pub static ERROR_CALLBACK: HostHook<ErrorCallbackFn> =
    HostHook::with_handler("zend_error_cb", host_error_callback);
#[cfg(feature = "preload")]
pub static POST_STARTUP: HostHook<PostStartupFn> =
    HostHook::with_handler("zend_post_startup_cb", host_post_startup);

pub fn compile(name: &str) -> Option<OpArray> {
    let compile_file = COMPILE_FILE.current().expect("compile entry point set");
    compile_file(
        &FileHandle {
            filename: name.to_string(),
        },
        CompileKind::Require,
    )
}

pub fn report_error(report: &ErrorReport) {
    let callback = ERROR_CALLBACK.current().expect("error callback set");
    callback(report);
}

/// Bindings for a host with the client module loaded
pub fn host_bindings(functions: &FunctionTable) -> HostBindings {
    HostBindings {
        compile_file: &COMPILE_FILE,
        error_callback: &ERROR_CALLBACK,
        #[cfg(feature = "preload")]
        post_startup: Some(&POST_STARTUP),
        functions: functions.clone(),
        modules: vec!["core".to_string(), "curl".to_string()],
        extensions: vec![LoadedExtension::new("ddtrace", "1.0.0")],
        constants: HashMap::from([
            ("CURLOPT_URL".to_string(), CURLOPT_URL),
            ("CURLOPT_HTTPHEADER".to_string(), CURLOPT_HTTPHEADER),
        ]),
    }
}

/// A started agent with a configurable trace source
///
/// Dropping the fixture ends the request, shuts the agent down and clears
/// the trace source. Tests using it must be `#[serial]`.
pub struct AgentFixture {
    pub functions: FunctionTable,
    pub source: Arc<ConfiguredTraceSource>,
    pub report: StartupReport,
}

impl AgentFixture {
    pub fn start() -> Self {
        Self::start_with(AgentConfig::default(), |_| {})
    }

    pub fn start_with(config: AgentConfig, adjust: impl FnOnce(&mut HostBindings)) -> Self {
        reset_fake_curl();
        let functions = curl_function_table();
        let mut host = host_bindings(&functions);
        adjust(&mut host);

        let source = Arc::new(ConfiguredTraceSource::new(&config));
        trace_source::install_source(source.clone());

        let report = agent::startup(&config, &host).expect("agent starts");
        agent::request_startup();

        Self {
            functions,
            source,
            report,
        }
    }

    /// Trace headers for the current request plus the active span
    pub fn with_trace(&self, pairs: &[(&str, &str)], span_id: u64) {
        self.source.set_headers(Some(headers(pairs)));
        self.source.set_span_id(span_id);
    }
}

impl Drop for AgentFixture {
    fn drop(&mut self) {
        agent::request_shutdown();
        agent::shutdown();
        trace_source::clear_source();
        reset_fake_curl();
    }
}

/// Clock advancing by a fixed step on every read
#[derive(Debug)]
pub struct StepClock {
    now: AtomicU64,
    step: u64,
}

impl StepClock {
    pub fn new(start: u64, step: u64) -> Self {
        Self {
            now: AtomicU64::new(start),
            step,
        }
    }
}

impl Clock for StepClock {
    fn now_micros(&self) -> Option<u64> {
        Some(self.now.fetch_add(self.step, Ordering::SeqCst))
    }
}
