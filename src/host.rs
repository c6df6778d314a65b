//! Host runtime model
//!
//! The agent runs inside a managed runtime it does not own. This module
//! describes the parts of that runtime the interception core touches:
//!
//! - global extension points that can be redirected ([`HostHook`])
//! - the internal function table, whose entries share one handler
//!   signature ([`FunctionTable`], [`CallFrame`], [`Value`])
//! - resource handles issued by extensions ([`ResourceHandle`])
//! - the compile entry point and error-reporting globals
//!
//! An embedding binds these to the real runtime; tests bind them to
//! in-process fakes.

use std::cell::RefCell;
use std::collections::HashMap;
use std::fmt;
use std::sync::{Arc, PoisonError, RwLock};

use thiserror::Error;

use crate::headers::HeaderSet;

/// Fatal run-time error
pub const E_ERROR: i32 = 1;
/// Run-time warning
pub const E_WARNING: i32 = 2;
/// Run-time notice
pub const E_NOTICE: i32 = 8;
/// Every reportable error level
pub const E_ALL: i32 = 32767;

/// Type tag the host assigns to every resource of one kind
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub struct ResourceKind(pub i32);

/// Opaque handle to a resource owned by an extension
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub struct ResourceHandle {
    pub id: i64,
    pub kind: ResourceKind,
}

/// Dynamically typed value passed to and returned from internal functions
#[derive(Debug, Clone, Default, PartialEq)]
pub enum Value {
    #[default]
    Null,
    Bool(bool),
    Long(i64),
    Str(String),
    /// List of header lines, as accepted by the HTTP header option
    Headers(HeaderSet),
    /// Option id to value map, as accepted by a batch configure call
    Options(Vec<(i64, Value)>),
    Resource(ResourceHandle),
}

impl Value {
    pub fn as_resource(&self) -> Option<ResourceHandle> {
        match self {
            Value::Resource(handle) => Some(*handle),
            _ => None,
        }
    }

    pub fn as_long(&self) -> Option<i64> {
        match self {
            Value::Long(n) => Some(*n),
            _ => None,
        }
    }

    pub fn as_headers(&self) -> Option<&HeaderSet> {
        match self {
            Value::Headers(headers) => Some(headers),
            _ => None,
        }
    }

    pub fn as_options(&self) -> Option<&[(i64, Value)]> {
        match self {
            Value::Options(options) => Some(options),
            _ => None,
        }
    }

    /// Truthiness as the host's boolean conversion defines it
    pub fn is_truthy(&self) -> bool {
        match self {
            Value::Null => false,
            Value::Bool(b) => *b,
            Value::Long(n) => *n != 0,
            Value::Str(s) => !s.is_empty() && s != "0",
            Value::Headers(headers) => !headers.is_empty(),
            Value::Options(options) => !options.is_empty(),
            Value::Resource(_) => true,
        }
    }
}

/// Arguments and return slot of a single internal function call
#[derive(Debug, Clone, Default, PartialEq)]
pub struct CallFrame {
    pub args: Vec<Value>,
    pub return_value: Value,
}

impl CallFrame {
    pub fn new(args: Vec<Value>) -> Self {
        Self {
            args,
            return_value: Value::Null,
        }
    }

    pub fn arg(&self, index: usize) -> Option<&Value> {
        self.args.get(index)
    }
}

/// Handler signature shared by every internal function
pub type InternalHandler = fn(&mut CallFrame);

/// How a source unit is being loaded
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum CompileKind {
    Include,
    IncludeOnce,
    Require,
    RequireOnce,
}

/// Source unit handed to the compiler
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct FileHandle {
    pub filename: String,
}

/// Compiled form of a source unit
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct OpArray {
    pub filename: String,
    pub opcodes: usize,
}

/// The host's "compile a source unit" entry point
pub type CompileFileFn = fn(&FileHandle, CompileKind) -> Option<OpArray>;

/// Failure returned by a host startup callback
#[derive(Error, Debug, Clone, Copy, PartialEq, Eq)]
#[error("host callback reported failure")]
pub struct HostFailure;

/// A global indirection point that can be redirected to custom code
pub trait ExtensionPoint<F: Copy> {
    /// Stable name used in diagnostics
    fn name(&self) -> &str;

    /// Handler the point currently dispatches to
    fn current(&self) -> Option<F>;

    /// Point the extension at `handler` (or at nothing)
    fn set(&self, handler: Option<F>);
}

impl<F: Copy, P: ExtensionPoint<F> + ?Sized> ExtensionPoint<F> for &P {
    fn name(&self) -> &str {
        (**self).name()
    }

    fn current(&self) -> Option<F> {
        (**self).current()
    }

    fn set(&self, handler: Option<F>) {
        (**self).set(handler)
    }
}

/// A single process-wide function pointer owned by the host
///
/// # Example
///
/// ```
/// use tracehook::host::{ExtensionPoint, HostHook};
///
/// fn original() -> u32 { 1 }
///
/// static HOOK: HostHook<fn() -> u32> = HostHook::with_handler("answer", original);
/// assert_eq!(HOOK.current().map(|f| f()), Some(1));
/// ```
pub struct HostHook<F> {
    name: &'static str,
    handler: RwLock<Option<F>>,
}

impl<F: Copy> HostHook<F> {
    pub const fn new(name: &'static str) -> Self {
        Self {
            name,
            handler: RwLock::new(None),
        }
    }

    pub const fn with_handler(name: &'static str, handler: F) -> Self {
        Self {
            name,
            handler: RwLock::new(Some(handler)),
        }
    }
}

impl<F: Copy> ExtensionPoint<F> for HostHook<F> {
    fn name(&self) -> &str {
        self.name
    }

    fn current(&self) -> Option<F> {
        *self.handler.read().unwrap_or_else(PoisonError::into_inner)
    }

    fn set(&self, handler: Option<F>) {
        *self.handler.write().unwrap_or_else(PoisonError::into_inner) = handler;
    }
}

impl<F> fmt::Debug for HostHook<F> {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("HostHook").field("name", &self.name).finish()
    }
}

/// The host's table of internal functions, keyed by function name
///
/// Cloning is cheap and yields a view of the same table.
#[derive(Clone, Default)]
pub struct FunctionTable {
    functions: Arc<RwLock<HashMap<String, InternalHandler>>>,
}

impl FunctionTable {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn register(&self, name: impl Into<String>, handler: InternalHandler) {
        self.functions
            .write()
            .unwrap_or_else(PoisonError::into_inner)
            .insert(name.into(), handler);
    }

    pub fn handler(&self, name: &str) -> Option<InternalHandler> {
        self.functions
            .read()
            .unwrap_or_else(PoisonError::into_inner)
            .get(name)
            .copied()
    }

    pub fn contains(&self, name: &str) -> bool {
        self.handler(name).is_some()
    }

    /// Invoke `name` through whatever handler is currently installed
    ///
    /// Returns `false` if no such function exists. The table lock is not
    /// held while the handler runs, so handlers may call back in.
    pub fn call(&self, name: &str, frame: &mut CallFrame) -> bool {
        match self.handler(name) {
            Some(handler) => {
                handler(frame);
                true
            }
            None => false,
        }
    }

    /// Extension point for one named function
    pub fn entry(&self, name: impl Into<String>) -> FunctionEntry {
        FunctionEntry {
            table: self.clone(),
            name: name.into(),
        }
    }
}

impl fmt::Debug for FunctionTable {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        let functions = self.functions.read().unwrap_or_else(PoisonError::into_inner);
        let mut names: Vec<&String> = functions.keys().collect();
        names.sort();
        f.debug_struct("FunctionTable")
            .field("functions", &names)
            .finish()
    }
}

/// One function of a [`FunctionTable`], viewed as an extension point
///
/// Redirecting a function that does not exist does nothing: there is no
/// original behavior to chain to.
#[derive(Debug, Clone)]
pub struct FunctionEntry {
    table: FunctionTable,
    name: String,
}

impl ExtensionPoint<InternalHandler> for FunctionEntry {
    fn name(&self) -> &str {
        &self.name
    }

    fn current(&self) -> Option<InternalHandler> {
        self.table.handler(&self.name)
    }

    fn set(&self, handler: Option<InternalHandler>) {
        let mut functions = self
            .table
            .functions
            .write()
            .unwrap_or_else(PoisonError::into_inner);
        if let (Some(slot), Some(handler)) = (functions.get_mut(&self.name), handler) {
            *slot = handler;
        }
    }
}

/// Error-handling mode of the host
#[derive(Debug, Clone, Copy, PartialEq, Eq, Default)]
pub enum ErrorHandling {
    /// Errors are reported through the error callback
    #[default]
    Normal,
    /// Errors are silently dropped
    Suppress,
    /// Errors are converted to exceptions
    Throw,
}

/// The most recently reported error
///
/// Message and file are shared with whoever else holds them; a sandbox
/// compares them by pointer identity to tell a new error from the old one.
#[derive(Debug, Clone, Default)]
pub struct LastError {
    pub error_type: i32,
    pub message: Option<Arc<str>>,
    pub file: Option<Arc<str>>,
    pub line: u32,
}

/// An exception in flight
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct PendingException {
    pub class: String,
    pub message: String,
}

/// Error-reporting globals of one request
///
/// The host keeps these per worker thread, so plain `RefCell`s suffice.
#[derive(Debug)]
pub struct ErrorGlobals {
    mode: RefCell<ErrorHandling>,
    last_error: RefCell<LastError>,
    error_reporting: RefCell<i32>,
    exception: RefCell<Option<PendingException>>,
}

impl Default for ErrorGlobals {
    fn default() -> Self {
        Self {
            mode: RefCell::new(ErrorHandling::Normal),
            last_error: RefCell::new(LastError::default()),
            error_reporting: RefCell::new(E_ALL),
            exception: RefCell::new(None),
        }
    }
}

impl ErrorGlobals {
    pub fn new() -> Self {
        Self::default()
    }

    /// Record an error the way the host's reporting path does
    ///
    /// Fresh message and file strings replace the previous ones.
    pub fn report(&self, error_type: i32, message: &str, file: &str, line: u32) {
        *self.last_error.borrow_mut() = LastError {
            error_type,
            message: Some(Arc::from(message)),
            file: Some(Arc::from(file)),
            line,
        };
    }

    pub fn throw(&self, class: &str, message: &str) {
        *self.exception.borrow_mut() = Some(PendingException {
            class: class.to_string(),
            message: message.to_string(),
        });
    }

    pub fn mode(&self) -> ErrorHandling {
        *self.mode.borrow()
    }

    pub fn set_mode(&self, mode: ErrorHandling) {
        *self.mode.borrow_mut() = mode;
    }

    pub fn last_error(&self) -> LastError {
        self.last_error.borrow().clone()
    }

    /// Install `error` as the last error, handing back the displaced one
    pub fn replace_last_error(&self, error: LastError) -> LastError {
        self.last_error.replace(error)
    }

    pub fn error_reporting(&self) -> i32 {
        *self.error_reporting.borrow()
    }

    pub fn set_error_reporting(&self, level: i32) {
        *self.error_reporting.borrow_mut() = level;
    }

    pub fn exception(&self) -> Option<PendingException> {
        self.exception.borrow().clone()
    }

    pub fn replace_exception(
        &self,
        exception: Option<PendingException>,
    ) -> Option<PendingException> {
        self.exception.replace(exception)
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    fn answer_one() -> u32 {
        1
    }

    fn answer_two() -> u32 {
        2
    }

    fn set_true(frame: &mut CallFrame) {
        frame.return_value = Value::Bool(true);
    }

    fn set_false(frame: &mut CallFrame) {
        frame.return_value = Value::Bool(false);
    }

    #[test]
    fn test_host_hook_set_and_current() {
        let hook: HostHook<fn() -> u32> = HostHook::with_handler("answer", answer_one);
        assert_eq!(hook.current().map(|f| f()), Some(1));

        hook.set(Some(answer_two));
        assert_eq!(hook.current().map(|f| f()), Some(2));

        hook.set(None);
        assert!(hook.current().is_none());
        assert_eq!(hook.name(), "answer");
    }

    #[test]
    fn test_function_table_call() {
        let table = FunctionTable::new();
        table.register("ok", set_true);

        let mut frame = CallFrame::new(vec![]);
        assert!(table.call("ok", &mut frame));
        assert_eq!(frame.return_value, Value::Bool(true));

        let mut frame = CallFrame::new(vec![]);
        assert!(!table.call("missing", &mut frame));
        assert_eq!(frame.return_value, Value::Null);
    }

    #[test]
    fn test_function_entry_redirect() {
        let table = FunctionTable::new();
        table.register("f", set_true);

        let entry = table.entry("f");
        entry.set(Some(set_false));

        let mut frame = CallFrame::default();
        table.call("f", &mut frame);
        assert_eq!(frame.return_value, Value::Bool(false));
    }

    #[test]
    fn test_function_entry_missing_function_is_not_created() {
        let table = FunctionTable::new();
        let entry = table.entry("ghost");
        entry.set(Some(set_true));

        assert!(entry.current().is_none());
        assert!(!table.contains("ghost"));
    }

    #[test]
    fn test_function_table_clones_share_state() {
        let table = FunctionTable::new();
        let view = table.clone();
        table.register("f", set_true);
        assert!(view.contains("f"));
        assert!(format!("{:?}", view).contains("\"f\""));
    }

    #[test]
    fn test_value_truthiness() {
        assert!(!Value::Null.is_truthy());
        assert!(!Value::Bool(false).is_truthy());
        assert!(Value::Bool(true).is_truthy());
        assert!(!Value::Long(0).is_truthy());
        assert!(Value::Long(-1).is_truthy());
        assert!(!Value::Str("0".into()).is_truthy());
        assert!(!Value::Str(String::new()).is_truthy());
        assert!(Value::Str("ok".into()).is_truthy());
        assert!(!Value::Headers(HeaderSet::new()).is_truthy());
    }

    #[test]
    fn test_value_accessors() {
        let handle = ResourceHandle {
            id: 3,
            kind: ResourceKind(9),
        };
        assert_eq!(Value::Resource(handle).as_resource(), Some(handle));
        assert_eq!(Value::Long(5).as_resource(), None);
        assert_eq!(Value::Long(5).as_long(), Some(5));
        assert!(Value::Options(vec![(1, Value::Null)]).as_options().is_some());
        assert!(Value::Null.as_headers().is_none());
    }

    #[test]
    fn test_error_globals_report_replaces_strings() {
        let globals = ErrorGlobals::new();
        globals.report(E_WARNING, "first", "a.php", 1);
        let first = globals.last_error();

        globals.report(E_NOTICE, "second", "b.php", 2);
        let second = globals.last_error();

        assert_eq!(second.error_type, E_NOTICE);
        assert_eq!(second.line, 2);
        assert!(!Arc::ptr_eq(
            first.message.as_ref().unwrap(),
            second.message.as_ref().unwrap()
        ));
    }

    #[test]
    fn test_error_globals_defaults() {
        let globals = ErrorGlobals::new();
        assert_eq!(globals.mode(), ErrorHandling::Normal);
        assert_eq!(globals.error_reporting(), E_ALL);
        assert!(globals.exception().is_none());
        assert!(globals.last_error().message.is_none());
        assert_eq!(globals.last_error().error_type, 0);
        assert_eq!(E_ERROR, 1);
    }
}
