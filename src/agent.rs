//! Process and request lifecycle entry points
//!
//! [`startup`] installs every hook once per process and [`shutdown`]
//! removes them again. [`request_startup`] and [`request_shutdown`] reset
//! the request-local state of the calling worker thread.

use std::collections::HashMap;
use std::sync::atomic::{AtomicBool, Ordering};
use std::sync::{Mutex, PoisonError};

use tracing::{debug, info};

use crate::compile_time;
use crate::config::AgentConfig;
use crate::error::Result;
use crate::error_hook::{self, ErrorCallbackFn};
use crate::hook_registry::HookRegistry;
use crate::host::{CompileFileFn, FunctionTable, HostHook};
use crate::http_client;
use crate::logging;
use crate::symbol_bridge::{self, Capabilities, LoadedExtension};

#[cfg(feature = "preload")]
use crate::symbol_bridge::PostStartupFn;

/// The parts of the host runtime the agent hooks into
pub struct HostBindings {
    pub compile_file: &'static HostHook<CompileFileFn>,
    pub error_callback: &'static HostHook<ErrorCallbackFn>,
    #[cfg(feature = "preload")]
    pub post_startup: Option<&'static HostHook<PostStartupFn>>,
    pub functions: FunctionTable,
    /// Names of loaded modules
    pub modules: Vec<String>,
    /// Loaded engine extensions, searched for the sibling module
    pub extensions: Vec<LoadedExtension>,
    /// Integer constants registered by modules
    pub constants: HashMap<String, i64>,
}

/// What [`startup`] did
#[derive(Debug, Clone)]
pub struct StartupReport {
    /// Installed hooks, in install order
    pub hooks: Vec<&'static str>,
    pub http_client_hooks: usize,
    pub capabilities: Capabilities,
    /// The agent was already started and nothing was installed
    pub already_started: bool,
}

static REGISTRY: Mutex<HookRegistry> = Mutex::new(HookRegistry::new());
static STARTED: AtomicBool = AtomicBool::new(false);

/// Install all hooks and resolve the sibling module
///
/// Also installs the stderr log subscriber using `config.log_filter`.
///
/// Runs once per process; a second call without [`shutdown`] in between
/// changes nothing.
pub fn startup(config: &AgentConfig, host: &HostBindings) -> Result<StartupReport> {
    config.validate()?;
    // No-op when the host process installed a subscriber first
    logging::init(&config.log_filter);

    let mut registry = REGISTRY.lock().unwrap_or_else(PoisonError::into_inner);
    if STARTED.load(Ordering::Acquire) {
        debug!("agent already started");
        return Ok(StartupReport {
            hooks: registry.names(),
            http_client_hooks: 0,
            capabilities: *symbol_bridge::capabilities(),
            already_started: true,
        });
    }

    compile_time::install(&mut registry, host.compile_file);
    error_hook::install(&mut registry, host.error_callback);

    let client_loaded = host
        .modules
        .iter()
        .any(|module| *module == config.client_module);
    let header_option = host.constants.get(&config.header_option_constant).copied();
    let http_client_hooks = http_client::startup(
        &mut registry,
        config,
        &host.functions,
        client_loaded,
        header_option,
    );

    let capabilities = *symbol_bridge::startup(&host.extensions, config);

    chain_post_startup(&mut registry, host);

    STARTED.store(true, Ordering::Release);
    info!(hooks = registry.len(), http_client_hooks, "agent started");

    Ok(StartupReport {
        hooks: registry.names(),
        http_client_hooks,
        capabilities,
        already_started: false,
    })
}

#[cfg(feature = "preload")]
fn chain_post_startup(registry: &mut HookRegistry, host: &HostBindings) {
    if let Some(point) = host.post_startup {
        symbol_bridge::chain_post_startup(registry, point);
    }
}

#[cfg(not(feature = "preload"))]
fn chain_post_startup(_registry: &mut HookRegistry, _host: &HostBindings) {}

/// Remove every hook installed by [`startup`]
///
/// Returns how many extension points were restored. Points that were
/// re-hooked by someone else after startup are left alone.
pub fn shutdown() -> usize {
    let mut registry = REGISTRY.lock().unwrap_or_else(PoisonError::into_inner);
    let restored = registry.uninstall_all();
    http_client::shutdown();
    STARTED.store(false, Ordering::Release);
    debug!(restored, "agent shut down");
    restored
}

pub fn is_started() -> bool {
    STARTED.load(Ordering::Acquire)
}

/// Names of the hooks currently installed
pub fn installed_hooks() -> Vec<&'static str> {
    REGISTRY
        .lock()
        .unwrap_or_else(PoisonError::into_inner)
        .names()
}

/// Begin a request on the calling thread
pub fn request_startup() {
    compile_time::reset_compile_time();
}

/// End the request on the calling thread, dropping its cached state
pub fn request_shutdown() {
    http_client::reset_request_state();
}
