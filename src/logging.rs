//! Diagnostic logging setup
//!
//! Everything in the crate logs through `tracing` macros. Nothing is
//! printed unless an embedding (or the CLI) installs a subscriber here.

use tracing_subscriber::EnvFilter;

/// Install a stderr subscriber filtered by `filter`
///
/// `RUST_LOG`, when set, takes precedence over `filter`. Returns `false` if
/// a global subscriber was already installed, which is not an error: the
/// host process may have set one up first.
pub fn init(filter: &str) -> bool {
    let env_filter = EnvFilter::try_from_default_env()
        .or_else(|_| EnvFilter::try_new(filter))
        .unwrap_or_else(|_| EnvFilter::new("warn"));

    tracing_subscriber::fmt()
        .with_env_filter(env_filter)
        .with_writer(std::io::stderr)
        .try_init()
        .is_ok()
}

/// Does `filter` parse as a `tracing` filter directive?
pub fn is_valid_filter(filter: &str) -> bool {
    EnvFilter::try_new(filter).is_ok()
}

/// Verbose logging for interactive debugging
pub fn init_debug() -> bool {
    init("trace")
}
