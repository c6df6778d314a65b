//! tracehook - interception core of a request-tracing agent
//!
//! The agent lives inside a managed language runtime and hooks a handful of
//! the runtime's extension points:
//!
//! - the compile entry point, to measure compile latency
//! - the error callback, so reported errors reach the tracer
//! - the HTTP client functions, to forward distributed-trace headers
//! - the post-startup callback (`preload` feature)
//!
//! It also bridges optional capabilities of a sibling module and provides
//! an error-state sandbox for probes that run on the host's behalf.

pub mod agent;
pub mod cli;
pub mod clock;
pub mod compile_time;
pub mod config;
pub mod error;
pub mod error_hook;
pub mod header_cache;
pub mod headers;
pub mod hook_registry;
pub mod host;
pub mod http_client;
pub mod logging;
pub mod sandbox;
pub mod symbol_bridge;
pub mod trace_source;

pub use compile_time::{get_compile_time, reset_compile_time};
pub use error::{Result, TracehookError};
