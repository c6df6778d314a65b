//! Error types for the interception core
//!
//! Only configuration loading and dynamic symbol resolution can fail.
//! Intercepted host calls never surface errors: they degrade to plain
//! delegation instead.

use std::path::PathBuf;
use thiserror::Error;

/// Errors reported by tracehook
#[derive(Error, Debug)]
pub enum TracehookError {
    #[error("Failed to read config file {path}: {source}")]
    ConfigIo {
        path: PathBuf,
        #[source]
        source: std::io::Error,
    },

    #[error("Invalid config syntax: {0}")]
    ConfigParse(#[from] toml::de::Error),

    #[error("Invalid config value for `{field}`: {reason}")]
    InvalidConfig { field: &'static str, reason: String },

    #[error("Failed to open library {path}: {reason}")]
    LibraryOpen { path: String, reason: String },

    #[error("Symbol `{symbol}` not found: {reason}")]
    SymbolNotFound { symbol: String, reason: String },

    #[error("Name `{0}` contains an interior NUL byte")]
    InteriorNul(String),
}

pub type Result<T> = std::result::Result<T, TracehookError>;
