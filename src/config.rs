// Agent configuration
//
// Feature switches and the names the agent resolves against the host at
// startup. Loaded from TOML; every field has a default so an empty file is
// a valid configuration.

use serde::{Deserialize, Serialize};
use std::path::Path;

use crate::error::{Result, TracehookError};
use crate::headers::{is_valid_header_name, PARENT_ID_HEADER};
use crate::logging;

/// Configuration for the interception core
///
/// # Example
/// ```
/// use tracehook::config::AgentConfig;
///
/// let config = AgentConfig::from_toml_str("distributed_tracing_enabled = false").unwrap();
/// assert!(config.trace_enabled);
/// assert!(!config.distributed_tracing_enabled);
/// assert_eq!(config.parent_id_header, "x-datadog-parent-id");
/// ```
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
#[serde(default, deny_unknown_fields)]
pub struct AgentConfig {
    /// Master switch for tracing
    ///
    /// Default: true
    pub trace_enabled: bool,

    /// Forward trace context on outbound HTTP calls
    ///
    /// Default: true
    pub distributed_tracing_enabled: bool,

    /// Name under which this module is registered with the host
    ///
    /// Skipped when scanning for the sibling module.
    ///
    /// Default: "ddtrace"
    pub module_name: String,

    /// Cooperating module whose exports the symbol bridge resolves
    ///
    /// Default: "datadog-profiling"
    pub sibling_module: String,

    /// Host module providing the HTTP client functions
    ///
    /// If it is not loaded, no client hooks are installed.
    ///
    /// Default: "curl"
    pub client_module: String,

    /// Name of the host constant identifying the HTTP header option
    ///
    /// Resolved once at startup. If it cannot be resolved, header
    /// propagation stays disabled for the life of the process.
    ///
    /// Default: "CURLOPT_HTTPHEADER"
    pub header_option_constant: String,

    /// Header carrying the active span id
    ///
    /// Default: "x-datadog-parent-id"
    pub parent_id_header: String,

    /// `tracing` filter directive used when logging is initialized
    ///
    /// Overridden by `RUST_LOG`.
    ///
    /// Default: "warn"
    pub log_filter: String,
}

impl Default for AgentConfig {
    fn default() -> Self {
        Self {
            trace_enabled: true,
            distributed_tracing_enabled: true,
            module_name: "ddtrace".to_string(),
            sibling_module: "datadog-profiling".to_string(),
            client_module: "curl".to_string(),
            header_option_constant: "CURLOPT_HTTPHEADER".to_string(),
            parent_id_header: PARENT_ID_HEADER.to_string(),
            log_filter: "warn".to_string(),
        }
    }
}

impl AgentConfig {
    /// Parse a TOML document
    pub fn from_toml_str(source: &str) -> Result<Self> {
        Ok(toml::from_str(source)?)
    }

    /// Read and parse a TOML file
    pub fn from_file(path: &Path) -> Result<Self> {
        let source = std::fs::read_to_string(path).map_err(|source| TracehookError::ConfigIo {
            path: path.to_path_buf(),
            source,
        })?;
        Self::from_toml_str(&source)
    }

    /// Validate configuration
    pub fn validate(&self) -> Result<()> {
        let names = [
            ("module_name", &self.module_name),
            ("sibling_module", &self.sibling_module),
            ("client_module", &self.client_module),
            ("header_option_constant", &self.header_option_constant),
        ];
        for (field, value) in names {
            if value.trim().is_empty() {
                return Err(TracehookError::InvalidConfig {
                    field,
                    reason: "must not be empty".to_string(),
                });
            }
        }

        if self.module_name == self.sibling_module {
            return Err(TracehookError::InvalidConfig {
                field: "sibling_module",
                reason: format!("must differ from module_name ({})", self.module_name),
            });
        }

        if !is_valid_header_name(&self.parent_id_header) {
            return Err(TracehookError::InvalidConfig {
                field: "parent_id_header",
                reason: format!("{:?} is not a valid HTTP header name", self.parent_id_header),
            });
        }

        if !logging::is_valid_filter(&self.log_filter) {
            return Err(TracehookError::InvalidConfig {
                field: "log_filter",
                reason: format!("{:?} is not a valid filter directive", self.log_filter),
            });
        }

        Ok(())
    }
}
