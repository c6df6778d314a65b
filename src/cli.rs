//! CLI argument parsing for tracehook

use std::path::PathBuf;

use clap::{Parser, Subcommand};

use crate::headers::{parse_line, HeaderError, PARENT_ID_HEADER};

#[derive(Parser, Debug)]
#[command(name = "tracehook")]
#[command(version)]
#[command(about = "Interception core of a request-tracing agent", long_about = None)]
pub struct Cli {
    /// Enable debug tracing output to stderr
    #[arg(long, global = true)]
    pub debug: bool,

    #[command(subcommand)]
    pub command: Command,
}

#[derive(Subcommand, Debug)]
pub enum Command {
    /// Validate a TOML configuration file and print the effective settings
    CheckConfig {
        /// Path to the configuration file
        path: PathBuf,
    },

    /// Report which bridge capabilities a shared object exports
    Probe {
        /// Shared object to open
        library: String,

        /// Additional symbol to look up (repeatable)
        #[arg(long = "symbol", value_name = "NAME")]
        symbols: Vec<String>,
    },

    /// Print the header set that would be sent for a request
    Inject {
        /// Distributed-tracing header, "Name: value" (repeatable)
        #[arg(long = "trace-header", value_name = "HEADER", value_parser = parse_header)]
        trace_headers: Vec<(String, String)>,

        /// Header set by the application, "Name: value" (repeatable)
        #[arg(long = "user-header", value_name = "HEADER", value_parser = parse_header)]
        user_headers: Vec<(String, String)>,

        /// Id of the active span
        #[arg(long = "span-id", value_name = "ID")]
        span_id: u64,

        /// Name of the parent-id header
        #[arg(long = "parent-id-header", value_name = "NAME", default_value = PARENT_ID_HEADER)]
        parent_id_header: String,
    },
}

fn parse_header(line: &str) -> Result<(String, String), HeaderError> {
    parse_line(line)
}
