use std::path::Path;

use anyhow::{Context, Result};
use clap::Parser;
use serde::Serialize;
use tracehook::cli::{Cli, Command};
use tracehook::config::AgentConfig;
use tracehook::header_cache::compose;
use tracehook::headers::HeaderSet;
use tracehook::logging;
use tracehook::symbol_bridge::{DynamicLibrary, SymbolSource, BRIDGE_SYMBOLS};

/// Lookup result for one symbol
#[derive(Debug, Serialize)]
struct SymbolStatus {
    symbol: String,
    resolved: bool,
    #[serde(skip_serializing_if = "Option::is_none")]
    reason: Option<String>,
}

#[derive(Debug, Serialize)]
struct ProbeReport {
    library: String,
    symbols: Vec<SymbolStatus>,
}

fn check_config(path: &Path) -> Result<()> {
    let config = AgentConfig::from_file(path)
        .with_context(|| format!("Failed to load config {}", path.display()))?;
    config
        .validate()
        .with_context(|| format!("Invalid config {}", path.display()))?;
    // Already installed when --debug was given
    logging::init(&config.log_filter);
    println!("{}", serde_json::to_string_pretty(&config)?);
    Ok(())
}

fn probe(library: &str, extra: &[String]) -> Result<()> {
    let opened = DynamicLibrary::open(library)?;

    let symbols = BRIDGE_SYMBOLS
        .iter()
        .map(|symbol| symbol.to_string())
        .chain(extra.iter().cloned())
        .map(|symbol| match opened.resolve(&symbol) {
            Ok(_) => SymbolStatus {
                symbol,
                resolved: true,
                reason: None,
            },
            Err(err) => SymbolStatus {
                symbol,
                resolved: false,
                reason: Some(err.to_string()),
            },
        })
        .collect();

    let report = ProbeReport {
        library: opened.path().to_string(),
        symbols,
    };
    println!("{}", serde_json::to_string_pretty(&report)?);
    Ok(())
}

fn inject(
    trace_headers: Vec<(String, String)>,
    user_headers: Vec<(String, String)>,
    span_id: u64,
    parent_id_header: &str,
) -> Result<()> {
    if !tracehook::headers::is_valid_header_name(parent_id_header) {
        anyhow::bail!("Invalid parent id header name: {:?}", parent_id_header);
    }

    let tracing: HeaderSet = trace_headers.into_iter().collect();
    let user: HeaderSet = user_headers.into_iter().collect();
    let user = (!user.is_empty()).then_some(&user);

    let injected = compose(&tracing, user, parent_id_header, span_id);
    println!("{}", serde_json::to_string_pretty(&injected.to_lines())?);
    Ok(())
}

fn main() -> Result<()> {
    let args = Cli::parse();

    if args.debug {
        logging::init_debug();
    }

    match args.command {
        Command::CheckConfig { path } => check_config(&path),
        Command::Probe { library, symbols } => probe(&library, &symbols),
        Command::Inject {
            trace_headers,
            user_headers,
            span_id,
            parent_id_header,
        } => inject(trace_headers, user_headers, span_id, &parent_id_header),
    }
}
