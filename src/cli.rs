//! Command line front end.
//!
//! The engine carries no test content, so the stock binary runs with an
//! empty [`PluginSet`]. Station binaries link the crate, build their own
//! plugin set and call [`main_with`] to get the same commands.

use anyhow::Context;
use clap::{ArgAction, Parser, Subcommand};
use serde_json::{Value, json};
use std::path::PathBuf;
use std::process::ExitCode;
use std::sync::Arc;
use tracing::{debug, error, info};
use tracing_subscriber::EnvFilter;

use crate::plugin::PluginSet;
use crate::registry::{LogSink, Registry};
use crate::session::Parameters;
use crate::suite::Suite;

/// Station test-suite runner
#[derive(Parser, Debug)]
#[command(name = "benchrun")]
#[command(about = "Run station test flows built from tools and procedures")]
#[command(version)]
pub struct Cli {
    /// Increase log verbosity (-v debug, -vv trace); RUST_LOG overrides
    #[arg(short, long, action = ArgAction::Count, global = true)]
    pub verbose: u8,

    #[command(subcommand)]
    pub command: Commands,
}

#[derive(Subcommand, Debug)]
pub enum Commands {
    /// Load a suite and print its catalog and unresolved dependencies
    Check {
        /// Suite root containing tools/, procedures/ and flows/
        root: PathBuf,
    },
    /// Run one flow and print its outcome
    Run {
        /// Suite root containing tools/, procedures/ and flows/
        root: PathBuf,

        /// Flow to run
        flow: String,

        /// Flow parameter as key=value; the value is parsed as JSON and
        /// falls back to a plain string
        #[arg(short = 'p', long = "param", value_parser = parse_parameter)]
        params: Vec<(String, Value)>,
    },
}

impl Cli {
    pub fn parse_args() -> Self {
        <Self as clap::Parser>::parse()
    }
}

/// Parse a `key=value` flow parameter
pub fn parse_parameter(raw: &str) -> Result<(String, Value), String> {
    let (key, value) = raw
        .split_once('=')
        .ok_or_else(|| format!("expected key=value, got '{}'", raw))?;
    let key = key.trim();
    if key.is_empty() {
        return Err(format!("parameter name is empty in '{}'", raw));
    }
    let value = serde_json::from_str(value).unwrap_or_else(|_| Value::String(value.to_string()));
    Ok((key.to_string(), value))
}

/// Install the tracing subscriber on stderr
pub fn init_logging(verbosity: u8) {
    let default_level = match verbosity {
        0 => "info",
        1 => "debug",
        _ => "trace",
    };
    let filter =
        EnvFilter::try_from_default_env().unwrap_or_else(|_| EnvFilter::new(default_level));

    // A subscriber may already be installed by an embedding binary
    let _ = tracing_subscriber::fmt()
        .with_env_filter(filter)
        .with_writer(std::io::stderr)
        .try_init();
}

/// Sink that re-emits `Session::log` messages as tracing events
pub fn tracing_log_sink() -> LogSink {
    Arc::new(|flow: &str, message: &str| {
        info!(target: "benchrun::flow", flow, "{}", message);
    })
}

/// Execute a parsed command line against `plugins`.
///
/// Returns `Ok(false)` when the command ran but the suite failed it: unresolved
/// dependencies for `check`, a session status other than `COMPLETED` for `run`.
pub fn execute(cli: &Cli, plugins: &PluginSet) -> anyhow::Result<bool> {
    match &cli.command {
        Commands::Check { root } => {
            let suite = open_suite(root, plugins)?;
            let registry = suite.registry();
            let unresolved: Vec<Value> = registry
                .unresolved_dependencies()
                .into_iter()
                .map(|(procedure, tool)| json!({ "procedure": procedure, "tool": tool }))
                .collect();

            let report = json!({
                "root": root.display().to_string(),
                "units": suite.load_summary(),
                "catalog": registry.catalog(),
                "unresolved": unresolved,
            });
            println!("{}", serde_json::to_string_pretty(&report)?);

            if !unresolved.is_empty() {
                error!(count = unresolved.len(), "Suite has unresolved tool dependencies");
            }
            Ok(unresolved.is_empty())
        }
        Commands::Run { root, flow, params } => {
            let suite = open_suite(root, plugins)?;
            let parameters: Parameters = params.iter().cloned().collect();
            debug!(flow = %flow, ?parameters, "Running flow from command line");

            let outcome = suite
                .run_flow(flow, parameters)
                .with_context(|| format!("cannot run flow '{}'", flow))?;
            println!("{}", serde_json::to_string_pretty(&outcome)?);

            if !outcome.is_completed() {
                error!(flow = %flow, status = %outcome.status, "Flow did not complete");
            }
            Ok(outcome.is_completed())
        }
    }
}

fn open_suite(root: &std::path::Path, plugins: &PluginSet) -> anyhow::Result<Suite> {
    let mut registry = Registry::new();
    registry.set_log_sink(tracing_log_sink());
    Suite::open_with_registry(root, plugins, registry)
        .with_context(|| format!("cannot open suite at {}", root.display()))
}

/// Parse arguments, set up logging and run; the whole body of a station `main`
pub fn main_with(plugins: PluginSet) -> ExitCode {
    let cli = Cli::parse_args();
    init_logging(cli.verbose);
    debug!(?cli, "CLI arguments parsed");

    if plugins.is_empty() {
        info!("No plugin units linked; the suite will only contain builtin tools");
    }

    match execute(&cli, &plugins) {
        Ok(true) => ExitCode::SUCCESS,
        Ok(false) => ExitCode::FAILURE,
        Err(e) => {
            error!("{:#}", e);
            eprintln!("✗ {:#}", e);
            ExitCode::FAILURE
        }
    }
}
