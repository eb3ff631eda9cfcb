//! benchrun - Main entry point
//!
//! The stock binary links no plugin units. Station binaries call
//! `benchrun::cli::main_with` with their own `PluginSet`.

use std::process::ExitCode;

use benchrun::cli;
use benchrun::plugin::PluginSet;

fn main() -> ExitCode {
    cli::main_with(PluginSet::new())
}
