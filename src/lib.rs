//! benchrun Library
//!
//! Execution engine for station test suites. A suite registers *tools*
//! (drivers and other resources), *procedures* (individual test steps that
//! declare the tools they need) and *flows* (functions that sequence
//! procedures). Flows run against a [`Session`] that collects findings and
//! an overall outcome; each staged procedure runs on its own worker thread
//! with its tools constructed before and torn down after the body.

pub mod cli;
pub mod config;
pub mod error;
pub mod handle;
pub mod plugin;
pub mod procedure;
pub mod registry;
pub mod runner;
pub mod session;
pub mod status;
pub mod suite;
pub mod tool;
pub mod view;

// Re-export main types for convenience
pub use config::Configuration;
pub use error::{EngineError, Failure, Result};
pub use handle::ProcedureHandle;
pub use plugin::{
    FlowRegistrar, LoadSummary, Namespace, PluginSet, ProcedureRegistrar, ToolRegistrar,
};
pub use procedure::{ProcedureBuilder, ProcedureContext, ProcedureDefinition};
pub use registry::{Catalog, FlowDefinition, LogSink, Registry};
pub use runner::ProcedureResult;
pub use session::{Findings, FlowOutcome, Parameters, Session};
pub use status::{ProcedureStatus, SessionStatus, StatusTransitionError};
pub use suite::{Suite, SuiteLayout};
pub use tool::{CONFIG_TOOL, ToolInstance, ToolRegistration, ToolSet};
pub use view::{SuiteView, ToolCatalog};
