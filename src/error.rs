//! Error handling module for the engine
//!
//! `EngineError` covers engine-contract violations: duplicate names, unknown
//! flows, running a handle twice and so on. These are returned as `Err` to the
//! caller.
//!
//! Failures raised by test logic (procedure bodies, tool constructors, flow
//! bodies) are never returned as `Err`. They are captured as [`Failure`]
//! values and attached to the handle or flow outcome that produced them.

use std::any::Any;
use std::fmt;
use std::sync::Arc;

use thiserror::Error;

use crate::status::{ProcedureStatus, SessionStatus};

/// Main error type for the engine
#[derive(Error, Debug)]
pub enum EngineError {
    /// A non-builtin tool is already registered under this name
    #[error("Tool '{name}' is already registered")]
    DuplicateToolName { name: String },

    /// A procedure is already registered under this name
    #[error("Procedure '{name}' is already registered")]
    DuplicateProcedureName { name: String },

    /// A flow is already registered under this name
    #[error("Flow '{name}' is already registered")]
    DuplicateFlowName { name: String },

    /// The (tool, procedure) pair already carries association arguments
    #[error("Tool '{tool}' is already associated with procedure '{procedure}'")]
    DuplicateAssociation { tool: String, procedure: String },

    /// `run_flow` was called with an unregistered flow name
    #[error("Test flow '{name}' does not exist")]
    TestFlowDoesNotExist { name: String },

    /// A procedure name was not found in the registry
    #[error("Procedure '{name}' does not exist")]
    ProcedureDoesNotExist { name: String },

    /// A procedure declared a tool that is not registered
    #[error("Tool '{tool}' required by procedure '{procedure}' does not exist")]
    ToolDoesNotExist { tool: String, procedure: String },

    /// A procedure body asked for a tool it did not declare
    #[error("Tool '{tool}' is not bound to procedure '{procedure}'")]
    ToolNotBound { tool: String, procedure: String },

    /// A tool instance was requested as the wrong concrete type
    #[error("Tool '{tool}' is not of type {expected}")]
    ToolTypeMismatch { tool: String, expected: &'static str },

    /// `run` was called on a handle that already left the STAGED state
    #[error("Procedure '{procedure}' is not staged (status: {status})")]
    ProcedureIsNotStaged {
        procedure: String,
        status: ProcedureStatus,
    },

    /// The session outcome was already indicated
    #[error("Session for flow '{flow}' already concluded as {status}")]
    SessionAlreadyConcluded { flow: String, status: SessionStatus },

    /// A plugin unit tried to associate a tool with a procedure it did not register
    #[error("Unit '{unit}' cannot associate tools with procedure '{procedure}' (not registered by this unit)")]
    AssociationOutsideUnit { unit: String, procedure: String },

    /// A definition failed structural validation
    #[error("Invalid definition '{name}': {reason}")]
    InvalidDefinition { name: String, reason: String },

    /// The suite root is missing a required directory
    #[error("Suite layout error: {0}")]
    SuiteLayout(String),

    /// Configuration errors (loading, parsing)
    #[error("Configuration error: {0}")]
    Config(String),

    /// The worker thread for a procedure could not be started
    #[error("Failed to start worker for procedure '{procedure}': {reason}")]
    WorkerSpawn { procedure: String, reason: String },

    /// IO errors (suite layout, configuration file)
    #[error("IO error: {0}")]
    Io(#[from] std::io::Error),

    /// JSON serialization/deserialization errors
    #[error("JSON error: {0}")]
    Json(#[from] serde_json::Error),
}

/// Result type alias for engine operations
pub type Result<T> = std::result::Result<T, EngineError>;

impl EngineError {
    /// Create a configuration error
    pub fn config(msg: impl Into<String>) -> Self {
        Self::Config(msg.into())
    }

    /// Create a suite layout error
    pub fn suite_layout(msg: impl Into<String>) -> Self {
        Self::SuiteLayout(msg.into())
    }

    /// Create an invalid definition error
    pub fn invalid_definition(name: impl Into<String>, reason: impl Into<String>) -> Self {
        Self::InvalidDefinition {
            name: name.into(),
            reason: reason.into(),
        }
    }
}

/// A failure captured from test logic.
///
/// Wraps the `anyhow::Error` returned by a procedure body, a tool constructor
/// or a flow body. Panics are converted into a failure carrying the panic
/// message. Cloning is cheap; all clones share the same error.
#[derive(Clone)]
pub struct Failure {
    error: Arc<anyhow::Error>,
    panicked: bool,
}

impl Failure {
    /// Capture an error returned by test logic
    pub fn new(error: anyhow::Error) -> Self {
        Self {
            error: Arc::new(error),
            panicked: false,
        }
    }

    /// Capture a panic payload from test logic
    pub fn from_panic(context: &str, payload: Box<dyn Any + Send>) -> Self {
        let message = panic_message(&*payload);
        Self {
            error: Arc::new(anyhow::anyhow!("{} panicked: {}", context, message)),
            panicked: true,
        }
    }

    /// The underlying error
    pub fn error(&self) -> &anyhow::Error {
        &self.error
    }

    /// Whether this failure came from a panic rather than a returned error
    pub fn is_panic(&self) -> bool {
        self.panicked
    }

    /// Attempt to view the root error as a concrete type
    pub fn downcast_ref<E>(&self) -> Option<&E>
    where
        E: fmt::Display + fmt::Debug + Send + Sync + 'static,
    {
        self.error.downcast_ref::<E>()
    }
}

impl fmt::Debug for Failure {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("Failure")
            .field("error", &self.error)
            .field("panicked", &self.panicked)
            .finish()
    }
}

impl fmt::Display for Failure {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "{:#}", self.error)
    }
}

impl From<anyhow::Error> for Failure {
    fn from(error: anyhow::Error) -> Self {
        Self::new(error)
    }
}

impl From<EngineError> for Failure {
    fn from(error: EngineError) -> Self {
        Self::new(error.into())
    }
}

/// Extract a readable message from a panic payload
pub(crate) fn panic_message(payload: &(dyn Any + Send)) -> String {
    if let Some(s) = payload.downcast_ref::<&str>() {
        (*s).to_string()
    } else if let Some(s) = payload.downcast_ref::<String>() {
        s.clone()
    } else {
        "unknown panic payload".to_string()
    }
}
