//! Procedure definitions and the context a procedure body runs in.
//!
//! A procedure declares, up front, the tools it needs. The runner constructs
//! exactly those tools, in declaration order, before calling the body. The
//! declared parameter and output names are documentation only.

use serde_json::Value;
use std::any::Any;
use std::collections::HashSet;
use std::fmt;
use std::sync::Arc;

use crate::error::{EngineError, Result};
use crate::registry::LogSink;
use crate::session::{Parameters, SharedFindings};
use crate::tool::ToolSet;

pub(crate) type ProcedureBody =
    Arc<dyn Fn(&mut ProcedureContext<'_>) -> anyhow::Result<Value> + Send + Sync>;

/// A registered test step.
#[derive(Clone)]
pub struct ProcedureDefinition {
    name: String,
    description: Option<String>,
    tools: Vec<String>,
    parameters: Vec<String>,
    outputs: Vec<String>,
    body: ProcedureBody,
}

impl ProcedureDefinition {
    /// Start a new procedure definition
    pub fn builder(name: impl Into<String>) -> ProcedureBuilder {
        ProcedureBuilder::new(name)
    }

    /// Procedure name
    pub fn name(&self) -> &str {
        &self.name
    }

    /// Human-readable description, if any
    pub fn description(&self) -> Option<&str> {
        self.description.as_deref()
    }

    /// Tools injected into the body, in declaration order
    pub fn tools(&self) -> &[String] {
        &self.tools
    }

    /// Declared invocation parameter names
    pub fn parameters(&self) -> &[String] {
        &self.parameters
    }

    /// Declared output names
    pub fn outputs(&self) -> &[String] {
        &self.outputs
    }

    pub(crate) fn body(&self) -> &ProcedureBody {
        &self.body
    }

    fn validate_structure(&self) -> Result<()> {
        if self.name.trim().is_empty() {
            return Err(EngineError::invalid_definition(
                &self.name,
                "procedure name cannot be empty",
            ));
        }

        // Tools are looked up by name inside the body, so each may appear once
        let mut seen = HashSet::new();
        for tool in &self.tools {
            if tool.trim().is_empty() {
                return Err(EngineError::invalid_definition(
                    &self.name,
                    "tool names cannot be empty",
                ));
            }
            if !seen.insert(tool) {
                return Err(EngineError::invalid_definition(
                    &self.name,
                    format!("duplicate tool: {}", tool),
                ));
            }
        }

        let mut seen = HashSet::new();
        for parameter in &self.parameters {
            if !seen.insert(parameter) {
                return Err(EngineError::invalid_definition(
                    &self.name,
                    format!("duplicate parameter: {}", parameter),
                ));
            }
        }

        Ok(())
    }
}

impl fmt::Debug for ProcedureDefinition {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("ProcedureDefinition")
            .field("name", &self.name)
            .field("tools", &self.tools)
            .field("parameters", &self.parameters)
            .field("outputs", &self.outputs)
            .finish_non_exhaustive()
    }
}

/// Builder for [`ProcedureDefinition`]
#[derive(Debug, Clone)]
pub struct ProcedureBuilder {
    name: String,
    description: Option<String>,
    tools: Vec<String>,
    parameters: Vec<String>,
    outputs: Vec<String>,
}

impl ProcedureBuilder {
    /// Create a new builder
    pub fn new(name: impl Into<String>) -> Self {
        Self {
            name: name.into(),
            description: None,
            tools: Vec::new(),
            parameters: Vec::new(),
            outputs: Vec::new(),
        }
    }

    /// Set the description
    pub fn description(mut self, description: impl Into<String>) -> Self {
        self.description = Some(description.into());
        self
    }

    /// Require a tool (appended after previously required tools)
    pub fn tool(mut self, name: impl Into<String>) -> Self {
        self.tools.push(name.into());
        self
    }

    /// Require several tools, in order
    pub fn tools<I, S>(mut self, names: I) -> Self
    where
        I: IntoIterator<Item = S>,
        S: Into<String>,
    {
        self.tools.extend(names.into_iter().map(Into::into));
        self
    }

    /// Document an invocation parameter
    pub fn parameter(mut self, name: impl Into<String>) -> Self {
        self.parameters.push(name.into());
        self
    }

    /// Document an output
    pub fn output(mut self, name: impl Into<String>) -> Self {
        self.outputs.push(name.into());
        self
    }

    /// Attach the body and build the definition
    pub fn build<F>(self, body: F) -> Result<ProcedureDefinition>
    where
        F: Fn(&mut ProcedureContext<'_>) -> anyhow::Result<Value> + Send + Sync + 'static,
    {
        let definition = ProcedureDefinition {
            name: self.name,
            description: self.description,
            tools: self.tools,
            parameters: self.parameters,
            outputs: self.outputs,
            body: Arc::new(body),
        };
        definition.validate_structure()?;
        Ok(definition)
    }
}

/// Everything a procedure body can reach while it runs.
pub struct ProcedureContext<'a> {
    procedure: &'a str,
    flow: &'a str,
    tools: &'a mut ToolSet,
    parameters: &'a Parameters,
    findings: &'a SharedFindings,
    log_sink: Option<&'a LogSink>,
}

impl<'a> ProcedureContext<'a> {
    pub(crate) fn new(
        procedure: &'a str,
        flow: &'a str,
        tools: &'a mut ToolSet,
        parameters: &'a Parameters,
        findings: &'a SharedFindings,
        log_sink: Option<&'a LogSink>,
    ) -> Self {
        Self {
            procedure,
            flow,
            tools,
            parameters,
            findings,
            log_sink,
        }
    }

    /// Name of the running procedure
    pub fn procedure(&self) -> &str {
        self.procedure
    }

    /// Tools bound for this invocation
    pub fn tools(&self) -> &ToolSet {
        &*self.tools
    }

    /// Tools bound for this invocation, mutably
    pub fn tools_mut(&mut self) -> &mut ToolSet {
        &mut *self.tools
    }

    /// Borrow a declared tool as its concrete type
    pub fn tool<T: Any>(&self, name: &str) -> Result<&T> {
        self.tools.get(name)
    }

    /// Mutably borrow a declared tool as its concrete type
    pub fn tool_mut<T: Any>(&mut self, name: &str) -> Result<&mut T> {
        self.tools.get_mut(name)
    }

    /// Invocation parameters supplied at stage time
    pub fn parameters(&self) -> &Parameters {
        self.parameters
    }

    /// Look up one invocation parameter
    pub fn parameter(&self, name: &str) -> Option<&Value> {
        self.parameters.get(name)
    }

    /// Look up an invocation parameter that must be present
    pub fn require_parameter(&self, name: &str) -> anyhow::Result<&Value> {
        self.parameters.get(name).ok_or_else(|| {
            anyhow::anyhow!(
                "procedure '{}' requires parameter '{}'",
                self.procedure,
                name
            )
        })
    }

    /// Record a finding on the session that staged this procedure
    pub fn post_finding(&self, name: impl Into<String>, value: impl Into<Value>) {
        self.findings.insert(name.into(), value.into());
    }

    /// Forward a message to the session log sink, if one is configured
    pub fn log(&self, message: impl AsRef<str>) {
        if let Some(sink) = self.log_sink {
            sink(self.flow, message.as_ref());
        }
    }
}
