//! The registry binds tools, procedures and flows together.
//!
//! It is populated during the load pass (see [`crate::plugin`]) and then
//! frozen behind an `Arc` for execution. Every session, runner and handle
//! holds a clone of that `Arc`.

use serde::Serialize;
use serde_json::Value;
use std::collections::{BTreeMap, HashMap};
use std::fmt;
use std::panic::{self, AssertUnwindSafe};
use std::sync::Arc;
use std::time::Instant;
use tracing::{debug, info, warn};

use crate::config::Configuration;
use crate::error::{EngineError, Failure, Result};
use crate::procedure::ProcedureDefinition;
use crate::session::{FlowOutcome, Parameters, Session};
use crate::tool::{ToolRegistration, config_tool};
use crate::view::{SuiteView, ToolCatalog};

/// Receives `(flow, message)` for every `Session::log` call
pub type LogSink = Arc<dyn Fn(&str, &str) + Send + Sync>;

pub(crate) type FlowBody = Arc<dyn Fn(&Session) -> anyhow::Result<()> + Send + Sync>;

/// A named flow entry point.
#[derive(Clone)]
pub struct FlowDefinition {
    name: String,
    description: Option<String>,
    body: FlowBody,
}

impl FlowDefinition {
    /// Define a flow
    pub fn new<F>(name: impl Into<String>, body: F) -> Self
    where
        F: Fn(&Session) -> anyhow::Result<()> + Send + Sync + 'static,
    {
        Self {
            name: name.into(),
            description: None,
            body: Arc::new(body),
        }
    }

    /// Attach a description
    pub fn with_description(mut self, description: impl Into<String>) -> Self {
        self.description = Some(description.into());
        self
    }

    /// Flow name
    pub fn name(&self) -> &str {
        &self.name
    }

    /// Human-readable description, if any
    pub fn description(&self) -> Option<&str> {
        self.description.as_deref()
    }
}

impl fmt::Debug for FlowDefinition {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("FlowDefinition")
            .field("name", &self.name)
            .field("description", &self.description)
            .finish_non_exhaustive()
    }
}

/// Serializable summary of everything registered
#[derive(Debug, Clone, Serialize)]
pub struct Catalog {
    pub tools: Vec<ToolSummary>,
    pub procedures: Vec<ProcedureSummary>,
    pub flows: Vec<FlowSummary>,
}

#[derive(Debug, Clone, Serialize)]
pub struct ToolSummary {
    pub name: String,
    pub builtin: bool,
    pub has_deconstructor: bool,
}

#[derive(Debug, Clone, Serialize)]
pub struct ProcedureSummary {
    pub name: String,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub description: Option<String>,
    pub tools: Vec<String>,
    pub parameters: Vec<String>,
    pub outputs: Vec<String>,
    /// Association arguments keyed by tool name
    pub associations: BTreeMap<String, Vec<Value>>,
}

#[derive(Debug, Clone, Serialize)]
pub struct FlowSummary {
    pub name: String,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub description: Option<String>,
}

/// Catalog of tools, procedures, associations and flows.
pub struct Registry {
    configuration: Configuration,
    tools: ToolCatalog,
    procedures: HashMap<String, Arc<ProcedureDefinition>>,
    // procedure -> tool -> extra constructor arguments
    associations: HashMap<String, HashMap<String, Vec<Value>>>,
    flows: HashMap<String, FlowDefinition>,
    log_sink: Option<LogSink>,
}

impl Registry {
    /// Create a registry holding only the builtin tools
    pub fn new() -> Self {
        Self::with_configuration(Configuration::new())
    }

    /// Create a registry with the given suite configuration
    pub fn with_configuration(configuration: Configuration) -> Self {
        let mut tools = ToolCatalog::default();
        tools.insert(config_tool());

        Self {
            configuration,
            tools,
            procedures: HashMap::new(),
            associations: HashMap::new(),
            flows: HashMap::new(),
            log_sink: None,
        }
    }

    /// Replace the suite configuration
    pub fn set_configuration(&mut self, configuration: Configuration) {
        self.configuration = configuration;
    }

    /// Install the sink that receives `Session::log` messages
    pub fn set_log_sink(&mut self, sink: LogSink) {
        self.log_sink = Some(sink);
    }

    /// Register a tool.
    ///
    /// A builtin tool may be shadowed once; any other name clash is rejected.
    ///
    /// # Errors
    ///
    /// - `DuplicateToolName` if a non-builtin tool already uses the name
    /// - `InvalidDefinition` if the name is empty
    pub fn register_tool(&mut self, registration: ToolRegistration) -> Result<()> {
        let name = registration.name().to_string();
        if name.trim().is_empty() {
            return Err(EngineError::invalid_definition(
                name,
                "tool name cannot be empty",
            ));
        }
        if let Some(existing) = self.tools.get(&name) {
            if !existing.is_builtin() || registration.is_builtin() {
                return Err(EngineError::DuplicateToolName { name });
            }
            warn!(tool = %name, "Builtin tool shadowed by plugin registration");
        }

        debug!(tool = %name, deconstructor = registration.has_deconstructor(), "Registering tool");
        self.tools.insert(registration);
        Ok(())
    }

    /// Register a procedure.
    ///
    /// # Errors
    ///
    /// - `DuplicateProcedureName` if the name is taken
    pub fn register_procedure(&mut self, definition: ProcedureDefinition) -> Result<()> {
        let name = definition.name().to_string();
        if self.procedures.contains_key(&name) {
            return Err(EngineError::DuplicateProcedureName { name });
        }

        debug!(procedure = %name, tools = ?definition.tools(), "Registering procedure");
        self.procedures.insert(name, Arc::new(definition));
        Ok(())
    }

    /// Attach extra constructor arguments to a (tool, procedure) pair.
    ///
    /// The tool does not have to be registered yet; a missing tool surfaces
    /// as a dependency failure when the procedure runs.
    ///
    /// # Errors
    ///
    /// - `ProcedureDoesNotExist` if the procedure is not registered
    /// - `DuplicateAssociation` if the pair already has arguments
    pub fn associate_tool(
        &mut self,
        tool: impl Into<String>,
        procedure: &str,
        args: Vec<Value>,
    ) -> Result<()> {
        let tool = tool.into();
        if !self.procedures.contains_key(procedure) {
            return Err(EngineError::ProcedureDoesNotExist {
                name: procedure.to_string(),
            });
        }

        let by_tool = self.associations.entry(procedure.to_string()).or_default();
        if by_tool.contains_key(&tool) {
            return Err(EngineError::DuplicateAssociation {
                tool,
                procedure: procedure.to_string(),
            });
        }

        debug!(tool = %tool, procedure, args = args.len(), "Associating tool");
        by_tool.insert(tool, args);
        Ok(())
    }

    /// Register a flow.
    ///
    /// # Errors
    ///
    /// - `DuplicateFlowName` if the name is taken
    /// - `InvalidDefinition` if the name is empty
    pub fn register_flow(&mut self, flow: FlowDefinition) -> Result<()> {
        if flow.name().trim().is_empty() {
            return Err(EngineError::invalid_definition(
                flow.name(),
                "flow name cannot be empty",
            ));
        }
        if self.flows.contains_key(flow.name()) {
            return Err(EngineError::DuplicateFlowName {
                name: flow.name().to_string(),
            });
        }

        debug!(flow = flow.name(), "Registering flow");
        self.flows.insert(flow.name().to_string(), flow);
        Ok(())
    }

    /// Read-only view handed to tool constructors
    pub fn view(&self) -> SuiteView<'_> {
        SuiteView::new(&self.configuration, &self.tools)
    }

    /// Suite-wide configuration
    pub fn configuration(&self) -> &Configuration {
        &self.configuration
    }

    /// Registered tools
    pub fn tools(&self) -> &ToolCatalog {
        &self.tools
    }

    /// Look up a procedure definition
    pub fn procedure(&self, name: &str) -> Option<&ProcedureDefinition> {
        self.procedures.get(name).map(Arc::as_ref)
    }

    pub(crate) fn procedure_arc(&self, name: &str) -> Option<Arc<ProcedureDefinition>> {
        self.procedures.get(name).cloned()
    }

    /// Look up a flow definition
    pub fn flow(&self, name: &str) -> Option<&FlowDefinition> {
        self.flows.get(name)
    }

    /// Extra constructor arguments for `tool` when injected into `procedure`;
    /// empty when no association exists
    pub fn association_args(&self, tool: &str, procedure: &str) -> &[Value] {
        self.associations
            .get(procedure)
            .and_then(|by_tool| by_tool.get(tool))
            .map(Vec::as_slice)
            .unwrap_or(&[])
    }

    /// Registered tool names, sorted
    pub fn tool_names(&self) -> Vec<&str> {
        self.tools.names()
    }

    /// Registered procedure names, sorted
    pub fn procedure_names(&self) -> Vec<&str> {
        sorted_keys(&self.procedures)
    }

    /// Registered flow names, sorted
    pub fn flow_names(&self) -> Vec<&str> {
        sorted_keys(&self.flows)
    }

    /// `(procedure, tool)` pairs whose tool is not registered, sorted
    pub fn unresolved_dependencies(&self) -> Vec<(String, String)> {
        let tools = &self.tools;
        let mut missing: Vec<(String, String)> = self
            .procedures
            .values()
            .flat_map(|definition| {
                definition
                    .tools()
                    .iter()
                    .filter(move |tool| !tools.contains(tool.as_str()))
                    .map(move |tool| (definition.name().to_string(), tool.clone()))
            })
            .collect();
        missing.sort();
        missing
    }

    /// Summarize everything registered
    pub fn catalog(&self) -> Catalog {
        let tools = self
            .tool_names()
            .into_iter()
            .filter_map(|name| self.tools.get(name))
            .map(|registration| ToolSummary {
                name: registration.name().to_string(),
                builtin: registration.is_builtin(),
                has_deconstructor: registration.has_deconstructor(),
            })
            .collect();

        let procedures = self
            .procedure_names()
            .into_iter()
            .filter_map(|name| self.procedure(name))
            .map(|definition| {
                let associations: BTreeMap<String, Vec<Value>> = self
                    .associations
                    .get(definition.name())
                    .map(|by_tool| {
                        by_tool
                            .iter()
                            .map(|(tool, args)| (tool.clone(), args.clone()))
                            .collect()
                    })
                    .unwrap_or_default();

                ProcedureSummary {
                    name: definition.name().to_string(),
                    description: definition.description().map(str::to_string),
                    tools: definition.tools().to_vec(),
                    parameters: definition.parameters().to_vec(),
                    outputs: definition.outputs().to_vec(),
                    associations,
                }
            })
            .collect();

        let flows = self
            .flow_names()
            .into_iter()
            .filter_map(|name| self.flow(name))
            .map(|flow| FlowSummary {
                name: flow.name().to_string(),
                description: flow.description().map(str::to_string),
            })
            .collect();

        Catalog {
            tools,
            procedures,
            flows,
        }
    }

    pub(crate) fn log_sink(&self) -> Option<&LogSink> {
        self.log_sink.as_ref()
    }

    /// Run a flow in a fresh session.
    ///
    /// The flow body runs on the calling thread. An error or panic escaping
    /// the body is captured in the outcome and, unless the flow already
    /// indicated an outcome, marks the session `EXCEPTED`.
    ///
    /// # Errors
    ///
    /// - `TestFlowDoesNotExist` if no flow is registered under `name`
    pub fn run_flow(self: &Arc<Self>, name: &str, parameters: Parameters) -> Result<FlowOutcome> {
        let flow = self
            .flows
            .get(name)
            .ok_or_else(|| EngineError::TestFlowDoesNotExist {
                name: name.to_string(),
            })?;

        info!(flow = name, "Starting flow");
        let session = Session::new(Arc::clone(self), name, parameters);
        let started = Instant::now();

        let body = &flow.body;
        let failure = match panic::catch_unwind(AssertUnwindSafe(|| body(&session))) {
            Ok(Ok(())) => None,
            Ok(Err(e)) => Some(Failure::new(e)),
            Err(payload) => Some(Failure::from_panic(&format!("flow '{}'", name), payload)),
        };
        let elapsed = started.elapsed();

        if let Some(failure) = &failure {
            warn!(flow = name, "Flow raised: {}", failure);
            if let Err(e) = session.indicate_exception() {
                warn!(flow = name, "Keeping earlier outcome: {}", e);
            }
        }

        let outcome = session.into_outcome(failure, elapsed);
        info!(
            flow = name,
            status = %outcome.status,
            findings = outcome.findings.len(),
            ?elapsed,
            "Flow finished"
        );
        Ok(outcome)
    }
}

impl Default for Registry {
    fn default() -> Self {
        Self::new()
    }
}

impl fmt::Debug for Registry {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("Registry")
            .field("tools", &self.tool_names())
            .field("procedures", &self.procedure_names())
            .field("flows", &self.flow_names())
            .field("log_sink", &self.log_sink.is_some())
            .finish_non_exhaustive()
    }
}

fn sorted_keys<V>(map: &HashMap<String, V>) -> Vec<&str> {
    let mut names: Vec<&str> = map.keys().map(String::as_str).collect();
    names.sort_unstable();
    names
}
