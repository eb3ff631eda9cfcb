//! Compiled plugin units and the ordered load pass.
//!
//! A station binary groups its tools, procedures and flows into *units*,
//! each a closure that receives a registrar for exactly one namespace.
//! `PluginSet::load_into` runs all tool units, then all procedure units,
//! then all flow units, so a procedure unit can rely on every tool being
//! known and a flow unit on every procedure.
//!
//! Registrars only expose what their namespace may do: a tool unit cannot
//! register a flow, and a procedure unit can only associate tools with the
//! procedures it registered itself.

use anyhow::Context;
use serde::Serialize;
use serde_json::Value;
use std::collections::HashSet;
use std::fmt;
use std::sync::Arc;
use strum::{Display, EnumIter, IntoEnumIterator};
use tracing::{debug, error, info};

use crate::error::{EngineError, Result};
use crate::procedure::ProcedureDefinition;
use crate::registry::{FlowDefinition, Registry};
use crate::tool::ToolRegistration;

/// The three plugin namespaces, in load order
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Display, EnumIter, Serialize)]
#[strum(serialize_all = "lowercase")]
#[serde(rename_all = "lowercase")]
pub enum Namespace {
    Tools,
    Procedures,
    Flows,
}

type ToolUnit = Arc<dyn Fn(&mut ToolRegistrar<'_>) -> anyhow::Result<()> + Send + Sync>;
type ProcedureUnit = Arc<dyn Fn(&mut ProcedureRegistrar<'_>) -> anyhow::Result<()> + Send + Sync>;
type FlowUnit = Arc<dyn Fn(&mut FlowRegistrar<'_>) -> anyhow::Result<()> + Send + Sync>;

/// Registrar handed to tool units
pub struct ToolRegistrar<'r> {
    registry: &'r mut Registry,
    unit: &'r str,
    registered: usize,
}

impl ToolRegistrar<'_> {
    /// Register a tool constructor
    pub fn register_tool(&mut self, registration: ToolRegistration) -> Result<()> {
        self.registry.register_tool(registration)?;
        self.registered += 1;
        Ok(())
    }

    /// Name of the unit being loaded
    pub fn unit(&self) -> &str {
        self.unit
    }
}

/// Registrar handed to procedure units
pub struct ProcedureRegistrar<'r> {
    registry: &'r mut Registry,
    unit: &'r str,
    owned: HashSet<String>,
    registered: usize,
}

impl ProcedureRegistrar<'_> {
    /// Register a procedure definition
    pub fn register_procedure(&mut self, definition: ProcedureDefinition) -> Result<()> {
        let name = definition.name().to_string();
        self.registry.register_procedure(definition)?;
        self.owned.insert(name);
        self.registered += 1;
        Ok(())
    }

    /// Attach constructor arguments to a tool when it is injected into one of
    /// this unit's procedures.
    ///
    /// # Errors
    ///
    /// - `AssociationOutsideUnit` if this unit did not register `procedure`
    /// - `DuplicateAssociation` if the pair already has arguments
    pub fn associate_tool(
        &mut self,
        tool: impl Into<String>,
        procedure: &str,
        args: Vec<Value>,
    ) -> Result<()> {
        if !self.owned.contains(procedure) {
            return Err(EngineError::AssociationOutsideUnit {
                unit: self.unit.to_string(),
                procedure: procedure.to_string(),
            });
        }
        self.registry.associate_tool(tool, procedure, args)
    }

    /// Read-only access to everything loaded so far
    pub fn registry(&self) -> &Registry {
        self.registry
    }

    pub fn unit(&self) -> &str {
        self.unit
    }
}

/// Registrar handed to flow units
pub struct FlowRegistrar<'r> {
    registry: &'r mut Registry,
    unit: &'r str,
    registered: usize,
}

impl FlowRegistrar<'_> {
    /// Register a flow entry point
    pub fn register_flow(&mut self, flow: FlowDefinition) -> Result<()> {
        self.registry.register_flow(flow)?;
        self.registered += 1;
        Ok(())
    }

    /// Read-only access to everything loaded so far
    pub fn registry(&self) -> &Registry {
        self.registry
    }

    pub fn unit(&self) -> &str {
        self.unit
    }
}

/// Per-unit record of a load pass
#[derive(Debug, Clone, PartialEq, Eq, Serialize)]
pub struct UnitSummary {
    pub namespace: Namespace,
    pub unit: String,
    pub registered: usize,
}

/// What a load pass registered, in load order
#[derive(Debug, Clone, Default, PartialEq, Eq, Serialize)]
pub struct LoadSummary {
    pub units: Vec<UnitSummary>,
}

impl LoadSummary {
    /// Number of units loaded in a namespace
    pub fn unit_count(&self, namespace: Namespace) -> usize {
        self.units
            .iter()
            .filter(|u| u.namespace == namespace)
            .count()
    }

    /// Number of registrations made in a namespace
    pub fn registered(&self, namespace: Namespace) -> usize {
        self.units
            .iter()
            .filter(|u| u.namespace == namespace)
            .map(|u| u.registered)
            .sum()
    }

    fn record(&mut self, namespace: Namespace, unit: &str, registered: usize) {
        debug!(%namespace, unit, registered, "Plugin unit loaded");
        self.units.push(UnitSummary {
            namespace,
            unit: unit.to_string(),
            registered,
        });
    }
}

/// An ordered collection of plugin units.
///
/// # Example
///
/// ```
/// use benchrun::plugin::PluginSet;
/// use benchrun::procedure::ProcedureDefinition;
/// use benchrun::registry::{FlowDefinition, Registry};
/// use serde_json::json;
///
/// let plugins = PluginSet::new()
///     .procedures("smoke", |r| {
///         r.register_procedure(ProcedureDefinition::builder("ping").build(|_| Ok(json!("pong")))?)?;
///         Ok(())
///     })
///     .flows("smoke", |r| {
///         r.register_flow(FlowDefinition::new("smoke", |session| {
///             let handle = session.stage_procedure("ping", Default::default())?;
///             handle.run()?.wait();
///             session.indicate_completion()?;
///             Ok(())
///         }))?;
///         Ok(())
///     });
///
/// let mut registry = Registry::new();
/// let summary = plugins.load_into(&mut registry).unwrap();
/// assert_eq!(summary.units.len(), 2);
/// ```
#[derive(Clone, Default)]
pub struct PluginSet {
    tools: Vec<(String, ToolUnit)>,
    procedures: Vec<(String, ProcedureUnit)>,
    flows: Vec<(String, FlowUnit)>,
}

impl PluginSet {
    pub fn new() -> Self {
        Self::default()
    }

    /// Add a tool unit
    pub fn tools<F>(mut self, unit: impl Into<String>, load: F) -> Self
    where
        F: Fn(&mut ToolRegistrar<'_>) -> anyhow::Result<()> + Send + Sync + 'static,
    {
        self.tools.push((unit.into(), Arc::new(load)));
        self
    }

    /// Add a procedure unit
    pub fn procedures<F>(mut self, unit: impl Into<String>, load: F) -> Self
    where
        F: Fn(&mut ProcedureRegistrar<'_>) -> anyhow::Result<()> + Send + Sync + 'static,
    {
        self.procedures.push((unit.into(), Arc::new(load)));
        self
    }

    /// Add a flow unit
    pub fn flows<F>(mut self, unit: impl Into<String>, load: F) -> Self
    where
        F: Fn(&mut FlowRegistrar<'_>) -> anyhow::Result<()> + Send + Sync + 'static,
    {
        self.flows.push((unit.into(), Arc::new(load)));
        self
    }

    /// Returns true if no units were added
    pub fn is_empty(&self) -> bool {
        self.tools.is_empty() && self.procedures.is_empty() && self.flows.is_empty()
    }

    /// Run every unit against `registry`: tools, then procedures, then flows.
    ///
    /// Stops at the first failing unit. Registrations made before the failure
    /// stay in the registry.
    pub fn load_into(&self, registry: &mut Registry) -> anyhow::Result<LoadSummary> {
        let mut summary = LoadSummary::default();

        for namespace in Namespace::iter() {
            debug!(%namespace, "Loading plugin namespace");
            match namespace {
                Namespace::Tools => {
                    for (unit, load) in &self.tools {
                        let mut registrar = ToolRegistrar {
                            registry: &mut *registry,
                            unit: unit.as_str(),
                            registered: 0,
                        };
                        run_unit(namespace, unit, || load(&mut registrar))?;
                        summary.record(namespace, unit, registrar.registered);
                    }
                }
                Namespace::Procedures => {
                    for (unit, load) in &self.procedures {
                        let mut registrar = ProcedureRegistrar {
                            registry: &mut *registry,
                            unit: unit.as_str(),
                            owned: HashSet::new(),
                            registered: 0,
                        };
                        run_unit(namespace, unit, || load(&mut registrar))?;
                        summary.record(namespace, unit, registrar.registered);
                    }
                }
                Namespace::Flows => {
                    for (unit, load) in &self.flows {
                        let mut registrar = FlowRegistrar {
                            registry: &mut *registry,
                            unit: unit.as_str(),
                            registered: 0,
                        };
                        run_unit(namespace, unit, || load(&mut registrar))?;
                        summary.record(namespace, unit, registrar.registered);
                    }
                }
            }
        }

        info!(
            tools = summary.registered(Namespace::Tools),
            procedures = summary.registered(Namespace::Procedures),
            flows = summary.registered(Namespace::Flows),
            "Plugin set loaded"
        );
        Ok(summary)
    }
}

fn run_unit(
    namespace: Namespace,
    unit: &str,
    load: impl FnOnce() -> anyhow::Result<()>,
) -> anyhow::Result<()> {
    load()
        .inspect_err(|e| error!(%namespace, unit, "Plugin unit failed: {:#}", e))
        .with_context(|| format!("failed to load {} unit '{}'", namespace, unit))
}

fn unit_names<U>(units: &[(String, U)]) -> Vec<&str> {
    units.iter().map(|(name, _)| name.as_str()).collect()
}

impl fmt::Debug for PluginSet {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("PluginSet")
            .field("tools", &unit_names(&self.tools))
            .field("procedures", &unit_names(&self.procedures))
            .field("flows", &unit_names(&self.flows))
            .finish()
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::view::SuiteView;
    use serde_json::json;
    use std::sync::Mutex;

    fn measure() -> ProcedureDefinition {
        ProcedureDefinition::builder("measure")
            .tool("dmm")
            .build(|_| Ok(Value::Null))
            .unwrap()
    }

    #[test]
    fn test_namespaces_load_in_order() {
        let order = Arc::new(Mutex::new(Vec::new()));
        let (a, b, c) = (Arc::clone(&order), Arc::clone(&order), Arc::clone(&order));

        // Added in reverse namespace order on purpose
        let plugins = PluginSet::new()
            .flows("f", move |_| {
                a.lock().unwrap().push("flows");
                Ok(())
            })
            .procedures("p", move |_| {
                b.lock().unwrap().push("procedures");
                Ok(())
            })
            .tools("t", move |_| {
                c.lock().unwrap().push("tools");
                Ok(())
            });

        let summary = plugins.load_into(&mut Registry::new()).unwrap();
        assert_eq!(*order.lock().unwrap(), vec!["tools", "procedures", "flows"]);
        assert_eq!(summary.unit_count(Namespace::Tools), 1);
        assert_eq!(summary.units[0].namespace, Namespace::Tools);
    }

    #[test]
    fn test_load_summary_counts_registrations() {
        let plugins = PluginSet::new()
            .tools("bench", |r| {
                r.register_tool(ToolRegistration::new(
                    "dmm",
                    |_: &SuiteView<'_>, _: &[Value]| Ok(0_u8),
                ))?;
                r.register_tool(ToolRegistration::new(
                    "psu",
                    |_: &SuiteView<'_>, _: &[Value]| Ok(0_u8),
                ))?;
                Ok(())
            })
            .procedures("electrical", |r| {
                r.register_procedure(measure())?;
                r.associate_tool("dmm", "measure", vec![json!("10V")])?;
                Ok(())
            });

        let mut registry = Registry::new();
        let summary = plugins.load_into(&mut registry).unwrap();
        assert_eq!(summary.registered(Namespace::Tools), 2);
        assert_eq!(summary.registered(Namespace::Procedures), 1);
        assert_eq!(summary.registered(Namespace::Flows), 0);
        assert_eq!(registry.association_args("dmm", "measure"), [json!("10V")]);
    }

    #[test]
    fn test_association_outside_unit_rejected() {
        let plugins = PluginSet::new()
            .procedures("owner", |r| {
                r.register_procedure(measure())?;
                Ok(())
            })
            .procedures("intruder", |r| {
                r.associate_tool("dmm", "measure", vec![])?;
                Ok(())
            });

        let err = plugins.load_into(&mut Registry::new()).unwrap_err();
        assert!(err.to_string().contains("intruder"));
        assert!(matches!(
            err.downcast_ref::<EngineError>(),
            Some(EngineError::AssociationOutsideUnit { .. })
        ));
    }

    #[test]
    fn test_failing_unit_stops_load() {
        let plugins = PluginSet::new()
            .tools("broken", |_| anyhow::bail!("driver library missing"))
            .flows("never", |r| {
                r.register_flow(FlowDefinition::new("main", |_| Ok(())))?;
                Ok(())
            });

        let mut registry = Registry::new();
        let err = plugins.load_into(&mut registry).unwrap_err();
        assert!(format!("{:#}", err).contains("driver library missing"));
        assert!(registry.flow("main").is_none());
    }
}
