//! Read-only view of suite state handed to tool constructors.
//!
//! A constructor may read the configuration or build other tools it depends
//! on. It cannot register anything and cannot see procedures or flows.

use serde_json::Value;
use std::any::{Any, type_name};
use std::collections::HashMap;

use crate::config::Configuration;
use crate::error::EngineError;
use crate::tool::{ToolInstance, ToolRegistration};

/// Catalog of registered tools, keyed by name.
#[derive(Debug, Default, Clone)]
pub struct ToolCatalog {
    entries: HashMap<String, ToolRegistration>,
}

impl ToolCatalog {
    /// Look up a registration
    pub fn get(&self, name: &str) -> Option<&ToolRegistration> {
        self.entries.get(name)
    }

    /// Returns true if a tool with this name is registered
    pub fn contains(&self, name: &str) -> bool {
        self.entries.contains_key(name)
    }

    /// Registered tool names, sorted
    pub fn names(&self) -> Vec<&str> {
        let mut names: Vec<&str> = self.entries.keys().map(String::as_str).collect();
        names.sort_unstable();
        names
    }

    /// Iterate over all registrations
    pub fn iter(&self) -> impl Iterator<Item = &ToolRegistration> {
        self.entries.values()
    }

    /// Number of registered tools
    pub fn len(&self) -> usize {
        self.entries.len()
    }

    /// Returns true if no tools are registered
    pub fn is_empty(&self) -> bool {
        self.entries.is_empty()
    }

    pub(crate) fn insert(&mut self, registration: ToolRegistration) -> Option<ToolRegistration> {
        self.entries
            .insert(registration.name().to_string(), registration)
    }
}

/// Borrowed, read-only projection of the configuration and tool catalog.
#[derive(Debug, Clone, Copy)]
pub struct SuiteView<'a> {
    configuration: &'a Configuration,
    tools: &'a ToolCatalog,
}

impl<'a> SuiteView<'a> {
    pub(crate) fn new(configuration: &'a Configuration, tools: &'a ToolCatalog) -> Self {
        Self {
            configuration,
            tools,
        }
    }

    /// Suite-wide configuration
    pub fn configuration(&self) -> &'a Configuration {
        self.configuration
    }

    /// Registered tool constructors
    pub fn tools(&self) -> &'a ToolCatalog {
        self.tools
    }

    /// Construct another tool by name.
    ///
    /// The caller owns the returned instance. It is not bound to any procedure,
    /// so its deconstructor does not run automatically.
    pub fn construct_tool(&self, name: &str, args: &[Value]) -> anyhow::Result<ToolInstance> {
        let registration = self
            .tools
            .get(name)
            .ok_or_else(|| anyhow::anyhow!("tool '{}' is not registered", name))?;
        registration.construct(self, args)
    }

    /// Construct another tool by name and unwrap it as `T`
    pub fn construct_tool_as<T: Any>(&self, name: &str, args: &[Value]) -> anyhow::Result<T> {
        let instance = self.construct_tool(name, args)?;
        let instance = instance
            .downcast::<T>()
            .map_err(|_| EngineError::ToolTypeMismatch {
                tool: name.to_string(),
                expected: type_name::<T>(),
            })?;
        Ok(*instance)
    }
}
