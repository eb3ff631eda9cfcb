//! A test suite rooted at a directory.
//!
//! The root must contain `tools/`, `procedures/` and `flows/`. Their
//! contents belong to the station; the engine only checks that they exist.
//! An optional `suite.json` at the root supplies the configuration.

use anyhow::Context;
use std::path::{Path, PathBuf};
use std::sync::Arc;
use tracing::{debug, info};

use crate::config::Configuration;
use crate::error::{EngineError, Result};
use crate::plugin::{LoadSummary, PluginSet};
use crate::registry::Registry;
use crate::session::{FlowOutcome, Parameters};
use crate::view::SuiteView;

/// Directories every suite root must contain, in load order
pub const SUITE_DIRECTORIES: [&str; 3] = ["tools", "procedures", "flows"];

/// Optional configuration file at the suite root
pub const CONFIG_FILE: &str = "suite.json";

/// Resolved paths of a suite root
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct SuiteLayout {
    pub root: PathBuf,
    pub tools: PathBuf,
    pub procedures: PathBuf,
    pub flows: PathBuf,
    pub config_file: PathBuf,
}

impl SuiteLayout {
    /// Compute the layout for `root` without touching the filesystem
    pub fn new(root: impl Into<PathBuf>) -> Self {
        let root = root.into();
        Self {
            tools: root.join(SUITE_DIRECTORIES[0]),
            procedures: root.join(SUITE_DIRECTORIES[1]),
            flows: root.join(SUITE_DIRECTORIES[2]),
            config_file: root.join(CONFIG_FILE),
            root,
        }
    }

    /// Check that the root and each required directory exist.
    ///
    /// # Errors
    ///
    /// - `SuiteLayout` naming the first missing directory
    pub fn verify(&self) -> Result<()> {
        if !self.root.is_dir() {
            return Err(EngineError::suite_layout(format!(
                "suite root {} is not a directory",
                self.root.display()
            )));
        }
        for (name, path) in SUITE_DIRECTORIES
            .iter()
            .zip([&self.tools, &self.procedures, &self.flows])
        {
            if !path.is_dir() {
                return Err(EngineError::suite_layout(format!(
                    "missing '{}' directory under {}",
                    name,
                    self.root.display()
                )));
            }
        }
        Ok(())
    }

    /// Load `suite.json` if present, otherwise an empty configuration
    pub fn load_configuration(&self) -> Result<Configuration> {
        if self.config_file.is_file() {
            debug!(path = %self.config_file.display(), "Loading suite configuration");
            Configuration::load_from_file(&self.config_file)
        } else {
            Ok(Configuration::new())
        }
    }
}

/// A loaded suite, ready to run flows.
#[derive(Debug, Clone)]
pub struct Suite {
    layout: SuiteLayout,
    registry: Arc<Registry>,
    summary: LoadSummary,
}

impl Suite {
    /// Verify the layout, read the configuration and load `plugins`.
    pub fn open(root: impl AsRef<Path>, plugins: &PluginSet) -> anyhow::Result<Self> {
        Self::open_with_registry(root, plugins, Registry::new())
    }

    /// Like [`Suite::open`], starting from a prepared registry (for example
    /// one with a log sink installed)
    pub fn open_with_registry(
        root: impl AsRef<Path>,
        plugins: &PluginSet,
        mut registry: Registry,
    ) -> anyhow::Result<Self> {
        let layout = SuiteLayout::new(root.as_ref());
        layout.verify()?;

        let configuration = layout
            .load_configuration()
            .context("failed to load suite configuration")?;
        registry.set_configuration(configuration);

        let summary = plugins
            .load_into(&mut registry)
            .with_context(|| format!("failed to load suite {}", layout.root.display()))?;

        info!(
            root = %layout.root.display(),
            tools = registry.tools().len(),
            procedures = registry.procedure_names().len(),
            flows = registry.flow_names().len(),
            "Suite opened"
        );

        Ok(Self {
            layout,
            registry: Arc::new(registry),
            summary,
        })
    }

    pub fn layout(&self) -> &SuiteLayout {
        &self.layout
    }

    /// Shared registry, frozen after loading
    pub fn registry(&self) -> &Arc<Registry> {
        &self.registry
    }

    pub fn view(&self) -> SuiteView<'_> {
        self.registry.view()
    }

    /// What the load pass registered
    pub fn load_summary(&self) -> &LoadSummary {
        &self.summary
    }

    /// Run a flow in a fresh session
    pub fn run_flow(&self, name: &str, parameters: Parameters) -> Result<FlowOutcome> {
        self.registry.run_flow(name, parameters)
    }
}
