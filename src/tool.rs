//! Tool registrations and the per-procedure set of bound tool instances.
//!
//! A tool is registered with a typed constructor and, optionally, a typed
//! deconstructor. The builder ties both to the same instance type, so a
//! deconstructor always receives exactly what its constructor produced.
//!
//! # Example
//!
//! ```
//! use benchrun::tool::ToolRegistration;
//! use benchrun::view::SuiteView;
//! use serde_json::Value;
//!
//! struct Dmm {
//!     range: f64,
//! }
//!
//! let registration = ToolRegistration::builder("dmm", |_view: &SuiteView<'_>, args: &[Value]| {
//!     let range = args.first().and_then(Value::as_f64).unwrap_or(10.0);
//!     Ok(Dmm { range })
//! })
//! .deconstructor(|dmm: Dmm| {
//!     assert!(dmm.range > 0.0);
//!     Ok(())
//! })
//! .build();
//!
//! assert_eq!(registration.name(), "dmm");
//! assert!(registration.has_deconstructor());
//! ```

use serde_json::Value;
use std::any::{Any, type_name};
use std::fmt;
use std::marker::PhantomData;
use std::panic::{self, AssertUnwindSafe};
use std::sync::Arc;
use tracing::{debug, warn};

use crate::error::{EngineError, panic_message};
use crate::view::SuiteView;

/// Name of the builtin configuration tool
pub const CONFIG_TOOL: &str = "config";

/// A constructed tool, owned by the procedure invocation that requested it
pub type ToolInstance = Box<dyn Any + Send>;

pub(crate) type ToolConstructor =
    Arc<dyn Fn(&SuiteView<'_>, &[Value]) -> anyhow::Result<ToolInstance> + Send + Sync>;

pub(crate) type ToolDeconstructor = Arc<dyn Fn(ToolInstance) -> anyhow::Result<()> + Send + Sync>;

/// A named tool constructor with an optional deconstructor.
#[derive(Clone)]
pub struct ToolRegistration {
    name: String,
    constructor: ToolConstructor,
    deconstructor: Option<ToolDeconstructor>,
    builtin: bool,
}

impl ToolRegistration {
    /// Start a registration for tools of type `T`
    pub fn builder<T, F>(name: impl Into<String>, constructor: F) -> ToolRegistrationBuilder<T>
    where
        T: Any + Send,
        F: Fn(&SuiteView<'_>, &[Value]) -> anyhow::Result<T> + Send + Sync + 'static,
    {
        let constructor: ToolConstructor =
            Arc::new(move |view: &SuiteView<'_>, args: &[Value]| {
                constructor(view, args).map(|instance| Box::new(instance) as ToolInstance)
            });
        ToolRegistrationBuilder {
            name: name.into(),
            constructor,
            deconstructor: None,
            _instance: PhantomData,
        }
    }

    /// Register a tool without a deconstructor
    pub fn new<T, F>(name: impl Into<String>, constructor: F) -> Self
    where
        T: Any + Send,
        F: Fn(&SuiteView<'_>, &[Value]) -> anyhow::Result<T> + Send + Sync + 'static,
    {
        Self::builder(name, constructor).build()
    }

    /// Tool name
    pub fn name(&self) -> &str {
        &self.name
    }

    /// Returns true if instances are torn down through a deconstructor
    pub fn has_deconstructor(&self) -> bool {
        self.deconstructor.is_some()
    }

    /// Returns true for tools the engine registers itself
    pub fn is_builtin(&self) -> bool {
        self.builtin
    }

    /// Build an instance with the given association arguments
    pub fn construct(&self, view: &SuiteView<'_>, args: &[Value]) -> anyhow::Result<ToolInstance> {
        (self.constructor)(view, args)
    }

    pub(crate) fn deconstructor(&self) -> Option<ToolDeconstructor> {
        self.deconstructor.clone()
    }

    pub(crate) fn into_builtin(mut self) -> Self {
        self.builtin = true;
        self
    }
}

impl fmt::Debug for ToolRegistration {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("ToolRegistration")
            .field("name", &self.name)
            .field("has_deconstructor", &self.has_deconstructor())
            .field("builtin", &self.builtin)
            .finish()
    }
}

/// Builder for [`ToolRegistration`], typed by the instance it constructs
pub struct ToolRegistrationBuilder<T> {
    name: String,
    constructor: ToolConstructor,
    deconstructor: Option<ToolDeconstructor>,
    _instance: PhantomData<fn() -> T>,
}

impl<T: Any + Send> ToolRegistrationBuilder<T> {
    /// Tear instances down with `deconstructor` once their procedure finishes
    pub fn deconstructor<D>(mut self, deconstructor: D) -> Self
    where
        D: Fn(T) -> anyhow::Result<()> + Send + Sync + 'static,
    {
        let tool = self.name.clone();
        self.deconstructor = Some(Arc::new(move |instance: ToolInstance| {
            let instance = instance
                .downcast::<T>()
                .map_err(|_| EngineError::ToolTypeMismatch {
                    tool: tool.clone(),
                    expected: type_name::<T>(),
                })?;
            deconstructor(*instance)
        }));
        self
    }

    /// Finish the registration
    pub fn build(self) -> ToolRegistration {
        ToolRegistration {
            name: self.name,
            constructor: self.constructor,
            deconstructor: self.deconstructor,
            builtin: false,
        }
    }
}

/// The `config` tool: hands out the suite configuration, ignoring its arguments
pub(crate) fn config_tool() -> ToolRegistration {
    ToolRegistration::new(CONFIG_TOOL, |view: &SuiteView<'_>, _args: &[Value]| {
        Ok(view.configuration().clone())
    })
    .into_builtin()
}

struct BoundTool {
    name: String,
    instance: ToolInstance,
    deconstructor: Option<ToolDeconstructor>,
}

/// Tool instances bound to one procedure invocation, in declaration order.
pub struct ToolSet {
    procedure: String,
    bound: Vec<BoundTool>,
}

impl ToolSet {
    pub(crate) fn new(procedure: &str) -> Self {
        Self {
            procedure: procedure.to_string(),
            bound: Vec::new(),
        }
    }

    pub(crate) fn bind(
        &mut self,
        name: &str,
        instance: ToolInstance,
        deconstructor: Option<ToolDeconstructor>,
    ) {
        self.bound.push(BoundTool {
            name: name.to_string(),
            instance,
            deconstructor,
        });
    }

    /// Borrow a tool instance as its concrete type
    pub fn get<T: Any>(&self, name: &str) -> Result<&T, EngineError> {
        let entry = self
            .bound
            .iter()
            .find(|b| b.name == name)
            .ok_or_else(|| EngineError::ToolNotBound {
                tool: name.to_string(),
                procedure: self.procedure.clone(),
            })?;
        (*entry.instance)
            .downcast_ref::<T>()
            .ok_or_else(|| EngineError::ToolTypeMismatch {
                tool: name.to_string(),
                expected: type_name::<T>(),
            })
    }

    /// Mutably borrow a tool instance as its concrete type
    pub fn get_mut<T: Any>(&mut self, name: &str) -> Result<&mut T, EngineError> {
        let procedure = &self.procedure;
        let entry = self
            .bound
            .iter_mut()
            .find(|b| b.name == name)
            .ok_or_else(|| EngineError::ToolNotBound {
                tool: name.to_string(),
                procedure: procedure.clone(),
            })?;
        (*entry.instance)
            .downcast_mut::<T>()
            .ok_or_else(|| EngineError::ToolTypeMismatch {
                tool: name.to_string(),
                expected: type_name::<T>(),
            })
    }

    /// Returns true if a tool with this name is bound
    pub fn contains(&self, name: &str) -> bool {
        self.bound.iter().any(|b| b.name == name)
    }

    /// Bound tool names in binding order
    pub fn names(&self) -> impl Iterator<Item = &str> {
        self.bound.iter().map(|b| b.name.as_str())
    }

    /// Number of bound tools
    pub fn len(&self) -> usize {
        self.bound.len()
    }

    /// Returns true if no tools are bound
    pub fn is_empty(&self) -> bool {
        self.bound.is_empty()
    }

    /// Release every bound instance in binding order.
    ///
    /// Each deconstructor runs exactly once. Errors and panics are logged and
    /// do not stop the remaining teardowns. Returns the number that failed.
    pub(crate) fn teardown(self) -> usize {
        let Self { procedure, bound } = self;
        let mut failed = 0;

        for BoundTool {
            name,
            instance,
            deconstructor,
        } in bound
        {
            let Some(deconstructor) = deconstructor else {
                drop(instance);
                continue;
            };

            debug!(procedure = %procedure, tool = %name, "Deconstructing tool");
            match panic::catch_unwind(AssertUnwindSafe(|| deconstructor(instance))) {
                Ok(Ok(())) => {}
                Ok(Err(e)) => {
                    failed += 1;
                    warn!(procedure = %procedure, tool = %name, "Tool deconstructor failed: {:#}", e);
                }
                Err(payload) => {
                    failed += 1;
                    warn!(
                        procedure = %procedure,
                        tool = %name,
                        "Tool deconstructor panicked: {}",
                        panic_message(&*payload)
                    );
                }
            }
        }

        failed
    }
}

impl fmt::Debug for ToolSet {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("ToolSet")
            .field("procedure", &self.procedure)
            .field("tools", &self.names().collect::<Vec<_>>())
            .finish()
    }
}
