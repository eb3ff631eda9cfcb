//! Procedure execution.
//!
//! A `ProcedureRunner` owns one staged procedure invocation. `run` hands it
//! to a dedicated worker thread which goes through three phases:
//!
//! 1. **Dependency resolution**: construct every declared tool, in order,
//!    with the association arguments registered for this procedure. Any
//!    failure ends the invocation as `DEPENDENCY_EXCEPTION` without calling
//!    the body.
//! 2. **Execution**: call the body. `Ok` → `COMPLETED`, `Err` or panic →
//!    `EXCEPTED`. The failure is stored, never re-raised.
//! 3. **Teardown**: deconstruct every tool that was constructed, in binding
//!    order, even when resolution stopped part way through.
//!
//! The handle observes the runner through a mutex; a condvar signals the
//! end of teardown to `wait`.

use serde_json::Value;
use std::fmt;
use std::panic::{self, AssertUnwindSafe};
use std::sync::{Arc, Condvar, Mutex, MutexGuard, PoisonError};
use std::thread;
use std::time::{Duration, Instant};
use tracing::{debug, error, info, warn};

use crate::error::{EngineError, Failure, Result};
use crate::procedure::{ProcedureContext, ProcedureDefinition};
use crate::registry::Registry;
use crate::session::{Parameters, SharedFindings};
use crate::status::ProcedureStatus;
use crate::tool::ToolSet;

/// What a finished procedure produced.
#[derive(Debug, Clone)]
pub enum ProcedureResult {
    /// The body returned a value
    Returned(Value),
    /// Dependency resolution or the body failed
    Failed(Failure),
}

impl ProcedureResult {
    /// The returned value, if the body succeeded
    pub fn value(&self) -> Option<&Value> {
        match self {
            Self::Returned(value) => Some(value),
            Self::Failed(_) => None,
        }
    }

    /// The captured failure, if any
    pub fn failure(&self) -> Option<&Failure> {
        match self {
            Self::Returned(_) => None,
            Self::Failed(failure) => Some(failure),
        }
    }

    /// Returns true if this result holds a failure
    pub fn is_failure(&self) -> bool {
        matches!(self, Self::Failed(_))
    }
}

#[derive(Debug)]
struct RunnerState {
    status: ProcedureStatus,
    result: Option<ProcedureResult>,
    started_at: Option<Instant>,
    ended_at: Option<Instant>,
    launched: bool,
    finished: bool,
}

/// One staged procedure invocation and the worker that executes it.
pub struct ProcedureRunner {
    registry: Arc<Registry>,
    definition: Arc<ProcedureDefinition>,
    flow: String,
    parameters: Parameters,
    findings: SharedFindings,
    state: Mutex<RunnerState>,
    done: Condvar,
}

impl ProcedureRunner {
    pub(crate) fn new(
        registry: Arc<Registry>,
        definition: Arc<ProcedureDefinition>,
        flow: &str,
        parameters: Parameters,
        findings: SharedFindings,
    ) -> Arc<Self> {
        Arc::new(Self {
            registry,
            definition,
            flow: flow.to_string(),
            parameters,
            findings,
            state: Mutex::new(RunnerState {
                status: ProcedureStatus::Staged,
                result: None,
                started_at: None,
                ended_at: None,
                launched: false,
                finished: false,
            }),
            done: Condvar::new(),
        })
    }

    /// Procedure name
    pub fn procedure(&self) -> &str {
        self.definition.name()
    }

    /// Parameters the procedure was staged with
    pub fn parameters(&self) -> &Parameters {
        &self.parameters
    }

    /// Current status
    pub fn status(&self) -> ProcedureStatus {
        self.lock().status
    }

    /// Result, once the procedure reached a terminal status
    pub fn result(&self) -> Option<ProcedureResult> {
        self.lock().result.clone()
    }

    /// Time spent in the body: `None` before it starts, live while it runs,
    /// fixed once it ends
    pub fn running_time(&self) -> Option<Duration> {
        let state = self.lock();
        let started = state.started_at?;
        Some(match state.ended_at {
            Some(ended) => ended.duration_since(started),
            None => started.elapsed(),
        })
    }

    /// Returns true once the worker has finished, teardown included
    pub fn is_finished(&self) -> bool {
        self.lock().finished
    }

    /// Start the worker.
    ///
    /// # Errors
    ///
    /// - `ProcedureIsNotStaged` if the runner was already started
    /// - `WorkerSpawn` if the OS refused to create the thread
    pub fn run(self: &Arc<Self>) -> Result<()> {
        {
            let mut state = self.lock();
            if state.launched || state.status != ProcedureStatus::Staged {
                return Err(EngineError::ProcedureIsNotStaged {
                    procedure: self.procedure().to_string(),
                    status: state.status,
                });
            }
            state.launched = true;
        }

        let runner = Arc::clone(self);
        let spawned = thread::Builder::new()
            .name(format!("procedure:{}", self.procedure()))
            .spawn(move || runner.execute());

        if let Err(e) = spawned {
            self.lock().launched = false;
            error!(procedure = self.procedure(), "Failed to spawn worker: {}", e);
            return Err(EngineError::WorkerSpawn {
                procedure: self.procedure().to_string(),
                reason: e.to_string(),
            });
        }

        debug!(flow = %self.flow, procedure = self.procedure(), "Worker started");
        Ok(())
    }

    /// Block until the worker has finished; returns at once if never started
    pub fn wait(&self) {
        let mut state = self.lock();
        if !state.launched {
            return;
        }
        while !state.finished {
            state = self
                .done
                .wait(state)
                .unwrap_or_else(PoisonError::into_inner);
        }
    }

    // State writes are single assignments, so a poisoned lock still holds a
    // consistent state.
    fn lock(&self) -> MutexGuard<'_, RunnerState> {
        self.state.lock().unwrap_or_else(PoisonError::into_inner)
    }

    fn advance(&self, state: &mut RunnerState, next: ProcedureStatus) {
        match state.status.transition(next) {
            Ok(status) => state.status = status,
            Err(e) => error!(procedure = self.procedure(), "Invalid status transition: {}", e),
        }
    }

    fn execute(&self) {
        let _finished = FinishedGuard(self);
        let procedure = self.procedure();

        let mut tools = match self.resolve_dependencies() {
            Ok(tools) => tools,
            Err((failure, constructed)) => {
                warn!(procedure, "Dependency resolution failed: {}", failure);
                {
                    let mut state = self.lock();
                    self.advance(&mut state, ProcedureStatus::DependencyException);
                    state.result = Some(ProcedureResult::Failed(failure));
                }
                constructed.teardown();
                return;
            }
        };

        {
            let mut state = self.lock();
            state.started_at = Some(Instant::now());
            self.advance(&mut state, ProcedureStatus::Ongoing);
        }
        info!(flow = %self.flow, procedure, tools = tools.len(), "Procedure started");

        let outcome = {
            let mut context = ProcedureContext::new(
                procedure,
                &self.flow,
                &mut tools,
                &self.parameters,
                &self.findings,
                self.registry.log_sink(),
            );
            let body = self.definition.body();
            panic::catch_unwind(AssertUnwindSafe(|| body(&mut context)))
        };

        let (status, result) = match outcome {
            Ok(Ok(value)) => (ProcedureStatus::Completed, ProcedureResult::Returned(value)),
            Ok(Err(e)) => (
                ProcedureStatus::Excepted,
                ProcedureResult::Failed(Failure::new(e)),
            ),
            Err(payload) => (
                ProcedureStatus::Excepted,
                ProcedureResult::Failed(Failure::from_panic(
                    &format!("procedure '{}'", procedure),
                    payload,
                )),
            ),
        };

        let elapsed = {
            let mut state = self.lock();
            let ended = Instant::now();
            state.ended_at = Some(ended);
            self.advance(&mut state, status);
            if let ProcedureResult::Failed(failure) = &result {
                warn!(procedure, "Procedure excepted: {}", failure);
            }
            state.result = Some(result);
            state.started_at.map(|started| ended.duration_since(started))
        };
        info!(procedure, %status, ?elapsed, "Procedure finished");

        let failed = tools.teardown();
        if failed > 0 {
            warn!(procedure, failed, "Some tool deconstructors failed");
        }
    }

    /// Construct the declared tools in order. On failure, returns the tools
    /// constructed so far so they can still be torn down.
    fn resolve_dependencies(&self) -> std::result::Result<ToolSet, (Failure, ToolSet)> {
        let procedure = self.procedure();
        let view = self.registry.view();
        let mut tools = ToolSet::new(procedure);

        for tool in self.definition.tools() {
            let Some(registration) = view.tools().get(tool) else {
                let error = EngineError::ToolDoesNotExist {
                    tool: tool.clone(),
                    procedure: procedure.to_string(),
                };
                return Err((Failure::from(error), tools));
            };

            let args = self.registry.association_args(tool, procedure);
            debug!(procedure, tool = %tool, args = args.len(), "Constructing tool");

            match panic::catch_unwind(AssertUnwindSafe(|| registration.construct(&view, args))) {
                Ok(Ok(instance)) => tools.bind(tool, instance, registration.deconstructor()),
                Ok(Err(e)) => {
                    let failure = Failure::new(e.context(format!(
                        "failed to construct tool '{}' for procedure '{}'",
                        tool, procedure
                    )));
                    return Err((failure, tools));
                }
                Err(payload) => {
                    let failure =
                        Failure::from_panic(&format!("constructor of tool '{}'", tool), payload);
                    return Err((failure, tools));
                }
            }
        }

        Ok(tools)
    }
}

impl fmt::Debug for ProcedureRunner {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("ProcedureRunner")
            .field("procedure", &self.procedure())
            .field("flow", &self.flow)
            .field("state", &*self.lock())
            .finish_non_exhaustive()
    }
}

/// Marks the runner finished and wakes waiters when the worker exits
struct FinishedGuard<'a>(&'a ProcedureRunner);

impl Drop for FinishedGuard<'_> {
    fn drop(&mut self) {
        self.0.lock().finished = true;
        self.0.done.notify_all();
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::tool::ToolRegistration;
    use crate::view::SuiteView;
    use serde_json::json;
    use std::sync::atomic::{AtomicUsize, Ordering};
    use std::sync::mpsc;

    fn runner_for(registry: Registry, procedure: &str, parameters: Parameters) -> Arc<ProcedureRunner> {
        let registry = Arc::new(registry);
        let definition = registry.procedure_arc(procedure).unwrap();
        ProcedureRunner::new(registry, definition, "unit", parameters, SharedFindings::default())
    }

    #[test]
    fn test_staged_runner_has_no_result_or_time() {
        let mut registry = Registry::new();
        registry
            .register_procedure(
                ProcedureDefinition::builder("noop")
                    .build(|_| Ok(Value::Null))
                    .unwrap(),
            )
            .unwrap();

        let runner = runner_for(registry, "noop", Parameters::new());
        assert_eq!(runner.status(), ProcedureStatus::Staged);
        assert!(runner.result().is_none());
        assert!(runner.running_time().is_none());

        // Waiting on a runner that never started returns immediately
        runner.wait();
        assert_eq!(runner.status(), ProcedureStatus::Staged);
    }

    #[test]
    fn test_body_receives_parameters() {
        let mut registry = Registry::new();
        registry
            .register_procedure(
                ProcedureDefinition::builder("echo")
                    .parameter("word")
                    .build(|ctx| Ok(ctx.require_parameter("word")?.clone()))
                    .unwrap(),
            )
            .unwrap();

        let runner = runner_for(
            registry,
            "echo",
            Parameters::from([("word".to_string(), json!("hello"))]),
        );
        runner.run().unwrap();
        runner.wait();

        assert_eq!(runner.status(), ProcedureStatus::Completed);
        assert_eq!(runner.result().unwrap().value(), Some(&json!("hello")));
    }

    #[test]
    fn test_running_time_is_live_while_ongoing() {
        let (started_tx, started_rx) = mpsc::channel::<()>();
        let (release_tx, release_rx) = mpsc::channel::<()>();
        let started_tx = Mutex::new(started_tx);
        let release_rx = Mutex::new(release_rx);

        let mut registry = Registry::new();
        registry
            .register_procedure(
                ProcedureDefinition::builder("hold")
                    .build(move |_| {
                        started_tx.lock().unwrap().send(()).unwrap();
                        release_rx.lock().unwrap().recv().unwrap();
                        Ok(Value::Null)
                    })
                    .unwrap(),
            )
            .unwrap();

        let runner = runner_for(registry, "hold", Parameters::new());
        runner.run().unwrap();
        started_rx.recv().unwrap();

        assert_eq!(runner.status(), ProcedureStatus::Ongoing);
        let first = runner.running_time().unwrap();
        thread::sleep(Duration::from_millis(20));
        let second = runner.running_time().unwrap();
        assert!(second > first);

        release_tx.send(()).unwrap();
        runner.wait();

        let fixed = runner.running_time().unwrap();
        thread::sleep(Duration::from_millis(10));
        assert_eq!(runner.running_time().unwrap(), fixed);
    }

    #[test]
    fn test_partial_dependencies_are_torn_down() {
        let torn_down = Arc::new(AtomicUsize::new(0));
        let counter = Arc::clone(&torn_down);

        let mut registry = Registry::new();
        registry
            .register_tool(
                ToolRegistration::builder("psu", |_: &SuiteView<'_>, _: &[Value]| Ok(12_u32))
                    .deconstructor(move |_: u32| {
                        counter.fetch_add(1, Ordering::SeqCst);
                        Ok(())
                    })
                    .build(),
            )
            .unwrap();
        registry
            .register_tool(ToolRegistration::new(
                "broken",
                |_: &SuiteView<'_>, _: &[Value]| -> anyhow::Result<u32> {
                    anyhow::bail!("fixture not connected")
                },
            ))
            .unwrap();
        registry
            .register_procedure(
                ProcedureDefinition::builder("power_on")
                    .tools(["psu", "broken"])
                    .build(|_| panic!("body must not run"))
                    .unwrap(),
            )
            .unwrap();

        let runner = runner_for(registry, "power_on", Parameters::new());
        runner.run().unwrap();
        runner.wait();

        assert_eq!(runner.status(), ProcedureStatus::DependencyException);
        assert!(runner.running_time().is_none());
        assert_eq!(torn_down.load(Ordering::SeqCst), 1);

        let result = runner.result().unwrap();
        let failure = result.failure().unwrap();
        assert!(failure.to_string().contains("fixture not connected"));
        assert!(failure.to_string().contains("broken"));
    }

    #[test]
    fn test_constructor_panic_is_dependency_exception() {
        let mut registry = Registry::new();
        registry
            .register_tool(ToolRegistration::new(
                "flaky",
                |_: &SuiteView<'_>, _: &[Value]| -> anyhow::Result<u32> { panic!("usb reset") },
            ))
            .unwrap();
        registry
            .register_procedure(
                ProcedureDefinition::builder("uses_flaky")
                    .tool("flaky")
                    .build(|_| Ok(Value::Null))
                    .unwrap(),
            )
            .unwrap();

        let runner = runner_for(registry, "uses_flaky", Parameters::new());
        runner.run().unwrap();
        runner.wait();

        assert_eq!(runner.status(), ProcedureStatus::DependencyException);
        let result = runner.result().unwrap();
        assert!(result.failure().unwrap().is_panic());
    }

    #[test]
    fn test_body_panic_is_excepted() {
        let mut registry = Registry::new();
        registry
            .register_procedure(
                ProcedureDefinition::builder("explode")
                    .build(|_| panic!("limit exceeded"))
                    .unwrap(),
            )
            .unwrap();

        let runner = runner_for(registry, "explode", Parameters::new());
        runner.run().unwrap();
        runner.wait();

        assert_eq!(runner.status(), ProcedureStatus::Excepted);
        let result = runner.result().unwrap();
        let failure = result.failure().unwrap();
        assert!(failure.is_panic());
        assert!(failure.to_string().contains("limit exceeded"));
        assert!(runner.running_time().is_some());
        assert!(runner.is_finished());
    }
}
