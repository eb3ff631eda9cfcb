//! Caller-facing handle to a staged procedure.

use std::fmt;
use std::sync::Arc;
use std::time::Duration;

use crate::error::Result;
use crate::runner::{ProcedureResult, ProcedureRunner};
use crate::session::Parameters;
use crate::status::ProcedureStatus;

/// Handle returned by `Session::stage_procedure`.
///
/// Clones share the same runner, so any clone may `run` (once) or `wait`.
#[derive(Clone)]
pub struct ProcedureHandle {
    runner: Arc<ProcedureRunner>,
}

impl ProcedureHandle {
    pub(crate) fn new(runner: Arc<ProcedureRunner>) -> Self {
        Self { runner }
    }

    /// Procedure name
    pub fn procedure(&self) -> &str {
        self.runner.procedure()
    }

    /// Parameters the procedure was staged with
    pub fn parameters(&self) -> &Parameters {
        self.runner.parameters()
    }

    /// Current status
    pub fn status(&self) -> ProcedureStatus {
        self.runner.status()
    }

    /// The returned value or captured failure; `None` until terminal
    pub fn result(&self) -> Option<ProcedureResult> {
        self.runner.result()
    }

    /// Time spent in the body; `None` before it starts
    pub fn running_time(&self) -> Option<Duration> {
        self.runner.running_time()
    }

    /// Start the procedure on its worker thread.
    ///
    /// # Errors
    ///
    /// - `ProcedureIsNotStaged` if the handle was already run
    /// - `WorkerSpawn` if the worker thread could not be created
    pub fn run(&self) -> Result<&Self> {
        self.runner.run()?;
        Ok(self)
    }

    /// Block until the procedure and its teardown have finished
    pub fn wait(&self) -> &Self {
        self.runner.wait();
        self
    }

    /// Returns true once the worker has finished
    pub fn is_finished(&self) -> bool {
        self.runner.is_finished()
    }
}

impl fmt::Debug for ProcedureHandle {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("ProcedureHandle")
            .field("procedure", &self.procedure())
            .field("status", &self.status())
            .field("running_time", &self.running_time())
            .finish()
    }
}

#[cfg(test)]
mod tests {
    use crate::error::EngineError;
    use crate::procedure::ProcedureDefinition;
    use crate::registry::Registry;
    use crate::session::{Parameters, Session};
    use crate::status::ProcedureStatus;
    use serde_json::json;
    use std::sync::Arc;

    fn session() -> Session {
        let mut registry = Registry::new();
        registry
            .register_procedure(
                ProcedureDefinition::builder("answer")
                    .build(|_| Ok(json!(42)))
                    .unwrap(),
            )
            .unwrap();
        Session::new(Arc::new(registry), "unit", Parameters::new())
    }

    #[test]
    fn test_run_then_wait_chains() {
        let handle = session()
            .stage_procedure("answer", Parameters::new())
            .unwrap();
        assert_eq!(handle.status(), ProcedureStatus::Staged);

        let status = handle.run().unwrap().wait().status();
        assert_eq!(status, ProcedureStatus::Completed);
        assert_eq!(handle.result().unwrap().value(), Some(&json!(42)));
        assert!(handle.is_finished());
    }

    #[test]
    fn test_clones_share_runner() {
        let handle = session()
            .stage_procedure("answer", Parameters::new())
            .unwrap();
        let clone = handle.clone();

        handle.run().unwrap();
        assert!(matches!(
            clone.run(),
            Err(EngineError::ProcedureIsNotStaged { .. })
        ));
        clone.wait();
        assert_eq!(handle.status(), ProcedureStatus::Completed);
    }
}
