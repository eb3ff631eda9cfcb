//! Per-flow execution context.
//!
//! A `Session` is created by the dispatcher for every flow invocation,
//! including nested ones. Flows use it to stage procedures, run sub-flows,
//! post findings and indicate their outcome.
//!
//! Findings are shared with every procedure the session stages. Procedure
//! bodies run on worker threads, so the mapping sits behind a mutex.

use serde::Serialize;
use serde_json::Value;
use std::collections::BTreeMap;
use std::fmt;
use std::sync::{Arc, Mutex, MutexGuard, PoisonError};
use std::time::Duration;
use tracing::{debug, info};

use crate::error::{EngineError, Failure, Result};
use crate::handle::ProcedureHandle;
use crate::registry::Registry;
use crate::runner::ProcedureRunner;
use crate::status::SessionStatus;

/// Invocation parameters for a flow or a staged procedure
pub type Parameters = BTreeMap<String, Value>;

/// Named result values recorded by a flow
pub type Findings = BTreeMap<String, Value>;

/// Findings mapping shared between a session and the procedures it staged
#[derive(Debug, Clone, Default)]
pub(crate) struct SharedFindings(Arc<Mutex<Findings>>);

impl SharedFindings {
    // Every write is a single map operation, so a poisoned lock still holds a
    // consistent mapping.
    fn lock(&self) -> MutexGuard<'_, Findings> {
        self.0.lock().unwrap_or_else(PoisonError::into_inner)
    }

    pub(crate) fn insert(&self, name: String, value: Value) {
        self.lock().insert(name, value);
    }

    pub(crate) fn merge(&self, other: Findings) {
        self.lock().extend(other);
    }

    pub(crate) fn snapshot(&self) -> Findings {
        self.lock().clone()
    }
}

/// Final result of a flow invocation.
#[derive(Debug, Clone, Serialize)]
pub struct FlowOutcome {
    /// Flow name
    pub flow: String,
    /// Session status when the flow returned
    pub status: SessionStatus,
    /// Findings posted during the flow (including merged sub-flow findings)
    pub findings: Findings,
    /// Failure that escaped the flow body, if any
    #[serde(serialize_with = "serialize_failure")]
    pub failure: Option<Failure>,
    /// Wall time spent in the flow body
    #[serde(serialize_with = "serialize_duration")]
    pub elapsed: Duration,
}

impl FlowOutcome {
    /// Returns true if the flow indicated completion
    pub fn is_completed(&self) -> bool {
        self.status == SessionStatus::Completed
    }
}

fn serialize_failure<S: serde::Serializer>(
    failure: &Option<Failure>,
    serializer: S,
) -> std::result::Result<S::Ok, S::Error> {
    match failure {
        Some(failure) => serializer.serialize_some(&failure.to_string()),
        None => serializer.serialize_none(),
    }
}

fn serialize_duration<S: serde::Serializer>(
    elapsed: &Duration,
    serializer: S,
) -> std::result::Result<S::Ok, S::Error> {
    serializer.serialize_f64(elapsed.as_secs_f64())
}

/// Execution context for one flow invocation.
pub struct Session {
    registry: Arc<Registry>,
    flow: String,
    parameters: Parameters,
    findings: SharedFindings,
    status: Mutex<SessionStatus>,
}

impl Session {
    pub(crate) fn new(registry: Arc<Registry>, flow: &str, parameters: Parameters) -> Self {
        Self {
            registry,
            flow: flow.to_string(),
            parameters,
            findings: SharedFindings::default(),
            status: Mutex::new(SessionStatus::Unknown),
        }
    }

    /// Name of the flow this session belongs to
    pub fn flow(&self) -> &str {
        &self.flow
    }

    /// Invocation parameters
    pub fn parameters(&self) -> &Parameters {
        &self.parameters
    }

    /// Look up one invocation parameter
    pub fn parameter(&self, name: &str) -> Option<&Value> {
        self.parameters.get(name)
    }

    /// Snapshot of the findings posted so far
    pub fn findings(&self) -> Findings {
        self.findings.snapshot()
    }

    /// Current session status
    pub fn status(&self) -> SessionStatus {
        *self.lock_status()
    }

    /// Prepare a procedure invocation without starting it.
    ///
    /// # Errors
    ///
    /// - `ProcedureDoesNotExist` if no procedure is registered under `name`
    pub fn stage_procedure(&self, name: &str, parameters: Parameters) -> Result<ProcedureHandle> {
        let definition =
            self.registry
                .procedure_arc(name)
                .ok_or_else(|| EngineError::ProcedureDoesNotExist {
                    name: name.to_string(),
                })?;

        debug!(flow = %self.flow, procedure = name, "Staging procedure");
        let runner = ProcedureRunner::new(
            Arc::clone(&self.registry),
            definition,
            &self.flow,
            parameters,
            self.findings.clone(),
        );
        Ok(ProcedureHandle::new(runner))
    }

    /// Run another flow in a nested session.
    ///
    /// With `merge_findings`, the nested findings are merged into this
    /// session; nested keys overwrite existing keys of the same name.
    ///
    /// # Errors
    ///
    /// - `TestFlowDoesNotExist` if no flow is registered under `name`
    pub fn run_flow(
        &self,
        name: &str,
        merge_findings: bool,
        parameters: Parameters,
    ) -> Result<FlowOutcome> {
        info!(parent = %self.flow, flow = name, "Running nested flow");
        let outcome = self.registry.run_flow(name, parameters)?;
        if merge_findings {
            self.findings.merge(outcome.findings.clone());
        }
        Ok(outcome)
    }

    /// Insert or overwrite a finding
    pub fn post_finding(&self, name: impl Into<String>, value: impl Into<Value>) {
        let name = name.into();
        debug!(flow = %self.flow, finding = %name, "Posting finding");
        self.findings.insert(name, value.into());
    }

    /// Forward a message to the registry's log sink; a no-op without one
    pub fn log(&self, message: impl AsRef<str>) {
        if let Some(sink) = self.registry.log_sink() {
            sink(&self.flow, message.as_ref());
        }
    }

    /// Mark the session as completed
    ///
    /// # Errors
    ///
    /// - `SessionAlreadyConcluded` if an outcome was already indicated
    pub fn indicate_completion(&self) -> Result<()> {
        self.indicate(SessionStatus::Completed)
    }

    /// Mark the session as unable to complete
    ///
    /// # Errors
    ///
    /// - `SessionAlreadyConcluded` if an outcome was already indicated
    pub fn indicate_non_completion(&self) -> Result<()> {
        self.indicate(SessionStatus::CouldNotComplete)
    }

    /// Mark the session as excepted
    ///
    /// # Errors
    ///
    /// - `SessionAlreadyConcluded` if an outcome was already indicated
    pub fn indicate_exception(&self) -> Result<()> {
        self.indicate(SessionStatus::Excepted)
    }

    fn indicate(&self, next: SessionStatus) -> Result<()> {
        let mut status = self.lock_status();
        let current = *status;
        *status = current
            .transition(next)
            .map_err(|_| EngineError::SessionAlreadyConcluded {
                flow: self.flow.clone(),
                status: current,
            })?;
        info!(flow = %self.flow, status = %next, "Session outcome indicated");
        Ok(())
    }

    fn lock_status(&self) -> MutexGuard<'_, SessionStatus> {
        self.status.lock().unwrap_or_else(PoisonError::into_inner)
    }

    pub(crate) fn into_outcome(self, failure: Option<Failure>, elapsed: Duration) -> FlowOutcome {
        let status = self.status();
        FlowOutcome {
            flow: self.flow,
            status,
            findings: self.findings.snapshot(),
            failure,
            elapsed,
        }
    }
}

impl fmt::Debug for Session {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("Session")
            .field("flow", &self.flow)
            .field("parameters", &self.parameters)
            .field("status", &self.status())
            .finish_non_exhaustive()
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use serde_json::json;

    fn session() -> Session {
        Session::new(Arc::new(Registry::new()), "unit", Parameters::new())
    }

    #[test]
    fn test_session_starts_unknown_without_findings() {
        let session = session();
        assert_eq!(session.status(), SessionStatus::Unknown);
        assert!(session.findings().is_empty());
        assert_eq!(session.flow(), "unit");
    }

    #[test]
    fn test_post_finding_overwrites() {
        let session = session();
        session.post_finding("serial", "A1");
        session.post_finding("serial", "B2");
        assert_eq!(session.findings().get("serial"), Some(&json!("B2")));
    }

    #[test]
    fn test_outcome_indicated_once() {
        let session = session();
        session.indicate_non_completion().unwrap();
        assert_eq!(session.status(), SessionStatus::CouldNotComplete);

        let err = session.indicate_completion().unwrap_err();
        assert!(matches!(
            err,
            EngineError::SessionAlreadyConcluded {
                status: SessionStatus::CouldNotComplete,
                ..
            }
        ));
        assert_eq!(session.status(), SessionStatus::CouldNotComplete);
    }

    #[test]
    fn test_stage_unknown_procedure_fails() {
        let err = session()
            .stage_procedure("missing", Parameters::new())
            .unwrap_err();
        assert!(matches!(err, EngineError::ProcedureDoesNotExist { .. }));
    }

    #[test]
    fn test_log_without_sink_is_noop() {
        session().log("nobody is listening");
    }

    #[test]
    fn test_outcome_serializes_failure_as_text() {
        let outcome = FlowOutcome {
            flow: "f".to_string(),
            status: SessionStatus::Excepted,
            findings: Findings::new(),
            failure: Some(Failure::new(anyhow::anyhow!("fixture missing"))),
            elapsed: Duration::from_millis(1500),
        };
        let json = serde_json::to_value(&outcome).unwrap();
        assert_eq!(json["status"], json!("EXCEPTED"));
        assert_eq!(json["failure"], json!("fixture missing"));
        assert_eq!(json["elapsed"], json!(1.5));
    }
}
