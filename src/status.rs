//! Status vocabularies for procedure runners and sessions
//!
//! Both enums encode their legal transitions so the runner and the session
//! cannot move through states the engine does not define.
//!
//! # Procedure lifecycle
//!
//! ```text
//! Staged
//!   ├──→ DependencyException          (tool lookup or construction failed)
//!   └──→ Ongoing
//!          ├──→ Completed             (body returned Ok)
//!          └──→ Excepted              (body returned Err or panicked)
//!
//! Cancelled, Crashed: reserved, never emitted
//! ```
//!
//! # Session lifecycle
//!
//! ```text
//! Unknown ──→ Completed | CouldNotComplete | Excepted   (exactly once)
//! ```

use serde::{Deserialize, Serialize};
use strum::{Display, EnumIter, EnumString};
use thiserror::Error;

/// Status of a single staged procedure invocation.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[derive(Display, EnumString, EnumIter)]
#[strum(serialize_all = "SCREAMING_SNAKE_CASE")]
#[serde(rename_all = "SCREAMING_SNAKE_CASE")]
pub enum ProcedureStatus {
    /// Created by `stage_procedure`, not yet started
    Staged,

    /// A declared tool could not be resolved or constructed (terminal)
    DependencyException,

    /// The procedure body is executing
    Ongoing,

    /// The procedure body returned a value (terminal)
    Completed,

    /// The procedure body failed (terminal)
    Excepted,

    /// Reserved for cooperative cancellation
    Cancelled,

    /// Reserved for fatal-fault signaling
    Crashed,
}

impl ProcedureStatus {
    /// Returns true once the runner can no longer change state
    #[inline]
    pub const fn is_terminal(self) -> bool {
        matches!(
            self,
            Self::DependencyException
                | Self::Completed
                | Self::Excepted
                | Self::Cancelled
                | Self::Crashed
        )
    }

    /// Returns true for the terminal states that represent a failure
    #[inline]
    pub const fn is_failure(self) -> bool {
        matches!(
            self,
            Self::DependencyException | Self::Excepted | Self::Cancelled | Self::Crashed
        )
    }

    /// Returns true if `next` is a legal successor of this status
    pub const fn can_transition_to(self, next: Self) -> bool {
        matches!(
            (self, next),
            (Self::Staged, Self::DependencyException)
                | (Self::Staged, Self::Ongoing)
                | (Self::Ongoing, Self::Completed)
                | (Self::Ongoing, Self::Excepted)
        )
    }

    /// Validate a transition, returning the target on success
    pub fn transition(self, next: Self) -> Result<Self, StatusTransitionError> {
        if self.is_terminal() {
            return Err(StatusTransitionError::FromTerminalState {
                from: self.to_string(),
            });
        }
        if !self.can_transition_to(next) {
            return Err(StatusTransitionError::Illegal {
                from: self.to_string(),
                to: next.to_string(),
            });
        }
        Ok(next)
    }
}

/// Overall outcome of a session.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Default, Serialize, Deserialize)]
#[derive(Display, EnumString, EnumIter)]
#[strum(serialize_all = "SCREAMING_SNAKE_CASE")]
#[serde(rename_all = "SCREAMING_SNAKE_CASE")]
pub enum SessionStatus {
    /// No outcome indicated yet
    #[default]
    Unknown,

    /// The flow indicated completion
    Completed,

    /// The flow indicated it could not complete
    CouldNotComplete,

    /// The flow indicated an exception, or its body failed
    Excepted,
}

impl SessionStatus {
    /// Returns true once an outcome has been indicated
    #[inline]
    pub const fn is_terminal(self) -> bool {
        !matches!(self, Self::Unknown)
    }

    /// Validate an indication, returning the target on success
    pub fn transition(self, next: Self) -> Result<Self, StatusTransitionError> {
        if self.is_terminal() {
            return Err(StatusTransitionError::FromTerminalState {
                from: self.to_string(),
            });
        }
        if !next.is_terminal() {
            return Err(StatusTransitionError::Illegal {
                from: self.to_string(),
                to: next.to_string(),
            });
        }
        Ok(next)
    }
}

/// Errors that can occur during status transitions
#[derive(Error, Debug, Clone, PartialEq, Eq)]
pub enum StatusTransitionError {
    /// Attempted to leave a terminal state
    #[error("Cannot transition from terminal state {from}")]
    FromTerminalState { from: String },

    /// Attempted a transition the lifecycle does not define
    #[error("Illegal transition from {from} to {to}")]
    Illegal { from: String, to: String },
}
