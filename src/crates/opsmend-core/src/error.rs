//! Error types and error handling for plan execution
//!
//! This module defines all errors that can occur while validating, gating,
//! executing, and rolling back remediation plans. All errors implement
//! `std::error::Error` via the `thiserror` crate and expose a stable
//! [`ErrorKind`] plus an optional remediation [`suggestion`](EngineError::suggestion)
//! so callers can render them uniformly.

use opsmend_store::StoreError;
use thiserror::Error;

/// Convenience result type using [`EngineError`]
pub type Result<T> = std::result::Result<T, EngineError>;

/// Stable classification of an [`EngineError`], independent of its payload.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub enum ErrorKind {
    Validation,
    CyclicDependency,
    InvalidTransition,
    UnknownStepKind,
    StepDispatch,
    StepTimeout,
    ConfirmationTimeout,
    NoChannels,
    ConfirmationRejected,
    NotFound,
    RollbackFailed,
    SnapshotRestoreFailed,
    Cancelled,
    Storage,
    Internal,
}

/// Comprehensive error type for all plan-engine operations
#[derive(Error, Debug)]
pub enum EngineError {
    /// Plan failed structural validation (empty, duplicate ids, dangling
    /// dependencies, incompatible compensation)
    #[error("Plan validation failed: {0}")]
    Validation(String),

    /// The dependency relation between steps contains a cycle
    #[error("Cyclic dependency detected: {0}")]
    CyclicDependency(String),

    /// A (state, event) pair outside the legal transition table
    #[error("Invalid transition: cannot apply '{event}' in state '{state}'")]
    InvalidTransition {
        /// State the plan was in when the event arrived
        state: String,
        /// Event that was rejected
        event: String,
    },

    /// A step's kind has no capability wired to execute it
    #[error("No executor wired for step kind '{0}'")]
    UnknownStepKind(String),

    /// A step dispatch failed (missing tool, provider failure, expression
    /// error), surfaced verbatim after retry exhaustion
    #[error("Step '{step}' dispatch failed: {message}")]
    StepDispatch {
        /// Step that failed
        step: String,
        /// Kind-specific error message
        message: String,
    },

    /// A single dispatch exceeded the step's timeout
    #[error("Step '{step}' timed out after {duration_ms}ms")]
    StepTimeout {
        /// Step that timed out
        step: String,
        /// Configured timeout in milliseconds
        duration_ms: u64,
    },

    /// No confirmation channel answered before the deadline
    #[error("Confirmation timed out after {waited_ms}ms")]
    ConfirmationTimeout {
        /// How long the handler waited
        waited_ms: u64,
    },

    /// Confirmation was requested but no channels are configured
    #[error("No confirmation channels configured")]
    NoChannels,

    /// A confirmation channel answered with a rejection
    #[error("Confirmation rejected by '{approver}'")]
    ConfirmationRejected {
        /// Who rejected
        approver: String,
        /// Optional comment from the approver
        comment: Option<String>,
    },

    /// Plan, state, or snapshot not found
    #[error("Not found: {0}")]
    NotFound(String),

    /// One or more compensating actions failed
    #[error("Rollback failed: {0}")]
    RollbackFailed(String),

    /// Snapshot restoration failed for one or more targets
    #[error("Snapshot restore failed: {0}")]
    SnapshotRestoreFailed(String),

    /// Execution was cancelled by the caller
    #[error("execution cancelled")]
    Cancelled,

    /// Persistence layer failure
    #[error("Storage error: {0}")]
    Storage(#[from] StoreError),

    /// Unexpected internal failure
    #[error("Internal error: {0}")]
    Internal(String),
}

impl From<serde_json::Error> for EngineError {
    fn from(e: serde_json::Error) -> Self {
        EngineError::Storage(StoreError::Serialization(e))
    }
}

impl EngineError {
    /// Stable kind for this error
    pub fn kind(&self) -> ErrorKind {
        match self {
            EngineError::Validation(_) => ErrorKind::Validation,
            EngineError::CyclicDependency(_) => ErrorKind::CyclicDependency,
            EngineError::InvalidTransition { .. } => ErrorKind::InvalidTransition,
            EngineError::UnknownStepKind(_) => ErrorKind::UnknownStepKind,
            EngineError::StepDispatch { .. } => ErrorKind::StepDispatch,
            EngineError::StepTimeout { .. } => ErrorKind::StepTimeout,
            EngineError::ConfirmationTimeout { .. } => ErrorKind::ConfirmationTimeout,
            EngineError::NoChannels => ErrorKind::NoChannels,
            EngineError::ConfirmationRejected { .. } => ErrorKind::ConfirmationRejected,
            EngineError::NotFound(_) => ErrorKind::NotFound,
            EngineError::RollbackFailed(_) => ErrorKind::RollbackFailed,
            EngineError::SnapshotRestoreFailed(_) => ErrorKind::SnapshotRestoreFailed,
            EngineError::Cancelled => ErrorKind::Cancelled,
            EngineError::Storage(_) => ErrorKind::Storage,
            EngineError::Internal(_) => ErrorKind::Internal,
        }
    }

    /// Optional remediation hint for operators
    pub fn suggestion(&self) -> Option<&'static str> {
        match self {
            EngineError::Validation(_) => {
                Some("fix the plan structure: every step needs a unique id and resolvable dependencies")
            }
            EngineError::CyclicDependency(_) => {
                Some("break the dependency cycle between the listed steps")
            }
            EngineError::UnknownStepKind(_) => {
                Some("wire the matching capability (tool registry, model client, sub-plan runner) into the engine")
            }
            EngineError::StepTimeout { .. } => {
                Some("raise the step timeout or add a retry policy")
            }
            EngineError::ConfirmationTimeout { .. } => {
                Some("raise the confirmation timeout or add a faster channel")
            }
            EngineError::NoChannels => {
                Some("register at least one confirmation channel, or lower the plan's risk below the auto-confirm threshold")
            }
            EngineError::RollbackFailed(_) => {
                Some("inspect the per-step rollback errors and restore the remaining targets manually")
            }
            _ => None,
        }
    }

    /// True when this error means the caller cancelled
    pub fn is_cancelled(&self) -> bool {
        matches!(self, EngineError::Cancelled)
    }

    /// Create a step dispatch error with context
    pub fn dispatch(step: impl Into<String>, message: impl Into<String>) -> Self {
        Self::StepDispatch {
            step: step.into(),
            message: message.into(),
        }
    }

    /// Create an invalid transition error
    pub fn invalid_transition(state: impl Into<String>, event: impl Into<String>) -> Self {
        Self::InvalidTransition {
            state: state.into(),
            event: event.into(),
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_kind_is_stable_across_payloads() {
        let a = EngineError::dispatch("s1", "boom");
        let b = EngineError::dispatch("s2", "other");
        assert_eq!(a.kind(), b.kind());
        assert_eq!(a.kind(), ErrorKind::StepDispatch);
    }

    #[test]
    fn test_display_messages() {
        let err = EngineError::invalid_transition("Completed", "start");
        assert_eq!(
            err.to_string(),
            "Invalid transition: cannot apply 'start' in state 'Completed'"
        );

        let err = EngineError::Cancelled;
        assert_eq!(err.to_string(), "execution cancelled");
    }

    #[test]
    fn test_suggestions_present_where_actionable() {
        assert!(EngineError::NoChannels.suggestion().is_some());
        assert!(EngineError::Cancelled.suggestion().is_none());
    }

    #[test]
    fn test_store_error_converts() {
        let err: EngineError = StoreError::NotFound("plan:x".into()).into();
        assert_eq!(err.kind(), ErrorKind::Storage);
    }
}
