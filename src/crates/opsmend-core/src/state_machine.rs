//! Plan lifecycle state machine
//!
//! Enforces the legal plan transitions:
//!
//! ```text
//! Pending   --approve-->  Approved
//! Pending   --cancel-->   Cancelled
//! Approved  --start-->    Executing
//! Approved  --cancel-->   Cancelled
//! Executing --complete--> Completed
//! Executing --fail-->     Failed
//! Failed    --rollback--> RolledBack
//! Failed    --retry-->    Pending
//! ```
//!
//! Any other (state, event) pair fails with `InvalidTransition`. Listeners
//! are notified after the state has changed; a panicking listener is
//! isolated and logged, never aborting the transition.

use crate::error::{EngineError, Result};
use crate::state::PlanStatus;
use parking_lot::RwLock;
use serde::{Deserialize, Serialize};
use std::panic::{catch_unwind, AssertUnwindSafe};
use std::sync::Arc;
use tracing::warn;

/// Lifecycle states of a plan
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
pub enum PlanState {
    Pending,
    Approved,
    Executing,
    Completed,
    Failed,
    RolledBack,
    Cancelled,
}

impl PlanState {
    /// Terminal states accept no further events (`retry` reopens only via
    /// `Failed`, which is not terminal)
    pub fn is_terminal(&self) -> bool {
        matches!(
            self,
            PlanState::Completed | PlanState::Cancelled | PlanState::RolledBack
        )
    }

    /// Persisted status corresponding to this lifecycle state
    pub fn as_status(&self) -> PlanStatus {
        match self {
            PlanState::Pending => PlanStatus::Pending,
            PlanState::Approved => PlanStatus::Approved,
            PlanState::Executing => PlanStatus::Running,
            PlanState::Completed => PlanStatus::Completed,
            PlanState::Failed => PlanStatus::Failed,
            PlanState::RolledBack => PlanStatus::RolledBack,
            PlanState::Cancelled => PlanStatus::Cancelled,
        }
    }
}

impl std::fmt::Display for PlanState {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        let name = match self {
            PlanState::Pending => "Pending",
            PlanState::Approved => "Approved",
            PlanState::Executing => "Executing",
            PlanState::Completed => "Completed",
            PlanState::Failed => "Failed",
            PlanState::RolledBack => "RolledBack",
            PlanState::Cancelled => "Cancelled",
        };
        write!(f, "{name}")
    }
}

/// Events that drive plan transitions
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
pub enum PlanEvent {
    Approve,
    Cancel,
    Start,
    Complete,
    Fail,
    Rollback,
    Retry,
}

impl std::fmt::Display for PlanEvent {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        let name = match self {
            PlanEvent::Approve => "approve",
            PlanEvent::Cancel => "cancel",
            PlanEvent::Start => "start",
            PlanEvent::Complete => "complete",
            PlanEvent::Fail => "fail",
            PlanEvent::Rollback => "rollback",
            PlanEvent::Retry => "retry",
        };
        write!(f, "{name}")
    }
}

/// Observer notified after each successful transition
pub trait TransitionListener: Send + Sync {
    fn on_transition(&self, from: PlanState, event: PlanEvent, to: PlanState);
}

impl<F> TransitionListener for F
where
    F: Fn(PlanState, PlanEvent, PlanState) + Send + Sync,
{
    fn on_transition(&self, from: PlanState, event: PlanEvent, to: PlanState) {
        self(from, event, to)
    }
}

/// State machine for one plan's lifecycle
pub struct PlanStateMachine {
    state: RwLock<PlanState>,
    listeners: RwLock<Vec<Arc<dyn TransitionListener>>>,
}

impl PlanStateMachine {
    /// Machine for a freshly submitted plan
    pub fn new() -> Self {
        Self::starting_at(PlanState::Pending)
    }

    /// Machine resumed at a known state
    pub fn starting_at(state: PlanState) -> Self {
        Self {
            state: RwLock::new(state),
            listeners: RwLock::new(Vec::new()),
        }
    }

    /// Current state
    pub fn state(&self) -> PlanState {
        *self.state.read()
    }

    /// Register a transition listener
    pub fn add_listener(&self, listener: Arc<dyn TransitionListener>) {
        self.listeners.write().push(listener);
    }

    /// Target state for a (state, event) pair, if the pair is legal
    pub fn next_state(state: PlanState, event: PlanEvent) -> Option<PlanState> {
        use PlanEvent::*;
        use PlanState::*;
        match (state, event) {
            (Pending, Approve) => Some(Approved),
            (Pending, Cancel) => Some(Cancelled),
            (Approved, Start) => Some(Executing),
            (Approved, Cancel) => Some(Cancelled),
            (Executing, Complete) => Some(Completed),
            (Executing, Fail) => Some(Failed),
            (Failed, Rollback) => Some(RolledBack),
            (Failed, Retry) => Some(Pending),
            _ => None,
        }
    }

    /// Apply an event, returning the new state.
    ///
    /// The state is updated before listeners run, so a listener reading the
    /// machine observes the post-transition state.
    pub fn transition(&self, event: PlanEvent) -> Result<PlanState> {
        let (from, to) = {
            let mut state = self.state.write();
            let from = *state;
            let to = Self::next_state(from, event).ok_or_else(|| {
                EngineError::invalid_transition(from.to_string(), event.to_string())
            })?;
            *state = to;
            (from, to)
        };

        for listener in self.listeners.read().iter() {
            let result = catch_unwind(AssertUnwindSafe(|| {
                listener.on_transition(from, event, to);
            }));
            if result.is_err() {
                warn!(%from, %event, %to, "transition listener panicked");
            }
        }
        Ok(to)
    }
}

impl Default for PlanStateMachine {
    fn default() -> Self {
        Self::new()
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::sync::atomic::{AtomicUsize, Ordering};

    const ALL_STATES: [PlanState; 7] = [
        PlanState::Pending,
        PlanState::Approved,
        PlanState::Executing,
        PlanState::Completed,
        PlanState::Failed,
        PlanState::RolledBack,
        PlanState::Cancelled,
    ];

    const ALL_EVENTS: [PlanEvent; 7] = [
        PlanEvent::Approve,
        PlanEvent::Cancel,
        PlanEvent::Start,
        PlanEvent::Complete,
        PlanEvent::Fail,
        PlanEvent::Rollback,
        PlanEvent::Retry,
    ];

    /// The eight rows of the transition table, and nothing else
    #[test]
    fn test_transition_table_is_exact() {
        let legal = [
            (PlanState::Pending, PlanEvent::Approve, PlanState::Approved),
            (PlanState::Pending, PlanEvent::Cancel, PlanState::Cancelled),
            (PlanState::Approved, PlanEvent::Start, PlanState::Executing),
            (PlanState::Approved, PlanEvent::Cancel, PlanState::Cancelled),
            (PlanState::Executing, PlanEvent::Complete, PlanState::Completed),
            (PlanState::Executing, PlanEvent::Fail, PlanState::Failed),
            (PlanState::Failed, PlanEvent::Rollback, PlanState::RolledBack),
            (PlanState::Failed, PlanEvent::Retry, PlanState::Pending),
        ];

        for state in ALL_STATES {
            for event in ALL_EVENTS {
                let expected = legal
                    .iter()
                    .find(|(s, e, _)| *s == state && *e == event)
                    .map(|(_, _, to)| *to);
                assert_eq!(
                    PlanStateMachine::next_state(state, event),
                    expected,
                    "({state}, {event})"
                );
            }
        }
    }

    #[test]
    fn test_invalid_transition_errors_and_keeps_state() {
        let machine = PlanStateMachine::new();
        let err = machine.transition(PlanEvent::Complete).unwrap_err();
        assert!(err.to_string().contains("complete"));
        assert_eq!(machine.state(), PlanState::Pending);
    }

    #[test]
    fn test_full_success_path() {
        let machine = PlanStateMachine::new();
        machine.transition(PlanEvent::Approve).unwrap();
        machine.transition(PlanEvent::Start).unwrap();
        machine.transition(PlanEvent::Complete).unwrap();
        assert_eq!(machine.state(), PlanState::Completed);
        assert!(machine.state().is_terminal());
    }

    #[test]
    fn test_retry_reopens_failed_plan() {
        let machine = PlanStateMachine::starting_at(PlanState::Failed);
        machine.transition(PlanEvent::Retry).unwrap();
        assert_eq!(machine.state(), PlanState::Pending);
    }

    #[test]
    fn test_listeners_run_after_change() {
        let machine = PlanStateMachine::new();
        let seen = Arc::new(AtomicUsize::new(0));
        let seen_clone = seen.clone();
        machine.add_listener(Arc::new(
            move |from: PlanState, _event: PlanEvent, to: PlanState| {
                assert_eq!(from, PlanState::Pending);
                assert_eq!(to, PlanState::Approved);
                seen_clone.fetch_add(1, Ordering::SeqCst);
            },
        ));
        machine.transition(PlanEvent::Approve).unwrap();
        assert_eq!(seen.load(Ordering::SeqCst), 1);
    }

    #[test]
    fn test_panicking_listener_does_not_abort_transition() {
        let machine = PlanStateMachine::new();
        machine.add_listener(Arc::new(
            |_: PlanState, _: PlanEvent, _: PlanState| panic!("listener bug"),
        ));
        let to = machine.transition(PlanEvent::Approve).unwrap();
        assert_eq!(to, PlanState::Approved);
        assert_eq!(machine.state(), PlanState::Approved);
    }
}
