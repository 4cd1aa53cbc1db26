//! Execution state for plans and steps
//!
//! [`ExecutionState`] is the per-plan mutable record the engine owns while a
//! plan runs and the stores persist between runs. Step states move forward
//! only (`Pending → Running → Completed/Failed/Skipped`), with the single
//! legal exception `Failed → RolledBack` applied by the rollback paths.

use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};
use serde_json::Value;
use std::collections::HashMap;

/// Overall status of a plan's execution
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
pub enum PlanStatus {
    /// Submitted, awaiting confirmation
    Pending,
    /// Confirmed, not yet started
    Approved,
    /// Steps are executing
    Running,
    /// Execution suspended by the caller
    Paused,
    /// Every step completed
    Completed,
    /// At least one step failed
    Failed,
    /// Failure was compensated
    RolledBack,
    /// Cancelled by the caller or by a rejected confirmation
    Cancelled,
}

impl PlanStatus {
    /// Terminal statuses never change again
    pub fn is_terminal(&self) -> bool {
        matches!(
            self,
            PlanStatus::Completed
                | PlanStatus::Failed
                | PlanStatus::RolledBack
                | PlanStatus::Cancelled
        )
    }
}

impl std::fmt::Display for PlanStatus {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        let name = match self {
            PlanStatus::Pending => "Pending",
            PlanStatus::Approved => "Approved",
            PlanStatus::Running => "Running",
            PlanStatus::Paused => "Paused",
            PlanStatus::Completed => "Completed",
            PlanStatus::Failed => "Failed",
            PlanStatus::RolledBack => "RolledBack",
            PlanStatus::Cancelled => "Cancelled",
        };
        write!(f, "{name}")
    }
}

/// Status of a single step
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
pub enum StepStatus {
    /// Not yet dispatched
    Pending,
    /// Dispatch in flight
    Running,
    /// Finished successfully
    Completed,
    /// Dispatch failed after retry exhaustion
    Failed,
    /// Never dispatched because an earlier group failed
    Skipped,
    /// Completed, then undone by its compensating action
    RolledBack,
}

impl std::fmt::Display for StepStatus {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        let name = match self {
            StepStatus::Pending => "Pending",
            StepStatus::Running => "Running",
            StepStatus::Completed => "Completed",
            StepStatus::Failed => "Failed",
            StepStatus::Skipped => "Skipped",
            StepStatus::RolledBack => "RolledBack",
        };
        write!(f, "{name}")
    }
}

/// Mutable execution record of one step
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct StepState {
    /// Current status
    pub status: StepStatus,
    /// When the dispatch started
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub started_at: Option<DateTime<Utc>>,
    /// When the step reached a terminal status
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub finished_at: Option<DateTime<Utc>>,
    /// Output value of a successful dispatch
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub output: Option<Value>,
    /// Error message of a failed dispatch or rollback
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub error: Option<String>,
}

impl Default for StepState {
    fn default() -> Self {
        Self {
            status: StepStatus::Pending,
            started_at: None,
            finished_at: None,
            output: None,
            error: None,
        }
    }
}

/// Per-plan mutable execution state
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct ExecutionState {
    /// Plan this state belongs to
    pub plan_id: String,
    /// Overall status
    pub status: PlanStatus,
    /// Per-step states keyed by step id
    #[serde(default)]
    pub steps: HashMap<String, StepState>,
    /// When execution started
    pub started_at: DateTime<Utc>,
    /// Set when a terminal status is reached
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub completed_at: Option<DateTime<Utc>>,
    /// Aggregate error of a failed or cancelled run
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub error: Option<String>,
}

impl ExecutionState {
    /// Fresh state for a plan about to run
    pub fn new(plan_id: impl Into<String>) -> Self {
        Self {
            plan_id: plan_id.into(),
            status: PlanStatus::Running,
            steps: HashMap::new(),
            started_at: Utc::now(),
            completed_at: None,
            error: None,
        }
    }

    /// State of one step, defaulting to pending
    pub fn step(&self, step_id: &str) -> StepState {
        self.steps.get(step_id).cloned().unwrap_or_default()
    }

    /// Mark a step as dispatched
    pub fn mark_step_running(&mut self, step_id: &str) {
        let entry = self.steps.entry(step_id.to_string()).or_default();
        entry.status = StepStatus::Running;
        entry.started_at = Some(Utc::now());
    }

    /// Mark a step completed with its output
    pub fn mark_step_completed(&mut self, step_id: &str, output: Value) {
        let entry = self.steps.entry(step_id.to_string()).or_default();
        entry.status = StepStatus::Completed;
        entry.finished_at = Some(Utc::now());
        entry.output = Some(output);
        entry.error = None;
    }

    /// Mark a step failed with its error message
    pub fn mark_step_failed(&mut self, step_id: &str, error: impl Into<String>) {
        let entry = self.steps.entry(step_id.to_string()).or_default();
        entry.status = StepStatus::Failed;
        entry.finished_at = Some(Utc::now());
        entry.error = Some(error.into());
    }

    /// Mark every still-pending step as skipped
    pub fn skip_pending_steps(&mut self) {
        for state in self.steps.values_mut() {
            if state.status == StepStatus::Pending {
                state.status = StepStatus::Skipped;
            }
        }
    }

    /// Apply the one legal backward step transition, `Failed`/`Completed` →
    /// `RolledBack` (completed steps are rolled back by compensation;
    /// failed plans roll the whole set back via snapshot restore)
    pub fn mark_step_rolled_back(&mut self, step_id: &str) {
        let entry = self.steps.entry(step_id.to_string()).or_default();
        entry.status = StepStatus::RolledBack;
    }

    /// Record a rollback failure on the step without changing its status
    pub fn record_rollback_error(&mut self, step_id: &str, error: impl Into<String>) {
        let entry = self.steps.entry(step_id.to_string()).or_default();
        entry.error = Some(error.into());
    }

    /// Move to a terminal status, stamping the completion time
    pub fn finish(&mut self, status: PlanStatus, error: Option<String>) {
        debug_assert!(status.is_terminal());
        self.status = status;
        self.completed_at = Some(Utc::now());
        if error.is_some() {
            self.error = error;
        }
    }

    /// Ids of steps currently completed, ordered by completion time
    pub fn completed_step_ids(&self) -> Vec<String> {
        let mut completed: Vec<(&String, DateTime<Utc>)> = self
            .steps
            .iter()
            .filter(|(_, s)| s.status == StepStatus::Completed)
            .map(|(id, s)| (id, s.finished_at.unwrap_or(self.started_at)))
            .collect();
        completed.sort_by_key(|(_, at)| *at);
        completed.into_iter().map(|(id, _)| id.clone()).collect()
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use serde_json::json;

    #[test]
    fn test_terminal_statuses() {
        assert!(PlanStatus::Completed.is_terminal());
        assert!(PlanStatus::Failed.is_terminal());
        assert!(PlanStatus::RolledBack.is_terminal());
        assert!(PlanStatus::Cancelled.is_terminal());
        assert!(!PlanStatus::Running.is_terminal());
        assert!(!PlanStatus::Paused.is_terminal());
    }

    #[test]
    fn test_step_lifecycle() {
        let mut state = ExecutionState::new("p1");
        assert_eq!(state.step("a").status, StepStatus::Pending);

        state.mark_step_running("a");
        assert_eq!(state.step("a").status, StepStatus::Running);
        assert!(state.step("a").started_at.is_some());

        state.mark_step_completed("a", json!("ok"));
        let a = state.step("a");
        assert_eq!(a.status, StepStatus::Completed);
        assert_eq!(a.output, Some(json!("ok")));
        assert!(a.finished_at.is_some());
    }

    #[test]
    fn test_finish_sets_completion_timestamp() {
        let mut state = ExecutionState::new("p1");
        state.finish(PlanStatus::Failed, Some("step a failed".into()));
        assert_eq!(state.status, PlanStatus::Failed);
        assert!(state.completed_at.is_some());
        assert_eq!(state.error.as_deref(), Some("step a failed"));
    }

    #[test]
    fn test_completed_ids_ordered_by_finish_time() {
        let mut state = ExecutionState::new("p1");
        state.mark_step_completed("first", json!(1));
        std::thread::sleep(std::time::Duration::from_millis(2));
        state.mark_step_completed("second", json!(2));
        assert_eq!(state.completed_step_ids(), vec!["first", "second"]);
    }

    #[test]
    fn test_skip_pending_leaves_finished_steps_alone() {
        let mut state = ExecutionState::new("p1");
        state.mark_step_completed("done", json!(1));
        state.mark_step_failed("bad", "boom");
        state.steps.entry("later".into()).or_default();

        state.skip_pending_steps();
        assert_eq!(state.step("done").status, StepStatus::Completed);
        assert_eq!(state.step("bad").status, StepStatus::Failed);
        assert_eq!(state.step("later").status, StepStatus::Skipped);
    }

    #[test]
    fn test_serde_roundtrip() {
        let mut state = ExecutionState::new("p1");
        state.mark_step_completed("a", json!({"rows": 3}));
        state.finish(PlanStatus::Completed, None);

        let raw = serde_json::to_string(&state).unwrap();
        let back: ExecutionState = serde_json::from_str(&raw).unwrap();
        assert_eq!(state, back);
    }
}
