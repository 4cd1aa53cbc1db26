//! Compensating-action rollback
//!
//! After a plan fails, every completed step that declared a compensating
//! action is undone in reverse completion order. Each compensation runs as
//! a synthetic step of the same kind, inheriting the original step's
//! timeout and retry policy. Rollback is best-effort: a failing
//! compensation is recorded on the step and the loop continues, so partial
//! success is reported rather than aborted.

use crate::executor::StepExecutor;
use crate::plan::{Action, Plan, Step};
use crate::state::ExecutionState;
use serde_json::Value;
use std::collections::HashMap;
use std::sync::Arc;
use tokio_util::sync::CancellationToken;
use tracing::{info, warn};

/// Outcome of one rollback pass
#[derive(Debug, Clone, Default)]
pub struct RollbackReport {
    /// Steps whose compensation succeeded, in rollback order
    pub rolled_back: Vec<String>,
    /// Steps whose compensation failed, with the error message
    pub failures: Vec<(String, String)>,
}

impl RollbackReport {
    /// True when every attempted compensation succeeded
    pub fn success(&self) -> bool {
        self.failures.is_empty()
    }

    /// Human-readable summary
    pub fn summary(&self) -> String {
        if self.failures.is_empty() {
            format!("rolled back {} step(s)", self.rolled_back.len())
        } else {
            let failed: Vec<&str> = self.failures.iter().map(|(id, _)| id.as_str()).collect();
            format!(
                "rolled back {} step(s), {} failed: [{}]",
                self.rolled_back.len(),
                self.failures.len(),
                failed.join(", ")
            )
        }
    }
}

/// Runs compensating actions for completed steps
pub struct RollbackCoordinator {
    executor: Arc<StepExecutor>,
}

impl RollbackCoordinator {
    /// Coordinator reusing the engine's step executor
    pub fn new(executor: Arc<StepExecutor>) -> Self {
        Self { executor }
    }

    /// Completed steps that carry a compensating action, in reverse
    /// completion order
    pub fn rollbackable_steps<'a>(
        &self,
        plan: &'a Plan,
        state: &ExecutionState,
    ) -> Vec<&'a Step> {
        state
            .completed_step_ids()
            .iter()
            .rev()
            .filter_map(|id| plan.step(id))
            .filter(|step| step.compensation.is_some())
            .collect()
    }

    /// True when at least one completed step can be compensated
    pub fn can_rollback(&self, plan: &Plan, state: &ExecutionState) -> bool {
        !self.rollbackable_steps(plan, state).is_empty()
    }

    /// Run every compensating action, marking successfully undone steps
    /// `RolledBack` and recording failures on the step state.
    pub async fn rollback(
        &self,
        plan: &Plan,
        state: &mut ExecutionState,
        cancel: &CancellationToken,
    ) -> RollbackReport {
        let steps = self.rollbackable_steps(plan, state);
        info!(plan_id = %plan.id, steps = steps.len(), "starting compensating rollback");

        let bindings: HashMap<String, Value> = HashMap::new();
        let mut report = RollbackReport::default();
        for step in steps {
            let Some(compensation) = step.compensation.clone() else {
                continue;
            };
            let rollback_step = Self::synthetic_step(step, compensation);
            match self.executor.execute(&rollback_step, &bindings, cancel).await {
                Ok(_) => {
                    state.mark_step_rolled_back(&step.id);
                    report.rolled_back.push(step.id.clone());
                }
                Err(e) => {
                    warn!(step = %step.id, error = %e, "compensating action failed, continuing");
                    state.record_rollback_error(&step.id, format!("rollback failed: {e}"));
                    report.failures.push((step.id.clone(), e.to_string()));
                }
            }
        }

        info!(plan_id = %plan.id, summary = %report.summary(), "compensating rollback finished");
        report
    }

    /// Synthetic step that runs the compensation with the forward step's
    /// timeout and retry policy
    fn synthetic_step(step: &Step, compensation: Action) -> Step {
        Step {
            id: format!("{}-rollback", step.id),
            name: format!("rollback of {}", step.name),
            action: compensation,
            depends_on: Vec::new(),
            compensation: None,
            timeout_ms: step.timeout_ms,
            retry: step.retry.clone(),
        }
    }
}
