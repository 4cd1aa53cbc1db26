//! Bounded parallel execution of independent steps
//!
//! One DAG level group at a time: every step in the group is spawned
//! concurrently under a semaphore cap, and the group result is only
//! returned once every submitted step reached a terminal outcome. The
//! group never short-circuits on the first failure; the engine needs all
//! peer outcomes to mark failures atomically and honour per-step retry
//! policies.

use crate::error::{EngineError, Result};
use crate::executor::StepExecutor;
use crate::plan::Step;
use serde_json::Value;
use std::collections::HashMap;
use std::sync::Arc;
use tokio::sync::Semaphore;
use tokio_util::sync::CancellationToken;
use tracing::{debug, error};

/// Default concurrency cap
pub const DEFAULT_MAX_PARALLEL: usize = 10;

/// Terminal outcome of one step in a group
#[derive(Debug)]
pub struct StepOutcome {
    /// Step the outcome belongs to
    pub step_id: String,
    /// Output on success, error on failure
    pub result: Result<Value>,
}

/// Runs a set of independent steps concurrently under a cap
pub struct ParallelExecutor {
    executor: Arc<StepExecutor>,
    max_parallel: usize,
}

impl ParallelExecutor {
    /// Executor with the default cap
    pub fn new(executor: Arc<StepExecutor>) -> Self {
        Self {
            executor,
            max_parallel: DEFAULT_MAX_PARALLEL,
        }
    }

    /// Override the concurrency cap (must be at least 1)
    pub fn with_max_parallel(mut self, max_parallel: usize) -> Self {
        self.max_parallel = max_parallel.max(1);
        self
    }

    /// Configured cap
    pub fn max_parallel(&self) -> usize {
        self.max_parallel
    }

    /// Execute every step of a group, returning outcomes in group order.
    ///
    /// Steps beyond the cap queue behind the semaphore. Each step reaches a
    /// terminal outcome before this returns, even when peers fail or the
    /// token is cancelled mid-group (cancelled steps report `Cancelled`).
    pub async fn execute_group(
        &self,
        steps: &[Step],
        bindings: &HashMap<String, Value>,
        cancel: &CancellationToken,
    ) -> Vec<StepOutcome> {
        debug!(steps = steps.len(), cap = self.max_parallel, "executing parallel group");
        let semaphore = Arc::new(Semaphore::new(self.max_parallel));

        let mut handles = Vec::with_capacity(steps.len());
        for step in steps {
            let step = step.clone();
            let step_id = step.id.clone();
            let bindings = bindings.clone();
            let cancel = cancel.clone();
            let executor = self.executor.clone();
            let semaphore = semaphore.clone();
            let handle = tokio::spawn(async move {
                let _permit = match semaphore.acquire_owned().await {
                    Ok(permit) => permit,
                    Err(_) => return Err(EngineError::Cancelled),
                };
                executor.execute(&step, &bindings, &cancel).await
            });
            handles.push((step_id, handle));
        }

        let mut outcomes = Vec::with_capacity(handles.len());
        for (step_id, handle) in handles {
            let result = match handle.await {
                Ok(result) => result,
                Err(e) => {
                    error!(step = %step_id, error = %e, "step task aborted");
                    Err(EngineError::Internal(format!("step task aborted: {e}")))
                }
            };
            outcomes.push(StepOutcome { step_id, result });
        }
        outcomes
    }
}
