//! Plan engine orchestration
//!
//! [`PlanEngine`] ties the subsystem together: validate → assess → confirm →
//! checkpoint → execute level groups → reflect or roll back. It owns the
//! in-flight [`ExecutionState`] of every running plan (single writer per
//! plan id), the per-plan cancellation registry, and the stores that make
//! progress recoverable across restarts.

use crate::confirm::{ConfirmationChannel, ConfirmationHandler};
use crate::dag::DependencyGraph;
use crate::error::{EngineError, Result};
use crate::events::{EngineEvent, EventBus};
use crate::executor::{
    ConditionEvaluator, ModelClient, StepExecutor, SubPlanRunner, ToolRegistry,
};
use crate::parallel::{ParallelExecutor, StepOutcome, DEFAULT_MAX_PARALLEL};
use crate::plan::{Plan, Step};
use crate::plan_store::PlanStore;
use crate::risk::RiskAssessor;
use crate::rollback::RollbackCoordinator;
use crate::snapshot::{SnapshotCollector, SnapshotManager};
use crate::state::{ExecutionState, PlanStatus, StepStatus};
use crate::state_store::{KvStateStore, StateStore};
use crate::state_machine::{PlanEvent, PlanState, PlanStateMachine};
use async_trait::async_trait;
use chrono::Utc;
use dashmap::mapref::entry::Entry;
use dashmap::DashMap;
use opsmend_store::BlobStore;
use serde_json::Value;
use std::collections::HashMap;
use std::sync::{Arc, Weak};
use std::time::Duration;
use tokio_util::sync::CancellationToken;
use tracing::{debug, info, warn};

/// Engine tunables
#[derive(Debug, Clone)]
pub struct EngineConfig {
    /// Concurrency cap for parallel groups
    pub max_parallel: usize,
    /// How long the confirmation gate waits for an answer
    pub confirmation_timeout: Duration,
    /// Run snapshot restore and compensating actions on failure
    pub enable_rollback: bool,
    /// Run the post-execution evaluator on success
    pub enable_reflection: bool,
}

impl Default for EngineConfig {
    fn default() -> Self {
        Self {
            max_parallel: DEFAULT_MAX_PARALLEL,
            confirmation_timeout: Duration::from_secs(300),
            enable_rollback: true,
            enable_reflection: false,
        }
    }
}

/// Builder wiring stores, capabilities, and channels into an engine
pub struct PlanEngineBuilder {
    blobs: Arc<dyn BlobStore>,
    state_store: Option<Arc<dyn StateStore>>,
    tools: Option<Arc<dyn ToolRegistry>>,
    model: Option<Arc<dyn ModelClient>>,
    conditions: Option<Arc<dyn ConditionEvaluator>>,
    channels: Vec<Arc<dyn ConfirmationChannel>>,
    collectors: Vec<Arc<dyn SnapshotCollector>>,
    assessor: Option<RiskAssessor>,
    config: EngineConfig,
}

impl PlanEngineBuilder {
    /// Use an explicit state store instead of the blob-backed default
    pub fn with_state_store(mut self, state_store: Arc<dyn StateStore>) -> Self {
        self.state_store = Some(state_store);
        self
    }

    /// Wire the tool registry
    pub fn with_tools(mut self, tools: Arc<dyn ToolRegistry>) -> Self {
        self.tools = Some(tools);
        self
    }

    /// Wire the language-model client (sub-plan queries and reflection)
    pub fn with_model(mut self, model: Arc<dyn ModelClient>) -> Self {
        self.model = Some(model);
        self
    }

    /// Replace the built-in condition evaluator
    pub fn with_conditions(mut self, conditions: Arc<dyn ConditionEvaluator>) -> Self {
        self.conditions = Some(conditions);
        self
    }

    /// Add a confirmation channel
    pub fn with_channel(mut self, channel: Arc<dyn ConfirmationChannel>) -> Self {
        self.channels.push(channel);
        self
    }

    /// Register a snapshot collector
    pub fn with_collector(mut self, collector: Arc<dyn SnapshotCollector>) -> Self {
        self.collectors.push(collector);
        self
    }

    /// Replace the default risk assessor
    pub fn with_assessor(mut self, assessor: RiskAssessor) -> Self {
        self.assessor = Some(assessor);
        self
    }

    /// Override the engine configuration
    pub fn with_config(mut self, config: EngineConfig) -> Self {
        self.config = config;
        self
    }

    /// Assemble the engine
    pub fn build(self) -> Arc<PlanEngine> {
        Arc::new_cyclic(|weak: &Weak<PlanEngine>| {
            let mut executor = StepExecutor::new()
                .with_sub_plans(Arc::new(EngineSubPlans {
                    engine: weak.clone(),
                }));
            if let Some(tools) = self.tools {
                executor = executor.with_tools(tools);
            }
            if let Some(model) = &self.model {
                executor = executor.with_model(model.clone());
            }
            if let Some(conditions) = self.conditions {
                executor = executor.with_conditions(conditions);
            }
            let executor = Arc::new(executor);

            let mut snapshots = SnapshotManager::new(self.blobs.clone());
            for collector in self.collectors {
                snapshots.register(collector);
            }

            PlanEngine {
                plan_store: PlanStore::new(self.blobs.clone()),
                state_store: self
                    .state_store
                    .unwrap_or_else(|| Arc::new(KvStateStore::new(self.blobs.clone()))),
                assessor: self.assessor.unwrap_or_default(),
                confirmation: ConfirmationHandler::new(
                    self.channels,
                    self.config.confirmation_timeout,
                    self.blobs.clone(),
                ),
                snapshots,
                parallel: ParallelExecutor::new(executor.clone())
                    .with_max_parallel(self.config.max_parallel),
                rollback: RollbackCoordinator::new(executor.clone()),
                executor,
                events: EventBus::new(),
                active: DashMap::new(),
                paused: DashMap::new(),
                model: self.model,
                config: self.config,
            }
        })
    }
}

/// Orchestrates plan execution end to end
pub struct PlanEngine {
    plan_store: PlanStore,
    state_store: Arc<dyn StateStore>,
    assessor: RiskAssessor,
    confirmation: ConfirmationHandler,
    snapshots: SnapshotManager,
    executor: Arc<StepExecutor>,
    parallel: ParallelExecutor,
    rollback: RollbackCoordinator,
    events: EventBus,
    /// Cancellers of in-flight executions, keyed by plan id
    active: DashMap<String, CancellationToken>,
    /// Pause requests picked up at the next group boundary
    paused: DashMap<String, ()>,
    model: Option<Arc<dyn ModelClient>>,
    config: EngineConfig,
}

/// Sub-plan recursion adapter handed to the step executor
struct EngineSubPlans {
    engine: Weak<PlanEngine>,
}

#[async_trait]
impl SubPlanRunner for EngineSubPlans {
    async fn run_sub_plan(&self, plan_id: &str, cancel: &CancellationToken) -> Result<PlanStatus> {
        let engine = self
            .engine
            .upgrade()
            .ok_or_else(|| EngineError::Internal("engine was dropped".into()))?;
        let record = engine.plan_store.load(plan_id).await?;
        let state = engine
            .execute_with_parent(&record.plan, Some(cancel))
            .await?;
        Ok(state.status)
    }
}

impl PlanEngine {
    /// Start building an engine over the given blob backend
    pub fn builder(blobs: Arc<dyn BlobStore>) -> PlanEngineBuilder {
        PlanEngineBuilder {
            blobs,
            state_store: None,
            tools: None,
            model: None,
            conditions: None,
            channels: Vec::new(),
            collectors: Vec::new(),
            assessor: None,
            config: EngineConfig::default(),
        }
    }

    /// Event bus for execution progress
    pub fn events(&self) -> &EventBus {
        &self.events
    }

    /// Execute a plan to a terminal state.
    ///
    /// Returns the final [`ExecutionState`] for every terminal outcome
    /// (completed, failed, rolled back, or cancelled) with the aggregate
    /// error recorded on the state. Orchestration failures (validation,
    /// confirmation timeout, storage) are returned as errors.
    pub async fn execute_plan(&self, plan: &Plan) -> Result<ExecutionState> {
        self.execute_with_parent(plan, None).await
    }

    async fn execute_with_parent(
        &self,
        plan: &Plan,
        parent: Option<&CancellationToken>,
    ) -> Result<ExecutionState> {
        plan.validate()?;
        let cancel = match parent {
            Some(parent) => parent.child_token(),
            None => CancellationToken::new(),
        };
        self.register(&plan.id, cancel.clone())?;
        let result = self.run(plan, &cancel).await;
        self.active.remove(&plan.id);
        result
    }

    /// Latest execution state for a plan
    pub async fn get_state(&self, plan_id: &str) -> Result<ExecutionState> {
        self.state_store.load(plan_id).await
    }

    /// All stored execution states
    pub async fn list_executions(&self) -> Result<Vec<ExecutionState>> {
        self.state_store.list().await
    }

    /// Delete the stored execution state of an inactive plan
    pub async fn delete_execution(&self, plan_id: &str) -> Result<()> {
        if self.active.contains_key(plan_id) {
            return Err(EngineError::Internal(format!(
                "plan '{plan_id}' is still executing"
            )));
        }
        self.state_store.delete(plan_id).await
    }

    /// Cancel an in-flight execution.
    ///
    /// The running steps abort at their next suspension point; the
    /// orchestration task then finalises the state as `Cancelled` with the
    /// completion timestamp set.
    pub fn cancel_plan(&self, plan_id: &str) -> Result<()> {
        match self.active.get(plan_id) {
            Some(token) => {
                info!(plan_id, "cancelling plan execution");
                token.cancel();
                Ok(())
            }
            None => Err(EngineError::NotFound(format!(
                "no active execution for plan '{plan_id}'"
            ))),
        }
    }

    /// Pause a running plan. The orchestration loop stops at the next group
    /// boundary; [`resume_plan`](Self::resume_plan) continues from there.
    pub async fn pause_plan(&self, plan_id: &str) -> Result<()> {
        let mut state = self.state_store.load(plan_id).await?;
        if state.status != PlanStatus::Running {
            return Err(EngineError::invalid_transition(
                state.status.to_string(),
                "pause",
            ));
        }
        self.paused.insert(plan_id.to_string(), ());
        state.status = PlanStatus::Paused;
        self.persist(&state).await
    }

    /// Resume an incomplete plan from its persisted state.
    ///
    /// Requires the original plan to have been retained in the plan store;
    /// completed steps are skipped and the remaining groups run normally.
    pub async fn resume_plan(&self, plan_id: &str) -> Result<ExecutionState> {
        let mut state = self.state_store.load(plan_id).await?;
        if state.status.is_terminal() {
            return Err(EngineError::invalid_transition(
                state.status.to_string(),
                "resume",
            ));
        }
        let record = self.plan_store.load(plan_id).await.map_err(|_| {
            EngineError::Internal(format!(
                "resume not supported: original plan for '{plan_id}' was not retained"
            ))
        })?;

        let cancel = CancellationToken::new();
        self.register(plan_id, cancel.clone())?;
        info!(plan_id, "resuming plan execution");

        let machine = self.machine_for(plan_id);
        state.status = PlanStatus::Running;
        self.persist_warn(&state).await;
        let result = async {
            machine.transition(PlanEvent::Approve)?;
            machine.transition(PlanEvent::Start)?;
            self.run_groups(&record.plan, &mut state, &machine, &cancel, String::new())
                .await
        }
        .await;
        self.active.remove(plan_id);
        result
    }

    fn register(&self, plan_id: &str, cancel: CancellationToken) -> Result<()> {
        self.paused.remove(plan_id);
        match self.active.entry(plan_id.to_string()) {
            Entry::Occupied(_) => Err(EngineError::Internal(format!(
                "plan '{plan_id}' is already executing"
            ))),
            Entry::Vacant(entry) => {
                entry.insert(cancel);
                Ok(())
            }
        }
    }

    /// Machine wired to forward transitions onto the event bus
    fn machine_for(&self, plan_id: &str) -> PlanStateMachine {
        let machine = PlanStateMachine::new();
        let events = self.events.clone();
        let plan_id = plan_id.to_string();
        machine.add_listener(Arc::new(
            move |from: PlanState, event: PlanEvent, to: PlanState| {
                events.publish(EngineEvent::PlanTransition {
                    plan_id: plan_id.clone(),
                    from,
                    event,
                    to,
                    at: Utc::now(),
                });
            },
        ));
        machine
    }

    async fn run(&self, plan: &Plan, cancel: &CancellationToken) -> Result<ExecutionState> {
        info!(plan_id = %plan.id, steps = plan.steps.len(), "executing plan");

        let mut plan = plan.clone();
        let mut state = ExecutionState::new(&plan.id);
        for step in &plan.steps {
            state.steps.entry(step.id.clone()).or_default();
        }
        self.ensure_plan_saved(&plan).await?;
        self.persist(&state).await?;

        let machine = self.machine_for(&plan.id);

        let assessment = self.assessor.assess(&plan);
        debug!(plan_id = %plan.id, score = assessment.score, level = %assessment.level,
               "risk assessed");
        plan.risk = Some(assessment.clone());
        if let Err(e) = self.plan_store.update(&plan).await {
            warn!(plan_id = %plan.id, error = %e, "failed to persist risk assessment");
        }

        if assessment.requires_confirm {
            state.status = PlanStatus::Pending;
            self.persist_warn(&state).await;
            match self
                .confirmation
                .request_confirmation(&plan, &assessment, cancel)
                .await
            {
                Ok(response) if response.approved => {
                    machine.transition(PlanEvent::Approve)?;
                    state.status = PlanStatus::Approved;
                    self.persist_warn(&state).await;
                }
                Ok(response) => {
                    info!(plan_id = %plan.id, approver = %response.approver,
                          "plan rejected by approver");
                    let rejection = EngineError::ConfirmationRejected {
                        approver: response.approver,
                        comment: response.comment,
                    };
                    let _ = machine.transition(PlanEvent::Cancel);
                    state.finish(PlanStatus::Cancelled, Some(rejection.to_string()));
                    self.persist_warn(&state).await;
                    return Ok(state);
                }
                Err(e) => {
                    let _ = machine.transition(PlanEvent::Cancel);
                    state.finish(PlanStatus::Cancelled, Some(e.to_string()));
                    self.persist_warn(&state).await;
                    return Err(e);
                }
            }
        } else {
            machine.transition(PlanEvent::Approve)?;
            state.status = PlanStatus::Approved;
        }

        let checkpoint_id = match self.snapshots.create_checkpoint(&plan, cancel).await {
            Ok(id) => {
                if !id.is_empty() {
                    self.events.publish(EngineEvent::CheckpointCreated {
                        plan_id: plan.id.clone(),
                        checkpoint_id: id.clone(),
                        at: Utc::now(),
                    });
                }
                id
            }
            Err(e) if e.is_cancelled() => return Ok(self.finalize_cancelled(&mut state).await),
            Err(e) => {
                // execution proceeds without a restore point
                warn!(plan_id = %plan.id, error = %e, "checkpoint creation failed");
                String::new()
            }
        };

        machine.transition(PlanEvent::Start)?;
        state.status = PlanStatus::Running;
        self.persist_warn(&state).await;

        self.run_groups(&plan, &mut state, &machine, cancel, checkpoint_id)
            .await
    }

    /// Execute the DAG level groups, then apply success or failure handling
    async fn run_groups(
        &self,
        plan: &Plan,
        state: &mut ExecutionState,
        machine: &PlanStateMachine,
        cancel: &CancellationToken,
        checkpoint_id: String,
    ) -> Result<ExecutionState> {
        let graph = DependencyGraph::build(&plan.steps);
        let groups = graph.parallel_groups()?;

        let mut bindings: HashMap<String, Value> = state
            .steps
            .iter()
            .filter(|(_, s)| s.status == StepStatus::Completed)
            .map(|(id, s)| (id.clone(), s.output.clone().unwrap_or(Value::Null)))
            .collect();
        let mut failed_steps: Vec<String> = Vec::new();

        for group in groups {
            if self.paused.remove(&plan.id).is_some() {
                state.status = PlanStatus::Paused;
                self.persist_warn(state).await;
                info!(plan_id = %plan.id, "execution paused at group boundary");
                return Ok(state.clone());
            }
            if cancel.is_cancelled() {
                return Ok(self.finalize_cancelled(state).await);
            }

            let steps: Vec<Step> = group
                .iter()
                .filter(|id| state.step(id).status != StepStatus::Completed)
                .filter_map(|id| plan.step(id).cloned())
                .collect();
            if steps.is_empty() {
                continue;
            }

            for step in &steps {
                state.mark_step_running(&step.id);
                self.events.publish(EngineEvent::StepStarted {
                    plan_id: plan.id.clone(),
                    step_id: step.id.clone(),
                    at: Utc::now(),
                });
            }
            self.persist_warn(state).await;

            let outcomes: Vec<StepOutcome> = if steps.len() == 1 {
                let step = &steps[0];
                let result = self.executor.execute(step, &bindings, cancel).await;
                vec![StepOutcome {
                    step_id: step.id.clone(),
                    result,
                }]
            } else {
                self.parallel.execute_group(&steps, &bindings, cancel).await
            };

            let mut group_failed = false;
            for outcome in outcomes {
                let status = match outcome.result {
                    Ok(output) => {
                        bindings.insert(outcome.step_id.clone(), output.clone());
                        state.mark_step_completed(&outcome.step_id, output);
                        StepStatus::Completed
                    }
                    Err(e) => {
                        group_failed = true;
                        state.mark_step_failed(&outcome.step_id, e.to_string());
                        failed_steps.push(outcome.step_id.clone());
                        StepStatus::Failed
                    }
                };
                self.events.publish(EngineEvent::StepFinished {
                    plan_id: plan.id.clone(),
                    step_id: outcome.step_id,
                    status,
                    at: Utc::now(),
                });
            }
            self.persist_warn(state).await;

            if cancel.is_cancelled() {
                return Ok(self.finalize_cancelled(state).await);
            }
            if group_failed {
                break;
            }
        }

        if !failed_steps.is_empty() {
            return self
                .handle_failure(plan, state, machine, cancel, checkpoint_id, failed_steps)
                .await;
        }

        machine.transition(PlanEvent::Complete)?;
        state.finish(PlanStatus::Completed, None);
        self.persist_warn(state).await;
        info!(plan_id = %plan.id, "plan completed");

        if self.config.enable_reflection {
            self.reflect(plan, state, cancel).await;
        }
        Ok(state.clone())
    }

    /// Mark the plan failed, then try both rollback paths: snapshot restore
    /// first, per-step compensations after
    async fn handle_failure(
        &self,
        plan: &Plan,
        state: &mut ExecutionState,
        machine: &PlanStateMachine,
        cancel: &CancellationToken,
        checkpoint_id: String,
        failed_steps: Vec<String>,
    ) -> Result<ExecutionState> {
        let aggregate = format!("step(s) [{}] failed", failed_steps.join(", "));
        warn!(plan_id = %plan.id, %aggregate, "plan execution failed");

        machine.transition(PlanEvent::Fail)?;
        state.skip_pending_steps();
        state.finish(PlanStatus::Failed, Some(aggregate.clone()));
        self.persist_warn(state).await;

        if !self.config.enable_rollback || !self.rollback.can_rollback(plan, state) {
            return Ok(state.clone());
        }

        // snapshot restore first, compensating actions after; the source
        // system runs both and so do we
        let snapshot_ok = if checkpoint_id.is_empty() {
            true
        } else {
            match self.snapshots.restore(&checkpoint_id, plan, cancel).await {
                Ok(result) => {
                    if !result.success {
                        warn!(plan_id = %plan.id, message = %result.message,
                              "snapshot restore incomplete");
                    }
                    result.success
                }
                Err(e) => {
                    warn!(plan_id = %plan.id, error = %e, "snapshot restore errored");
                    false
                }
            }
        };

        let report = self.rollback.rollback(plan, state, cancel).await;
        let rolled_back = snapshot_ok && report.success();
        self.events.publish(EngineEvent::RollbackFinished {
            plan_id: plan.id.clone(),
            success: rolled_back,
            at: Utc::now(),
        });

        if rolled_back {
            machine.transition(PlanEvent::Rollback)?;
            state.status = PlanStatus::RolledBack;
        } else {
            // keep the execution error visible next to the rollback detail
            let detail = EngineError::RollbackFailed(report.summary());
            state.error = Some(format!("{aggregate}; {detail}"));
        }
        self.persist_warn(state).await;
        Ok(state.clone())
    }

    /// Finalise a cancelled execution: abort marks, terminal state, audit
    async fn finalize_cancelled(&self, state: &mut ExecutionState) -> ExecutionState {
        for step_state in state.steps.values_mut() {
            if step_state.status == StepStatus::Running {
                step_state.status = StepStatus::Failed;
                step_state.finished_at = Some(Utc::now());
                step_state.error = Some("execution cancelled".into());
            }
        }
        state.skip_pending_steps();
        state.finish(PlanStatus::Cancelled, Some("execution cancelled".into()));
        self.persist_warn(state).await;
        info!(plan_id = %state.plan_id, "plan execution cancelled");
        state.clone()
    }

    async fn reflect(&self, plan: &Plan, state: &ExecutionState, cancel: &CancellationToken) {
        let Some(model) = &self.model else { return };
        let outcomes: Vec<String> = plan
            .steps
            .iter()
            .map(|step| format!("{}={}", step.id, state.step(&step.id).status))
            .collect();
        let prompt = format!(
            "Remediation plan '{}' finished with status {}. Step outcomes: {}. \
             In two sentences, judge whether the remediation was sound and name one improvement.",
            plan.name,
            state.status,
            outcomes.join(", ")
        );
        match model.complete(&prompt, cancel).await {
            Ok(summary) => {
                info!(plan_id = %plan.id, %summary, "post-execution reflection");
                self.events.publish(EngineEvent::Reflection {
                    plan_id: plan.id.clone(),
                    summary,
                    at: Utc::now(),
                });
            }
            Err(e) => warn!(plan_id = %plan.id, error = %e, "reflection failed"),
        }
    }

    async fn ensure_plan_saved(&self, plan: &Plan) -> Result<()> {
        match self.plan_store.load(&plan.id).await {
            Ok(_) => Ok(()),
            Err(EngineError::NotFound(_)) => self.plan_store.save(plan).await,
            Err(e) => Err(e),
        }
    }

    async fn persist(&self, state: &ExecutionState) -> Result<()> {
        self.state_store.save(state).await?;
        self.plan_store.update_state(&state.plan_id, state).await
    }

    /// Persistence failures mid-execution are logged, never fatal
    async fn persist_warn(&self, state: &ExecutionState) {
        if let Err(e) = self.persist(state).await {
            warn!(plan_id = %state.plan_id, error = %e, "failed to persist execution state");
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::plan::Action;
    use opsmend_store::MemoryBlobStore;
    use serde_json::json;

    struct OkTools;

    #[async_trait]
    impl ToolRegistry for OkTools {
        async fn run(
            &self,
            _tool: &str,
            _args: &HashMap<String, Value>,
            _cancel: &CancellationToken,
        ) -> Result<Value> {
            Ok(json!("ok"))
        }
    }

    fn engine() -> Arc<PlanEngine> {
        PlanEngine::builder(Arc::new(MemoryBlobStore::new()))
            .with_tools(Arc::new(OkTools))
            .build()
    }

    fn simple_plan(id: &str) -> Plan {
        Plan::new("simple").with_id(id).with_step(Step::new(
            "only",
            "only step",
            Action::ToolCall {
                tool: "shell".into(),
                args: HashMap::new(),
            },
        ))
    }

    #[tokio::test]
    async fn test_simple_plan_completes() {
        let engine = engine();
        let state = engine.execute_plan(&simple_plan("p1")).await.unwrap();
        assert_eq!(state.status, PlanStatus::Completed);
        assert!(state.completed_at.is_some());
        assert_eq!(state.step("only").status, StepStatus::Completed);

        // state is queryable afterwards
        let loaded = engine.get_state("p1").await.unwrap();
        assert_eq!(loaded.status, PlanStatus::Completed);
        assert_eq!(engine.list_executions().await.unwrap().len(), 1);
    }

    #[tokio::test]
    async fn test_invalid_plan_is_rejected() {
        let engine = engine();
        let err = engine.execute_plan(&Plan::new("empty")).await.unwrap_err();
        assert!(matches!(err, EngineError::Validation(_)));
    }

    #[tokio::test]
    async fn test_cancel_unknown_plan_is_not_found() {
        let engine = engine();
        assert!(matches!(
            engine.cancel_plan("nope").unwrap_err(),
            EngineError::NotFound(_)
        ));
    }

    #[tokio::test]
    async fn test_delete_execution_of_finished_plan() {
        let engine = engine();
        engine.execute_plan(&simple_plan("p1")).await.unwrap();
        engine.delete_execution("p1").await.unwrap();
        assert!(matches!(
            engine.get_state("p1").await.unwrap_err(),
            EngineError::NotFound(_)
        ));
    }

    #[tokio::test]
    async fn test_sub_plan_output_is_terminal_status() {
        let blobs = Arc::new(MemoryBlobStore::new());
        let engine = PlanEngine::builder(blobs)
            .with_tools(Arc::new(OkTools))
            .build();

        let child = simple_plan("child");
        // the sub-plan must be stored so the engine can load it by id
        engine.plan_store.save(&child).await.unwrap();

        let parent = Plan::new("parent").with_id("parent").with_step(Step::new(
            "nest",
            "run child",
            Action::SubPlan {
                plan_id: "child".into(),
            },
        ));
        let state = engine.execute_plan(&parent).await.unwrap();
        assert_eq!(state.status, PlanStatus::Completed);
        assert_eq!(state.step("nest").output, Some(json!("Completed")));

        // the child's execution state was stored under its own id
        let child_state = engine.get_state("child").await.unwrap();
        assert_eq!(child_state.status, PlanStatus::Completed);
    }

    #[tokio::test]
    async fn test_resume_without_retained_plan_is_rejected() {
        let engine = engine();
        let state = ExecutionState::new("orphan");
        engine.state_store.save(&state).await.unwrap();

        let err = engine.resume_plan("orphan").await.unwrap_err();
        assert!(err.to_string().contains("not supported"));
    }

    #[tokio::test]
    async fn test_pause_requires_running_state() {
        let engine = engine();
        engine.execute_plan(&simple_plan("p1")).await.unwrap();
        let err = engine.pause_plan("p1").await.unwrap_err();
        assert!(matches!(err, EngineError::InvalidTransition { .. }));
    }
}
