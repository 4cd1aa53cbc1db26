//! Plan execution engine for opsmend
//!
//! opsmend is an AI-assisted operations agent for diagnosing and remediating
//! middleware (caches, databases, message brokers). This crate is its core
//! execution subsystem: it takes a structured multi-step remediation
//! [`Plan`], assesses its risk, obtains confirmation when the risk demands
//! it, captures a rollback checkpoint, executes the steps with
//! dependency-aware parallelism, and compensates on failure. Plans move
//! through a formal state machine with durable persistence, so incomplete
//! work is recoverable across process restarts.
//!
//! # Architecture
//!
//! ```text
//! ┌─────────────────────────────────────────────────────────────┐
//! │  PlanEngine                                                 │
//! │  validate → assess → confirm → checkpoint → execute →       │
//! │  reflect / rollback                                         │
//! └──┬──────────┬───────────┬────────────┬───────────┬──────────┘
//!    │          │           │            │           │
//!    ▼          ▼           ▼            ▼           ▼
//!  RiskAssessor │    SnapshotManager  DependencyGraph │
//!               ▼                        +            ▼
//!     ConfirmationHandler         ParallelExecutor  RollbackCoordinator
//!               │                        │
//!               ▼                        ▼
//!     ConfirmationChannels          StepExecutor ──► ToolRegistry
//!                                                    ModelClient
//!                                                    ConditionEvaluator
//!                                                    SubPlanRunner
//! ```
//!
//! Persistence flows through `opsmend-store`: plans as one JSON document
//! each (`PlanStore`), execution state under `plan:` keys (`StateStore`),
//! snapshots under `snap:` keys, confirmation records under `confirm:`.
//!
//! # Quick start
//!
//! ```rust,no_run
//! use opsmend_core::{Action, Plan, PlanEngine, Step};
//! use opsmend_store::MemoryBlobStore;
//! use std::collections::HashMap;
//! use std::sync::Arc;
//!
//! # async fn example(tools: Arc<dyn opsmend_core::ToolRegistry>) -> opsmend_core::Result<()> {
//! let engine = PlanEngine::builder(Arc::new(MemoryBlobStore::new()))
//!     .with_tools(tools)
//!     .build();
//!
//! let plan = Plan::new("clear hot keys")
//!     .with_step(Step::new("flush", "flush the cache", Action::ToolCall {
//!         tool: "shell".into(),
//!         args: HashMap::from([
//!             ("command".to_string(), serde_json::json!("redis-cli FLUSHDB")),
//!         ]),
//!     }));
//!
//! let state = engine.execute_plan(&plan).await?;
//! println!("finished: {}", state.status);
//! # Ok(())
//! # }
//! ```

pub mod confirm;
pub mod dag;
pub mod engine;
pub mod error;
pub mod events;
pub mod executor;
pub mod parallel;
pub mod plan;
pub mod plan_store;
pub mod risk;
pub mod rollback;
pub mod snapshot;
pub mod state;
pub mod state_machine;
pub mod state_store;

pub use confirm::{
    ConfirmationChannel, ConfirmationHandler, ConfirmationRequest, ConfirmationResponse,
};
pub use dag::DependencyGraph;
pub use engine::{EngineConfig, PlanEngine, PlanEngineBuilder};
pub use error::{EngineError, ErrorKind, Result};
pub use events::{EngineEvent, EventBus};
pub use executor::{
    ConditionEvaluator, DefaultConditionEvaluator, ModelClient, StepExecutor, SubPlanRunner,
    ToolRegistry,
};
pub use parallel::{ParallelExecutor, StepOutcome, DEFAULT_MAX_PARALLEL};
pub use plan::{Action, Plan, RetryPolicy, Step, StepKind};
pub use plan_store::{PlanRecord, PlanStore};
pub use risk::{
    ImpactEstimate, KeywordRule, RiskAssessment, RiskAssessor, RiskLevel, RiskRule,
    RiskThresholds, RuleOutcome,
};
pub use rollback::{RollbackCoordinator, RollbackReport};
pub use snapshot::{
    infer_targets, RestoreOutcome, RollbackResult, SnapshotCollector, SnapshotManager,
    StateSnapshot, TargetRef,
};
pub use state::{ExecutionState, PlanStatus, StepState, StepStatus};
pub use state_machine::{PlanEvent, PlanState, PlanStateMachine, TransitionListener};
pub use state_store::{KvStateStore, MemoryStateStore, StateStore};
