//! Engine telemetry events
//!
//! The engine emits an [`EngineEvent`] at every state-machine transition and
//! every step outcome. Callers subscribe through the [`EventBus`], a
//! broadcast fan-out: publishing with no subscribers is a no-op, and slow
//! subscribers lag rather than block the engine.

use crate::state::StepStatus;
use crate::state_machine::{PlanEvent, PlanState};
use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};
use tokio::sync::broadcast;
use tokio_stream::wrappers::BroadcastStream;

/// Default buffer for the broadcast channel
const DEFAULT_CAPACITY: usize = 256;

/// One telemetry event, tagged with plan/step identity and timestamp
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(tag = "type", rename_all = "snake_case")]
pub enum EngineEvent {
    /// The plan state machine transitioned
    PlanTransition {
        plan_id: String,
        from: PlanState,
        event: PlanEvent,
        to: PlanState,
        at: DateTime<Utc>,
    },
    /// A step was dispatched
    StepStarted {
        plan_id: String,
        step_id: String,
        at: DateTime<Utc>,
    },
    /// A step reached a terminal status
    StepFinished {
        plan_id: String,
        step_id: String,
        status: StepStatus,
        at: DateTime<Utc>,
    },
    /// A snapshot checkpoint was captured before execution
    CheckpointCreated {
        plan_id: String,
        checkpoint_id: String,
        at: DateTime<Utc>,
    },
    /// A rollback pass (snapshot restore and/or compensation) finished
    RollbackFinished {
        plan_id: String,
        success: bool,
        at: DateTime<Utc>,
    },
    /// The post-execution evaluator produced a critique
    Reflection {
        plan_id: String,
        summary: String,
        at: DateTime<Utc>,
    },
}

impl EngineEvent {
    /// Plan the event belongs to
    pub fn plan_id(&self) -> &str {
        match self {
            EngineEvent::PlanTransition { plan_id, .. }
            | EngineEvent::StepStarted { plan_id, .. }
            | EngineEvent::StepFinished { plan_id, .. }
            | EngineEvent::CheckpointCreated { plan_id, .. }
            | EngineEvent::RollbackFinished { plan_id, .. }
            | EngineEvent::Reflection { plan_id, .. } => plan_id,
        }
    }
}

/// Broadcast fan-out of engine events
#[derive(Clone)]
pub struct EventBus {
    tx: broadcast::Sender<EngineEvent>,
}

impl EventBus {
    /// Bus with the default buffer
    pub fn new() -> Self {
        Self::with_capacity(DEFAULT_CAPACITY)
    }

    /// Bus with an explicit buffer
    pub fn with_capacity(capacity: usize) -> Self {
        let (tx, _) = broadcast::channel(capacity.max(1));
        Self { tx }
    }

    /// Publish an event. Without subscribers this is a no-op.
    pub fn publish(&self, event: EngineEvent) {
        let _ = self.tx.send(event);
    }

    /// Subscribe to all events from this point on
    pub fn subscribe(&self) -> broadcast::Receiver<EngineEvent> {
        self.tx.subscribe()
    }

    /// Subscribe as an async stream
    pub fn stream(&self) -> BroadcastStream<EngineEvent> {
        BroadcastStream::new(self.tx.subscribe())
    }
}

impl Default for EventBus {
    fn default() -> Self {
        Self::new()
    }
}
