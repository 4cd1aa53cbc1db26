//! Durable plan persistence
//!
//! One JSON document per plan, keyed by plan id (so the file backend writes
//! `<planID>.json`). The document nests the latest `execution_state` next
//! to the plan itself, which is what makes resume possible: an incomplete
//! execution can always be reloaded together with the plan it was running.

use crate::error::{EngineError, Result};
use crate::plan::Plan;
use crate::state::{ExecutionState, PlanStatus};
use opsmend_store::{BlobStore, StoreError};
use serde::{Deserialize, Serialize};
use std::sync::Arc;
use tracing::warn;

/// Persisted plan document: the plan plus its latest execution state
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct PlanRecord {
    /// The submitted plan
    #[serde(flatten)]
    pub plan: Plan,
    /// Latest execution state, absent until the plan first runs
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub execution_state: Option<ExecutionState>,
}

impl PlanRecord {
    /// Effective status: a plan that never ran counts as pending
    pub fn status(&self) -> PlanStatus {
        self.execution_state
            .as_ref()
            .map(|state| state.status)
            .unwrap_or(PlanStatus::Pending)
    }
}

/// Typed plan store over any [`BlobStore`]
pub struct PlanStore {
    blobs: Arc<dyn BlobStore>,
}

impl PlanStore {
    /// Store over the given backend
    pub fn new(blobs: Arc<dyn BlobStore>) -> Self {
        Self { blobs }
    }

    /// Persist a newly submitted plan with no execution state
    pub async fn save(&self, plan: &Plan) -> Result<()> {
        let record = PlanRecord {
            plan: plan.clone(),
            execution_state: None,
        };
        self.put_record(&record).await
    }

    /// Replace the stored plan, preserving its execution state
    pub async fn update(&self, plan: &Plan) -> Result<()> {
        let execution_state = match self.load(&plan.id).await {
            Ok(record) => record.execution_state,
            Err(e) if matches!(e, EngineError::NotFound(_)) => None,
            Err(e) => return Err(e),
        };
        let record = PlanRecord {
            plan: plan.clone(),
            execution_state,
        };
        self.put_record(&record).await
    }

    /// Attach the latest execution state to the stored plan
    pub async fn update_state(&self, plan_id: &str, state: &ExecutionState) -> Result<()> {
        let mut record = self.load(plan_id).await?;
        record.execution_state = Some(state.clone());
        self.put_record(&record).await
    }

    /// Load a plan document
    pub async fn load(&self, plan_id: &str) -> Result<PlanRecord> {
        let value = self.blobs.get(plan_id).await.map_err(|e| match e {
            StoreError::NotFound(_) => EngineError::NotFound(format!("plan '{plan_id}'")),
            other => EngineError::Storage(other),
        })?;
        Ok(serde_json::from_value(value)?)
    }

    /// Delete a plan document
    pub async fn delete(&self, plan_id: &str) -> Result<()> {
        self.blobs.delete(plan_id).await?;
        Ok(())
    }

    /// Plans whose effective status matches
    pub async fn list_by_state(&self, status: PlanStatus) -> Result<Vec<PlanRecord>> {
        Ok(self
            .list_all()
            .await?
            .into_iter()
            .filter(|record| record.status() == status)
            .collect())
    }

    /// Plans that still need work: pending, approved, or running
    pub async fn list_incomplete(&self) -> Result<Vec<PlanRecord>> {
        Ok(self
            .list_all()
            .await?
            .into_iter()
            .filter(|record| {
                matches!(
                    record.status(),
                    PlanStatus::Pending | PlanStatus::Approved | PlanStatus::Running
                )
            })
            .collect())
    }

    async fn list_all(&self) -> Result<Vec<PlanRecord>> {
        let mut records = Vec::new();
        for (key, value) in self.blobs.list("").await? {
            // other namespaces (state, snapshots, confirmations) share the
            // backend; plan documents are the unprefixed keys
            if key.contains(':') {
                continue;
            }
            match serde_json::from_value::<PlanRecord>(value) {
                Ok(record) => records.push(record),
                Err(e) => warn!(%key, error = %e, "skipping undecodable plan document"),
            }
        }
        Ok(records)
    }

    async fn put_record(&self, record: &PlanRecord) -> Result<()> {
        self.blobs
            .put(&record.plan.id, serde_json::to_value(record)?)
            .await?;
        Ok(())
    }
}
