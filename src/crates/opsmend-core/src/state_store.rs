//! Per-plan execution state persistence
//!
//! [`StateStore`] is the pluggable backing for [`ExecutionState`] records.
//! Every save writes a deep-copied snapshot of the state, so mutating the
//! caller's object after the save never alters what was persisted.
//! [`MemoryStateStore`] backs tests; [`KvStateStore`] persists through any
//! [`BlobStore`] under `plan:`-prefixed keys in production.

use crate::error::{EngineError, Result};
use crate::state::ExecutionState;
use async_trait::async_trait;
use opsmend_store::{BlobStore, StoreError};
use parking_lot::RwLock;
use std::collections::HashMap;
use std::sync::Arc;
use tracing::warn;

/// Key prefix for execution state documents
const STATE_PREFIX: &str = "plan:";

/// Durable persistence of per-plan execution state
#[async_trait]
pub trait StateStore: Send + Sync {
    /// Persist a deep copy of the state
    async fn save(&self, state: &ExecutionState) -> Result<()>;

    /// Load the state for a plan
    async fn load(&self, plan_id: &str) -> Result<ExecutionState>;

    /// Delete the state for a plan (absent is not an error)
    async fn delete(&self, plan_id: &str) -> Result<()>;

    /// All stored states
    async fn list(&self) -> Result<Vec<ExecutionState>>;
}

/// In-memory state store for development and tests
#[derive(Default)]
pub struct MemoryStateStore {
    states: RwLock<HashMap<String, ExecutionState>>,
}

impl MemoryStateStore {
    /// Empty store
    pub fn new() -> Self {
        Self::default()
    }
}

#[async_trait]
impl StateStore for MemoryStateStore {
    async fn save(&self, state: &ExecutionState) -> Result<()> {
        // clone is a deep copy: ExecutionState owns all of its data
        self.states
            .write()
            .insert(state.plan_id.clone(), state.clone());
        Ok(())
    }

    async fn load(&self, plan_id: &str) -> Result<ExecutionState> {
        self.states
            .read()
            .get(plan_id)
            .cloned()
            .ok_or_else(|| EngineError::NotFound(format!("execution state '{plan_id}'")))
    }

    async fn delete(&self, plan_id: &str) -> Result<()> {
        self.states.write().remove(plan_id);
        Ok(())
    }

    async fn list(&self) -> Result<Vec<ExecutionState>> {
        let states = self.states.read();
        let mut all: Vec<ExecutionState> = states.values().cloned().collect();
        all.sort_by(|a, b| a.plan_id.cmp(&b.plan_id));
        Ok(all)
    }
}

/// Key-value state store over any [`BlobStore`]
pub struct KvStateStore {
    blobs: Arc<dyn BlobStore>,
}

impl KvStateStore {
    /// Store over the given backend
    pub fn new(blobs: Arc<dyn BlobStore>) -> Self {
        Self { blobs }
    }

    fn key(plan_id: &str) -> String {
        format!("{STATE_PREFIX}{plan_id}")
    }
}

#[async_trait]
impl StateStore for KvStateStore {
    async fn save(&self, state: &ExecutionState) -> Result<()> {
        // serialisation produces the deep copy
        self.blobs
            .put(&Self::key(&state.plan_id), serde_json::to_value(state)?)
            .await?;
        Ok(())
    }

    async fn load(&self, plan_id: &str) -> Result<ExecutionState> {
        let value = self
            .blobs
            .get(&Self::key(plan_id))
            .await
            .map_err(|e| match e {
                StoreError::NotFound(_) => {
                    EngineError::NotFound(format!("execution state '{plan_id}'"))
                }
                other => EngineError::Storage(other),
            })?;
        Ok(serde_json::from_value(value)?)
    }

    async fn delete(&self, plan_id: &str) -> Result<()> {
        self.blobs.delete(&Self::key(plan_id)).await?;
        Ok(())
    }

    async fn list(&self) -> Result<Vec<ExecutionState>> {
        let mut states = Vec::new();
        for (key, value) in self.blobs.list(STATE_PREFIX).await? {
            match serde_json::from_value(value) {
                Ok(state) => states.push(state),
                Err(e) => warn!(%key, error = %e, "skipping undecodable state document"),
            }
        }
        Ok(states)
    }
}
