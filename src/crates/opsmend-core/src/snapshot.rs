//! Snapshot checkpoints for rollback
//!
//! Before a plan executes, the [`SnapshotManager`] captures the state of
//! every middleware target the plan is expected to touch. On failure the
//! snapshots are restored in reverse creation order, independently of (and
//! before) per-step compensating actions.
//!
//! Targets are inferred from step command text by keyword family. This is a
//! temporary contract: structured per-step target metadata should replace
//! the heuristic, which is why the mapping lives in one function,
//! [`infer_targets`].

use crate::error::{EngineError, Result};
use crate::plan::Plan;
use async_trait::async_trait;
use chrono::{DateTime, Utc};
use opsmend_store::BlobStore;
use serde::{Deserialize, Serialize};
use serde_json::Value;
use std::collections::HashMap;
use std::sync::Arc;
use tokio_util::sync::CancellationToken;
use tracing::{debug, info, warn};
use uuid::Uuid;

/// A middleware instance snapshots are taken of
#[derive(Debug, Clone, PartialEq, Eq, Hash, Serialize, Deserialize)]
pub struct TargetRef {
    /// Target kind, matched against collector registrations
    pub kind: String,
    /// Target identifier
    pub id: String,
}

impl TargetRef {
    /// Build a target reference
    pub fn new(kind: impl Into<String>, id: impl Into<String>) -> Self {
        Self {
            kind: kind.into(),
            id: id.into(),
        }
    }
}

/// Keyword families for target inference, checked in order
const TARGET_FAMILIES: &[(&str, &str, &[&str])] = &[
    ("redis", "redis-main", &["REDIS", "FLUSHALL", "FLUSHDB"]),
    ("mysql", "mysql-main", &["MYSQL", "SET GLOBAL"]),
    ("postgres", "postgres-main", &["POSTGRES", "PSQL", "VACUUM"]),
    ("kafka", "kafka-main", &["KAFKA"]),
];

/// Infer the set of targets a plan touches from its step command text.
///
/// Any step command mentioning a family keyword yields that family's single
/// well-known target (for example every redis-family keyword maps to
/// `redis-main`). Families are reported at most once, in declaration order.
pub fn infer_targets(plan: &Plan) -> Vec<TargetRef> {
    let mut targets = Vec::new();
    for (kind, id, keywords) in TARGET_FAMILIES {
        let mentioned = plan.steps.iter().any(|step| {
            let text = step.command_text().to_uppercase();
            keywords.iter().any(|kw| text.contains(kw))
        });
        if mentioned {
            targets.push(TargetRef::new(*kind, *id));
        }
    }
    targets
}

/// Opaque captured state for one target
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct StateSnapshot {
    /// Composite identifier `<checkpointID>-<targetID>`
    pub id: String,
    /// Plan the snapshot was taken for
    pub plan_id: String,
    /// Target kind (collector registry key)
    pub target_kind: String,
    /// Target identifier
    pub target_id: String,
    /// Captured state, interpreted only by the collector that produced it
    pub state: Value,
    /// Free-form annotations
    #[serde(default)]
    pub metadata: HashMap<String, String>,
    /// Creation timestamp (restore order is descending on this)
    pub created_at: DateTime<Utc>,
}

/// Captures and restores state for the target kinds it declares
#[async_trait]
pub trait SnapshotCollector: Send + Sync {
    /// Target kinds this collector supports
    fn kinds(&self) -> Vec<String>;

    /// Capture the target's state as an opaque serialisable payload
    async fn collect(&self, target: &TargetRef, cancel: &CancellationToken) -> Result<Value>;

    /// Restore a snapshot previously produced by this collector
    async fn restore(&self, snapshot: &StateSnapshot, cancel: &CancellationToken) -> Result<()>;
}

/// Per-target outcome of a restore pass
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct RestoreOutcome {
    /// Target the outcome is about
    pub target_id: String,
    /// Whether restoration succeeded
    pub success: bool,
    /// Human-readable detail
    pub message: String,
}

/// Aggregate result of restoring a checkpoint
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct RollbackResult {
    /// True iff every detailed outcome succeeded
    pub success: bool,
    /// Aggregate summary
    pub message: String,
    /// Per-target outcomes, in restore order
    pub details: Vec<RestoreOutcome>,
}

impl RollbackResult {
    fn nothing_to_rollback() -> Self {
        Self {
            success: true,
            message: "nothing to rollback".into(),
            details: Vec::new(),
        }
    }
}

/// Registry of collectors plus checkpoint persistence
pub struct SnapshotManager {
    collectors: HashMap<String, Arc<dyn SnapshotCollector>>,
    store: Arc<dyn BlobStore>,
}

impl SnapshotManager {
    /// Manager with no collectors registered
    pub fn new(store: Arc<dyn BlobStore>) -> Self {
        Self {
            collectors: HashMap::new(),
            store,
        }
    }

    /// Register a collector under every kind it declares
    pub fn register(&mut self, collector: Arc<dyn SnapshotCollector>) {
        for kind in collector.kinds() {
            self.collectors.insert(kind, collector.clone());
        }
    }

    /// Kinds that currently have a collector
    pub fn registered_kinds(&self) -> Vec<&str> {
        let mut kinds: Vec<&str> = self.collectors.keys().map(String::as_str).collect();
        kinds.sort();
        kinds
    }

    /// Capture a checkpoint for the plan's inferred targets.
    ///
    /// Returns an empty checkpoint id when no targets could be inferred, in
    /// which case snapshot restore is skipped on failure. A target whose
    /// collection fails is skipped with a warning; the checkpoint keeps the
    /// snapshots that did succeed.
    pub async fn create_checkpoint(
        &self,
        plan: &Plan,
        cancel: &CancellationToken,
    ) -> Result<String> {
        let targets = infer_targets(plan);
        if targets.is_empty() {
            debug!(plan_id = %plan.id, "no snapshot targets inferred");
            return Ok(String::new());
        }

        let checkpoint_id = format!("ckpt-{}", Uuid::new_v4());
        let mut captured = 0usize;
        for target in &targets {
            if cancel.is_cancelled() {
                return Err(EngineError::Cancelled);
            }
            let Some(collector) = self.collectors.get(&target.kind) else {
                warn!(kind = %target.kind, target = %target.id, "no collector registered, skipping target");
                continue;
            };
            let state = match collector.collect(target, cancel).await {
                Ok(state) => state,
                Err(e) => {
                    warn!(target = %target.id, error = %e, "snapshot collection failed, skipping target");
                    continue;
                }
            };

            let snapshot = StateSnapshot {
                id: format!("{checkpoint_id}-{}", target.id),
                plan_id: plan.id.clone(),
                target_kind: target.kind.clone(),
                target_id: target.id.clone(),
                state,
                metadata: HashMap::from([("plan_name".to_string(), plan.name.clone())]),
                created_at: Utc::now(),
            };
            self.store
                .put(
                    &format!("snap:{}", snapshot.id),
                    serde_json::to_value(&snapshot)?,
                )
                .await?;
            captured += 1;
        }

        info!(plan_id = %plan.id, %checkpoint_id, captured, "checkpoint created");
        Ok(checkpoint_id)
    }

    /// Restore every snapshot of the checkpoint, newest first.
    ///
    /// Missing snapshots are not an error: the result says there was
    /// nothing to roll back.
    pub async fn restore(
        &self,
        checkpoint_id: &str,
        plan: &Plan,
        cancel: &CancellationToken,
    ) -> Result<RollbackResult> {
        if checkpoint_id.is_empty() {
            return Ok(RollbackResult::nothing_to_rollback());
        }

        let mut snapshots: Vec<StateSnapshot> = self
            .store
            .list(&format!("snap:{checkpoint_id}-"))
            .await?
            .into_iter()
            .filter_map(|(key, value)| match serde_json::from_value(value) {
                Ok(snapshot) => Some(snapshot),
                Err(e) => {
                    warn!(%key, error = %e, "skipping undecodable snapshot");
                    None
                }
            })
            .filter(|snapshot: &StateSnapshot| snapshot.plan_id == plan.id)
            .collect();
        if snapshots.is_empty() {
            return Ok(RollbackResult::nothing_to_rollback());
        }
        snapshots.sort_by(|a, b| b.created_at.cmp(&a.created_at));

        let mut details = Vec::with_capacity(snapshots.len());
        for snapshot in &snapshots {
            if cancel.is_cancelled() {
                return Err(EngineError::Cancelled);
            }
            let outcome = match self.collectors.get(&snapshot.target_kind) {
                None => RestoreOutcome {
                    target_id: snapshot.target_id.clone(),
                    success: false,
                    message: format!("no collector for kind '{}'", snapshot.target_kind),
                },
                Some(collector) => match collector.restore(snapshot, cancel).await {
                    Ok(()) => RestoreOutcome {
                        target_id: snapshot.target_id.clone(),
                        success: true,
                        message: "restored".into(),
                    },
                    Err(e) => RestoreOutcome {
                        target_id: snapshot.target_id.clone(),
                        success: false,
                        message: e.to_string(),
                    },
                },
            };
            debug!(target = %outcome.target_id, success = outcome.success, "snapshot restore outcome");
            details.push(outcome);
        }

        let success = details.iter().all(|d| d.success);
        let message = if success {
            format!("restored {} snapshot(s)", details.len())
        } else {
            let failed: Vec<&str> = details
                .iter()
                .filter(|d| !d.success)
                .map(|d| d.target_id.as_str())
                .collect();
            format!("restore failed for [{}]", failed.join(", "))
        };
        Ok(RollbackResult {
            success,
            message,
            details,
        })
    }

    /// Delete every snapshot belonging to a checkpoint (administrative)
    pub async fn delete_checkpoint(&self, checkpoint_id: &str) -> Result<usize> {
        if checkpoint_id.is_empty() {
            return Ok(0);
        }
        let entries = self.store.list(&format!("snap:{checkpoint_id}-")).await?;
        let mut deleted = 0usize;
        for (key, _) in entries {
            self.store.delete(&key).await?;
            deleted += 1;
        }
        Ok(deleted)
    }
}
