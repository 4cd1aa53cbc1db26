//! Interactive confirmation gate
//!
//! Risky plans pause before execution until a human answers. The
//! [`ConfirmationHandler`] fans one [`ConfirmationRequest`] out to every
//! configured [`ConfirmationChannel`] concurrently and takes the first
//! response that arrives; approval or rejection, whichever is faster, ends
//! the wait. The race also covers the configured timeout and the caller's
//! cancellation token, so a dead channel can never hang an execution.

use crate::error::{EngineError, Result};
use crate::plan::Plan;
use crate::risk::{ImpactEstimate, RiskAssessment, RiskLevel};
use async_trait::async_trait;
use chrono::{DateTime, Utc};
use opsmend_store::BlobStore;
use serde::{Deserialize, Serialize};
use std::sync::Arc;
use std::time::Duration;
use tokio::sync::mpsc;
use tokio_util::sync::CancellationToken;
use tracing::{debug, info, warn};
use uuid::Uuid;

/// What an approver is asked to confirm
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct ConfirmationRequest {
    /// Request identifier
    pub id: String,
    /// Plan awaiting confirmation
    pub plan_id: String,
    /// One summary per step, by name
    pub summaries: Vec<String>,
    /// Assessed risk level
    pub risk_level: RiskLevel,
    /// Why the plan is considered risky
    pub reasons: Vec<String>,
    /// Estimated impact
    pub impact: ImpactEstimate,
    /// Who asked for the confirmation
    pub requested_by: String,
    /// When the request was created
    pub created_at: DateTime<Utc>,
}

/// An approver's decision
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct ConfirmationResponse {
    /// True to approve execution
    pub approved: bool,
    /// Who answered
    pub approver: String,
    /// Optional comment
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub comment: Option<String>,
    /// When the answer was given
    pub responded_at: DateTime<Utc>,
}

impl ConfirmationResponse {
    /// An approval from the given approver
    pub fn approved(approver: impl Into<String>) -> Self {
        Self {
            approved: true,
            approver: approver.into(),
            comment: None,
            responded_at: Utc::now(),
        }
    }

    /// A rejection from the given approver
    pub fn rejected(approver: impl Into<String>) -> Self {
        Self {
            approved: false,
            approver: approver.into(),
            comment: None,
            responded_at: Utc::now(),
        }
    }

    /// Attach a comment
    pub fn with_comment(mut self, comment: impl Into<String>) -> Self {
        self.comment = Some(comment.into());
        self
    }
}

/// Persisted confirmation record
#[derive(Debug, Clone, Serialize, Deserialize)]
struct ConfirmationRecord {
    request: ConfirmationRequest,
    status: String,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    response: Option<ConfirmationResponse>,
}

/// An asynchronous agent that solicits a human decision.
///
/// Channels must not block the caller, must abandon work when the token is
/// cancelled, and must tolerate their response never being consumed (a
/// slower channel loses the race and its answer is discarded).
#[async_trait]
pub trait ConfirmationChannel: Send + Sync {
    /// Channel name for logging
    fn name(&self) -> &str;

    /// Solicit a decision for the request
    async fn request(
        &self,
        request: ConfirmationRequest,
        cancel: CancellationToken,
    ) -> Result<ConfirmationResponse>;
}

/// Fans confirmation requests out to channels, first response wins
pub struct ConfirmationHandler {
    channels: Vec<Arc<dyn ConfirmationChannel>>,
    timeout: Duration,
    store: Arc<dyn BlobStore>,
    requested_by: String,
}

impl ConfirmationHandler {
    /// Handler over the given channels
    pub fn new(
        channels: Vec<Arc<dyn ConfirmationChannel>>,
        timeout: Duration,
        store: Arc<dyn BlobStore>,
    ) -> Self {
        Self {
            channels,
            timeout,
            store,
            requested_by: "plan-engine".into(),
        }
    }

    /// Override the requester identifier stamped on requests
    pub fn with_requester(mut self, requested_by: impl Into<String>) -> Self {
        self.requested_by = requested_by.into();
        self
    }

    /// Number of configured channels
    pub fn channel_count(&self) -> usize {
        self.channels.len()
    }

    /// Request confirmation for a plan.
    ///
    /// Returns the first response from any channel (the engine interprets
    /// rejection), `ConfirmationTimeout` when no channel answers in time,
    /// `Cancelled` when the caller cancels, `NoChannels` when the channel
    /// list is empty.
    pub async fn request_confirmation(
        &self,
        plan: &Plan,
        assessment: &RiskAssessment,
        cancel: &CancellationToken,
    ) -> Result<ConfirmationResponse> {
        if self.channels.is_empty() {
            return Err(EngineError::NoChannels);
        }

        let request = ConfirmationRequest {
            id: Uuid::new_v4().to_string(),
            plan_id: plan.id.clone(),
            summaries: plan.steps.iter().map(|s| s.name.clone()).collect(),
            risk_level: assessment.level,
            reasons: assessment.reasons.clone(),
            impact: assessment.impact.clone(),
            requested_by: self.requested_by.clone(),
            created_at: Utc::now(),
        };
        let record_key = format!("confirm:{}", request.id);
        self.persist_record(&record_key, &request, "pending", None)
            .await;

        info!(plan_id = %plan.id, request_id = %request.id, channels = self.channels.len(),
              "requesting confirmation");

        // Buffered to the channel count so no producer ever blocks; late
        // responses hit a dropped receiver and are discarded.
        let (tx, mut rx) = mpsc::channel::<ConfirmationResponse>(self.channels.len());
        let fanout_cancel = cancel.child_token();
        for channel in &self.channels {
            let channel = channel.clone();
            let request = request.clone();
            let tx = tx.clone();
            let token = fanout_cancel.clone();
            tokio::spawn(async move {
                match channel.request(request, token).await {
                    Ok(response) => {
                        let _ = tx.send(response).await;
                    }
                    Err(e) => {
                        warn!(channel = channel.name(), error = %e, "confirmation channel failed");
                    }
                }
            });
        }
        drop(tx);

        let outcome = tokio::select! {
            response = rx.recv() => match response {
                Some(response) => Ok(response),
                // every channel failed without producing a response
                None => Err(EngineError::ConfirmationTimeout {
                    waited_ms: 0,
                }),
            },
            _ = tokio::time::sleep(self.timeout) => Err(EngineError::ConfirmationTimeout {
                waited_ms: self.timeout.as_millis() as u64,
            }),
            _ = cancel.cancelled() => Err(EngineError::Cancelled),
        };
        fanout_cancel.cancel();

        match &outcome {
            Ok(response) => {
                debug!(request_id = %request.id, approved = response.approved,
                       approver = %response.approver, "confirmation answered");
                let status = if response.approved { "approved" } else { "rejected" };
                self.persist_record(&record_key, &request, status, Some(response.clone()))
                    .await;
            }
            Err(e) => {
                self.persist_record(&record_key, &request, "unanswered", None)
                    .await;
                warn!(request_id = %request.id, error = %e, "confirmation not obtained");
            }
        }
        outcome
    }

    async fn persist_record(
        &self,
        key: &str,
        request: &ConfirmationRequest,
        status: &str,
        response: Option<ConfirmationResponse>,
    ) {
        let record = ConfirmationRecord {
            request: request.clone(),
            status: status.to_string(),
            response,
        };
        match serde_json::to_value(&record) {
            Ok(value) => {
                if let Err(e) = self.store.put(key, value).await {
                    warn!(%key, error = %e, "failed to persist confirmation record");
                }
            }
            Err(e) => warn!(%key, error = %e, "failed to encode confirmation record"),
        }
    }
}
