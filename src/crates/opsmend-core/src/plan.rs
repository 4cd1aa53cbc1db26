//! Plan and step data model
//!
//! A [`Plan`] is the immutable submission unit: an identified, named list of
//! [`Step`]s whose dependency relation forms a DAG. Each step carries a
//! tagged [`Action`] describing what to run, an optional compensating action
//! that undoes it, and optional timeout/retry policies.

use crate::dag::DependencyGraph;
use crate::error::{EngineError, Result};
use crate::risk::RiskAssessment;
use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};
use serde_json::Value;
use std::collections::{HashMap, HashSet};
use uuid::Uuid;

/// The four kinds of work a step can describe
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
pub enum StepKind {
    /// Invoke a registered tool with arguments
    ToolCall,
    /// Ask the language-model client for a completion
    LlmQuery,
    /// Evaluate a boolean expression against runtime bindings
    Condition,
    /// Execute another stored plan and report its terminal state
    SubPlan,
}

impl std::fmt::Display for StepKind {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        match self {
            StepKind::ToolCall => write!(f, "tool_call"),
            StepKind::LlmQuery => write!(f, "llm_query"),
            StepKind::Condition => write!(f, "condition"),
            StepKind::SubPlan => write!(f, "sub_plan"),
        }
    }
}

/// Concrete payload of a step, tagged by kind
///
/// The variant determines which fields are meaningful, so a step can never
/// carry a prompt for a tool call or an expression for a sub-plan.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(tag = "kind", rename_all = "snake_case")]
pub enum Action {
    /// Run a registered tool
    ToolCall {
        /// Tool name in the registry
        tool: String,
        /// Arguments passed to the tool
        #[serde(default)]
        args: HashMap<String, Value>,
    },
    /// Request a language-model completion
    LlmQuery {
        /// Prompt text
        prompt: String,
    },
    /// Evaluate a boolean expression
    Condition {
        /// Expression in the built-in comparison grammar
        expression: String,
    },
    /// Execute a stored sub-plan
    SubPlan {
        /// Identifier of the plan to execute
        plan_id: String,
    },
}

impl Action {
    /// Kind implied by the variant
    pub fn kind(&self) -> StepKind {
        match self {
            Action::ToolCall { .. } => StepKind::ToolCall,
            Action::LlmQuery { .. } => StepKind::LlmQuery,
            Action::Condition { .. } => StepKind::Condition,
            Action::SubPlan { .. } => StepKind::SubPlan,
        }
    }

    /// Flat text rendering used for keyword scanning (risk rules, snapshot
    /// target inference)
    pub fn command_text(&self) -> String {
        match self {
            Action::ToolCall { tool, args } => {
                let mut parts = vec![tool.clone()];
                let mut keys: Vec<&String> = args.keys().collect();
                keys.sort();
                for key in keys {
                    match &args[key] {
                        Value::String(s) => parts.push(s.clone()),
                        other => parts.push(other.to_string()),
                    }
                }
                parts.join(" ")
            }
            Action::LlmQuery { prompt } => prompt.clone(),
            Action::Condition { expression } => expression.clone(),
            Action::SubPlan { plan_id } => plan_id.clone(),
        }
    }
}

/// Retry policy for a single step
///
/// The first attempt counts toward the total, so a step makes at most
/// `max_retries + 1` dispatches. Backoff is fixed by default; a multiplier
/// above 1.0 makes it exponential.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct RetryPolicy {
    /// Retries after the first attempt
    pub max_retries: u32,
    /// Wait between attempts, in milliseconds
    pub backoff_ms: u64,
    /// Multiplier applied to the backoff after each attempt
    #[serde(default = "default_backoff_multiplier")]
    pub backoff_multiplier: f64,
}

fn default_backoff_multiplier() -> f64 {
    1.0
}

impl RetryPolicy {
    /// Fixed-backoff policy
    pub fn new(max_retries: u32, backoff_ms: u64) -> Self {
        Self {
            max_retries,
            backoff_ms,
            backoff_multiplier: default_backoff_multiplier(),
        }
    }

    /// Set the backoff multiplier
    pub fn with_multiplier(mut self, multiplier: f64) -> Self {
        self.backoff_multiplier = multiplier;
        self
    }

    /// Backoff before the given retry (0-indexed: the wait after the first
    /// failed attempt is `backoff(0)`)
    pub fn backoff(&self, retry: u32) -> std::time::Duration {
        let ms = self.backoff_ms as f64 * self.backoff_multiplier.powi(retry as i32);
        std::time::Duration::from_millis(ms as u64)
    }
}

/// A unit of work within a plan
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct Step {
    /// Identifier, unique within the plan
    pub id: String,
    /// Human-readable name
    pub name: String,
    /// What to run
    pub action: Action,
    /// Identifiers of steps that must complete first
    #[serde(default)]
    pub depends_on: Vec<String>,
    /// Action that undoes this step after it completed
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub compensation: Option<Action>,
    /// Per-dispatch timeout in milliseconds
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub timeout_ms: Option<u64>,
    /// Retry policy for the whole dispatch
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub retry: Option<RetryPolicy>,
}

impl Step {
    /// Create a step with no dependencies
    pub fn new(id: impl Into<String>, name: impl Into<String>, action: Action) -> Self {
        Self {
            id: id.into(),
            name: name.into(),
            action,
            depends_on: Vec::new(),
            compensation: None,
            timeout_ms: None,
            retry: None,
        }
    }

    /// Add a dependency on another step
    pub fn depends_on(mut self, step_id: impl Into<String>) -> Self {
        self.depends_on.push(step_id.into());
        self
    }

    /// Attach a compensating action
    pub fn with_compensation(mut self, action: Action) -> Self {
        self.compensation = Some(action);
        self
    }

    /// Bound each dispatch by a timeout
    pub fn with_timeout_ms(mut self, timeout_ms: u64) -> Self {
        self.timeout_ms = Some(timeout_ms);
        self
    }

    /// Attach a retry policy
    pub fn with_retry(mut self, retry: RetryPolicy) -> Self {
        self.retry = Some(retry);
        self
    }

    /// Kind of this step, implied by its action
    pub fn kind(&self) -> StepKind {
        self.action.kind()
    }

    /// Flat command text of the forward action
    pub fn command_text(&self) -> String {
        self.action.command_text()
    }
}

/// An immutable remediation plan: a DAG of steps plus metadata
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct Plan {
    /// Unique plan identifier
    pub id: String,
    /// Human-readable name
    pub name: String,
    /// What the plan is meant to accomplish
    #[serde(default)]
    pub description: String,
    /// Steps in submission order
    pub steps: Vec<Step>,
    /// Creation timestamp
    pub created_at: DateTime<Utc>,
    /// Free-form metadata
    #[serde(default)]
    pub metadata: HashMap<String, Value>,
    /// Risk assessment attached by the engine before execution
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub risk: Option<RiskAssessment>,
}

impl Plan {
    /// Create an empty plan with a generated identifier
    pub fn new(name: impl Into<String>) -> Self {
        Self {
            id: Uuid::new_v4().to_string(),
            name: name.into(),
            description: String::new(),
            steps: Vec::new(),
            created_at: Utc::now(),
            metadata: HashMap::new(),
            risk: None,
        }
    }

    /// Override the generated identifier
    pub fn with_id(mut self, id: impl Into<String>) -> Self {
        self.id = id.into();
        self
    }

    /// Set the description
    pub fn with_description(mut self, description: impl Into<String>) -> Self {
        self.description = description.into();
        self
    }

    /// Append a step
    pub fn with_step(mut self, step: Step) -> Self {
        self.steps.push(step);
        self
    }

    /// Attach a metadata entry
    pub fn with_metadata(mut self, key: impl Into<String>, value: Value) -> Self {
        self.metadata.insert(key.into(), value);
        self
    }

    /// Look up a step by id
    pub fn step(&self, id: &str) -> Option<&Step> {
        self.steps.iter().find(|s| s.id == id)
    }

    /// Validate the data-model invariants plus DAG acyclicity.
    ///
    /// Checks, in order: at least one step; unique step ids; every
    /// dependency refers to another step in this plan; compensation actions
    /// are kind-compatible with their forward action; the dependency
    /// relation is acyclic.
    pub fn validate(&self) -> Result<()> {
        if self.steps.is_empty() {
            return Err(EngineError::Validation(format!(
                "plan '{}' has no steps",
                self.id
            )));
        }

        let mut seen = HashSet::new();
        for step in &self.steps {
            if !seen.insert(step.id.as_str()) {
                return Err(EngineError::Validation(format!(
                    "duplicate step id '{}'",
                    step.id
                )));
            }
        }

        for step in &self.steps {
            for dep in &step.depends_on {
                if dep == &step.id {
                    return Err(EngineError::Validation(format!(
                        "step '{}' depends on itself",
                        step.id
                    )));
                }
                if !seen.contains(dep.as_str()) {
                    return Err(EngineError::Validation(format!(
                        "step '{}' depends on unknown step '{}'",
                        step.id, dep
                    )));
                }
            }

            if let Some(compensation) = &step.compensation {
                if compensation.kind() != step.kind() {
                    return Err(EngineError::Validation(format!(
                        "step '{}' compensation kind '{}' does not match action kind '{}'",
                        step.id,
                        compensation.kind(),
                        step.kind()
                    )));
                }
            }
        }

        DependencyGraph::build(&self.steps).topological_sort()?;
        Ok(())
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::error::ErrorKind;
    use serde_json::json;

    fn tool_step(id: &str) -> Step {
        Step::new(
            id,
            format!("step {id}"),
            Action::ToolCall {
                tool: "shell".into(),
                args: HashMap::from([("command".to_string(), json!("echo ok"))]),
            },
        )
    }

    #[test]
    fn test_empty_plan_fails_validation() {
        let plan = Plan::new("empty");
        let err = plan.validate().unwrap_err();
        assert_eq!(err.kind(), ErrorKind::Validation);
    }

    #[test]
    fn test_duplicate_step_id_fails_validation() {
        let plan = Plan::new("dup")
            .with_step(tool_step("a"))
            .with_step(tool_step("a"));
        let err = plan.validate().unwrap_err();
        assert_eq!(err.kind(), ErrorKind::Validation);
        assert!(err.to_string().contains("duplicate"));
    }

    #[test]
    fn test_unknown_dependency_fails_validation() {
        let plan = Plan::new("dangling").with_step(tool_step("a").depends_on("ghost"));
        let err = plan.validate().unwrap_err();
        assert_eq!(err.kind(), ErrorKind::Validation);
    }

    #[test]
    fn test_two_step_cycle_fails_with_cyclic_dependency() {
        let plan = Plan::new("cycle")
            .with_step(tool_step("a").depends_on("b"))
            .with_step(tool_step("b").depends_on("a"));
        let err = plan.validate().unwrap_err();
        assert_eq!(err.kind(), ErrorKind::CyclicDependency);
    }

    #[test]
    fn test_incompatible_compensation_fails_validation() {
        let step = tool_step("a").with_compensation(Action::LlmQuery {
            prompt: "undo it".into(),
        });
        let plan = Plan::new("mismatch").with_step(step);
        let err = plan.validate().unwrap_err();
        assert_eq!(err.kind(), ErrorKind::Validation);
    }

    #[test]
    fn test_valid_plan_passes() {
        let plan = Plan::new("linear")
            .with_step(tool_step("a"))
            .with_step(tool_step("b").depends_on("a"));
        plan.validate().unwrap();
    }

    #[test]
    fn test_serde_roundtrip_preserves_all_fields() {
        let plan = Plan::new("roundtrip")
            .with_description("flush and restart cache")
            .with_metadata("source", json!("diagnosis-42"))
            .with_step(
                tool_step("flush")
                    .with_compensation(Action::ToolCall {
                        tool: "shell".into(),
                        args: HashMap::from([("command".to_string(), json!("restore backup"))]),
                    })
                    .with_timeout_ms(2_000)
                    .with_retry(RetryPolicy::new(2, 50)),
            )
            .with_step(tool_step("verify").depends_on("flush"));

        let raw = serde_json::to_string(&plan).unwrap();
        let back: Plan = serde_json::from_str(&raw).unwrap();
        assert_eq!(plan, back);
    }

    #[test]
    fn test_command_text_includes_tool_and_args() {
        let text = tool_step("a").command_text();
        assert!(text.contains("shell"));
        assert!(text.contains("echo ok"));
    }

    #[test]
    fn test_retry_backoff_multiplier() {
        let fixed = RetryPolicy::new(3, 100);
        assert_eq!(fixed.backoff(0).as_millis(), 100);
        assert_eq!(fixed.backoff(2).as_millis(), 100);

        let exponential = RetryPolicy::new(3, 100).with_multiplier(2.0);
        assert_eq!(exponential.backoff(0).as_millis(), 100);
        assert_eq!(exponential.backoff(2).as_millis(), 400);
    }
}
