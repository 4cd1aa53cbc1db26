//! Single-step execution
//!
//! [`StepExecutor`] dispatches one step to the capability matching its
//! action variant: a [`ToolRegistry`] for tool calls, a [`ModelClient`] for
//! language-model queries, a [`ConditionEvaluator`] for conditions, and a
//! [`SubPlanRunner`] for nested plans. Around the dispatch it applies the
//! step's optional timeout and retry policy; cancellation is honoured both
//! inside a dispatch and between attempts.

use crate::error::{EngineError, Result};
use crate::plan::{Action, Step};
use crate::state::PlanStatus;
use async_trait::async_trait;
use serde_json::Value;
use std::collections::HashMap;
use std::sync::Arc;
use tokio_util::sync::CancellationToken;
use tracing::{debug, warn};

/// Registry of invocable tools
#[async_trait]
pub trait ToolRegistry: Send + Sync {
    /// Run a named tool with arguments, returning its output value
    async fn run(
        &self,
        tool: &str,
        args: &HashMap<String, Value>,
        cancel: &CancellationToken,
    ) -> Result<Value>;
}

/// Language-model completion client
#[async_trait]
pub trait ModelClient: Send + Sync {
    /// Complete a prompt
    async fn complete(&self, prompt: &str, cancel: &CancellationToken) -> Result<String>;
}

/// Boolean expression evaluator for condition steps
#[async_trait]
pub trait ConditionEvaluator: Send + Sync {
    /// Evaluate an expression against the runtime bindings
    async fn evaluate(&self, expression: &str, bindings: &HashMap<String, Value>) -> Result<bool>;
}

/// Recursion seam for sub-plan steps; implemented by the engine
#[async_trait]
pub trait SubPlanRunner: Send + Sync {
    /// Execute the stored plan and report its terminal status
    async fn run_sub_plan(&self, plan_id: &str, cancel: &CancellationToken) -> Result<PlanStatus>;
}

/// Built-in evaluator for the minimal comparison grammar.
///
/// Accepts the literals `true`/`false` (case-insensitive) and comparisons of
/// the form `<name> <op> <literal>` with `op` one of `>` `>=` `<` `<=` `==`
/// `!=`, where `<name>` is looked up in the bindings. Numbers compare
/// numerically, everything else compares on its string form. A missing or
/// non-scalar binding makes the comparison false. Any expression outside
/// the grammar evaluates to true; this fallback keeps hand-written plans
/// from wedging on a malformed guard.
#[derive(Debug, Clone, Copy, Default)]
pub struct DefaultConditionEvaluator;

impl DefaultConditionEvaluator {
    fn scalar_text(value: &Value) -> Option<String> {
        match value {
            Value::String(s) => Some(s.clone()),
            Value::Number(n) => Some(n.to_string()),
            Value::Bool(b) => Some(b.to_string()),
            _ => None,
        }
    }

    fn compare(op: &str, left: &str, right: &str) -> bool {
        if let (Ok(l), Ok(r)) = (left.parse::<f64>(), right.parse::<f64>()) {
            return match op {
                ">" => l > r,
                ">=" => l >= r,
                "<" => l < r,
                "<=" => l <= r,
                "==" => l == r,
                "!=" => l != r,
                _ => true,
            };
        }
        match op {
            ">" => left > right,
            ">=" => left >= right,
            "<" => left < right,
            "<=" => left <= right,
            "==" => left == right,
            "!=" => left != right,
            _ => true,
        }
    }
}

#[async_trait]
impl ConditionEvaluator for DefaultConditionEvaluator {
    async fn evaluate(&self, expression: &str, bindings: &HashMap<String, Value>) -> Result<bool> {
        let trimmed = expression.trim();
        if trimmed.eq_ignore_ascii_case("true") {
            return Ok(true);
        }
        if trimmed.eq_ignore_ascii_case("false") {
            return Ok(false);
        }

        let parts: Vec<&str> = trimmed.split_whitespace().collect();
        let &[name, op, literal] = parts.as_slice() else {
            debug!(expression, "expression outside grammar, defaulting to true");
            return Ok(true);
        };
        if !matches!(op, ">" | ">=" | "<" | "<=" | "==" | "!=") {
            debug!(expression, "unknown operator, defaulting to true");
            return Ok(true);
        }

        let Some(bound) = bindings.get(name).and_then(Self::scalar_text) else {
            return Ok(false);
        };
        let literal = literal.trim_matches(|c| c == '\'' || c == '"');
        Ok(Self::compare(op, &bound, literal))
    }
}

/// Executes one step of a known kind with timeout and retry
pub struct StepExecutor {
    tools: Option<Arc<dyn ToolRegistry>>,
    model: Option<Arc<dyn ModelClient>>,
    conditions: Arc<dyn ConditionEvaluator>,
    sub_plans: Option<Arc<dyn SubPlanRunner>>,
}

impl StepExecutor {
    /// Executor with the built-in condition evaluator and no other
    /// capabilities wired
    pub fn new() -> Self {
        Self {
            tools: None,
            model: None,
            conditions: Arc::new(DefaultConditionEvaluator),
            sub_plans: None,
        }
    }

    /// Wire the tool registry
    pub fn with_tools(mut self, tools: Arc<dyn ToolRegistry>) -> Self {
        self.tools = Some(tools);
        self
    }

    /// Wire the language-model client
    pub fn with_model(mut self, model: Arc<dyn ModelClient>) -> Self {
        self.model = Some(model);
        self
    }

    /// Replace the condition evaluator
    pub fn with_conditions(mut self, conditions: Arc<dyn ConditionEvaluator>) -> Self {
        self.conditions = conditions;
        self
    }

    /// Wire the sub-plan runner
    pub fn with_sub_plans(mut self, sub_plans: Arc<dyn SubPlanRunner>) -> Self {
        self.sub_plans = Some(sub_plans);
        self
    }

    /// Execute a step, honouring its timeout and retry policy.
    ///
    /// Makes at most `max_retries + 1` dispatches and returns the first
    /// success. A deadline expiry is retryable like any other dispatch
    /// error; cancellation aborts immediately, including during backoff.
    pub async fn execute(
        &self,
        step: &Step,
        bindings: &HashMap<String, Value>,
        cancel: &CancellationToken,
    ) -> Result<Value> {
        let attempts = step.retry.as_ref().map(|r| r.max_retries + 1).unwrap_or(1);

        let mut last_error = None;
        for attempt in 0..attempts {
            if cancel.is_cancelled() {
                return Err(EngineError::Cancelled);
            }
            match self.dispatch(step, bindings, cancel).await {
                Ok(output) => {
                    debug!(step = %step.id, attempt = attempt + 1, "step dispatch succeeded");
                    return Ok(output);
                }
                Err(e) if e.is_cancelled() => return Err(e),
                Err(e) => {
                    warn!(step = %step.id, attempt = attempt + 1, error = %e, "step dispatch failed");
                    last_error = Some(e);
                }
            }

            if attempt + 1 < attempts {
                let backoff = step
                    .retry
                    .as_ref()
                    .map(|r| r.backoff(attempt))
                    .unwrap_or_default();
                tokio::select! {
                    _ = tokio::time::sleep(backoff) => {}
                    _ = cancel.cancelled() => return Err(EngineError::Cancelled),
                }
            }
        }
        // attempts >= 1, so a fall-through always carries an error
        Err(last_error.unwrap_or_else(|| EngineError::Internal("no dispatch attempted".into())))
    }

    /// One dispatch, bounded by the step timeout and the cancellation token
    async fn dispatch(
        &self,
        step: &Step,
        bindings: &HashMap<String, Value>,
        cancel: &CancellationToken,
    ) -> Result<Value> {
        let work = self.dispatch_action(step, bindings, cancel);
        match step.timeout_ms {
            Some(timeout_ms) if timeout_ms > 0 => {
                let deadline = std::time::Duration::from_millis(timeout_ms);
                tokio::select! {
                    result = tokio::time::timeout(deadline, work) => match result {
                        Ok(result) => result,
                        Err(_) => Err(EngineError::StepTimeout {
                            step: step.id.clone(),
                            duration_ms: timeout_ms,
                        }),
                    },
                    _ = cancel.cancelled() => Err(EngineError::Cancelled),
                }
            }
            _ => {
                tokio::select! {
                    result = work => result,
                    _ = cancel.cancelled() => Err(EngineError::Cancelled),
                }
            }
        }
    }

    async fn dispatch_action(
        &self,
        step: &Step,
        bindings: &HashMap<String, Value>,
        cancel: &CancellationToken,
    ) -> Result<Value> {
        match &step.action {
            Action::ToolCall { tool, args } => {
                let tools = self
                    .tools
                    .as_ref()
                    .ok_or_else(|| EngineError::UnknownStepKind(step.kind().to_string()))?;
                tools.run(tool, args, cancel).await
            }
            Action::LlmQuery { prompt } => {
                let model = self
                    .model
                    .as_ref()
                    .ok_or_else(|| EngineError::UnknownStepKind(step.kind().to_string()))?;
                let completion = model.complete(prompt, cancel).await?;
                Ok(Value::String(completion))
            }
            Action::Condition { expression } => {
                let verdict = self.conditions.evaluate(expression, bindings).await?;
                Ok(Value::Bool(verdict))
            }
            Action::SubPlan { plan_id } => {
                let runner = self
                    .sub_plans
                    .as_ref()
                    .ok_or_else(|| EngineError::UnknownStepKind(step.kind().to_string()))?;
                let status = runner.run_sub_plan(plan_id, cancel).await?;
                Ok(Value::String(status.to_string()))
            }
        }
    }
}

impl Default for StepExecutor {
    fn default() -> Self {
        Self::new()
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::plan::RetryPolicy;
    use parking_lot::Mutex;
    use serde_json::json;
    use std::sync::atomic::{AtomicU32, Ordering};
    use std::time::Duration;

    /// Tool registry that fails a configurable number of times, then
    /// succeeds, recording every invocation
    struct FlakyTools {
        failures_before_success: u32,
        calls: AtomicU32,
        invoked: Mutex<Vec<String>>,
        delay: Option<Duration>,
    }

    impl FlakyTools {
        fn reliable() -> Self {
            Self::failing(0)
        }

        fn failing(failures_before_success: u32) -> Self {
            Self {
                failures_before_success,
                calls: AtomicU32::new(0),
                invoked: Mutex::new(Vec::new()),
                delay: None,
            }
        }

        fn slow(delay: Duration) -> Self {
            Self {
                delay: Some(delay),
                ..Self::reliable()
            }
        }
    }

    #[async_trait]
    impl ToolRegistry for FlakyTools {
        async fn run(
            &self,
            tool: &str,
            _args: &HashMap<String, Value>,
            _cancel: &CancellationToken,
        ) -> Result<Value> {
            self.invoked.lock().push(tool.to_string());
            if let Some(delay) = self.delay {
                tokio::time::sleep(delay).await;
            }
            let call = self.calls.fetch_add(1, Ordering::SeqCst);
            if call < self.failures_before_success {
                return Err(EngineError::dispatch("?", "transient failure"));
            }
            Ok(json!("ok"))
        }
    }

    fn tool_step(id: &str) -> Step {
        Step::new(
            id,
            id,
            Action::ToolCall {
                tool: "shell".into(),
                args: HashMap::new(),
            },
        )
    }

    fn no_bindings() -> HashMap<String, Value> {
        HashMap::new()
    }

    #[tokio::test]
    async fn test_tool_dispatch_succeeds() {
        let tools = Arc::new(FlakyTools::reliable());
        let executor = StepExecutor::new().with_tools(tools.clone());
        let output = executor
            .execute(&tool_step("a"), &no_bindings(), &CancellationToken::new())
            .await
            .unwrap();
        assert_eq!(output, json!("ok"));
        assert_eq!(tools.invoked.lock().len(), 1);
    }

    #[tokio::test]
    async fn test_unwired_capability_is_unknown_step_kind() {
        let executor = StepExecutor::new();
        let err = executor
            .execute(&tool_step("a"), &no_bindings(), &CancellationToken::new())
            .await
            .unwrap_err();
        assert!(matches!(err, EngineError::UnknownStepKind(kind) if kind == "tool_call"));

        let llm = Step::new("q", "q", Action::LlmQuery { prompt: "hi".into() });
        let err = executor
            .execute(&llm, &no_bindings(), &CancellationToken::new())
            .await
            .unwrap_err();
        assert!(matches!(err, EngineError::UnknownStepKind(kind) if kind == "llm_query"));
    }

    #[tokio::test(start_paused = true)]
    async fn test_retry_until_success_counts_attempts() {
        let tools = Arc::new(FlakyTools::failing(2));
        let executor = StepExecutor::new().with_tools(tools.clone());
        let step = tool_step("retry").with_retry(RetryPolicy::new(3, 10));

        let output = executor
            .execute(&step, &no_bindings(), &CancellationToken::new())
            .await
            .unwrap();
        assert_eq!(output, json!("ok"));
        assert_eq!(tools.calls.load(Ordering::SeqCst), 3);
    }

    #[tokio::test(start_paused = true)]
    async fn test_retry_exhaustion_returns_last_error_verbatim() {
        let tools = Arc::new(FlakyTools::failing(u32::MAX));
        let executor = StepExecutor::new().with_tools(tools.clone());
        let step = tool_step("hopeless").with_retry(RetryPolicy::new(2, 10));

        let err = executor
            .execute(&step, &no_bindings(), &CancellationToken::new())
            .await
            .unwrap_err();
        assert!(matches!(err, EngineError::StepDispatch { .. }));
        // max_retries + 1 total attempts
        assert_eq!(tools.calls.load(Ordering::SeqCst), 3);
    }

    #[tokio::test(start_paused = true)]
    async fn test_timeout_surfaces_as_step_timeout() {
        let tools = Arc::new(FlakyTools::slow(Duration::from_secs(60)));
        let executor = StepExecutor::new().with_tools(tools);
        let step = tool_step("slow").with_timeout_ms(100);

        let err = executor
            .execute(&step, &no_bindings(), &CancellationToken::new())
            .await
            .unwrap_err();
        assert!(matches!(err, EngineError::StepTimeout { duration_ms: 100, .. }));
    }

    #[tokio::test(start_paused = true)]
    async fn test_timeout_is_retryable() {
        let tools = Arc::new(FlakyTools::slow(Duration::from_secs(60)));
        let executor = StepExecutor::new().with_tools(tools.clone());
        let step = tool_step("slow")
            .with_timeout_ms(50)
            .with_retry(RetryPolicy::new(1, 10));

        let err = executor
            .execute(&step, &no_bindings(), &CancellationToken::new())
            .await
            .unwrap_err();
        assert!(matches!(err, EngineError::StepTimeout { .. }));
        assert_eq!(tools.calls.load(Ordering::SeqCst), 0); // slow tool never returned
        assert_eq!(tools.invoked.lock().len(), 2); // but was dispatched twice
    }

    #[tokio::test(start_paused = true)]
    async fn test_cancellation_during_backoff_returns_immediately() {
        let tools = Arc::new(FlakyTools::failing(u32::MAX));
        let executor = StepExecutor::new().with_tools(tools.clone());
        let step = tool_step("cancelled").with_retry(RetryPolicy::new(5, 60_000));

        let cancel = CancellationToken::new();
        let canceller = cancel.clone();
        tokio::spawn(async move {
            tokio::time::sleep(Duration::from_millis(20)).await;
            canceller.cancel();
        });

        let err = executor.execute(&step, &no_bindings(), &cancel).await.unwrap_err();
        assert!(err.is_cancelled());
        // first attempt failed, cancellation hit during the first backoff
        assert_eq!(tools.calls.load(Ordering::SeqCst), 1);
    }

    #[tokio::test]
    async fn test_condition_literals() {
        let eval = DefaultConditionEvaluator;
        let bindings = no_bindings();
        assert!(eval.evaluate("true", &bindings).await.unwrap());
        assert!(eval.evaluate("TRUE", &bindings).await.unwrap());
        assert!(!eval.evaluate("false", &bindings).await.unwrap());
        assert!(!eval.evaluate(" False ", &bindings).await.unwrap());
    }

    #[tokio::test]
    async fn test_condition_numeric_comparisons() {
        let eval = DefaultConditionEvaluator;
        let bindings = HashMap::from([("memory_used".to_string(), json!(82.5))]);
        assert!(eval.evaluate("memory_used > 80", &bindings).await.unwrap());
        assert!(eval.evaluate("memory_used <= 82.5", &bindings).await.unwrap());
        assert!(!eval.evaluate("memory_used == 80", &bindings).await.unwrap());
        assert!(eval.evaluate("memory_used != 80", &bindings).await.unwrap());
    }

    #[tokio::test]
    async fn test_condition_string_comparisons() {
        let eval = DefaultConditionEvaluator;
        let bindings = HashMap::from([("status".to_string(), json!("degraded"))]);
        assert!(eval.evaluate("status == degraded", &bindings).await.unwrap());
        assert!(eval.evaluate("status == 'degraded'", &bindings).await.unwrap());
        assert!(!eval.evaluate("status == healthy", &bindings).await.unwrap());
    }

    #[tokio::test]
    async fn test_condition_missing_binding_is_false() {
        let eval = DefaultConditionEvaluator;
        assert!(!eval.evaluate("ghost > 1", &no_bindings()).await.unwrap());
    }

    #[tokio::test]
    async fn test_condition_fallback_is_true() {
        let eval = DefaultConditionEvaluator;
        let bindings = no_bindings();
        assert!(eval.evaluate("totally free form", &bindings).await.unwrap());
        assert!(eval.evaluate("a ~ b", &bindings).await.unwrap());
        assert!(eval.evaluate("", &bindings).await.unwrap());
    }

    #[tokio::test]
    async fn test_condition_step_dispatch() {
        let executor = StepExecutor::new();
        let step = Step::new(
            "guard",
            "guard",
            Action::Condition {
                expression: "errors > 10".into(),
            },
        );
        let bindings = HashMap::from([("errors".to_string(), json!(25))]);
        let output = executor
            .execute(&step, &bindings, &CancellationToken::new())
            .await
            .unwrap();
        assert_eq!(output, json!(true));
    }
}
