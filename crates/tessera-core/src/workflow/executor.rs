//! Step executor: runs one step against its tool, honoring conditional skip,
//! bounded retries with backoff, per-attempt timeouts and async dispatch.

use chrono::Utc;
use once_cell::sync::Lazy;
use regex::Regex;
use serde_json::{Map, Value};
use std::sync::Arc;
use std::time::Duration;
use thiserror::Error;
use tokio::time::timeout;
use tracing::{debug, info, warn};

use super::condition::should_execute_step;
use super::context::{ExecutionContext, StepResult};
use super::retry::RetryPolicy;
use crate::playbooks::types::StepSpec;
use crate::tools::{ToolError, ToolInvoker, ToolResponse};

/// Default wall-clock budget for one synchronous tool call.
pub const DEFAULT_STEP_TIMEOUT: Duration = Duration::from_secs(30);

static TEMPLATE_RE: Lazy<Regex> = Lazy::new(|| {
    Regex::new(r"\{\{\s*(inputs|steps)\.([A-Za-z0-9_\-]+)(?:\.([A-Za-z0-9_\-@]+))?\s*\}\}")
        .expect("template pattern is valid")
});

/// A step that could not complete.
#[derive(Error, Debug, Clone, PartialEq, Eq)]
#[error("Step '{step_id}' failed after {attempts} attempt(s): {source}")]
pub struct StepError {
    pub step_id: String,
    pub attempts: u32,
    #[source]
    pub source: ToolError,
}

impl StepError {
    /// Whether the final error was retryable (retries were exhausted).
    pub fn retries_exhausted(&self) -> bool {
        self.source.is_retryable()
    }
}

/// Executes individual workflow steps.
#[derive(Clone)]
pub struct StepExecutor {
    invoker: Arc<dyn ToolInvoker>,
    retry_policy: RetryPolicy,
    step_timeout: Duration,
}

impl StepExecutor {
    pub fn new(invoker: Arc<dyn ToolInvoker>) -> Self {
        Self { invoker, retry_policy: RetryPolicy::default(), step_timeout: DEFAULT_STEP_TIMEOUT }
    }

    #[must_use]
    pub fn with_retry_policy(mut self, retry_policy: RetryPolicy) -> Self {
        self.retry_policy = retry_policy;
        self
    }

    #[must_use]
    pub fn with_step_timeout(mut self, step_timeout: Duration) -> Self {
        self.step_timeout = step_timeout;
        self
    }

    pub fn invoker(&self) -> &Arc<dyn ToolInvoker> {
        &self.invoker
    }

    /// Executes a single step.
    ///
    /// Returns a `skipped` result when the step's condition is false, a
    /// `dispatched` result carrying the job id for async steps, or a
    /// `success` result with the tool output.
    ///
    /// # Errors
    ///
    /// Returns [`StepError`] when the tool rejects the call or retryable
    /// failures exhaust the retry policy.
    pub async fn execute(
        &self,
        step: &StepSpec,
        context: &ExecutionContext,
    ) -> Result<StepResult, StepError> {
        if !should_execute_step(&step.step_id, step.condition.as_ref(), context) {
            return Ok(StepResult::skipped(&step.step_id));
        }

        let started_at = Utc::now();
        let params = render_params(step, context);
        let mut attempts = 0;

        loop {
            attempts += 1;
            debug!(
                execution_id = %context.execution_id,
                trace_id = %context.trace_id,
                step_id = %step.step_id,
                tool = %step.tool_ref,
                attempt = attempts,
                "Invoking tool"
            );

            let outcome = match timeout(
                self.step_timeout,
                self.invoker.invoke(&step.tool_ref, params.clone()),
            )
            .await
            {
                Ok(result) => result,
                Err(_) => Err(ToolError::Timeout(self.step_timeout)),
            };

            match outcome {
                Ok(ToolResponse::Completed(output)) => {
                    return Ok(StepResult::success(
                        &step.step_id,
                        output,
                        attempts,
                        started_at,
                        Utc::now(),
                    ));
                }
                Ok(ToolResponse::Dispatched { job_id }) => {
                    if !step.is_async {
                        warn!(
                            step_id = %step.step_id,
                            tool = %step.tool_ref,
                            "Synchronous step received a job id; treating as dispatched"
                        );
                    }
                    info!(
                        execution_id = %context.execution_id,
                        step_id = %step.step_id,
                        job_id = %job_id,
                        "Dispatched async job"
                    );
                    return Ok(StepResult::dispatched(&step.step_id, job_id, attempts, started_at));
                }
                Err(error) if error.is_retryable() && self.retry_policy.allows_another(attempts) => {
                    let delay = self.retry_policy.calculate_delay(attempts - 1);
                    warn!(
                        execution_id = %context.execution_id,
                        step_id = %step.step_id,
                        attempt = attempts,
                        delay_ms = delay.as_millis() as u64,
                        error = %error,
                        "Retrying step after backoff"
                    );
                    tokio::time::sleep(delay).await;
                }
                Err(error) => {
                    warn!(
                        execution_id = %context.execution_id,
                        step_id = %step.step_id,
                        attempts,
                        error = %error,
                        "Step failed"
                    );
                    return Err(StepError { step_id: step.step_id.clone(), attempts, source: error });
                }
            }
        }
    }
}

/// Builds the tool parameters: the bound inputs overlaid with the step's
/// rendered parameter template.
pub fn render_params(step: &StepSpec, context: &ExecutionContext) -> Value {
    let mut params: Map<String, Value> = context.inputs.as_map().clone();
    for (key, template) in &step.params {
        params.insert(key.clone(), render_value(template, context));
    }
    Value::Object(params)
}

fn render_value(template: &Value, context: &ExecutionContext) -> Value {
    match template {
        Value::String(text) => render_string(text, context),
        Value::Array(items) => Value::Array(items.iter().map(|v| render_value(v, context)).collect()),
        Value::Object(map) => Value::Object(
            map.iter().map(|(k, v)| (k.clone(), render_value(v, context))).collect(),
        ),
        other => other.clone(),
    }
}

fn render_string(text: &str, context: &ExecutionContext) -> Value {
    // A template that is the whole string keeps the referenced value's type.
    if let Some(captures) = TEMPLATE_RE.captures(text) {
        if captures.get(0).is_some_and(|m| m.as_str() == text.trim()) {
            return lookup(&captures, context).unwrap_or(Value::Null);
        }
    }

    let rendered = TEMPLATE_RE.replace_all(text, |captures: &regex::Captures<'_>| {
        match lookup(captures, context) {
            Some(Value::String(s)) => s,
            Some(Value::Null) | None => String::new(),
            Some(other) => other.to_string(),
        }
    });
    Value::String(rendered.into_owned())
}

fn lookup(captures: &regex::Captures<'_>, context: &ExecutionContext) -> Option<Value> {
    let name = captures.get(2)?.as_str();
    let field = captures.get(3).map(|m| m.as_str());
    match (&captures[1], field) {
        ("inputs", None) => context.inputs.get(name).cloned(),
        ("inputs", Some(field)) => context.inputs.get(name)?.get(field).cloned(),
        (_, None) => context.get_step_result(name)?.output.clone(),
        (_, Some(field)) => context.get_step_result(name)?.output.as_ref()?.get(field).cloned(),
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::binding::bind;
    use crate::playbooks::types::ToolRef;
    use crate::tools::{JobState, Tool, ToolRegistry};
    use crate::workflow::condition::Condition;
    use crate::workflow::context::StepStatus;
    use async_trait::async_trait;
    use serde_json::json;
    use std::collections::BTreeMap;
    use std::sync::atomic::{AtomicU32, Ordering};

    struct Flaky {
        calls: AtomicU32,
        fail_times: u32,
        error: ToolError,
    }

    #[async_trait]
    impl Tool for Flaky {
        async fn call(&self, _params: Value) -> crate::tools::Result<ToolResponse> {
            let call = self.calls.fetch_add(1, Ordering::SeqCst);
            if call < self.fail_times {
                Err(self.error.clone())
            } else {
                Ok(ToolResponse::Completed(json!({"ok": true})))
            }
        }
    }

    struct Slow;

    #[async_trait]
    impl Tool for Slow {
        async fn call(&self, _params: Value) -> crate::tools::Result<ToolResponse> {
            tokio::time::sleep(Duration::from_secs(60)).await;
            Ok(ToolResponse::Completed(json!({})))
        }
    }

    struct Dispatcher;

    #[async_trait]
    impl Tool for Dispatcher {
        async fn call(&self, _params: Value) -> crate::tools::Result<ToolResponse> {
            Ok(ToolResponse::Dispatched { job_id: "job-42".to_string() })
        }

        async fn poll(&self, _job_id: &str) -> crate::tools::Result<JobState> {
            Ok(JobState::Running)
        }
    }

    fn step(id: &str, tool: &str) -> StepSpec {
        StepSpec {
            step_id: id.to_string(),
            action: id.to_string(),
            tool_ref: tool.parse().unwrap(),
            condition: None,
            is_async: false,
            params: BTreeMap::new(),
            artifact: None,
        }
    }

    fn context(raw: Value) -> ExecutionContext {
        ExecutionContext::new("test", bind(&BTreeMap::new(), raw.as_object().unwrap()).unwrap())
    }

    fn executor_with(tool_ref: &str, tool: Arc<dyn Tool>) -> StepExecutor {
        let mut registry = ToolRegistry::new();
        let tool_ref: ToolRef = tool_ref.parse().unwrap();
        registry.register(tool_ref, tool);
        StepExecutor::new(Arc::new(registry)).with_retry_policy(RetryPolicy::new(
            3,
            Duration::from_millis(1),
            Duration::from_millis(5),
            2.0,
        ))
    }

    #[tokio::test]
    async fn test_retries_transient_then_succeeds() {
        let flaky = Arc::new(Flaky {
            calls: AtomicU32::new(0),
            fail_times: 2,
            error: ToolError::Transient("503".to_string()),
        });
        let executor = executor_with("seo.analyze", flaky.clone());

        let result = executor.execute(&step("analyze", "seo.analyze"), &context(json!({}))).await.unwrap();
        assert_eq!(result.status, StepStatus::Success);
        assert_eq!(result.attempts, 3);
        assert_eq!(flaky.calls.load(Ordering::SeqCst), 3);
    }

    #[tokio::test]
    async fn test_retries_are_bounded() {
        let flaky = Arc::new(Flaky {
            calls: AtomicU32::new(0),
            fail_times: 10,
            error: ToolError::Transient("503".to_string()),
        });
        let executor = executor_with("seo.analyze", flaky.clone());

        let err = executor.execute(&step("analyze", "seo.analyze"), &context(json!({}))).await.unwrap_err();
        assert_eq!(err.attempts, 3);
        assert!(err.retries_exhausted());
        assert_eq!(flaky.calls.load(Ordering::SeqCst), 3);
    }

    #[tokio::test]
    async fn test_rejected_is_not_retried() {
        let flaky = Arc::new(Flaky {
            calls: AtomicU32::new(0),
            fail_times: 10,
            error: ToolError::Rejected("bad".to_string()),
        });
        let executor = executor_with("seo.analyze", flaky.clone());

        let err = executor.execute(&step("analyze", "seo.analyze"), &context(json!({}))).await.unwrap_err();
        assert_eq!(err.attempts, 1);
        assert!(!err.retries_exhausted());
    }

    #[tokio::test(start_paused = true)]
    async fn test_timeout_is_retryable() {
        let executor = executor_with("seo.slow", Arc::new(Slow))
            .with_step_timeout(Duration::from_secs(30));

        let err = executor.execute(&step("slow", "seo.slow"), &context(json!({}))).await.unwrap_err();
        assert_eq!(err.source, ToolError::Timeout(Duration::from_secs(30)));
        assert_eq!(err.attempts, 3);
    }

    #[tokio::test]
    async fn test_condition_false_skips() {
        let executor = executor_with("seo.rewrite", Arc::new(crate::tools::EchoTool));
        let mut spec = step("rewrite", "seo.rewrite");
        spec.condition = Some(Condition::NotSkipped("rewrite".to_string()));

        let result =
            executor.execute(&spec, &context(json!({"skip_steps": ["rewrite"]}))).await.unwrap();
        assert_eq!(result.status, StepStatus::Skipped);
        assert_eq!(result.attempts, 0);
    }

    #[tokio::test]
    async fn test_async_step_returns_job_id() {
        let executor = executor_with("video.render", Arc::new(Dispatcher));
        let mut spec = step("render", "video.render");
        spec.is_async = true;

        let result = executor.execute(&spec, &context(json!({}))).await.unwrap();
        assert_eq!(result.status, StepStatus::Dispatched);
        assert_eq!(result.job_id.as_deref(), Some("job-42"));
    }

    #[test]
    fn test_render_params() {
        let mut ctx = context(json!({"content_source": "obsidian://vault/a.md", "engines": ["perplexity"]}));
        ctx.record_step_result(StepResult::success(
            "analyze",
            json!({"language": "zh-TW", "score": 71}),
            1,
            Utc::now(),
            Utc::now(),
        ));

        let mut spec = step("rewrite", "seo.rewrite");
        spec.params.insert("targets".to_string(), json!("{{inputs.engines}}"));
        spec.params.insert("lang".to_string(), json!("{{ steps.analyze.language }}"));
        spec.params.insert("note".to_string(), json!("score={{steps.analyze.score}}"));
        spec.params.insert("missing".to_string(), json!("{{steps.nope.x}}"));

        let params = render_params(&spec, &ctx);
        assert_eq!(params["targets"], json!(["perplexity"]));
        assert_eq!(params["lang"], json!("zh-TW"));
        assert_eq!(params["note"], json!("score=71"));
        assert_eq!(params["missing"], Value::Null);
        assert_eq!(params["content_source"], json!("obsidian://vault/a.md"));
    }
}
