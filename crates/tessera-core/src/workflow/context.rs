//! Per-invocation execution state.
//!
//! An [`ExecutionContext`] is created when a playbook is invoked, mutated as
//! each step resolves, and reaches a terminal status once every step has
//! resolved or a fatal error halts execution.

use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};
use serde_json::Value;
use std::fmt;
use uuid::Uuid;

use crate::aggregate::BatchSummary;
use crate::binding::BoundInputs;

/// Lifecycle status of an execution.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum ExecutionStatus {
    Pending,
    Running,
    Success,
    PartialFailure,
    Error,
}

impl ExecutionStatus {
    /// Terminal statuses never change again.
    pub fn is_terminal(self) -> bool {
        matches!(self, Self::Success | Self::PartialFailure | Self::Error)
    }

    fn can_advance_to(self, next: Self) -> bool {
        match self {
            Self::Pending => next == Self::Running || next == Self::Error,
            Self::Running => next != Self::Pending,
            _ => false,
        }
    }
}

impl fmt::Display for ExecutionStatus {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        let text = match self {
            Self::Pending => "pending",
            Self::Running => "running",
            Self::Success => "success",
            Self::PartialFailure => "partial_failure",
            Self::Error => "error",
        };
        f.write_str(text)
    }
}

/// Outcome of a single step.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum StepStatus {
    Success,
    /// The step's condition evaluated false.
    Skipped,
    /// An async job was dispatched and has not completed yet.
    Dispatched,
    Failed,
}

/// Result of executing a workflow step.
#[derive(Debug, Clone, Serialize, Deserialize, PartialEq)]
pub struct StepResult {
    pub step_id: String,
    pub status: StepStatus,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub output: Option<Value>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub job_id: Option<String>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub error: Option<String>,
    /// Number of tool invocations made, including retries.
    pub attempts: u32,
    pub started_at: DateTime<Utc>,
    pub completed_at: DateTime<Utc>,
    pub duration_ms: u64,
}

impl StepResult {
    fn new(
        step_id: impl Into<String>,
        status: StepStatus,
        attempts: u32,
        started_at: DateTime<Utc>,
        completed_at: DateTime<Utc>,
    ) -> Self {
        let duration_ms =
            completed_at.signed_duration_since(started_at).num_milliseconds().max(0) as u64;
        Self {
            step_id: step_id.into(),
            status,
            output: None,
            job_id: None,
            error: None,
            attempts,
            started_at,
            completed_at,
            duration_ms,
        }
    }

    /// Creates a successful step result.
    pub fn success(
        step_id: impl Into<String>,
        output: Value,
        attempts: u32,
        started_at: DateTime<Utc>,
        completed_at: DateTime<Utc>,
    ) -> Self {
        let mut result = Self::new(step_id, StepStatus::Success, attempts, started_at, completed_at);
        result.output = Some(output);
        result
    }

    /// Creates a skipped step result. Skipping is not an error.
    pub fn skipped(step_id: impl Into<String>) -> Self {
        let now = Utc::now();
        Self::new(step_id, StepStatus::Skipped, 0, now, now)
    }

    /// Creates a result for a dispatched async job.
    pub fn dispatched(
        step_id: impl Into<String>,
        job_id: impl Into<String>,
        attempts: u32,
        started_at: DateTime<Utc>,
    ) -> Self {
        let mut result =
            Self::new(step_id, StepStatus::Dispatched, attempts, started_at, Utc::now());
        result.job_id = Some(job_id.into());
        result
    }

    /// Creates a failed step result.
    pub fn failure(
        step_id: impl Into<String>,
        error: String,
        attempts: u32,
        started_at: DateTime<Utc>,
        completed_at: DateTime<Utc>,
    ) -> Self {
        let mut result = Self::new(step_id, StepStatus::Failed, attempts, started_at, completed_at);
        result.error = Some(error);
        result
    }
}

/// Execution context for one playbook invocation.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct ExecutionContext {
    pub execution_id: String,
    pub trace_id: String,
    pub playbook_code: String,
    pub inputs: BoundInputs,
    /// Step results in execution order.
    pub step_results: Vec<StepResult>,
    pub status: ExecutionStatus,
    /// Index of the next step to execute.
    pub next_step: usize,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub batch_summary: Option<BatchSummary>,
    pub started_at: DateTime<Utc>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub completed_at: Option<DateTime<Utc>>,
}

impl ExecutionContext {
    /// Creates a pending context with fresh execution and trace ids.
    pub fn new(playbook_code: impl Into<String>, inputs: BoundInputs) -> Self {
        Self::with_trace(playbook_code, inputs, Uuid::new_v4().to_string())
    }

    /// Creates a pending context that shares an existing trace id.
    pub fn with_trace(
        playbook_code: impl Into<String>,
        inputs: BoundInputs,
        trace_id: impl Into<String>,
    ) -> Self {
        Self {
            execution_id: Uuid::new_v4().to_string(),
            trace_id: trace_id.into(),
            playbook_code: playbook_code.into(),
            inputs,
            step_results: Vec::new(),
            status: ExecutionStatus::Pending,
            next_step: 0,
            batch_summary: None,
            started_at: Utc::now(),
            completed_at: None,
        }
    }

    /// Records the result of a step, replacing an earlier result for the same
    /// step (a dispatched step completing after a poll).
    pub fn record_step_result(&mut self, result: StepResult) {
        match self.step_results.iter_mut().find(|r| r.step_id == result.step_id) {
            Some(existing) => *existing = result,
            None => self.step_results.push(result),
        }
    }

    /// Gets the result of a previously executed step.
    pub fn get_step_result(&self, step_id: &str) -> Option<&StepResult> {
        self.step_results.iter().find(|r| r.step_id == step_id)
    }

    /// Outputs of successful steps, in execution order.
    pub fn successful_outputs(&self) -> impl Iterator<Item = &Value> {
        self.step_results
            .iter()
            .filter(|r| r.status == StepStatus::Success)
            .filter_map(|r| r.output.as_ref())
    }

    /// Moves the context to a new status.
    ///
    /// Returns `false` and leaves the status untouched when the transition is
    /// not allowed (terminal statuses are final).
    pub fn advance(&mut self, next: ExecutionStatus) -> bool {
        if !self.status.can_advance_to(next) {
            tracing::warn!(
                execution_id = %self.execution_id,
                from = %self.status,
                to = %next,
                "Ignoring invalid execution status transition"
            );
            return false;
        }
        self.status = next;
        if next.is_terminal() {
            self.completed_at = Some(Utc::now());
        }
        true
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use serde_json::json;

    #[test]
    fn test_status_transitions() {
        let mut context = ExecutionContext::new("p", BoundInputs::default());
        assert_eq!(context.status, ExecutionStatus::Pending);
        assert!(!context.advance(ExecutionStatus::Success));
        assert!(context.advance(ExecutionStatus::Running));
        assert!(context.advance(ExecutionStatus::PartialFailure));
        assert!(context.completed_at.is_some());
        assert!(!context.advance(ExecutionStatus::Running));
        assert_eq!(context.status, ExecutionStatus::PartialFailure);
    }

    #[test]
    fn test_record_replaces_same_step() {
        let mut context = ExecutionContext::new("p", BoundInputs::default());
        context.record_step_result(StepResult::dispatched("render", "job-1", 1, Utc::now()));
        context.record_step_result(StepResult::success(
            "render",
            json!({"url": "x"}),
            1,
            Utc::now(),
            Utc::now(),
        ));

        assert_eq!(context.step_results.len(), 1);
        assert_eq!(context.get_step_result("render").unwrap().status, StepStatus::Success);
        assert_eq!(context.successful_outputs().count(), 1);
    }

    #[test]
    fn test_ids_are_unique() {
        let a = ExecutionContext::new("p", BoundInputs::default());
        let b = ExecutionContext::with_trace("p", BoundInputs::default(), a.trace_id.clone());
        assert_ne!(a.execution_id, b.execution_id);
        assert_eq!(a.trace_id, b.trace_id);
    }
}
