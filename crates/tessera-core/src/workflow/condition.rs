//! Tagged condition expressions for conditional step execution.
//!
//! Conditions are small structured predicates over the bound inputs and the
//! results of earlier steps. They are declared in playbook frontmatter, e.g.:
//!
//! ```yaml
//! condition:
//!   all:
//!     - not_skipped: rewrite
//!     - input_in: { field: citation_mode, values: [light, strict] }
//! ```

use serde::{Deserialize, Serialize};
use serde_json::Value;
use tracing::debug;

use super::context::{ExecutionContext, StepStatus};

/// A predicate deciding whether a step runs.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum Condition {
    /// Always run.
    Always,
    /// Run unless the caller's `skip_steps` input lists this step id.
    NotSkipped(String),
    /// Run when the input field is present and not null.
    InputPresent(String),
    /// Run when the input field equals the value.
    InputEquals { field: String, value: Value },
    /// Run when the input field equals one of the values.
    InputIn { field: String, values: Vec<Value> },
    /// Run when the boolean input field is `true`.
    Flag(String),
    /// Run when the named step completed successfully.
    StepSucceeded(String),
    /// Run when a field of the named step's output equals the value.
    StepOutputEquals { step: String, field: String, value: Value },
    /// Run when every inner condition holds.
    All(Vec<Condition>),
    /// Run when at least one inner condition holds.
    Any(Vec<Condition>),
    /// Negation.
    Not(Box<Condition>),
}

impl Condition {
    /// Evaluates the condition against the execution context.
    pub fn evaluate(&self, context: &ExecutionContext) -> bool {
        match self {
            Condition::Always => true,
            Condition::NotSkipped(step_id) => {
                !context.inputs.skip_steps().iter().any(|skipped| skipped == step_id)
            }
            Condition::InputPresent(field) => {
                context.inputs.get(field).is_some_and(|value| !value.is_null())
            }
            Condition::InputEquals { field, value } => context.inputs.get(field) == Some(value),
            Condition::InputIn { field, values } => {
                context.inputs.get(field).is_some_and(|actual| values.contains(actual))
            }
            Condition::Flag(field) => {
                context.inputs.get(field).and_then(Value::as_bool).unwrap_or(false)
            }
            Condition::StepSucceeded(step_id) => context
                .get_step_result(step_id)
                .is_some_and(|result| result.status == StepStatus::Success),
            Condition::StepOutputEquals { step, field, value } => context
                .get_step_result(step)
                .and_then(|result| result.output.as_ref())
                .and_then(|output| output.get(field))
                == Some(value),
            Condition::All(conditions) => conditions.iter().all(|c| c.evaluate(context)),
            Condition::Any(conditions) => conditions.iter().any(|c| c.evaluate(context)),
            Condition::Not(inner) => !inner.evaluate(context),
        }
    }
}

/// Evaluates whether a step should be executed.
///
/// A step without a condition always runs.
pub fn should_execute_step(
    step_id: &str,
    condition: Option<&Condition>,
    context: &ExecutionContext,
) -> bool {
    let Some(condition) = condition else {
        return true;
    };

    let execute = condition.evaluate(context);
    if !execute {
        debug!(
            execution_id = %context.execution_id,
            step_id = %step_id,
            "Step condition evaluated to skip"
        );
    }
    execute
}
