//! Types for batch executions.

use serde::{Deserialize, Serialize};
use serde_json::{Map, Value};
use std::time::Duration;

use crate::artifacts::Artifact;
use crate::binding::{BindingError, RunMode};
use crate::error::ExecutionFailure;

/// Input field holding the batch items.
pub const ITEMS_FIELD: &str = "items";

/// Concurrency and time budgets of a batch.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct BatchSettings {
    /// Maximum number of items executing at once.
    pub concurrency: usize,
    /// Budget of one item's execution.
    pub item_timeout: Duration,
    /// Budget of the whole batch.
    pub batch_timeout: Duration,
}

impl Default for BatchSettings {
    fn default() -> Self {
        Self {
            concurrency: 4,
            item_timeout: Duration::from_secs(120),
            batch_timeout: Duration::from_secs(600),
        }
    }
}

/// Terminal state of one batch item.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum BatchItemStatus {
    Success,
    /// Every step of the item was skipped.
    Skipped,
    Failed,
}

/// Result of one batch item.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct BatchItemResult {
    pub item_index: usize,
    pub status: BatchItemStatus,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub execution_id: Option<String>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub output: Option<Map<String, Value>>,
    /// The item's primary score, when it reported one.
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub score: Option<f64>,
    #[serde(default, skip_serializing_if = "Vec::is_empty")]
    pub artifacts: Vec<Artifact>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub error: Option<ExecutionFailure>,
}

impl BatchItemResult {
    pub fn success(
        item_index: usize,
        execution_id: impl Into<String>,
        output: Map<String, Value>,
        score: Option<f64>,
    ) -> Self {
        Self {
            item_index,
            status: BatchItemStatus::Success,
            execution_id: Some(execution_id.into()),
            output: Some(output),
            score,
            artifacts: Vec::new(),
            error: None,
        }
    }

    pub fn skipped(item_index: usize, execution_id: impl Into<String>) -> Self {
        Self {
            item_index,
            status: BatchItemStatus::Skipped,
            execution_id: Some(execution_id.into()),
            output: None,
            score: None,
            artifacts: Vec::new(),
            error: None,
        }
    }

    pub fn failed(item_index: usize, execution_id: Option<String>, error: ExecutionFailure) -> Self {
        Self {
            item_index,
            status: BatchItemStatus::Failed,
            execution_id,
            output: None,
            score: None,
            artifacts: Vec::new(),
            error: Some(error),
        }
    }

    #[must_use]
    pub fn with_artifacts(mut self, artifacts: Vec<Artifact>) -> Self {
        self.artifacts = artifacts;
        self
    }
}

/// Expands batch inputs into one raw input object per item.
///
/// Each entry of `items` is overlaid on the shared inputs; a string entry
/// becomes the item's `content_source`. Items always run in single mode.
pub fn expand_items(raw: &Map<String, Value>) -> Result<Vec<Map<String, Value>>, BindingError> {
    let items = match raw.get(ITEMS_FIELD) {
        Some(Value::Array(items)) if !items.is_empty() => items,
        Some(Value::Array(_)) => {
            return Err(BindingError::InvalidValue {
                field: ITEMS_FIELD.to_string(),
                reason: "batch requires at least one item".to_string(),
            });
        }
        Some(_) => {
            return Err(BindingError::InvalidValue {
                field: ITEMS_FIELD.to_string(),
                reason: "expected an array".to_string(),
            });
        }
        None => return Err(BindingError::MissingField(ITEMS_FIELD.to_string())),
    };

    let mut shared = raw.clone();
    shared.remove(ITEMS_FIELD);
    shared.insert(RunMode::FIELD.to_string(), Value::String(RunMode::Single.as_str().to_string()));

    items
        .iter()
        .enumerate()
        .map(|(index, item)| {
            let mut inputs = shared.clone();
            match item {
                Value::Object(overlay) => {
                    inputs.extend(overlay.iter().map(|(k, v)| (k.clone(), v.clone())));
                }
                Value::String(source) => {
                    inputs.insert("content_source".to_string(), Value::String(source.clone()));
                }
                _ => {
                    return Err(BindingError::InvalidValue {
                        field: format!("{ITEMS_FIELD}[{index}]"),
                        reason: "expected an object or a content source string".to_string(),
                    });
                }
            }
            // An item cannot start a nested batch.
            inputs.insert(
                RunMode::FIELD.to_string(),
                Value::String(RunMode::Single.as_str().to_string()),
            );
            Ok(inputs)
        })
        .collect()
}
