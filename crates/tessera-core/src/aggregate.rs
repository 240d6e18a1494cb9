//! Merge & aggregation stage.
//!
//! Step outputs are folded into one object field by field, following the
//! merge policy each `output_schema` field declares. Batch executions are
//! additionally summarized into a [`BatchSummary`].

use serde::{Deserialize, Serialize};
use serde_json::{Map, Value};
use std::collections::BTreeMap;

use crate::batch::{BatchItemResult, BatchItemStatus};
use crate::error::ErrorKind;
use crate::playbooks::types::{MergePolicy, OutputField, Reducer};

/// Folds step outputs into a single aggregated object.
#[derive(Debug)]
pub struct Aggregation<'a> {
    schema: &'a BTreeMap<String, OutputField>,
    merged: Map<String, Value>,
    samples: BTreeMap<String, Vec<f64>>,
}

impl<'a> Aggregation<'a> {
    pub fn new(schema: &'a BTreeMap<String, OutputField>) -> Self {
        Self { schema, merged: Map::new(), samples: BTreeMap::new() }
    }

    /// Merges one step output. Non-object outputs carry no fields and are
    /// ignored.
    pub fn merge(&mut self, output: &Value) {
        let Some(fields) = output.as_object() else {
            return;
        };

        for (name, field) in self.schema {
            if let MergePolicy::Reduce { from, .. } = &field.merge {
                let sources: Vec<&str> = if from.is_empty() {
                    vec![name.as_str()]
                } else {
                    from.iter().map(String::as_str).collect()
                };
                let samples = self.samples.entry(name.clone()).or_default();
                for source in sources {
                    if let Some(value) = fields.get(source) {
                        collect_numbers(value, samples);
                    }
                }
            }
        }

        for (name, value) in fields {
            if value.is_null() {
                continue;
            }
            match self.schema.get(name).map(|field| &field.merge) {
                Some(MergePolicy::UnionByKey { key, dedup, max }) => {
                    let slot = self
                        .merged
                        .entry(name.clone())
                        .or_insert_with(|| Value::Array(Vec::new()));
                    if !slot.is_array() {
                        *slot = Value::Array(Vec::new());
                    }
                    if let Value::Array(existing) = slot {
                        union_by_key(existing, value, key, dedup, max.as_deref());
                    }
                }
                // Reduced fields are computed in `finish`.
                Some(MergePolicy::Reduce { .. }) => {}
                Some(MergePolicy::OverwriteLast) | None => {
                    self.merged.insert(name.clone(), value.clone());
                }
            }
        }
    }

    /// The merged object so far, without reductions applied.
    pub fn current(&self) -> &Map<String, Value> {
        &self.merged
    }

    /// Applies reducers and returns the aggregated object.
    pub fn finish(mut self) -> Map<String, Value> {
        for (name, field) in self.schema {
            if let MergePolicy::Reduce { reducer, .. } = &field.merge {
                let reduced = self
                    .samples
                    .get(name)
                    .and_then(|samples| reduce(*reducer, samples))
                    .map_or(Value::Null, number);
                if !reduced.is_null() {
                    self.merged.insert(name.clone(), reduced);
                }
            }
        }
        self.merged
    }
}

/// Aggregates the given step outputs in order.
pub fn aggregate<'v>(
    schema: &BTreeMap<String, OutputField>,
    outputs: impl IntoIterator<Item = &'v Value>,
) -> Map<String, Value> {
    let mut aggregation = Aggregation::new(schema);
    for output in outputs {
        aggregation.merge(output);
    }
    aggregation.finish()
}

/// Unions `incoming` into `existing`, identifying entries by `key`.
///
/// On collision, `dedup` arrays are union-deduplicated, the `max` field keeps
/// the larger number, and fields absent from the existing entry are filled
/// from the incoming one. Merging the same entries again changes nothing.
pub fn union_by_key(
    existing: &mut Vec<Value>,
    incoming: &Value,
    key: &str,
    dedup: &[String],
    max: Option<&str>,
) {
    let entries = match incoming {
        Value::Array(items) => items.as_slice(),
        single => std::slice::from_ref(single),
    };

    for entry in entries {
        let identity = entry.get(key).filter(|id| !id.is_null());
        let position = identity.and_then(|id| {
            existing.iter().position(|candidate| candidate.get(key) == Some(id))
        });

        match (position, entry) {
            (Some(index), Value::Object(fields)) => {
                if let Value::Object(target) = &mut existing[index] {
                    merge_entry(target, fields, dedup, max);
                }
            }
            _ => {
                if !existing.contains(entry) {
                    existing.push(entry.clone());
                }
            }
        }
    }
}

fn merge_entry(
    target: &mut Map<String, Value>,
    incoming: &Map<String, Value>,
    dedup: &[String],
    max: Option<&str>,
) {
    for (field, value) in incoming {
        let current = target.get_mut(field);
        match current {
            Some(Value::Array(items)) if dedup.iter().any(|d| d == field) => {
                let additions = match value {
                    Value::Array(values) => values.as_slice(),
                    single => std::slice::from_ref(single),
                };
                for item in additions {
                    if !items.contains(item) {
                        items.push(item.clone());
                    }
                }
            }
            Some(slot) if max == Some(field.as_str()) => {
                if let (Some(a), Some(b)) = (slot.as_f64(), value.as_f64()) {
                    if b > a {
                        *slot = value.clone();
                    }
                } else if slot.is_null() {
                    *slot = value.clone();
                }
            }
            Some(slot) if slot.is_null() => *slot = value.clone(),
            Some(_) => {}
            None => {
                target.insert(field.clone(), value.clone());
            }
        }
    }
}

fn collect_numbers(value: &Value, samples: &mut Vec<f64>) {
    match value {
        Value::Number(n) => samples.extend(n.as_f64()),
        Value::Array(items) => samples.extend(items.iter().filter_map(Value::as_f64)),
        _ => {}
    }
}

/// Reduces numeric samples. Returns `None` for an empty sample set.
pub fn reduce(reducer: Reducer, samples: &[f64]) -> Option<f64> {
    if samples.is_empty() {
        return None;
    }
    let value = match reducer {
        Reducer::Mean => samples.iter().sum::<f64>() / samples.len() as f64,
        Reducer::Sum => samples.iter().sum(),
        Reducer::Min => samples.iter().copied().fold(f64::INFINITY, f64::min),
        Reducer::Max => samples.iter().copied().fold(f64::NEG_INFINITY, f64::max),
    };
    Some(value)
}

fn number(value: f64) -> Value {
    serde_json::Number::from_f64(value).map_or(Value::Null, Value::Number)
}

/// One failed item in a batch.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct BatchItemError {
    pub item_index: usize,
    pub error_kind: ErrorKind,
    pub message: String,
}

/// Summary of a batch execution.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize, Default)]
pub struct BatchSummary {
    pub total: usize,
    pub success: usize,
    pub failed: usize,
    pub skipped: usize,
    /// Mean primary score over successful items that reported one.
    pub avg_score: Option<f64>,
    pub errors: Vec<BatchItemError>,
}

impl BatchSummary {
    /// Summarizes item results. Every item must have reached a terminal state.
    pub fn from_items(items: &[BatchItemResult]) -> Self {
        let mut summary = Self { total: items.len(), ..Self::default() };
        let mut scores = Vec::new();

        for item in items {
            match item.status {
                BatchItemStatus::Success => {
                    summary.success += 1;
                    scores.extend(item.score);
                }
                BatchItemStatus::Skipped => summary.skipped += 1,
                BatchItemStatus::Failed => {
                    summary.failed += 1;
                    if let Some(error) = &item.error {
                        summary.errors.push(BatchItemError {
                            item_index: item.item_index,
                            error_kind: error.error_kind,
                            message: error.message.clone(),
                        });
                    }
                }
            }
        }

        summary.avg_score = reduce(Reducer::Mean, &scores);
        summary
    }
}
