//! Output finalizer.
//!
//! Projects the aggregated output onto the playbook's `output_schema`,
//! derives governance flags and collects the artifacts to persist.

use serde::{Deserialize, Serialize};
use serde_json::{Map, Value};
use thiserror::Error;

use crate::artifacts::ArtifactDraft;
use crate::binding::{CitationMode, ContentStatus};
use crate::playbooks::types::PlaybookDefinition;
use crate::workflow::context::{ExecutionContext, ExecutionStatus, StepStatus};

/// Field listing claims and their supporting sources.
pub const CLAIMS_FIELD: &str = "claims_to_sources";
/// Field each claim must carry under strict citation.
pub const ANCHOR_FIELD: &str = "anchor";
pub const RESULT_STATUS_FIELD: &str = "result_status";
pub const BATCH_SUMMARY_FIELD: &str = "batch_summary";

/// Aggregated output does not satisfy the declared schema.
#[derive(Error, Debug, Clone, PartialEq, Eq)]
#[error("Output does not satisfy output_schema: {}", fields.join(", "))]
pub struct SchemaMismatch {
    /// Offending fields, each optionally followed by a reason in parentheses.
    pub fields: Vec<String>,
}

/// Boolean flags used by downstream systems.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize, Default)]
pub struct GovernanceFlags {
    pub is_artifact: bool,
    pub has_structured_output: bool,
    pub should_embed: bool,
    pub is_final: bool,
}

impl GovernanceFlags {
    pub fn derive(content_status: ContentStatus, artifacts: usize, output: &Map<String, Value>) -> Self {
        Self {
            is_artifact: artifacts > 0,
            has_structured_output: output.values().any(is_populated_structure),
            should_embed: content_status == ContentStatus::Published,
            is_final: matches!(content_status, ContentStatus::Published | ContentStatus::Archived),
        }
    }

    fn entries(self) -> [(&'static str, bool); 4] {
        [
            ("is_artifact", self.is_artifact),
            ("has_structured_output", self.has_structured_output),
            ("should_embed", self.should_embed),
            ("is_final", self.is_final),
        ]
    }
}

fn is_populated_structure(value: &Value) -> bool {
    match value {
        Value::Array(items) => !items.is_empty(),
        Value::Object(map) => !map.is_empty(),
        _ => false,
    }
}

/// The finalized result of one execution.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct FinalResult {
    /// Output object with exactly the declared keys.
    pub output: Map<String, Value>,
    pub status: ExecutionStatus,
    pub flags: GovernanceFlags,
    /// Artifacts to hand to the storage collaborator.
    #[serde(default, skip_serializing_if = "Vec::is_empty")]
    pub artifacts: Vec<ArtifactDraft>,
}

/// Terminal status implied by the recorded step results.
pub fn outcome_status(context: &ExecutionContext) -> ExecutionStatus {
    if context.step_results.iter().any(|r| r.status == StepStatus::Failed) {
        ExecutionStatus::PartialFailure
    } else {
        ExecutionStatus::Success
    }
}

/// Finalizes an execution.
///
/// # Errors
///
/// Returns [`SchemaMismatch`] when a required field is missing or mistyped,
/// an artifact step produced no content, or strict citation is requested and
/// the declared claims are empty or a claim has no anchor.
pub fn finalize(
    definition: &PlaybookDefinition,
    context: &ExecutionContext,
    mut aggregated: Map<String, Value>,
) -> Result<FinalResult, SchemaMismatch> {
    let mut mismatched = Vec::new();
    let status = outcome_status(context);
    let content_status = context.inputs.content_status();

    let artifacts = collect_artifacts(definition, context, content_status, &mut mismatched);

    aggregated.insert(RESULT_STATUS_FIELD.to_string(), Value::String(status.to_string()));
    if let Some(summary) = &context.batch_summary {
        if let Ok(value) = serde_json::to_value(summary) {
            aggregated.insert(BATCH_SUMMARY_FIELD.to_string(), value);
        }
    }

    let mut output = Map::new();
    for name in definition.output_schema.keys() {
        let value = aggregated.get(name).filter(|v| !v.is_null()).cloned();
        output.insert(name.clone(), value.unwrap_or(Value::Null));
    }

    let flags = GovernanceFlags::derive(content_status, artifacts.len(), &output);
    for (name, flag) in flags.entries() {
        if definition.output_schema.contains_key(name) {
            output.insert(name.to_string(), Value::Bool(flag));
        }
    }

    for (name, field) in &definition.output_schema {
        let value = &output[name];
        if value.is_null() {
            if field.required {
                mismatched.push(format!("{name} (missing)"));
            }
        } else if !field.field_type.accepts(value) {
            let expected = format!("{:?}", field.field_type).to_lowercase();
            mismatched.push(format!("{name} (expected {expected})"));
        }
    }

    if context.inputs.citation_mode() == CitationMode::Strict {
        check_anchors(definition, &output, &mut mismatched);
    }

    if !mismatched.is_empty() {
        return Err(SchemaMismatch { fields: mismatched });
    }

    Ok(FinalResult { output, status, flags, artifacts })
}

fn collect_artifacts(
    definition: &PlaybookDefinition,
    context: &ExecutionContext,
    content_status: ContentStatus,
    mismatched: &mut Vec<String>,
) -> Vec<ArtifactDraft> {
    let mut drafts = Vec::new();
    for step in &definition.steps {
        let Some(spec) = &step.artifact else { continue };
        let Some(result) = context.get_step_result(&step.step_id) else { continue };
        if result.status != StepStatus::Success {
            continue;
        }

        let content = match result.output.as_ref().and_then(|o| o.get(&spec.content_field)) {
            Some(Value::String(text)) if !text.is_empty() => text.clone(),
            Some(value @ (Value::Object(_) | Value::Array(_))) => {
                serde_json::to_string_pretty(value).unwrap_or_default()
            }
            _ => {
                mismatched.push(format!("{}.{} (no artifact content)", step.step_id, spec.content_field));
                continue;
            }
        };

        drafts.push(ArtifactDraft {
            capability: definition.artifact_capability().to_string(),
            name: spec.name.clone(),
            extension: spec.extension.clone(),
            content,
            content_status,
            execution_id: context.execution_id.clone(),
            step_id: step.step_id.clone(),
        });
    }
    drafts
}

/// Strict citation: a declared claims field must hold at least one claim and
/// every claim needs a non-empty anchor.
fn check_anchors(
    definition: &PlaybookDefinition,
    output: &Map<String, Value>,
    mismatched: &mut Vec<String>,
) {
    if !definition.output_schema.contains_key(CLAIMS_FIELD) {
        return;
    }
    match output.get(CLAIMS_FIELD) {
        Some(Value::Array(claims)) if !claims.is_empty() => {
            let anchored = claims.iter().all(|claim| {
                claim.get(ANCHOR_FIELD).and_then(Value::as_str).is_some_and(|a| !a.trim().is_empty())
            });
            if !anchored {
                mismatched.push(format!("{CLAIMS_FIELD} ({ANCHOR_FIELD} required by strict citation)"));
            }
        }
        None | Some(Value::Null | Value::Array(_)) => {
            mismatched.push(format!("{CLAIMS_FIELD} (claims required by strict citation)"));
        }
        // Mistyped values are already reported by the schema check.
        Some(_) => {}
    }
}
