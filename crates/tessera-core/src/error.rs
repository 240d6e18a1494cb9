//! Engine-level errors and the structured failure object returned to callers.

use serde::{Deserialize, Serialize};
use std::fmt;
use std::time::Duration;
use thiserror::Error;

use crate::artifacts::StorageError;
use crate::binding::BindingError;
use crate::finalize::SchemaMismatch;
use crate::playbooks::PlaybookError;
use crate::workflow::StepError;

/// Stable classification of a failed execution.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum ErrorKind {
    Definition,
    NotFound,
    Validation,
    Retryable,
    StepFailure,
    SchemaMismatch,
    Storage,
}

impl ErrorKind {
    pub fn as_str(self) -> &'static str {
        match self {
            Self::Definition => "definition",
            Self::NotFound => "not_found",
            Self::Validation => "validation",
            Self::Retryable => "retryable",
            Self::StepFailure => "step_failure",
            Self::SchemaMismatch => "schema_mismatch",
            Self::Storage => "storage",
        }
    }
}

impl fmt::Display for ErrorKind {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(self.as_str())
    }
}

/// Errors raised while executing a playbook.
#[derive(Error, Debug)]
pub enum EngineError {
    #[error(transparent)]
    Playbook(#[from] PlaybookError),

    #[error("Invalid input: {0}")]
    Validation(#[from] BindingError),

    #[error(transparent)]
    Step(#[from] StepError),

    #[error(transparent)]
    SchemaMismatch(#[from] SchemaMismatch),

    #[error(transparent)]
    Storage(#[from] StorageError),

    #[error("Job not found: {0}")]
    JobNotFound(String),

    #[error("Job id already in use: {0}")]
    JobConflict(String),

    #[error("Batch mode is not supported: {0}")]
    BatchUnsupported(String),

    #[error("Timed out after {0:?}")]
    Timeout(Duration),
}

impl EngineError {
    pub fn kind(&self) -> ErrorKind {
        match self {
            EngineError::Playbook(PlaybookError::NotFound(_)) | EngineError::JobNotFound(_) => {
                ErrorKind::NotFound
            }
            EngineError::Playbook(_) => ErrorKind::Definition,
            EngineError::Validation(_) | EngineError::BatchUnsupported(_) => ErrorKind::Validation,
            EngineError::Step(_) | EngineError::JobConflict(_) => ErrorKind::StepFailure,
            EngineError::SchemaMismatch(_) => ErrorKind::SchemaMismatch,
            EngineError::Storage(_) => ErrorKind::Storage,
            EngineError::Timeout(_) => ErrorKind::Retryable,
        }
    }

    /// Fields the error refers to, if any.
    pub fn fields(&self) -> Vec<String> {
        match self {
            EngineError::Validation(e) => vec![e.field().to_string()],
            EngineError::SchemaMismatch(e) => e.fields.clone(),
            EngineError::BatchUnsupported(_) => vec!["run_mode".to_string()],
            _ => Vec::new(),
        }
    }

    /// Converts the error into the caller-facing failure object.
    pub fn into_failure(self, trace_id: Option<&str>) -> ExecutionFailure {
        let mut failure = ExecutionFailure::new(self.kind(), self.to_string());
        failure.fields = self.fields();
        failure.trace_id = trace_id.map(str::to_string);
        if let EngineError::Step(step) = &self {
            failure.step_id = Some(step.step_id.clone());
        }
        failure
    }
}

/// Result type alias for engine operations.
pub type Result<T> = std::result::Result<T, EngineError>;

/// Structured error returned to callers in place of a result.
#[derive(Error, Debug, Clone, PartialEq, Serialize, Deserialize)]
#[error("{error_kind}: {message}")]
pub struct ExecutionFailure {
    pub error_kind: ErrorKind,
    pub message: String,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub trace_id: Option<String>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub execution_id: Option<String>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub step_id: Option<String>,
    #[serde(default, skip_serializing_if = "Vec::is_empty")]
    pub fields: Vec<String>,
}

impl ExecutionFailure {
    pub fn new(error_kind: ErrorKind, message: impl Into<String>) -> Self {
        Self {
            error_kind,
            message: message.into(),
            trace_id: None,
            execution_id: None,
            step_id: None,
            fields: Vec::new(),
        }
    }

    #[must_use]
    pub fn with_execution(mut self, execution_id: impl Into<String>) -> Self {
        self.execution_id = Some(execution_id.into());
        self
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::tools::ToolError;

    #[test]
    fn test_kind_strings_are_stable() {
        let kinds = [
            (ErrorKind::Definition, "definition"),
            (ErrorKind::NotFound, "not_found"),
            (ErrorKind::Validation, "validation"),
            (ErrorKind::Retryable, "retryable"),
            (ErrorKind::StepFailure, "step_failure"),
            (ErrorKind::SchemaMismatch, "schema_mismatch"),
            (ErrorKind::Storage, "storage"),
        ];
        for (kind, text) in kinds {
            assert_eq!(kind.as_str(), text);
            assert_eq!(serde_json::to_value(kind).unwrap(), serde_json::json!(text));
        }
    }

    #[test]
    fn test_validation_failure_names_field() {
        let error = EngineError::from(BindingError::MissingField("content_source".to_string()));
        let failure = error.into_failure(Some("trace-1"));

        assert_eq!(failure.error_kind, ErrorKind::Validation);
        assert_eq!(failure.fields, vec!["content_source".to_string()]);
        assert_eq!(failure.trace_id.as_deref(), Some("trace-1"));
    }

    #[test]
    fn test_not_found_classification() {
        let error = EngineError::from(PlaybookError::NotFound("nope".to_string()));
        assert_eq!(error.kind(), ErrorKind::NotFound);
        assert_eq!(EngineError::JobNotFound("j".to_string()).kind(), ErrorKind::NotFound);
        assert_eq!(
            EngineError::from(PlaybookError::DuplicateStep("a".to_string())).kind(),
            ErrorKind::Definition
        );
    }

    #[test]
    fn test_step_failure_carries_step_id() {
        let error = EngineError::from(StepError {
            step_id: "rewrite".to_string(),
            attempts: 3,
            source: ToolError::Transient("503".to_string()),
        });
        let failure = error.into_failure(None);
        assert_eq!(failure.error_kind, ErrorKind::StepFailure);
        assert_eq!(failure.step_id.as_deref(), Some("rewrite"));
    }
}
