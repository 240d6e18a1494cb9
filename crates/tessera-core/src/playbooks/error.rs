//! Error types for playbook operations.

use std::path::PathBuf;
use thiserror::Error;

/// Errors that can occur while loading or resolving playbook definitions.
#[derive(Error, Debug)]
pub enum PlaybookError {
    /// Failed to load playbook file.
    #[error("Failed to load playbook file at {path}: {source}")]
    LoadError {
        path: PathBuf,
        #[source]
        source: std::io::Error,
    },

    /// Failed to parse playbook YAML frontmatter.
    #[error("Failed to parse playbook frontmatter{}: {source}", path.as_ref().map(|p| format!(" at {}", p.display())).unwrap_or_default())]
    ParseError {
        path: Option<PathBuf>,
        #[source]
        source: serde_yaml::Error,
    },

    /// Invalid frontmatter format.
    #[error("Invalid frontmatter format: {0}")]
    InvalidFrontmatter(String),

    /// Missing required field in playbook.
    #[error("Missing required field in playbook: {0}")]
    MissingField(String),

    /// Version is not a semantic version.
    #[error("Invalid version '{version}': {reason}")]
    InvalidVersion { version: String, reason: String },

    /// Locale declarations are inconsistent.
    #[error("Invalid locale configuration: {0}")]
    InvalidLocale(String),

    /// Tool reference is not `capability.tool_name`.
    #[error("Invalid tool reference '{0}', expected 'capability.tool_name'")]
    InvalidToolRef(String),

    /// A step references a tool that the playbook does not declare.
    #[error("Step '{step_id}' references undeclared tool '{tool}'")]
    UndeclaredTool { step_id: String, tool: String },

    /// Two steps share the same id.
    #[error("Duplicate step id: {0}")]
    DuplicateStep(String),

    /// Two definitions share the same code and locale.
    #[error("Duplicate playbook code '{code}' for locale '{locale}'")]
    DuplicateCode { code: String, locale: String },

    /// Playbook not found.
    #[error("Playbook not found: {0}")]
    NotFound(String),

    /// I/O error.
    #[error("I/O error: {0}")]
    Io(#[from] std::io::Error),
}

impl PlaybookError {
    /// Returns `true` for errors describing a malformed or inconsistent definition.
    pub fn is_definition_error(&self) -> bool {
        !matches!(self, PlaybookError::NotFound(_) | PlaybookError::Io(_))
    }
}

/// Result type alias for playbook operations.
pub type Result<T> = std::result::Result<T, PlaybookError>;
