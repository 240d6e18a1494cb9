//! Error types for artifact storage.

use thiserror::Error;

/// Errors raised by artifact stores and the artifact service.
#[derive(Error, Debug)]
pub enum StorageError {
    /// Artifacts are immutable; the key is already taken.
    #[error("Artifact already exists: {0}")]
    AlreadyExists(String),

    #[error("Artifact not found: {0}")]
    NotFound(String),

    /// The key is not a valid storage key.
    #[error("Invalid storage key: {0}")]
    InvalidKey(String),

    /// Provenance links loop back on themselves.
    #[error("Provenance cycle detected at {0}")]
    LineageCycle(String),

    #[error("I/O error for {key}: {source}")]
    Io {
        key: String,
        #[source]
        source: std::io::Error,
    },

    #[error("Invalid artifact metadata: {0}")]
    Metadata(#[from] serde_json::Error),
}

/// Result type alias for storage operations.
pub type Result<T> = std::result::Result<T, StorageError>;
