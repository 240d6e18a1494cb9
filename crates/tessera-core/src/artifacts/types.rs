use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};
use sha2::{Digest, Sha256};

use crate::binding::ContentStatus;

/// Content a finished execution asks to persist.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct ArtifactDraft {
    /// Capability partition the artifact is stored under.
    pub capability: String,
    pub name: String,
    pub extension: String,
    pub content: String,
    pub content_status: ContentStatus,
    pub execution_id: String,
    /// Step whose output produced the content.
    pub step_id: String,
}

/// A persisted, immutable artifact version. Serialized as the metadata
/// sidecar next to the content.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct Artifact {
    pub id: String,
    pub storage_key: String,
    pub capability: String,
    pub name: String,
    pub version: u32,
    pub extension: String,
    pub content_status: ContentStatus,
    /// Storage key of the version this one was refined from.
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub derived_from: Option<String>,
    pub execution_id: String,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub step_id: Option<String>,
    pub created_at: DateTime<Utc>,
    pub sha256: String,
    pub size_bytes: u64,
}

/// Execution-scoped artifact id.
pub fn artifact_id(execution_id: &str, name: &str, version: u32) -> String {
    format!("{execution_id}-{name}-v{version}")
}

pub fn sha256_hex(bytes: &[u8]) -> String {
    let mut hasher = Sha256::new();
    hasher.update(bytes);
    hex::encode(hasher.finalize())
}
