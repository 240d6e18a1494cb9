//! Persisted, versioned outputs of playbook executions.

pub mod error;
pub mod layout;
pub mod service;
pub mod store;
pub mod types;

pub use error::{Result, StorageError};
pub use layout::{ArtifactKey, ArtifactLayout};
pub use service::ArtifactService;
pub use store::{ArtifactStore, FsArtifactStore, MemoryArtifactStore};
pub use types::{Artifact, ArtifactDraft};
