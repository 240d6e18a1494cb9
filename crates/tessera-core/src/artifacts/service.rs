//! Persistence, refinement and provenance of artifacts.

use chrono::Utc;
use std::collections::HashSet;
use std::sync::Arc;
use tracing::{info, warn};

use super::error::{Result, StorageError};
use super::layout::ArtifactKey;
use super::store::ArtifactStore;
use super::types::{Artifact, ArtifactDraft, artifact_id, sha256_hex};
use crate::binding::ContentStatus;

/// Upper bound on version probing when refining.
const MAX_VERSIONS: u32 = 10_000;

/// Writes artifacts through a store and maintains their provenance links.
#[derive(Clone)]
pub struct ArtifactService {
    store: Arc<dyn ArtifactStore>,
}

impl ArtifactService {
    pub fn new(store: Arc<dyn ArtifactStore>) -> Self {
        Self { store }
    }

    pub fn store(&self) -> &Arc<dyn ArtifactStore> {
        &self.store
    }

    /// Persists the first version of a drafted artifact.
    pub async fn persist(&self, draft: &ArtifactDraft) -> Result<Artifact> {
        let id = artifact_id(&draft.execution_id, &draft.name, 1);
        let key = ArtifactKey::new(&draft.capability, id, &draft.extension);
        let artifact = self
            .write(
                &key,
                draft.name.clone(),
                1,
                draft.content.as_bytes(),
                draft.content_status,
                None,
                draft.execution_id.clone(),
                Some(draft.step_id.clone()),
            )
            .await?;

        info!(
            storage_key = %artifact.storage_key,
            execution_id = %artifact.execution_id,
            "Persisted artifact"
        );
        Ok(artifact)
    }

    /// Creates a new version derived from `parent_key`. The parent is left
    /// untouched.
    pub async fn refine(
        &self,
        parent_key: &str,
        content: &str,
        content_status: ContentStatus,
    ) -> Result<Artifact> {
        let parent = self.store.read_metadata(parent_key).await?;

        let mut version = parent.version + 1;
        let key = loop {
            let id = artifact_id(&parent.execution_id, &parent.name, version);
            let key = ArtifactKey::new(&parent.capability, id, &parent.extension);
            if !self.version_taken(&key).await? {
                break key;
            }
            version += 1;
            if version > MAX_VERSIONS {
                return Err(StorageError::AlreadyExists(key.metadata_key()));
            }
        };

        let artifact = self
            .write(
                &key,
                parent.name.clone(),
                version,
                content.as_bytes(),
                content_status,
                Some(parent.storage_key.clone()),
                parent.execution_id.clone(),
                parent.step_id.clone(),
            )
            .await?;

        info!(
            storage_key = %artifact.storage_key,
            derived_from = %parent.storage_key,
            version,
            "Refined artifact"
        );
        Ok(artifact)
    }

    /// Provenance chain from `storage_key` back to its root version.
    pub async fn lineage(&self, storage_key: &str) -> Result<Vec<Artifact>> {
        let mut chain = Vec::new();
        let mut visited = HashSet::new();
        let mut next = Some(storage_key.to_string());

        while let Some(key) = next {
            if !visited.insert(key.clone()) {
                return Err(StorageError::LineageCycle(key));
            }
            let artifact = self.store.read_metadata(&key).await?;
            next = artifact.derived_from.clone();
            chain.push(artifact);
        }

        Ok(chain)
    }

    async fn version_taken(&self, key: &ArtifactKey) -> Result<bool> {
        // The sidecar key does not depend on the status partition.
        let draft_key = key.content_key(ContentStatus::Draft);
        match self.store.read_metadata(&draft_key).await {
            Ok(_) => Ok(true),
            Err(StorageError::NotFound(_)) => Ok(false),
            Err(e) => Err(e),
        }
    }

    #[allow(clippy::too_many_arguments)]
    async fn write(
        &self,
        key: &ArtifactKey,
        name: String,
        version: u32,
        content: &[u8],
        content_status: ContentStatus,
        derived_from: Option<String>,
        execution_id: String,
        step_id: Option<String>,
    ) -> Result<Artifact> {
        let storage_key = self.store.write_artifact(key, content, content_status).await?;
        let artifact = Artifact {
            id: key.id.clone(),
            storage_key,
            capability: key.capability.clone(),
            name,
            version,
            extension: key.extension.clone(),
            content_status,
            derived_from,
            execution_id,
            step_id,
            created_at: Utc::now(),
            sha256: sha256_hex(content),
            size_bytes: content.len() as u64,
        };
        if let Err(e) = self.store.write_metadata(&artifact).await {
            // Without its sidecar the content would block this version.
            if let Err(cleanup) = self.store.remove_artifact(&artifact.storage_key).await {
                warn!(
                    storage_key = %artifact.storage_key,
                    error = %cleanup,
                    "Failed to remove artifact content after metadata write failed"
                );
            }
            return Err(e);
        }
        Ok(artifact)
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::artifacts::store::MemoryArtifactStore;

    fn draft() -> ArtifactDraft {
        ArtifactDraft {
            capability: "seo".to_string(),
            name: "article".to_string(),
            extension: "md".to_string(),
            content: "# Draft".to_string(),
            content_status: ContentStatus::Draft,
            execution_id: "exec-1".to_string(),
            step_id: "rewrite".to_string(),
        }
    }

    #[tokio::test]
    async fn test_persist_writes_content_and_sidecar() {
        let store = Arc::new(MemoryArtifactStore::new());
        let service = ArtifactService::new(store.clone());

        let artifact = service.persist(&draft()).await.unwrap();
        assert_eq!(artifact.storage_key, "seo/generated/draft/exec-1-article-v1.md");
        assert_eq!(artifact.version, 1);
        assert_eq!(artifact.sha256, sha256_hex(b"# Draft"));
        assert_eq!(store.keys().await.len(), 2);

        let again = service.persist(&draft()).await.unwrap_err();
        assert!(matches!(again, StorageError::AlreadyExists(_)));
    }

    /// Delegates to memory but fails every sidecar write.
    struct SidecarFailingStore(MemoryArtifactStore);

    #[async_trait::async_trait]
    impl ArtifactStore for SidecarFailingStore {
        async fn write_artifact(
            &self,
            key: &ArtifactKey,
            content: &[u8],
            content_status: ContentStatus,
        ) -> Result<String> {
            self.0.write_artifact(key, content, content_status).await
        }

        async fn read_artifact(&self, storage_key: &str) -> Result<Vec<u8>> {
            self.0.read_artifact(storage_key).await
        }

        async fn write_metadata(&self, artifact: &Artifact) -> Result<()> {
            Err(StorageError::Io {
                key: artifact.storage_key.clone(),
                source: std::io::Error::other("disk full"),
            })
        }

        async fn read_metadata(&self, storage_key: &str) -> Result<Artifact> {
            self.0.read_metadata(storage_key).await
        }

        async fn exists(&self, storage_key: &str) -> Result<bool> {
            self.0.exists(storage_key).await
        }

        async fn remove_artifact(&self, storage_key: &str) -> Result<()> {
            self.0.remove_artifact(storage_key).await
        }
    }

    #[tokio::test]
    async fn test_failed_sidecar_write_leaves_no_orphan() {
        let store = Arc::new(SidecarFailingStore(MemoryArtifactStore::new()));
        let service = ArtifactService::new(store.clone());

        let err = service.persist(&draft()).await.unwrap_err();
        assert!(matches!(err, StorageError::Io { .. }));
        assert!(store.0.keys().await.is_empty());
    }

    #[tokio::test]
    async fn test_refine_links_versions() {
        let store = Arc::new(MemoryArtifactStore::new());
        let service = ArtifactService::new(store.clone());

        let v1 = service.persist(&draft()).await.unwrap();
        let v2 = service.refine(&v1.storage_key, "# Review", ContentStatus::InReview).await.unwrap();
        let v3 = service.refine(&v2.storage_key, "# Final", ContentStatus::Published).await.unwrap();

        assert_eq!(v2.version, 2);
        assert_eq!(v2.derived_from.as_deref(), Some(v1.storage_key.as_str()));
        assert_eq!(v3.storage_key, "seo/generated/published/exec-1-article-v3.md");

        // The parent is immutable.
        assert_eq!(store.read_artifact(&v1.storage_key).await.unwrap(), b"# Draft");

        let lineage = service.lineage(&v3.storage_key).await.unwrap();
        let versions: Vec<u32> = lineage.iter().map(|a| a.version).collect();
        assert_eq!(versions, vec![3, 2, 1]);
    }

    #[tokio::test]
    async fn test_refining_same_parent_twice_takes_next_version() {
        let service = ArtifactService::new(Arc::new(MemoryArtifactStore::new()));
        let v1 = service.persist(&draft()).await.unwrap();

        let a = service.refine(&v1.storage_key, "a", ContentStatus::Draft).await.unwrap();
        let b = service.refine(&v1.storage_key, "b", ContentStatus::Draft).await.unwrap();
        assert_eq!(a.version, 2);
        assert_eq!(b.version, 3);
        assert_eq!(b.derived_from, a.derived_from);
    }

    #[tokio::test]
    async fn test_lineage_detects_cycles() {
        let store = Arc::new(MemoryArtifactStore::new());
        let service = ArtifactService::new(store.clone());

        let key_a = "seo/generated/draft/a-v1.md";
        let key_b = "seo/generated/draft/b-v1.md";
        for (key, parent) in [(key_a, key_b), (key_b, key_a)] {
            let (artifact_key, _) = ArtifactKey::from_storage_key(key).unwrap();
            store.write_artifact(&artifact_key, b"x", ContentStatus::Draft).await.unwrap();
            store
                .write_metadata(&Artifact {
                    id: artifact_key.id.clone(),
                    storage_key: key.to_string(),
                    capability: "seo".to_string(),
                    name: "x".to_string(),
                    version: 1,
                    extension: "md".to_string(),
                    content_status: ContentStatus::Draft,
                    derived_from: Some(parent.to_string()),
                    execution_id: "e".to_string(),
                    step_id: None,
                    created_at: Utc::now(),
                    sha256: sha256_hex(b"x"),
                    size_bytes: 1,
                })
                .await
                .unwrap();
        }

        let err = service.lineage(key_a).await.unwrap_err();
        assert!(matches!(err, StorageError::LineageCycle(_)));
    }
}
