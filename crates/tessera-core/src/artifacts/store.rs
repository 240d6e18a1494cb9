//! Artifact stores. Writes never overwrite an existing key.

use async_trait::async_trait;
use std::collections::HashMap;
use std::io::ErrorKind;
use std::path::PathBuf;
use tokio::io::AsyncWriteExt;
use tokio::sync::RwLock;
use tracing::{debug, warn};

use super::error::{Result, StorageError};
use super::layout::{ArtifactKey, ArtifactLayout};
use super::types::Artifact;
use crate::binding::ContentStatus;

/// Storage collaborator for artifact content and metadata sidecars.
#[async_trait]
pub trait ArtifactStore: Send + Sync {
    /// Writes content into the status partition and returns its storage key.
    async fn write_artifact(
        &self,
        key: &ArtifactKey,
        content: &[u8],
        content_status: ContentStatus,
    ) -> Result<String>;

    async fn read_artifact(&self, storage_key: &str) -> Result<Vec<u8>>;

    /// Writes the metadata sidecar for an artifact.
    async fn write_metadata(&self, artifact: &Artifact) -> Result<()>;

    /// Reads the metadata sidecar belonging to a content storage key.
    async fn read_metadata(&self, storage_key: &str) -> Result<Artifact>;

    async fn exists(&self, storage_key: &str) -> Result<bool>;

    /// Removes content left without a sidecar by a failed persist. Missing
    /// keys are not an error.
    async fn remove_artifact(&self, storage_key: &str) -> Result<()>;
}

/// Artifact store on the local filesystem.
#[derive(Debug, Clone)]
pub struct FsArtifactStore {
    layout: ArtifactLayout,
}

impl FsArtifactStore {
    pub fn new(root: impl Into<PathBuf>) -> Self {
        Self { layout: ArtifactLayout::new(root.into()) }
    }

    pub fn layout(&self) -> &ArtifactLayout {
        &self.layout
    }

    async fn create(&self, key: &str, bytes: &[u8]) -> Result<()> {
        let path = self.layout.path_for(key)?;
        let io_error = |source| StorageError::Io { key: key.to_string(), source };

        if let Some(parent) = path.parent() {
            tokio::fs::create_dir_all(parent).await.map_err(io_error)?;
        }

        let mut file = tokio::fs::OpenOptions::new()
            .write(true)
            .create_new(true)
            .open(&path)
            .await
            .map_err(|e| match e.kind() {
                ErrorKind::AlreadyExists => StorageError::AlreadyExists(key.to_string()),
                _ => io_error(e),
            })?;
        let written = async {
            file.write_all(bytes).await?;
            file.flush().await
        }
        .await;
        if let Err(e) = written {
            drop(file);
            // A truncated file would hold the key forever.
            if let Err(cleanup) = tokio::fs::remove_file(&path).await {
                warn!(key = %key, error = %cleanup, "Failed to remove partial artifact file");
            }
            return Err(io_error(e));
        }

        debug!(key = %key, bytes = bytes.len(), "Wrote artifact file");
        Ok(())
    }

    async fn read(&self, key: &str) -> Result<Vec<u8>> {
        let path = self.layout.path_for(key)?;
        tokio::fs::read(&path).await.map_err(|e| match e.kind() {
            ErrorKind::NotFound => StorageError::NotFound(key.to_string()),
            _ => StorageError::Io { key: key.to_string(), source: e },
        })
    }
}

#[async_trait]
impl ArtifactStore for FsArtifactStore {
    async fn write_artifact(
        &self,
        key: &ArtifactKey,
        content: &[u8],
        content_status: ContentStatus,
    ) -> Result<String> {
        let storage_key = key.content_key(content_status);
        self.create(&storage_key, content).await?;
        Ok(storage_key)
    }

    async fn read_artifact(&self, storage_key: &str) -> Result<Vec<u8>> {
        ArtifactKey::from_storage_key(storage_key)?;
        self.read(storage_key).await
    }

    async fn write_metadata(&self, artifact: &Artifact) -> Result<()> {
        let (key, _) = ArtifactKey::from_storage_key(&artifact.storage_key)?;
        let bytes = serde_json::to_vec_pretty(artifact)?;
        self.create(&key.metadata_key(), &bytes).await
    }

    async fn read_metadata(&self, storage_key: &str) -> Result<Artifact> {
        let (key, _) = ArtifactKey::from_storage_key(storage_key)?;
        let bytes = self.read(&key.metadata_key()).await.map_err(|e| match e {
            StorageError::NotFound(_) => StorageError::NotFound(storage_key.to_string()),
            other => other,
        })?;
        Ok(serde_json::from_slice(&bytes)?)
    }

    async fn exists(&self, storage_key: &str) -> Result<bool> {
        let path = self.layout.path_for(storage_key)?;
        tokio::fs::try_exists(&path)
            .await
            .map_err(|source| StorageError::Io { key: storage_key.to_string(), source })
    }

    async fn remove_artifact(&self, storage_key: &str) -> Result<()> {
        ArtifactKey::from_storage_key(storage_key)?;
        let path = self.layout.path_for(storage_key)?;
        match tokio::fs::remove_file(&path).await {
            Ok(()) => Ok(()),
            Err(e) if e.kind() == ErrorKind::NotFound => Ok(()),
            Err(source) => Err(StorageError::Io { key: storage_key.to_string(), source }),
        }
    }
}

/// In-memory artifact store.
#[derive(Debug, Default)]
pub struct MemoryArtifactStore {
    entries: RwLock<HashMap<String, Vec<u8>>>,
}

impl MemoryArtifactStore {
    pub fn new() -> Self {
        Self::default()
    }

    /// All stored keys, content and sidecars, sorted.
    pub async fn keys(&self) -> Vec<String> {
        let mut keys: Vec<String> = self.entries.read().await.keys().cloned().collect();
        keys.sort();
        keys
    }

    async fn create(&self, key: String, bytes: Vec<u8>) -> Result<()> {
        let mut entries = self.entries.write().await;
        if entries.contains_key(&key) {
            return Err(StorageError::AlreadyExists(key));
        }
        entries.insert(key, bytes);
        Ok(())
    }

    async fn read(&self, key: &str) -> Result<Vec<u8>> {
        self.entries
            .read()
            .await
            .get(key)
            .cloned()
            .ok_or_else(|| StorageError::NotFound(key.to_string()))
    }
}

#[async_trait]
impl ArtifactStore for MemoryArtifactStore {
    async fn write_artifact(
        &self,
        key: &ArtifactKey,
        content: &[u8],
        content_status: ContentStatus,
    ) -> Result<String> {
        let storage_key = key.content_key(content_status);
        self.create(storage_key.clone(), content.to_vec()).await?;
        Ok(storage_key)
    }

    async fn read_artifact(&self, storage_key: &str) -> Result<Vec<u8>> {
        self.read(storage_key).await
    }

    async fn write_metadata(&self, artifact: &Artifact) -> Result<()> {
        let (key, _) = ArtifactKey::from_storage_key(&artifact.storage_key)?;
        self.create(key.metadata_key(), serde_json::to_vec(artifact)?).await
    }

    async fn read_metadata(&self, storage_key: &str) -> Result<Artifact> {
        let (key, _) = ArtifactKey::from_storage_key(storage_key)?;
        let bytes = self
            .read(&key.metadata_key())
            .await
            .map_err(|_| StorageError::NotFound(storage_key.to_string()))?;
        Ok(serde_json::from_slice(&bytes)?)
    }

    async fn exists(&self, storage_key: &str) -> Result<bool> {
        Ok(self.entries.read().await.contains_key(storage_key))
    }

    async fn remove_artifact(&self, storage_key: &str) -> Result<()> {
        self.entries.write().await.remove(storage_key);
        Ok(())
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::artifacts::types::sha256_hex;
    use chrono::Utc;
    use tempfile::TempDir;

    fn artifact(storage_key: &str) -> Artifact {
        Artifact {
            id: "exec-1-article-v1".to_string(),
            storage_key: storage_key.to_string(),
            capability: "seo".to_string(),
            name: "article".to_string(),
            version: 1,
            extension: "md".to_string(),
            content_status: ContentStatus::Draft,
            derived_from: None,
            execution_id: "exec-1".to_string(),
            step_id: None,
            created_at: Utc::now(),
            sha256: sha256_hex(b"# Hello"),
            size_bytes: 7,
        }
    }

    async fn exercise(store: &dyn ArtifactStore) {
        let key = ArtifactKey::new("seo", "exec-1-article-v1", "md");
        let storage_key = store.write_artifact(&key, b"# Hello", ContentStatus::Draft).await.unwrap();
        assert_eq!(storage_key, "seo/generated/draft/exec-1-article-v1.md");
        assert!(store.exists(&storage_key).await.unwrap());

        let err = store.write_artifact(&key, b"# Other", ContentStatus::Draft).await.unwrap_err();
        assert!(matches!(err, StorageError::AlreadyExists(_)));
        assert_eq!(store.read_artifact(&storage_key).await.unwrap(), b"# Hello");

        let meta = artifact(&storage_key);
        store.write_metadata(&meta).await.unwrap();
        assert!(matches!(
            store.write_metadata(&meta).await.unwrap_err(),
            StorageError::AlreadyExists(_)
        ));
        assert_eq!(store.read_metadata(&storage_key).await.unwrap(), meta);

        assert!(matches!(
            store.read_artifact("seo/generated/draft/missing.md").await.unwrap_err(),
            StorageError::NotFound(_)
        ));

        let orphan = ArtifactKey::new("seo", "exec-2-article-v1", "md");
        let orphan_key = store.write_artifact(&orphan, b"# Orphan", ContentStatus::Draft).await.unwrap();
        store.remove_artifact(&orphan_key).await.unwrap();
        assert!(!store.exists(&orphan_key).await.unwrap());
        store.remove_artifact(&orphan_key).await.unwrap();
        store.write_artifact(&orphan, b"# Again", ContentStatus::Draft).await.unwrap();
        store.remove_artifact(&orphan_key).await.unwrap();
    }

    #[tokio::test]
    async fn test_memory_store() {
        let store = MemoryArtifactStore::new();
        exercise(&store).await;
        assert_eq!(
            store.keys().await,
            vec![
                "seo/generated/draft/exec-1-article-v1.md".to_string(),
                "seo/metadata/exec-1-article-v1.json".to_string(),
            ]
        );
    }

    #[tokio::test]
    async fn test_fs_store() {
        let temp = TempDir::new().unwrap();
        let store = FsArtifactStore::new(temp.path());
        exercise(&store).await;

        assert!(temp.path().join("seo/generated/draft/exec-1-article-v1.md").exists());
        assert!(temp.path().join("seo/metadata/exec-1-article-v1.json").exists());
    }

    #[tokio::test]
    async fn test_fs_store_rejects_escaping_keys() {
        let temp = TempDir::new().unwrap();
        let store = FsArtifactStore::new(temp.path());
        let key = ArtifactKey::new("..", "x", "md");
        let err = store.write_artifact(&key, b"x", ContentStatus::Draft).await.unwrap_err();
        assert!(matches!(err, StorageError::InvalidKey(_)));
    }
}
