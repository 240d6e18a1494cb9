use std::path::{Component, Path, PathBuf};

use super::error::{Result, StorageError};
use crate::binding::ContentStatus;

const GENERATED_DIR: &str = "generated";
const METADATA_DIR: &str = "metadata";

/// Identity of one artifact version inside the store.
///
/// Content lives at `{capability}/generated/{content_status}/{id}.{ext}`,
/// the metadata sidecar at `{capability}/metadata/{id}.json`.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct ArtifactKey {
    pub capability: String,
    pub id: String,
    pub extension: String,
}

impl ArtifactKey {
    pub fn new(
        capability: impl Into<String>,
        id: impl Into<String>,
        extension: impl Into<String>,
    ) -> Self {
        Self { capability: capability.into(), id: id.into(), extension: extension.into() }
    }

    #[must_use]
    pub fn content_key(&self, status: ContentStatus) -> String {
        format!(
            "{}/{GENERATED_DIR}/{}/{}.{}",
            self.capability,
            status.as_str(),
            self.id,
            self.extension
        )
    }

    #[must_use]
    pub fn metadata_key(&self) -> String {
        format!("{}/{METADATA_DIR}/{}.json", self.capability, self.id)
    }

    /// Parses a content storage key back into its key and status partition.
    pub fn from_storage_key(storage_key: &str) -> Result<(Self, ContentStatus)> {
        let invalid = || StorageError::InvalidKey(storage_key.to_string());

        let parts: Vec<&str> = storage_key.split('/').collect();
        let [capability, generated, status, file] = parts.as_slice() else {
            return Err(invalid());
        };
        if *generated != GENERATED_DIR || capability.is_empty() {
            return Err(invalid());
        }
        let status: ContentStatus = status.parse().map_err(|_| invalid())?;
        let (id, extension) = file.rsplit_once('.').ok_or_else(invalid)?;
        if id.is_empty() {
            return Err(invalid());
        }

        Ok((Self::new(*capability, id, extension), status))
    }
}

/// Filesystem root of an artifact store.
#[derive(Debug, Clone)]
pub struct ArtifactLayout {
    root: PathBuf,
}

impl ArtifactLayout {
    #[must_use]
    pub fn new(root: PathBuf) -> Self {
        Self { root }
    }

    #[must_use]
    pub fn root(&self) -> &Path {
        &self.root
    }

    /// Maps a storage key to a path under the root. Keys must be relative and
    /// must not escape the root.
    pub fn path_for(&self, key: &str) -> Result<PathBuf> {
        let relative = Path::new(key);
        let safe = !key.is_empty()
            && relative.components().all(|component| matches!(component, Component::Normal(_)));
        if !safe {
            return Err(StorageError::InvalidKey(key.to_string()));
        }
        Ok(self.root.join(relative))
    }
}
