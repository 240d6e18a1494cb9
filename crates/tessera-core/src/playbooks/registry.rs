//! Read-only registry of playbook definitions keyed by code and locale.

use std::collections::BTreeMap;
use std::path::{Path, PathBuf};
use std::sync::Arc;

use crate::playbooks::discovery::PlaybookDiscovery;
use crate::playbooks::error::{PlaybookError, Result};
use crate::playbooks::types::{FALLBACK_LOCALE, PlaybookDefinition};

/// Shared handle to a loaded registry.
pub type RegistryHandle = Arc<PlaybookRegistry>;

/// Suffix of companion playbooks that report the status of dispatched jobs.
pub const STATUS_COMPANION_SUFFIX: &str = "_status";

/// A definition excluded from the registry, with the reason.
#[derive(Debug)]
pub struct RejectedDefinition {
    /// File path, or the playbook code for in-memory definitions.
    pub source: PathBuf,
    pub error: PlaybookError,
}

/// Playbook registry.
///
/// Built once, then shared read-only. Each code maps to one definition per
/// locale, kept in load order.
#[derive(Debug)]
pub struct PlaybookRegistry {
    playbooks: BTreeMap<String, Vec<PlaybookDefinition>>,
    rejected: Vec<RejectedDefinition>,
    fallback_locale: String,
}

impl PlaybookRegistry {
    /// Create an empty registry.
    pub fn new() -> Self {
        Self {
            playbooks: BTreeMap::new(),
            rejected: Vec::new(),
            fallback_locale: FALLBACK_LOCALE.to_string(),
        }
    }

    /// Override the last-resort locale used by [`resolve`](Self::resolve).
    #[must_use]
    pub fn with_fallback_locale(mut self, locale: impl Into<String>) -> Self {
        self.fallback_locale = locale.into();
        self
    }

    /// Load every definition under `directory`.
    ///
    /// Invalid definitions are excluded and recorded in
    /// [`rejected`](Self::rejected); the rest still load.
    ///
    /// # Errors
    ///
    /// Returns error if the directory does not exist.
    pub fn load(directory: impl AsRef<Path>) -> Result<RegistryHandle> {
        Self::load_with(directory, FALLBACK_LOCALE).map(Arc::new)
    }

    /// Like [`load`](Self::load) but fails on the first rejected definition.
    pub fn load_strict(directory: impl AsRef<Path>) -> Result<RegistryHandle> {
        let mut registry = Self::load_with(directory, FALLBACK_LOCALE)?;
        if registry.rejected.is_empty() {
            return Ok(Arc::new(registry));
        }
        Err(registry.rejected.remove(0).error)
    }

    /// Load every definition under `directory` with a custom fallback locale.
    pub fn load_with(directory: impl AsRef<Path>, fallback_locale: &str) -> Result<Self> {
        let directory = directory.as_ref();
        if !directory.is_dir() {
            return Err(PlaybookError::LoadError {
                path: directory.to_path_buf(),
                source: std::io::Error::new(
                    std::io::ErrorKind::NotFound,
                    "playbook directory not found",
                ),
            });
        }

        let mut registry = Self::new().with_fallback_locale(fallback_locale);
        for file in PlaybookDiscovery::with_paths(vec![directory.to_path_buf()]).discover_all() {
            match file.definition {
                Ok(definition) => registry.insert(file.path, definition),
                Err(error) => registry.reject(file.path, error),
            }
        }

        tracing::info!(
            directory = %directory.display(),
            playbooks = registry.len(),
            rejected = registry.rejected.len(),
            "Loaded playbook registry"
        );

        Ok(registry)
    }

    /// Build a registry from in-memory definitions, validating each one.
    pub fn from_definitions(definitions: impl IntoIterator<Item = PlaybookDefinition>) -> Self {
        let mut registry = Self::new();
        for definition in definitions {
            let source = PathBuf::from(&definition.code);
            match definition.validate() {
                Ok(()) => registry.insert(source, definition),
                Err(error) => registry.reject(source, error),
            }
        }
        registry
    }

    fn insert(&mut self, source: PathBuf, definition: PlaybookDefinition) {
        let variants = self.playbooks.entry(definition.code.clone()).or_default();
        if variants.iter().any(|existing| existing.locale == definition.locale) {
            let error = PlaybookError::DuplicateCode {
                code: definition.code.clone(),
                locale: definition.locale.clone(),
            };
            self.reject(source, error);
            return;
        }
        if let Some(first) = variants.first() {
            if first.default_locale != definition.default_locale {
                let error = PlaybookError::InvalidLocale(format!(
                    "variant '{}' of '{}' declares default locale '{}' but other variants declare '{}'",
                    definition.locale, definition.code, definition.default_locale, first.default_locale
                ));
                self.reject(source, error);
                return;
            }
        }
        variants.push(definition);
    }

    fn reject(&mut self, source: PathBuf, error: PlaybookError) {
        tracing::warn!(
            source = %source.display(),
            error = %error,
            "Excluding invalid playbook definition"
        );
        self.rejected.push(RejectedDefinition { source, error });
    }

    /// Resolve the best-matching localized variant of a playbook.
    ///
    /// Falls back from the requested locale to the playbook's `default_locale`,
    /// then to the registry fallback locale, then to the first loaded variant.
    ///
    /// # Errors
    ///
    /// Returns `NotFound` if no variant of `code` exists.
    pub fn resolve(&self, code: &str, locale: &str) -> Result<&PlaybookDefinition> {
        let variants = self
            .playbooks
            .get(code)
            .filter(|variants| !variants.is_empty())
            .ok_or_else(|| PlaybookError::NotFound(code.to_string()))?;

        let find = |wanted: &str| variants.iter().find(|def| def.locale == wanted);

        if let Some(def) = find(locale) {
            return Ok(def);
        }

        let default_locale = variants[0].default_locale.as_str();
        let resolved = find(default_locale)
            .or_else(|| find(&self.fallback_locale))
            .unwrap_or(&variants[0]);

        tracing::debug!(
            code = %code,
            requested = %locale,
            resolved = %resolved.locale,
            "Playbook locale fallback"
        );
        Ok(resolved)
    }

    /// All localized variants of a playbook.
    pub fn variants(&self, code: &str) -> &[PlaybookDefinition] {
        self.playbooks.get(code).map_or(&[], Vec::as_slice)
    }

    /// Returns the `{code}_status` companion playbook, if loaded.
    pub fn status_companion(&self, code: &str, locale: &str) -> Option<&PlaybookDefinition> {
        self.resolve(&format!("{code}{STATUS_COMPANION_SUFFIX}"), locale).ok()
    }

    /// One definition per code, resolved in its default locale, sorted by code.
    pub fn list(&self) -> Vec<&PlaybookDefinition> {
        self.playbooks
            .keys()
            .filter_map(|code| {
                let variants = self.variants(code);
                let default_locale = variants.first()?.default_locale.as_str();
                self.resolve(code, default_locale).ok()
            })
            .collect()
    }

    /// Sorted list of loaded playbook codes.
    pub fn codes(&self) -> Vec<&str> {
        self.playbooks.keys().map(String::as_str).collect()
    }

    /// Definitions that were excluded during loading.
    pub fn rejected(&self) -> &[RejectedDefinition] {
        &self.rejected
    }

    /// Number of distinct playbook codes.
    pub fn len(&self) -> usize {
        self.playbooks.len()
    }

    /// Check if the registry is empty.
    pub fn is_empty(&self) -> bool {
        self.playbooks.is_empty()
    }
}

impl Default for PlaybookRegistry {
    fn default() -> Self {
        Self::new()
    }
}
