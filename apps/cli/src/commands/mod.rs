//! Command implementations for the Tessera CLI.

pub mod list;
pub mod run;
pub mod show;
pub mod validate;

use anyhow::Context;
use std::sync::Arc;
use tessera_core::{EngineConfig, PlaybookRegistry, RegistryHandle};

/// Loads the configured playbook directory.
///
/// Rejected definitions are skipped here; `tess validate` reports them.
pub fn load_registry(config: &EngineConfig) -> anyhow::Result<RegistryHandle> {
    let dir = config.playbooks_dir();
    let registry = PlaybookRegistry::load_with(&dir, config.fallback_locale())
        .with_context(|| format!("Failed to load playbooks from {}", dir.display()))?;
    Ok(Arc::new(registry))
}
