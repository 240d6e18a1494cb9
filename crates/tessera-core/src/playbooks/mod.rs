//! Playbook definitions: parsing, discovery and the read-only registry.
//!
//! Playbooks are YAML-frontmattered markdown files describing a workflow:
//! metadata, declared tools, ordered steps and input/output schemas. The
//! frontmatter is parsed into a typed [`PlaybookDefinition`] once at load
//! time; the markdown body is kept as heading-keyed sections.

pub mod discovery;
pub mod error;
pub mod parser;
pub mod registry;
pub mod types;

pub use discovery::{DiscoveredFile, PlaybookDiscovery};
pub use error::{PlaybookError, Result};
pub use parser::PlaybookParser;
pub use registry::{PlaybookRegistry, RegistryHandle, RejectedDefinition};
pub use types::{
    ArtifactSpec, FieldType, MergePolicy, OutputField, ParamSpec, ParamType, PlaybookDefinition,
    PlaybookKind, Reducer, StepSpec, ToolRef,
};
