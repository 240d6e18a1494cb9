//! Tessera core: a runtime for Markdown playbooks.
//!
//! A playbook is a YAML-frontmattered Markdown document declaring tools,
//! ordered steps and input/output schemas. The [`engine::PlaybookEngine`]
//! loads definitions from a [`playbooks::PlaybookRegistry`], binds caller
//! inputs, executes steps against an injected [`tools::ToolInvoker`],
//! aggregates and finalizes the output, and persists artifacts through an
//! [`artifacts::ArtifactStore`].

pub mod aggregate;
pub mod artifacts;
pub mod batch;
pub mod binding;
pub mod config;
pub mod engine;
pub mod error;
pub mod finalize;
pub mod playbooks;
pub mod tools;
pub mod workflow;

pub use aggregate::{BatchSummary, aggregate};
pub use artifacts::{Artifact, ArtifactService, ArtifactStore, FsArtifactStore, MemoryArtifactStore};
pub use binding::{BoundInputs, CitationMode, ContentStatus, RunMode, bind};
pub use config::EngineConfig;
pub use engine::{ExecutionResult, Invocation, PlaybookEngine};
pub use error::{EngineError, ErrorKind, ExecutionFailure};
pub use finalize::{FinalResult, GovernanceFlags, SchemaMismatch};
pub use playbooks::{PlaybookDefinition, PlaybookRegistry, RegistryHandle, ToolRef};
pub use tools::{EchoTool, JobState, StaticTool, Tool, ToolError, ToolInvoker, ToolRegistry, ToolResponse};
pub use workflow::{ExecutionContext, ExecutionStatus, JobHandle, JobStatus, StepResult, StepStatus};
