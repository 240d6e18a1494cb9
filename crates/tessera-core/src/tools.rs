//! Tool invocation seam.
//!
//! Every capability a playbook declares is an opaque RPC behind the
//! [`ToolInvoker`] trait. The engine receives an invoker at construction;
//! [`ToolRegistry`] is the standard implementation, dispatching by
//! `capability.tool_name` to registered [`Tool`]s.

use async_trait::async_trait;
use serde_json::{Map, Value};
use std::collections::HashMap;
use std::fmt;
use std::sync::Arc;
use std::time::Duration;
use thiserror::Error;

use crate::playbooks::types::ToolRef;

/// Errors reported by tools.
#[derive(Error, Debug, Clone, PartialEq, Eq)]
pub enum ToolError {
    /// No tool is registered under the reference.
    #[error("Tool not registered: {0}")]
    NotRegistered(String),

    /// Transient failure (network, rate limit); safe to retry.
    #[error("Transient tool failure: {0}")]
    Transient(String),

    /// The invocation exceeded its wall-clock budget.
    #[error("Tool call timed out after {0:?}")]
    Timeout(Duration),

    /// The tool refused the request; retrying will not help.
    #[error("Tool rejected the request: {0}")]
    Rejected(String),

    /// The tool does not know the job id.
    #[error("Unknown job: {0}")]
    UnknownJob(String),
}

impl ToolError {
    /// Transient failures and timeouts are retried; everything else is not.
    pub fn is_retryable(&self) -> bool {
        matches!(self, ToolError::Transient(_) | ToolError::Timeout(_))
    }
}

/// Result type alias for tool operations.
pub type Result<T> = std::result::Result<T, ToolError>;

/// Immediate response of a tool invocation.
#[derive(Debug, Clone, PartialEq)]
pub enum ToolResponse {
    /// Synchronous result.
    Completed(Value),
    /// An async job was started; its state is observed by polling.
    Dispatched { job_id: String },
}

/// State of a dispatched job.
#[derive(Debug, Clone, PartialEq)]
pub enum JobState {
    Running,
    Completed(Value),
    Failed(String),
}

/// Invokes tools by reference.
#[async_trait]
pub trait ToolInvoker: Send + Sync {
    /// Invoke `tool` with `params`.
    async fn invoke(&self, tool: &ToolRef, params: Value) -> Result<ToolResponse>;

    /// Query the state of a job previously dispatched by `tool`. Must be
    /// idempotent.
    async fn poll(&self, tool: &ToolRef, job_id: &str) -> Result<JobState>;
}

/// A single capability implementation.
#[async_trait]
pub trait Tool: Send + Sync {
    async fn call(&self, params: Value) -> Result<ToolResponse>;

    async fn poll(&self, job_id: &str) -> Result<JobState> {
        Err(ToolError::UnknownJob(job_id.to_string()))
    }
}

/// Explicit registry of tools, injected into the engine.
#[derive(Default, Clone)]
pub struct ToolRegistry {
    tools: HashMap<ToolRef, Arc<dyn Tool>>,
    fallback: Option<Arc<dyn Tool>>,
}

impl ToolRegistry {
    pub fn new() -> Self {
        Self::default()
    }

    /// Registers a tool, replacing any previous registration.
    pub fn register(&mut self, tool_ref: ToolRef, tool: Arc<dyn Tool>) -> &mut Self {
        self.tools.insert(tool_ref, tool);
        self
    }

    /// Tool used for references that have no registration.
    #[must_use]
    pub fn with_fallback(mut self, tool: Arc<dyn Tool>) -> Self {
        self.fallback = Some(tool);
        self
    }

    pub fn contains(&self, tool_ref: &ToolRef) -> bool {
        self.tools.contains_key(tool_ref)
    }

    pub fn len(&self) -> usize {
        self.tools.len()
    }

    pub fn is_empty(&self) -> bool {
        self.tools.is_empty()
    }

    fn lookup(&self, tool_ref: &ToolRef) -> Result<&Arc<dyn Tool>> {
        self.tools
            .get(tool_ref)
            .or(self.fallback.as_ref())
            .ok_or_else(|| ToolError::NotRegistered(tool_ref.to_string()))
    }
}

impl fmt::Debug for ToolRegistry {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        let mut names: Vec<String> = self.tools.keys().map(ToString::to_string).collect();
        names.sort();
        f.debug_struct("ToolRegistry")
            .field("tools", &names)
            .field("fallback", &self.fallback.is_some())
            .finish()
    }
}

#[async_trait]
impl ToolInvoker for ToolRegistry {
    async fn invoke(&self, tool: &ToolRef, params: Value) -> Result<ToolResponse> {
        self.lookup(tool)?.call(params).await
    }

    async fn poll(&self, tool: &ToolRef, job_id: &str) -> Result<JobState> {
        self.lookup(tool)?.poll(job_id).await
    }
}

/// Returns its parameters as output. Used for dry runs.
#[derive(Debug, Default, Clone, Copy)]
pub struct EchoTool;

#[async_trait]
impl Tool for EchoTool {
    async fn call(&self, params: Value) -> Result<ToolResponse> {
        let output = match params {
            Value::Object(map) => Value::Object(map),
            other => {
                let mut map = Map::new();
                map.insert("params".to_string(), other);
                Value::Object(map)
            }
        };
        Ok(ToolResponse::Completed(output))
    }
}

/// Returns the same canned output on every call.
#[derive(Debug, Clone)]
pub struct StaticTool {
    output: Value,
}

impl StaticTool {
    pub fn new(output: Value) -> Self {
        Self { output }
    }
}

#[async_trait]
impl Tool for StaticTool {
    async fn call(&self, _params: Value) -> Result<ToolResponse> {
        Ok(ToolResponse::Completed(self.output.clone()))
    }
}
