//! Shared helpers for tessera-core integration tests.
//!
//! Provides closure-backed tools, a mock SEO and video tool set, and an
//! engine wired to the fixture playbooks and an in-memory artifact store.

#![allow(dead_code)]

use async_trait::async_trait;
use serde_json::{Map, Value, json};
use std::path::PathBuf;
use std::sync::Arc;
use std::sync::atomic::{AtomicU32, Ordering};
use std::time::Duration;
use tessera_core::tools::Result as ToolResult;
use tessera_core::workflow::RetryPolicy;
use tessera_core::{
    JobState, MemoryArtifactStore, PlaybookEngine, PlaybookRegistry, Tool, ToolError,
    ToolRegistry, ToolResponse,
};

/// Directory holding the fixture playbooks.
pub fn fixtures_dir() -> PathBuf {
    PathBuf::from(env!("CARGO_MANIFEST_DIR")).join("tests/fixtures/playbooks")
}

/// A synchronous tool backed by a closure.
pub struct FnTool<F>(pub F);

#[async_trait]
impl<F> Tool for FnTool<F>
where
    F: Fn(Value) -> ToolResult<Value> + Send + Sync,
{
    async fn call(&self, params: Value) -> ToolResult<ToolResponse> {
        (self.0)(params).map(ToolResponse::Completed)
    }
}

pub fn fn_tool<F>(f: F) -> Arc<dyn Tool>
where
    F: Fn(Value) -> ToolResult<Value> + Send + Sync + 'static,
{
    Arc::new(FnTool(f))
}

/// Async render tool: dispatches a job and reports `Running` for the first
/// `running_polls` polls.
pub struct RenderTool {
    running_polls: u32,
    polls: AtomicU32,
}

impl RenderTool {
    pub fn new(running_polls: u32) -> Self {
        Self { running_polls, polls: AtomicU32::new(0) }
    }

    pub fn polls(&self) -> u32 {
        self.polls.load(Ordering::SeqCst)
    }
}

#[async_trait]
impl Tool for RenderTool {
    async fn call(&self, _params: Value) -> ToolResult<ToolResponse> {
        Ok(ToolResponse::Dispatched { job_id: "render-job-1".to_string() })
    }

    async fn poll(&self, job_id: &str) -> ToolResult<JobState> {
        if job_id != "render-job-1" {
            return Err(ToolError::UnknownJob(job_id.to_string()));
        }
        let seen = self.polls.fetch_add(1, Ordering::SeqCst);
        if seen < self.running_polls {
            Ok(JobState::Running)
        } else {
            Ok(JobState::Completed(json!({"video_url": "https://cdn.example.com/v/1.mp4"})))
        }
    }
}

fn source_of(params: &Value) -> String {
    params.get("content_source").and_then(Value::as_str).unwrap_or_default().to_string()
}

/// Mock SEO tools. Rewriting fails for any content source containing
/// `fail`.
pub fn seo_tools() -> ToolRegistry {
    let mut tools = ToolRegistry::new();
    tools
        .register(
            "seo.analyze_content".parse().unwrap(),
            fn_tool(|_| Ok(json!({"language": "zh-TW", "seo_score": 60}))),
        )
        .register(
            "seo.rewrite_content".parse().unwrap(),
            fn_tool(|params| {
                let source = source_of(&params);
                if source.contains("fail") {
                    return Err(ToolError::Rejected(format!("cannot read {source}")));
                }
                Ok(json!({
                    "content_md": format!("# Optimized\n\nSource: {source}\nEngines: {}", params["engines"]),
                    "word_count": 420
                }))
            }),
        )
        .register(
            "seo.extract_claims".parse().unwrap(),
            fn_tool(|params| {
                let source = source_of(&params);
                Ok(json!({
                    "claims_to_sources": [
                        {"claim_id": "c1", "claim": "Yoga lowers stress", "anchor": "#intro", "confidence": 0.7, "sources": [source]},
                        {"claim_id": "c1", "claim": "Yoga lowers stress", "anchor": "#intro", "confidence": 0.9, "sources": [source, "url://example.com/study"]},
                        {"claim_id": "c2", "claim": "Ten minutes a day suffices", "anchor": "#practice", "confidence": 0.6, "sources": ["url://example.com/guide"]}
                    ]
                }))
            }),
        )
        .register(
            "seo.score_geo".parse().unwrap(),
            fn_tool(|_| Ok(json!({"geo_score": 80}))),
        );
    tools
}

/// Mock video tools around a shared render tool.
pub fn video_tools(render: Arc<RenderTool>) -> ToolRegistry {
    let mut tools = ToolRegistry::new();
    tools.register("video.render".parse().unwrap(), render).register(
        "video.publish".parse().unwrap(),
        fn_tool(|params| Ok(json!({"published": true, "video_url": params["url"].clone()}))),
    );
    tools
}

/// Engine over the fixture playbooks with fast retries.
pub fn engine_with(tools: ToolRegistry) -> (PlaybookEngine, Arc<MemoryArtifactStore>) {
    let registry = PlaybookRegistry::load(fixtures_dir()).expect("fixtures load");
    let store = Arc::new(MemoryArtifactStore::new());
    let engine = PlaybookEngine::new(registry, Arc::new(tools), store.clone()).with_retry_policy(
        RetryPolicy::new(3, Duration::from_millis(1), Duration::from_millis(5), 2.0),
    );
    (engine, store)
}

/// Builds an input map from a JSON object literal.
pub fn inputs(value: Value) -> Map<String, Value> {
    match value {
        Value::Object(map) => map,
        other => panic!("inputs must be an object, got {other}"),
    }
}
