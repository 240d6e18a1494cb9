//! `tess run`: dry-run a playbook against the echo tool.

use anyhow::Context;
use colored::Colorize;
use serde_json::{Map, Value};
use std::path::Path;
use std::sync::Arc;
use tessera_core::{
    EchoTool, EngineConfig, ExecutionFailure, ExecutionResult, ExecutionStatus, FsArtifactStore,
    Invocation, JobHandle, PlaybookEngine, StepStatus, ToolRegistry,
};

use super::load_registry;

/// Reads the run inputs from `--input` or `--input-file`; no inputs is an
/// empty object.
pub fn read_inputs(input: Option<&str>, input_file: Option<&Path>) -> anyhow::Result<Map<String, Value>> {
    let text = match (input, input_file) {
        (Some(text), _) => text.to_string(),
        (None, Some(path)) => std::fs::read_to_string(path)
            .with_context(|| format!("Failed to read inputs from {}", path.display()))?,
        (None, None) => return Ok(Map::new()),
    };

    let value: Value = serde_json::from_str(&text).context("Inputs are not valid JSON")?;
    match value {
        Value::Object(map) => Ok(map),
        other => anyhow::bail!("Inputs must be a JSON object, got {other}"),
    }
}

pub async fn execute(
    config: &EngineConfig,
    code: &str,
    locale: Option<&str>,
    inputs: Map<String, Value>,
    json: bool,
) -> anyhow::Result<()> {
    let registry = load_registry(config)?;
    let tools = ToolRegistry::new().with_fallback(Arc::new(EchoTool));
    let store = FsArtifactStore::new(config.artifacts_dir());
    let engine = PlaybookEngine::new(registry, Arc::new(tools), Arc::new(store)).with_config(config);

    let locale = locale.unwrap_or_else(|| config.fallback_locale());
    match engine.execute(code, locale, inputs).await {
        Ok(Invocation::Completed { result }) => {
            if json {
                println!("{}", serde_json::to_string_pretty(&result)?);
            } else {
                print_result(&result);
            }
            Ok(())
        }
        Ok(Invocation::Dispatched { job }) => {
            if json {
                println!("{}", serde_json::to_string_pretty(&job)?);
            } else {
                print_dispatched(&job);
            }
            Ok(())
        }
        Err(failure) => {
            if json {
                println!("{}", serde_json::to_string_pretty(&failure)?);
            } else {
                print_failure(&failure);
            }
            std::process::exit(1);
        }
    }
}

fn print_result(result: &ExecutionResult) {
    let status = match result.status {
        ExecutionStatus::Success => result.status.to_string().green(),
        ExecutionStatus::PartialFailure => result.status.to_string().yellow(),
        _ => result.status.to_string().red(),
    };
    println!("{} {} [{}]", result.playbook_code.bold().cyan(), result.locale.dimmed(), status);
    println!("  Execution: {}", result.execution_id.dimmed());
    println!("  Trace:     {}", result.trace_id.dimmed());
    println!();

    if !result.step_results.is_empty() {
        println!("{}", "Steps".bold());
        for step in &result.step_results {
            let marker = match step.status {
                StepStatus::Success => "✓".green(),
                StepStatus::Skipped => "-".dimmed(),
                StepStatus::Dispatched => "…".cyan(),
                StepStatus::Failed => "✗".red(),
            };
            println!("  {} {} {}", marker, step.step_id, format!("({} ms)", step.duration_ms).dimmed());
            if let Some(error) = &step.error {
                println!("    {}", error.red());
            }
        }
        println!();
    }

    if let Some(summary) = &result.batch_summary {
        println!("{}", "Batch".bold());
        println!("  Total:   {}", summary.total);
        println!("  Success: {}", summary.success.to_string().green());
        println!("  Skipped: {}", summary.skipped);
        println!("  Failed:  {}", summary.failed.to_string().red());
        if let Some(avg) = summary.avg_score {
            println!("  Average: {avg:.2}");
        }
        println!();
    }

    if !result.artifacts.is_empty() {
        println!("{}", "Artifacts".bold());
        for artifact in &result.artifacts {
            println!("  {} {}", artifact.storage_key.bright_blue(), format!("v{}", artifact.version).dimmed());
        }
        println!();
    }

    println!("{}", "Output".bold());
    match serde_json::to_string_pretty(&result.output) {
        Ok(text) => println!("{text}"),
        Err(e) => println!("  {}", format!("unprintable output: {e}").red()),
    }
}

fn print_dispatched(job: &JobHandle) {
    println!("{} dispatched job {}", job.playbook_code.bold().cyan(), job.job_id.bright_blue());
    println!("  Step: {} ({})", job.step_id, job.tool);
}

fn print_failure(failure: &ExecutionFailure) {
    eprintln!("{} {}: {}", "✗".red().bold(), failure.error_kind.to_string().red(), failure.message);
    if let Some(step) = &failure.step_id {
        eprintln!("  Step:  {step}");
    }
    if !failure.fields.is_empty() {
        eprintln!("  Fields: {}", failure.fields.join(", "));
    }
    if let Some(trace) = &failure.trace_id {
        eprintln!("  Trace: {}", trace.dimmed());
    }
}
