//! Playbook engine: the invocation and status-query entry points.
//!
//! An invocation resolves the playbook, binds inputs, runs the steps in
//! order, aggregates their outputs, finalizes against `output_schema` and
//! persists artifacts. Executions that reach an async step are parked in the
//! job table and resumed by [`PlaybookEngine::query_status`].

use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};
use serde_json::{Map, Value};
use std::collections::BTreeMap;
use std::sync::Arc;
use tracing::{error, info, warn};
use uuid::Uuid;

use crate::aggregate::{BatchSummary, aggregate};
use crate::artifacts::{Artifact, ArtifactService, ArtifactStore};
use crate::batch::{BatchItemResult, BatchProcessor, BatchSettings, expand_items};
use crate::binding::{BoundInputs, RunMode, bind};
use crate::config::EngineConfig;
use crate::error::{EngineError, ExecutionFailure};
use crate::finalize::{BATCH_SUMMARY_FIELD, GovernanceFlags, finalize};
use crate::playbooks::{PlaybookDefinition, RegistryHandle};
use crate::tools::{JobState, ToolError, ToolInvoker};
use crate::workflow::jobs::{Claim, JobHandle, JobStatus, JobTracker, SuspendedExecution};
use crate::workflow::{
    ExecutionContext, ExecutionStatus, RetryPolicy, StepError, StepExecutor, StepResult, StepStatus,
};

/// Output key holding per-item outputs of a batch.
pub const BATCH_RESULTS_FIELD: &str = "results";

/// Completed execution returned to the caller.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct ExecutionResult {
    pub execution_id: String,
    pub trace_id: String,
    pub playbook_code: String,
    /// Locale of the variant that ran.
    pub locale: String,
    pub status: ExecutionStatus,
    pub output: Map<String, Value>,
    pub flags: GovernanceFlags,
    pub step_results: Vec<StepResult>,
    #[serde(default, skip_serializing_if = "Vec::is_empty")]
    pub artifacts: Vec<Artifact>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub batch_summary: Option<BatchSummary>,
    #[serde(default, skip_serializing_if = "Vec::is_empty")]
    pub items: Vec<BatchItemResult>,
    pub started_at: DateTime<Utc>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub completed_at: Option<DateTime<Utc>>,
}

/// Immediate answer to an invocation.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(tag = "invocation", rename_all = "snake_case")]
pub enum Invocation {
    Completed { result: Box<ExecutionResult> },
    /// An async step was dispatched; poll with the job id.
    Dispatched { job: JobHandle },
}

enum Progress {
    Finished,
    Dispatched(JobHandle),
}

/// The playbook execution engine.
#[derive(Clone)]
pub struct PlaybookEngine {
    registry: RegistryHandle,
    executor: StepExecutor,
    artifacts: ArtifactService,
    batch: BatchProcessor,
    jobs: Arc<JobTracker>,
}

impl PlaybookEngine {
    pub fn new(
        registry: RegistryHandle,
        invoker: Arc<dyn ToolInvoker>,
        store: Arc<dyn ArtifactStore>,
    ) -> Self {
        Self {
            registry,
            executor: StepExecutor::new(invoker),
            artifacts: ArtifactService::new(store),
            batch: BatchProcessor::new(BatchSettings::default()),
            jobs: Arc::new(JobTracker::new()),
        }
    }

    /// Applies timeouts, retry and batch settings from configuration.
    #[must_use]
    pub fn with_config(self, config: &EngineConfig) -> Self {
        self.with_retry_policy(config.retry_policy())
            .with_step_timeout(config.step_timeout())
            .with_batch_settings(config.batch_settings())
            .with_result_ttl(config.result_ttl())
    }

    /// Sets how long terminal job statuses stay queryable.
    #[must_use]
    pub fn with_result_ttl(mut self, ttl: std::time::Duration) -> Self {
        self.jobs = Arc::new(JobTracker::new().with_result_ttl(ttl));
        self
    }

    #[must_use]
    pub fn with_retry_policy(mut self, policy: RetryPolicy) -> Self {
        self.executor = self.executor.with_retry_policy(policy);
        self
    }

    #[must_use]
    pub fn with_step_timeout(mut self, timeout: std::time::Duration) -> Self {
        self.executor = self.executor.with_step_timeout(timeout);
        self
    }

    #[must_use]
    pub fn with_batch_settings(mut self, settings: BatchSettings) -> Self {
        self.batch = BatchProcessor::new(settings);
        self
    }

    pub fn registry(&self) -> &RegistryHandle {
        &self.registry
    }

    pub fn artifacts(&self) -> &ArtifactService {
        &self.artifacts
    }

    /// Executes a playbook.
    ///
    /// Returns the completed result, or a job handle when an async step was
    /// dispatched.
    ///
    /// # Errors
    ///
    /// Returns an [`ExecutionFailure`] carrying the error kind, message and
    /// trace id when the playbook is unknown, inputs do not bind, a step
    /// fails fatally, the output does not match the schema, or artifacts
    /// cannot be stored.
    pub async fn execute(
        &self,
        playbook_code: &str,
        locale: &str,
        inputs: Map<String, Value>,
    ) -> Result<Invocation, ExecutionFailure> {
        let trace_id = Uuid::new_v4().to_string();
        let fail = |e: EngineError| {
            warn!(trace_id = %trace_id, playbook = %playbook_code, error = %e, "Invocation rejected");
            e.into_failure(Some(&trace_id))
        };

        let definition = self.registry.resolve(playbook_code, locale).map_err(|e| fail(e.into()))?;
        let definition = Arc::new(definition.clone());

        let run_mode = match inputs.get(RunMode::FIELD).and_then(Value::as_str) {
            Some(mode) => mode.parse::<RunMode>().map_err(|e| fail(EngineError::Validation(e)))?,
            None => RunMode::Single,
        };

        info!(
            trace_id = %trace_id,
            playbook = %definition.code,
            locale = %definition.locale,
            run_mode = %run_mode,
            "Executing playbook"
        );

        if run_mode == RunMode::Batch {
            return self
                .execute_batch(definition, inputs, &trace_id)
                .await
                .map(|result| Invocation::Completed { result: Box::new(result) })
                .map_err(fail);
        }

        let inputs = bind(&definition.input_schema, &inputs).map_err(|e| fail(e.into()))?;
        let mut context = ExecutionContext::with_trace(&definition.code, inputs, &trace_id);
        context.advance(ExecutionStatus::Running);
        self.drive(definition, context).await
    }

    /// Queries the status of an async job, resuming its execution when the
    /// job has completed. Terminal answers are cached.
    ///
    /// # Errors
    ///
    /// Returns a `not_found` failure for unknown job ids.
    pub async fn query_status(&self, job_id: &str) -> Result<JobStatus, ExecutionFailure> {
        let mut current = job_id.to_string();
        loop {
            match self.jobs.claim(&current) {
                Claim::Unknown => {
                    return Err(EngineError::JobNotFound(job_id.to_string()).into_failure(None));
                }
                Claim::Busy(job) => return Ok(JobStatus::Pending { job }),
                Claim::Finished(status) => return Ok(status),
                Claim::Forwarded(next) => current = next,
                Claim::Owned { execution, guard } => {
                    let status = self.resume(execution).await;
                    drop(guard);
                    return Ok(status);
                }
            }
        }
    }

    async fn resume(&self, mut suspended: Box<SuspendedExecution>) -> JobStatus {
        let handle = suspended.handle.clone();
        let polled = self.executor.invoker().poll(&handle.tool, &handle.tool_job_id).await;

        let attempts = suspended
            .context
            .get_step_result(&handle.step_id)
            .map_or(1, |result| result.attempts);
        let failure = match polled {
            Ok(JobState::Running) => {
                self.jobs.release(suspended);
                return JobStatus::Pending { job: handle };
            }
            Err(e) if e.is_retryable() => {
                warn!(job_id = %handle.job_id, error = %e, "Transient poll failure");
                self.jobs.release(suspended);
                return JobStatus::Pending { job: handle };
            }
            Ok(JobState::Completed(output)) => {
                info!(
                    execution_id = %handle.execution_id,
                    job_id = %handle.job_id,
                    step_id = %handle.step_id,
                    "Async job completed"
                );
                suspended.context.record_step_result(StepResult::success(
                    &handle.step_id,
                    output,
                    attempts,
                    handle.dispatched_at,
                    Utc::now(),
                ));
                None
            }
            Ok(JobState::Failed(message)) => Some(ToolError::Rejected(message)),
            Err(e) => Some(e),
        };

        if let Some(source) = failure {
            let error = StepError { step_id: handle.step_id.clone(), attempts, source };
            suspended.context.record_step_result(StepResult::failure(
                &handle.step_id,
                error.to_string(),
                attempts,
                handle.dispatched_at,
                Utc::now(),
            ));
            if !suspended.definition.is_optional_tool(&handle.tool) {
                let failure = self.fail(&mut suspended.context, error.into());
                let status = JobStatus::Failed { error: failure };
                self.jobs.finish(&handle.job_id, status.clone());
                return status;
            }
            warn!(step_id = %handle.step_id, "Optional async step failed; continuing");
        }

        let SuspendedExecution { definition, context, .. } = *suspended;
        let status = match self.drive(definition, context).await {
            Ok(Invocation::Completed { result }) => JobStatus::Completed { result },
            Ok(Invocation::Dispatched { job }) => {
                self.jobs.forward(&handle.job_id, &job.job_id);
                return JobStatus::Pending { job };
            }
            Err(error) => JobStatus::Failed { error },
        };
        self.jobs.finish(&handle.job_id, status.clone());
        status
    }

    /// Runs the remaining steps and finalizes, or parks the execution on an
    /// async step.
    async fn drive(
        &self,
        definition: Arc<PlaybookDefinition>,
        mut context: ExecutionContext,
    ) -> Result<Invocation, ExecutionFailure> {
        match self.run_steps(&definition, &mut context).await {
            Ok(Progress::Finished) => {}
            Ok(Progress::Dispatched(job)) => {
                let parked = SuspendedExecution { handle: job.clone(), definition, context };
                if let Err(mut rejected) = self.jobs.suspend(parked) {
                    let error = EngineError::JobConflict(rejected.handle.job_id.clone());
                    return Err(self.fail(&mut rejected.context, error));
                }
                return Ok(Invocation::Dispatched { job });
            }
            Err(e) => return Err(self.fail(&mut context, e)),
        }

        match self.complete(&definition, &mut context).await {
            Ok(result) => Ok(Invocation::Completed { result: Box::new(result) }),
            Err(e) => Err(self.fail(&mut context, e)),
        }
    }

    async fn run_steps(
        &self,
        definition: &PlaybookDefinition,
        context: &mut ExecutionContext,
    ) -> Result<Progress, EngineError> {
        while let Some(step) = definition.steps.get(context.next_step) {
            context.next_step += 1;
            match self.executor.execute(step, context).await {
                Ok(result) if result.status == StepStatus::Dispatched => {
                    let job = JobHandle {
                        job_id: Uuid::new_v4().to_string(),
                        tool_job_id: result.job_id.clone().unwrap_or_default(),
                        execution_id: context.execution_id.clone(),
                        trace_id: context.trace_id.clone(),
                        playbook_code: definition.code.clone(),
                        step_id: step.step_id.clone(),
                        tool: step.tool_ref.clone(),
                        dispatched_at: result.started_at,
                    };
                    context.record_step_result(result);
                    return Ok(Progress::Dispatched(job));
                }
                Ok(result) => context.record_step_result(result),
                Err(error) => {
                    let now = Utc::now();
                    context.record_step_result(StepResult::failure(
                        &step.step_id,
                        error.to_string(),
                        error.attempts,
                        now,
                        now,
                    ));
                    if !definition.is_optional_tool(&step.tool_ref) {
                        return Err(error.into());
                    }
                    warn!(
                        execution_id = %context.execution_id,
                        step_id = %step.step_id,
                        tool = %step.tool_ref,
                        "Optional step failed; continuing"
                    );
                }
            }
        }
        Ok(Progress::Finished)
    }

    async fn complete(
        &self,
        definition: &PlaybookDefinition,
        context: &mut ExecutionContext,
    ) -> Result<ExecutionResult, EngineError> {
        let aggregated = aggregate(&definition.output_schema, context.successful_outputs());
        let finalized = finalize(definition, context, aggregated)?;

        let mut artifacts = Vec::with_capacity(finalized.artifacts.len());
        for draft in &finalized.artifacts {
            artifacts.push(self.artifacts.persist(draft).await?);
        }

        context.advance(finalized.status);
        info!(
            execution_id = %context.execution_id,
            trace_id = %context.trace_id,
            status = %context.status,
            artifacts = artifacts.len(),
            "Execution finished"
        );

        Ok(ExecutionResult {
            execution_id: context.execution_id.clone(),
            trace_id: context.trace_id.clone(),
            playbook_code: definition.code.clone(),
            locale: definition.locale.clone(),
            status: context.status,
            output: finalized.output,
            flags: finalized.flags,
            step_results: context.step_results.clone(),
            artifacts,
            batch_summary: context.batch_summary.clone(),
            items: Vec::new(),
            started_at: context.started_at,
            completed_at: context.completed_at,
        })
    }

    fn fail(&self, context: &mut ExecutionContext, error: EngineError) -> ExecutionFailure {
        context.advance(ExecutionStatus::Error);
        error!(
            execution_id = %context.execution_id,
            trace_id = %context.trace_id,
            error_kind = %error.kind(),
            error = %error,
            "Execution failed"
        );
        error
            .into_failure(Some(&context.trace_id))
            .with_execution(context.execution_id.clone())
    }

    async fn execute_batch(
        &self,
        definition: Arc<PlaybookDefinition>,
        raw: Map<String, Value>,
        trace_id: &str,
    ) -> Result<ExecutionResult, EngineError> {
        if definition.has_async_steps() {
            return Err(EngineError::BatchUnsupported(format!(
                "playbook '{}' has async steps",
                definition.code
            )));
        }

        let items = expand_items(&raw)?;
        let shared = bind(&BTreeMap::new(), &raw)?;
        let mut context = ExecutionContext::with_trace(&definition.code, shared, trace_id);
        context.advance(ExecutionStatus::Running);

        let engine = self.clone();
        let item_definition = Arc::clone(&definition);
        let item_trace = trace_id.to_string();
        let results = self
            .batch
            .process(items, move |index, item| {
                let engine = engine.clone();
                let definition = Arc::clone(&item_definition);
                let trace_id = item_trace.clone();
                async move { engine.run_item(&definition, index, item, &trace_id).await }
            })
            .await;

        let summary = BatchSummary::from_items(&results);
        info!(
            trace_id = %trace_id,
            total = summary.total,
            success = summary.success,
            failed = summary.failed,
            skipped = summary.skipped,
            "Batch finished"
        );

        let item_outputs: Vec<Value> = results
            .iter()
            .map(|item| item.output.clone().map_or(Value::Null, Value::Object))
            .collect();
        let mut output = Map::new();
        output.insert(BATCH_RESULTS_FIELD.to_string(), Value::Array(item_outputs));
        output.insert(
            BATCH_SUMMARY_FIELD.to_string(),
            serde_json::to_value(&summary).unwrap_or(Value::Null),
        );

        context.advance(if summary.failed == 0 {
            ExecutionStatus::Success
        } else {
            ExecutionStatus::PartialFailure
        });
        context.batch_summary = Some(summary);

        let content_status = context.inputs.content_status();
        let artifacts: Vec<Artifact> =
            results.iter().flat_map(|item| item.artifacts.iter().cloned()).collect();
        let flags = GovernanceFlags::derive(content_status, artifacts.len(), &output);

        Ok(ExecutionResult {
            execution_id: context.execution_id.clone(),
            trace_id: context.trace_id.clone(),
            playbook_code: definition.code.clone(),
            locale: definition.locale.clone(),
            status: context.status,
            output,
            flags,
            step_results: Vec::new(),
            artifacts,
            batch_summary: context.batch_summary.clone(),
            items: results,
            started_at: context.started_at,
            completed_at: context.completed_at,
        })
    }

    /// Runs one batch item in isolation. Never fails; errors become a failed
    /// item.
    async fn run_item(
        &self,
        definition: &PlaybookDefinition,
        index: usize,
        raw: Map<String, Value>,
        trace_id: &str,
    ) -> BatchItemResult {
        let inputs: BoundInputs = match bind(&definition.input_schema, &raw) {
            Ok(inputs) => inputs,
            Err(e) => {
                let failure = EngineError::from(e).into_failure(Some(trace_id));
                return BatchItemResult::failed(index, None, failure);
            }
        };

        let mut context = ExecutionContext::with_trace(&definition.code, inputs, trace_id);
        context.advance(ExecutionStatus::Running);
        let execution_id = context.execution_id.clone();

        if let Err(e) = self.run_steps(definition, &mut context).await {
            let failure = self.fail(&mut context, e);
            return BatchItemResult::failed(index, Some(execution_id), failure);
        }

        let all_skipped = !context.step_results.is_empty()
            && context.step_results.iter().all(|r| r.status == StepStatus::Skipped);
        if all_skipped {
            context.advance(ExecutionStatus::Success);
            return BatchItemResult::skipped(index, execution_id);
        }

        match self.complete(definition, &mut context).await {
            Ok(result) => {
                let score = result.output.get(&definition.primary_score).and_then(Value::as_f64);
                BatchItemResult::success(index, execution_id, result.output, score)
                    .with_artifacts(result.artifacts)
            }
            Err(e) => {
                let failure = self.fail(&mut context, e);
                BatchItemResult::failed(index, Some(execution_id), failure)
            }
        }
    }
}

impl std::fmt::Debug for PlaybookEngine {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("PlaybookEngine")
            .field("playbooks", &self.registry.len())
            .field("batch", self.batch.settings())
            .finish_non_exhaustive()
    }
}
