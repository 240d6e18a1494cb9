//! Job table for executions suspended on an async step.
//!
//! A dispatched step parks its execution here under an engine-issued job id;
//! the tool's own job id is kept on the handle for polling. The engine's
//! status query claims the entry, polls the tool, and either puts it back,
//! forwards it to the next dispatched job, or caches the terminal status so
//! repeated queries return the same answer. Cached answers expire after the
//! result TTL.

use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};
use std::collections::HashMap;
use std::collections::hash_map::Entry;
use std::sync::{Arc, Mutex, MutexGuard, PoisonError};
use std::time::Duration;
use tokio::time::Instant;
use tracing::{debug, warn};

use super::context::ExecutionContext;
use crate::engine::ExecutionResult;
use crate::error::ExecutionFailure;
use crate::playbooks::types::{PlaybookDefinition, ToolRef};

/// How long terminal statuses stay queryable by default.
pub const DEFAULT_RESULT_TTL: Duration = Duration::from_secs(3600);

/// Reference to an outstanding async job.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct JobHandle {
    /// Engine-issued id used for status queries.
    pub job_id: String,
    /// Id the tool returned on dispatch; only meaningful to that tool.
    pub tool_job_id: String,
    pub execution_id: String,
    pub trace_id: String,
    pub playbook_code: String,
    pub step_id: String,
    pub tool: ToolRef,
    pub dispatched_at: DateTime<Utc>,
}

/// Answer to a status query.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(tag = "status", rename_all = "snake_case")]
pub enum JobStatus {
    /// Still running; carries the job currently awaited.
    Pending { job: JobHandle },
    Completed { result: Box<ExecutionResult> },
    Failed { error: ExecutionFailure },
}

impl JobStatus {
    pub fn is_terminal(&self) -> bool {
        !matches!(self, JobStatus::Pending { .. })
    }
}

/// An execution waiting for its async step.
#[derive(Debug, Clone)]
pub struct SuspendedExecution {
    pub handle: JobHandle,
    pub definition: Arc<PlaybookDefinition>,
    pub context: ExecutionContext,
}

#[derive(Debug)]
enum JobEntry {
    Suspended(Box<SuspendedExecution>),
    /// Claimed by an in-flight status query. Holds the execution as parked
    /// so an abandoned query can put it back.
    Resuming(Box<SuspendedExecution>),
    /// The execution moved on to another async job.
    Forwarded { next: String, at: Instant },
    Finished { status: JobStatus, at: Instant },
}

impl JobEntry {
    fn settled_at(&self) -> Option<Instant> {
        match self {
            JobEntry::Forwarded { at, .. } | JobEntry::Finished { at, .. } => Some(*at),
            JobEntry::Suspended(_) | JobEntry::Resuming(_) => None,
        }
    }
}

/// Outcome of claiming a job.
#[derive(Debug)]
pub enum Claim<'a> {
    Unknown,
    /// Another query is resuming the job.
    Busy(JobHandle),
    Forwarded(String),
    Finished(JobStatus),
    /// The caller now owns the execution and must settle it with
    /// [`JobTracker::release`], [`JobTracker::forward`] or
    /// [`JobTracker::finish`] before dropping the guard.
    Owned { execution: Box<SuspendedExecution>, guard: ClaimGuard<'a> },
}

/// Puts a claimed execution back when the claim is dropped unsettled.
#[derive(Debug)]
pub struct ClaimGuard<'a> {
    tracker: &'a JobTracker,
    job_id: String,
}

impl Drop for ClaimGuard<'_> {
    fn drop(&mut self) {
        self.tracker.restore(&self.job_id);
    }
}

/// Table of async jobs keyed by engine-issued job id.
#[derive(Debug)]
pub struct JobTracker {
    entries: Mutex<HashMap<String, JobEntry>>,
    result_ttl: Duration,
}

impl Default for JobTracker {
    fn default() -> Self {
        Self { entries: Mutex::new(HashMap::new()), result_ttl: DEFAULT_RESULT_TTL }
    }
}

impl JobTracker {
    pub fn new() -> Self {
        Self::default()
    }

    #[must_use]
    pub fn with_result_ttl(mut self, ttl: Duration) -> Self {
        self.result_ttl = ttl;
        self
    }

    // Never held across an await.
    fn lock(&self) -> MutexGuard<'_, HashMap<String, JobEntry>> {
        self.entries.lock().unwrap_or_else(PoisonError::into_inner)
    }

    fn evict_expired(&self, entries: &mut HashMap<String, JobEntry>) {
        let now = Instant::now();
        let before = entries.len();
        entries.retain(|_, entry| {
            entry.settled_at().is_none_or(|at| now.duration_since(at) < self.result_ttl)
        });
        let evicted = before - entries.len();
        if evicted > 0 {
            debug!(evicted, "Evicted expired job statuses");
        }
    }

    /// Parks an execution under its handle's job id.
    ///
    /// # Errors
    ///
    /// Hands the execution back when the id is already taken.
    pub fn suspend(
        &self,
        suspended: SuspendedExecution,
    ) -> Result<(), Box<SuspendedExecution>> {
        let mut entries = self.lock();
        self.evict_expired(&mut entries);
        match entries.entry(suspended.handle.job_id.clone()) {
            Entry::Occupied(_) => {
                warn!(job_id = %suspended.handle.job_id, "Job id already in use");
                Err(Box::new(suspended))
            }
            Entry::Vacant(slot) => {
                slot.insert(JobEntry::Suspended(Box::new(suspended)));
                Ok(())
            }
        }
    }

    /// Claims a job for resumption.
    pub fn claim(&self, job_id: &str) -> Claim<'_> {
        let mut entries = self.lock();
        self.evict_expired(&mut entries);
        let Some(entry) = entries.get_mut(job_id) else {
            return Claim::Unknown;
        };

        let execution = match entry {
            JobEntry::Resuming(parked) => return Claim::Busy(parked.handle.clone()),
            JobEntry::Forwarded { next, .. } => return Claim::Forwarded(next.clone()),
            JobEntry::Finished { status, .. } => return Claim::Finished(status.clone()),
            JobEntry::Suspended(parked) => parked.clone(),
        };
        *entry = JobEntry::Resuming(execution.clone());

        Claim::Owned { execution, guard: ClaimGuard { tracker: self, job_id: job_id.to_string() } }
    }

    fn restore(&self, job_id: &str) {
        let mut entries = self.lock();
        if let Some(JobEntry::Resuming(parked)) = entries.get(job_id) {
            debug!(job_id, "Restoring abandoned claim");
            let parked = parked.clone();
            entries.insert(job_id.to_string(), JobEntry::Suspended(parked));
        }
    }

    /// Returns a claimed execution whose job is still running.
    pub fn release(&self, suspended: Box<SuspendedExecution>) {
        let job_id = suspended.handle.job_id.clone();
        self.lock().insert(job_id, JobEntry::Suspended(suspended));
    }

    /// Records that `job_id`'s execution now waits on `next_job_id`.
    pub fn forward(&self, job_id: &str, next_job_id: &str) {
        self.lock().insert(
            job_id.to_string(),
            JobEntry::Forwarded { next: next_job_id.to_string(), at: Instant::now() },
        );
    }

    /// Caches the terminal status of a job.
    pub fn finish(&self, job_id: &str, status: JobStatus) {
        self.lock().insert(job_id.to_string(), JobEntry::Finished { status, at: Instant::now() });
    }

    /// Number of executions currently parked or being resumed.
    pub fn outstanding(&self) -> usize {
        self.lock()
            .values()
            .filter(|e| matches!(e, JobEntry::Suspended(_) | JobEntry::Resuming(_)))
            .count()
    }

    /// Number of cached terminal or forwarded entries not yet evicted.
    pub fn settled(&self) -> usize {
        let mut entries = self.lock();
        self.evict_expired(&mut entries);
        entries.values().filter(|e| e.settled_at().is_some()).count()
    }
}
