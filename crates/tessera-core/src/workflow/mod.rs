//! Step execution: conditions, per-invocation context, retries and async jobs.

pub mod condition;
pub mod context;
pub mod executor;
pub mod jobs;
pub mod retry;

pub use condition::{Condition, should_execute_step};
pub use context::{ExecutionContext, ExecutionStatus, StepResult, StepStatus};
pub use executor::{StepError, StepExecutor};
pub use jobs::{JobHandle, JobStatus, JobTracker};
pub use retry::RetryPolicy;
