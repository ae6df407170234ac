//! The job contract.
//!
//! - [`Job`]: a unit of work with a `handle()` entry point
//! - [`ShouldQueue`]: the capability that lets a job be stored and run later
//! - [`JobContext`]: what a running job knows about its own execution
//! - [`JobError`]: retryable or fatal failure reported by `handle()`
//!
//! Retry ceilings and backoff live in [`super::retry`].

use async_trait::async_trait;
use chrono::{DateTime, Utc};
use serde::de::DeserializeOwned;
use serde::{Deserialize, Serialize};
use std::fmt;
use std::str::FromStr;
use uuid::Uuid;

use super::record::JobRecord;
use super::retry::RetryPolicy;

// ═══════════════════════════════════════════════════════════════════════════════
// Job Identification
// ═══════════════════════════════════════════════════════════════════════════════

/// Job identifier, assigned by the provider when the job is pushed.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, PartialOrd, Ord, Serialize, Deserialize)]
#[serde(transparent)]
pub struct JobId(pub Uuid);

impl JobId {
    pub fn new() -> Self {
        Self(Uuid::new_v4())
    }
}

impl Default for JobId {
    fn default() -> Self {
        Self::new()
    }
}

impl fmt::Display for JobId {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        fmt::Display::fmt(&self.0, f)
    }
}

impl From<Uuid> for JobId {
    fn from(uuid: Uuid) -> Self {
        Self(uuid)
    }
}

// ═══════════════════════════════════════════════════════════════════════════════
// Job Status
// ═══════════════════════════════════════════════════════════════════════════════

/// Status of a stored job.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum JobStatus {
    /// Waiting in the queue (possibly delayed until `available_at`)
    Pending,
    /// Claimed by a runner and locked until `lock_until`
    Processing,
    /// Finished successfully
    Completed,
    /// Failed with no retries left
    Failed,
}

impl JobStatus {
    /// Check if the job is in a terminal state.
    pub fn is_terminal(&self) -> bool {
        matches!(self, Self::Completed | Self::Failed)
    }

    /// Storage representation.
    pub fn as_str(&self) -> &'static str {
        match self {
            Self::Pending => "pending",
            Self::Processing => "processing",
            Self::Completed => "completed",
            Self::Failed => "failed",
        }
    }
}

impl fmt::Display for JobStatus {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(self.as_str())
    }
}

impl FromStr for JobStatus {
    type Err = String;

    fn from_str(s: &str) -> std::result::Result<Self, Self::Err> {
        match s {
            "pending" => Ok(Self::Pending),
            "processing" => Ok(Self::Processing),
            "completed" => Ok(Self::Completed),
            "failed" => Ok(Self::Failed),
            other => Err(format!("unknown job status '{}'", other)),
        }
    }
}

// ═══════════════════════════════════════════════════════════════════════════════
// Job Error
// ═══════════════════════════════════════════════════════════════════════════════

/// Failure reported by [`Job::handle`].
///
/// `retryable` lets the runner's [`RetryPolicy`] decide whether the job is
/// re-queued; fatal errors fail the job on the spot unless the policy sets
/// `retry_on_any_error`.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct JobError {
    pub message: String,
    pub retryable: bool,
    /// Machine-readable code, stored with the failure
    pub code: Option<String>,
    pub context: Option<serde_json::Value>,
}

impl JobError {
    fn new(message: impl Into<String>, retryable: bool) -> Self {
        Self {
            message: message.into(),
            retryable,
            code: None,
            context: None,
        }
    }

    /// A transient failure, e.g. an unavailable upstream.
    pub fn retryable(message: impl Into<String>) -> Self {
        Self::new(message, true)
    }

    /// A failure that will not go away by trying again.
    pub fn fatal(message: impl Into<String>) -> Self {
        Self::new(message, false)
    }

    pub fn with_code(mut self, code: impl Into<String>) -> Self {
        self.code = Some(code.into());
        self
    }

    /// Attach structured context. Values that fail to serialize are dropped.
    pub fn with_context(mut self, context: impl Serialize) -> Self {
        self.context = serde_json::to_value(context).ok();
        self
    }
}

impl fmt::Display for JobError {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match &self.code {
            Some(code) => write!(f, "{} (code: {})", self.message, code),
            None => f.write_str(&self.message),
        }
    }
}

impl std::error::Error for JobError {}

/// Result type for job execution.
pub type JobResult = std::result::Result<(), JobError>;

// ═══════════════════════════════════════════════════════════════════════════════
// Job Context
// ═══════════════════════════════════════════════════════════════════════════════

/// Context passed to jobs during execution.
#[derive(Debug, Clone)]
pub struct JobContext {
    /// Job identifier (a fresh id for inline runs)
    pub job_id: JobId,
    /// Job type name
    pub job_type: String,
    /// Queue the job was claimed from; `None` for inline execution
    pub queue: Option<String>,
    /// Current attempt number (1-indexed)
    pub attempt: u32,
    /// When the job was enqueued; `None` for inline execution
    pub enqueued_at: Option<DateTime<Utc>>,
}

impl JobContext {
    /// Context for a job executed in-process by the dispatcher.
    pub fn inline(job_type: impl Into<String>) -> Self {
        Self {
            job_id: JobId::new(),
            job_type: job_type.into(),
            queue: None,
            attempt: 1,
            enqueued_at: None,
        }
    }

    /// Context for a job claimed from a provider.
    pub fn from_record(record: &JobRecord) -> Self {
        Self {
            job_id: record.id,
            job_type: record.job_type.clone(),
            queue: Some(record.queue.clone()),
            attempt: record.attempts + 1,
            enqueued_at: Some(record.created_at),
        }
    }

    /// Whether the job is running inline rather than from a queue.
    pub fn is_inline(&self) -> bool {
        self.queue.is_none()
    }

    /// Log a message associated with this job.
    pub fn log_info(&self, message: &str) {
        tracing::info!(
            job_id = %self.job_id,
            job_type = %self.job_type,
            queue = ?self.queue,
            attempt = self.attempt,
            message
        );
    }

    /// Log a warning associated with this job.
    pub fn log_warn(&self, message: &str) {
        tracing::warn!(
            job_id = %self.job_id,
            job_type = %self.job_type,
            queue = ?self.queue,
            attempt = self.attempt,
            message
        );
    }

    /// Log an error associated with this job.
    pub fn log_error(&self, message: &str) {
        tracing::error!(
            job_id = %self.job_id,
            job_type = %self.job_type,
            queue = ?self.queue,
            attempt = self.attempt,
            message
        );
    }
}

// ═══════════════════════════════════════════════════════════════════════════════
// Job Traits
// ═══════════════════════════════════════════════════════════════════════════════

/// The trait every unit of work implements.
#[async_trait]
pub trait Job: Send + Sync {
    /// Returns a human-readable name for this job, used in logs.
    fn name(&self) -> &'static str;

    /// Execute the job.
    ///
    /// # Errors
    ///
    /// Return a `JobError` if the job fails. Use `JobError::retryable()` for
    /// transient failures that should be retried, and `JobError::fatal()` for
    /// permanent failures.
    async fn handle(&self, ctx: &JobContext) -> JobResult;

    /// Retry policy override for this job type; `None` uses the worker default.
    fn retry_policy(&self) -> Option<RetryPolicy> {
        None
    }

    /// Called by the runner once the job has failed for good.
    async fn failed(&self, _ctx: &JobContext, _error: &JobError) {}
}

/// Capability of jobs that can be persisted by a provider and run later.
///
/// `JOB_TYPE` is the key stored with the payload and looked up by the
/// [`JobRegistry`](super::JobRegistry) when the job is claimed; it must stay
/// stable across deployments.
pub trait ShouldQueue: Job + Serialize + DeserializeOwned + 'static {
    const JOB_TYPE: &'static str;
}

// ═══════════════════════════════════════════════════════════════════════════════
// Tests
// ═══════════════════════════════════════════════════════════════════════════════
