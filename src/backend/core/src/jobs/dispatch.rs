//! Dispatching jobs: enqueue through a provider or run in-process.
//!
//! Whether a job is queued is decided when the [`Dispatchable`] is built,
//! not by inspecting the job at dispatch time:
//!
//! ```rust,ignore
//! // Persisted and handled later by a runner
//! dispatcher.dispatch(Dispatchable::queued(SendInvoice { id }).on_queue("billing")).await?;
//!
//! // Handled right away, in this task
//! dispatcher.dispatch(Dispatchable::inline(RefreshCache)).await?;
//! ```

use async_trait::async_trait;
use std::future::Future;
use std::sync::Arc;
use std::time::Duration;

use super::manager::QueueManager;
use super::record::NewJob;
use super::{Job, JobContext, JobId, JobResult, ShouldQueue};
use crate::error::{QueueError, Result};
use crate::events::{EventSink, QueueEvent};
use crate::observability::metrics;

// ═══════════════════════════════════════════════════════════════════════════════
// Dispatchable Jobs
// ═══════════════════════════════════════════════════════════════════════════════

/// A queueable job with its concrete type erased.
pub trait ErasedQueueable: Job {
    /// Registry key stored with the payload.
    fn job_type(&self) -> &'static str;

    /// Serialized job.
    fn payload(&self) -> serde_json::Result<serde_json::Value>;

    fn as_job(&self) -> &dyn Job;
}

impl<T: ShouldQueue> ErasedQueueable for T {
    fn job_type(&self) -> &'static str {
        T::JOB_TYPE
    }

    fn payload(&self) -> serde_json::Result<serde_json::Value> {
        serde_json::to_value(self)
    }

    fn as_job(&self) -> &dyn Job {
        self
    }
}

/// A queueable job plus where and when it should run.
pub struct QueueableDispatch {
    pub job: Box<dyn ErasedQueueable>,
    /// Target queue; the configured default queue when `None`
    pub queue: Option<String>,
    pub delay: Option<Duration>,
}

impl std::fmt::Debug for QueueableDispatch {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("QueueableDispatch")
            .field("job_type", &self.job.job_type())
            .field("queue", &self.queue)
            .field("delay", &self.delay)
            .finish()
    }
}

/// A job submitted to the [`Dispatcher`].
pub enum Dispatchable {
    /// Runs in-process when dispatched.
    Inline(Box<dyn Job>),
    /// Persisted by a provider and run later by a runner.
    Queueable(QueueableDispatch),
}

impl std::fmt::Debug for Dispatchable {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        match self {
            Self::Inline(job) => f.debug_tuple("Inline").field(&job.name()).finish(),
            Self::Queueable(dispatch) => f.debug_tuple("Queueable").field(dispatch).finish(),
        }
    }
}

impl Dispatchable {
    /// A job that always runs in-process.
    pub fn inline<J: Job + 'static>(job: J) -> Self {
        Self::Inline(Box::new(job))
    }

    /// A job that is pushed to a provider when dispatched.
    pub fn queued<J: ShouldQueue>(job: J) -> Self {
        Self::Queueable(QueueableDispatch {
            job: Box::new(job),
            queue: None,
            delay: None,
        })
    }

    /// An inline job backed by a closure.
    pub fn closure<F, Fut>(name: &'static str, f: F) -> Self
    where
        F: Fn(JobContext) -> Fut + Send + Sync + 'static,
        Fut: Future<Output = JobResult> + Send + 'static,
    {
        Self::inline(ClosureJob::new(name, f))
    }

    /// Target queue. Has no effect on inline jobs.
    pub fn on_queue(mut self, queue: impl Into<String>) -> Self {
        if let Self::Queueable(dispatch) = &mut self {
            dispatch.queue = Some(queue.into());
        }
        self
    }

    /// Delay pickup. Has no effect on inline jobs.
    pub fn delay(mut self, delay: Duration) -> Self {
        if let Self::Queueable(dispatch) = &mut self {
            dispatch.delay = Some(delay);
        }
        self
    }

    pub fn is_queueable(&self) -> bool {
        matches!(self, Self::Queueable(_))
    }

    /// Human-readable job name.
    pub fn name(&self) -> &'static str {
        self.job().name()
    }

    fn job(&self) -> &dyn Job {
        match self {
            Self::Inline(job) => job.as_ref(),
            Self::Queueable(dispatch) => dispatch.job.as_job(),
        }
    }
}

// ═══════════════════════════════════════════════════════════════════════════════
// Closure Jobs
// ═══════════════════════════════════════════════════════════════════════════════

/// Wraps an async closure as an inline job.
///
/// Closures cannot be serialized, so they never reach a provider.
pub struct ClosureJob<F> {
    name: &'static str,
    f: F,
}

impl<F> ClosureJob<F> {
    pub fn new(name: &'static str, f: F) -> Self {
        Self { name, f }
    }
}

#[async_trait]
impl<F, Fut> Job for ClosureJob<F>
where
    F: Fn(JobContext) -> Fut + Send + Sync,
    Fut: Future<Output = JobResult> + Send,
{
    fn name(&self) -> &'static str {
        self.name
    }

    async fn handle(&self, ctx: &JobContext) -> JobResult {
        (self.f)(ctx.clone()).await
    }
}

// ═══════════════════════════════════════════════════════════════════════════════
// Dispatcher
// ═══════════════════════════════════════════════════════════════════════════════

/// Outcome of [`Dispatcher::dispatch`].
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum Dispatched {
    /// The job was persisted and will be handled by a runner.
    Queued {
        job_id: JobId,
        provider: String,
        queue: String,
    },
    /// The job ran inline and succeeded.
    Executed,
}

impl Dispatched {
    pub fn job_id(&self) -> Option<JobId> {
        match self {
            Self::Queued { job_id, .. } => Some(*job_id),
            Self::Executed => None,
        }
    }
}

/// Routes each job to a provider or runs it in-process.
///
/// The dispatcher keeps no job state beyond the call that submits it.
#[derive(Clone)]
pub struct Dispatcher {
    manager: Arc<QueueManager>,
    events: Arc<dyn EventSink>,
}

impl Dispatcher {
    pub fn new(manager: Arc<QueueManager>, events: Arc<dyn EventSink>) -> Self {
        Self { manager, events }
    }

    pub fn manager(&self) -> &Arc<QueueManager> {
        &self.manager
    }

    /// Queue a queueable job, or run an inline job exactly as
    /// [`dispatch_now`](Self::dispatch_now) would.
    ///
    /// A queued job is never handled here. On success exactly one
    /// `JobQueued` event is emitted; when the provider cannot persist the
    /// job the error is returned and nothing is emitted.
    pub async fn dispatch(&self, job: Dispatchable) -> Result<Dispatched> {
        match job {
            Dispatchable::Queueable(dispatch) => self.enqueue(dispatch).await,
            inline @ Dispatchable::Inline(_) => {
                self.dispatch_now(inline).await?;
                Ok(Dispatched::Executed)
            }
        }
    }

    /// Handle the job in-process, bypassing every provider.
    ///
    /// A job failure is returned as `JobExecutionFailed` with the
    /// [`JobError`](super::JobError) as its source.
    pub async fn dispatch_now(&self, job: Dispatchable) -> Result<()> {
        let job = job.job();
        let ctx = JobContext::inline(job.name());

        tracing::debug!(job = job.name(), job_id = %ctx.job_id, "Running job inline");
        job.handle(&ctx).await.map_err(QueueError::from)
    }

    async fn enqueue(&self, dispatch: QueueableDispatch) -> Result<Dispatched> {
        let queue = dispatch
            .queue
            .unwrap_or_else(|| self.manager.default_queue().to_string());
        let provider = self.manager.provider_for_queue(&queue)?;

        let job_type = dispatch.job.job_type();
        let payload = dispatch.job.payload()?;
        let mut new_job = NewJob::new(queue.clone(), job_type, payload);
        new_job.delay = dispatch.delay;

        let job_id = provider.push(new_job).await.map_err(|e| {
            tracing::warn!(
                provider = provider.name(),
                queue = %queue,
                job_type = job_type,
                error = %e,
                "Failed to enqueue job"
            );
            e
        })?;

        metrics::record_job_queued(provider.name(), &queue);
        self.events.emit(&QueueEvent::JobQueued {
            provider: provider.name().to_string(),
            queue: queue.clone(),
            job_id,
            job_type: job_type.to_string(),
        });

        Ok(Dispatched::Queued {
            job_id,
            provider: provider.name().to_string(),
            queue,
        })
    }
}
