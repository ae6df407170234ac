//! Queue runner: claims batches from a provider and handles them.

use futures::FutureExt;
use serde::{Deserialize, Serialize};
use std::any::Any;
use std::panic::AssertUnwindSafe;
use std::sync::atomic::{AtomicU64, Ordering};
use std::sync::Arc;
use std::time::{Duration, Instant};
use tokio::task::JoinHandle;
use tracing::instrument;

use super::manager::QueueManager;
use super::record::{to_chrono, JobFailure, JobRecord};
use super::registry::JobRegistry;
use super::{Job, JobContext, JobError, JobResult, Provider, RetryPolicy};
use crate::error::{QueueError, Result};
use crate::events::{EventSink, QueueEvent};
use crate::observability::metrics;

/// Configuration for the queue worker.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(default)]
pub struct WorkerConfig {
    /// Worker name/identifier
    pub name: String,
    /// Queue processed by [`QueueWorker::tick`]
    pub queue: String,
    /// Maximum jobs claimed per tick
    pub batch_size: usize,
    /// Pause between ticks when the queue is drained
    #[serde(with = "humantime_serde")]
    pub poll_interval: Duration,
    /// Retry policy for jobs that do not override it
    pub retry: RetryPolicy,
}

impl WorkerConfig {
    pub fn validate(&self) -> Result<()> {
        if self.batch_size == 0 {
            return Err(QueueError::invalid_configuration(
                "worker.batch_size must be at least 1",
            ));
        }
        if self.queue.is_empty() {
            return Err(QueueError::invalid_configuration(
                "worker.queue must not be empty",
            ));
        }
        Ok(())
    }
}

impl Default for WorkerConfig {
    fn default() -> Self {
        Self {
            name: "mantle-worker".to_string(),
            queue: "default".to_string(),
            batch_size: 100,
            poll_interval: Duration::from_secs(60),
            retry: RetryPolicy::default(),
        }
    }
}

/// Statistics for the queue worker. Clones share the same counters.
#[derive(Debug, Clone, Default)]
pub struct WorkerStats {
    /// Total jobs handled
    pub processed: Arc<AtomicU64>,
    /// Total jobs succeeded
    pub succeeded: Arc<AtomicU64>,
    /// Total job failures, including retried ones
    pub failed: Arc<AtomicU64>,
    /// Total failures that were re-queued
    pub retried: Arc<AtomicU64>,
    /// Completed ticks
    pub ticks: Arc<AtomicU64>,
}

impl WorkerStats {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn processed(&self) -> u64 {
        self.processed.load(Ordering::Relaxed)
    }

    pub fn succeeded(&self) -> u64 {
        self.succeeded.load(Ordering::Relaxed)
    }

    pub fn failed(&self) -> u64 {
        self.failed.load(Ordering::Relaxed)
    }

    pub fn retried(&self) -> u64 {
        self.retried.load(Ordering::Relaxed)
    }

    pub fn ticks(&self) -> u64 {
        self.ticks.load(Ordering::Relaxed)
    }
}

/// Outcome of one tick.
#[derive(Debug, Clone, Default, PartialEq, Eq)]
pub struct RunSummary {
    /// Jobs claimed from the provider
    pub claimed: usize,
    /// Jobs handled successfully
    pub processed: usize,
    /// Jobs that failed, retried or not
    pub failed: usize,
    /// Failed jobs that were re-queued
    pub retried: usize,
    /// Finished records removed by retention
    pub pruned: u64,
}

impl RunSummary {
    pub fn is_idle(&self) -> bool {
        self.claimed == 0
    }
}

/// What happened to one claimed job.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
enum JobOutcome {
    Processed,
    Retried,
    Failed,
}

/// Handle for controlling a running worker.
///
/// Dropping the handle also stops the worker after its current tick.
pub struct WorkerHandle {
    shutdown: tokio::sync::watch::Sender<bool>,
    stats: WorkerStats,
    task: JoinHandle<()>,
}

impl WorkerHandle {
    /// Signal the worker to shut down gracefully.
    pub fn shutdown(&self) {
        let _ = self.shutdown.send(true);
    }

    /// Signal shutdown and wait for the current tick to finish.
    pub async fn stop(self) {
        self.shutdown();
        if let Err(e) = self.task.await {
            tracing::error!(error = %e, "Worker task ended abnormally");
        }
    }

    /// Get worker statistics.
    pub fn stats(&self) -> &WorkerStats {
        &self.stats
    }
}

/// Runner that claims jobs from the queue's provider and handles them.
///
/// Each tick runs `IDLE -> CLAIM -> RUNNING -> (SUCCESS | FAILURE) -> IDLE`
/// for a batch of jobs. A failing or panicking job is recorded through the
/// provider and never aborts the rest of the batch.
#[derive(Clone)]
pub struct QueueWorker {
    manager: Arc<QueueManager>,
    registry: Arc<JobRegistry>,
    events: Arc<dyn EventSink>,
    config: WorkerConfig,
    stats: WorkerStats,
}

impl QueueWorker {
    /// Create a new queue worker.
    pub fn new(
        manager: Arc<QueueManager>,
        registry: Arc<JobRegistry>,
        events: Arc<dyn EventSink>,
        config: WorkerConfig,
    ) -> Self {
        Self {
            manager,
            registry,
            events,
            config,
            stats: WorkerStats::new(),
        }
    }

    pub fn config(&self) -> &WorkerConfig {
        &self.config
    }

    pub fn stats(&self) -> &WorkerStats {
        &self.stats
    }

    /// Run one tick against the configured queue.
    pub async fn tick(&self) -> Result<RunSummary> {
        self.run(&self.config.queue).await
    }

    /// Run one tick against `queue`.
    ///
    /// Configuration and claim errors abort the tick; errors while handling
    /// or recording a single job are contained to that job.
    #[instrument(skip(self), fields(worker = %self.config.name))]
    pub async fn run(&self, queue: &str) -> Result<RunSummary> {
        let provider = self.manager.provider_for_queue(queue)?;
        let jobs = provider.pop_batch(queue, self.config.batch_size).await?;

        let mut summary = RunSummary {
            claimed: jobs.len(),
            ..Default::default()
        };

        if !jobs.is_empty() {
            metrics::record_batch(queue, jobs.len());
            self.events.emit(&QueueEvent::RunStart {
                provider: provider.name().to_string(),
                queue: queue.to_string(),
                jobs: jobs.iter().map(|job| job.id).collect(),
            });

            for record in jobs {
                let job_id = record.id;
                match self.process(provider.as_ref(), record).await {
                    Ok(JobOutcome::Processed) => summary.processed += 1,
                    Ok(JobOutcome::Retried) => {
                        summary.failed += 1;
                        summary.retried += 1;
                    }
                    Ok(JobOutcome::Failed) => summary.failed += 1,
                    Err(e) => {
                        tracing::warn!(job_id = %job_id, error = %e, "Could not record job outcome");
                        e.log();
                        summary.failed += 1;
                    }
                }
            }

            self.events.emit(&QueueEvent::RunComplete {
                provider: provider.name().to_string(),
                queue: queue.to_string(),
                processed: summary.processed,
                failed: summary.failed,
            });
        }

        summary.pruned = self.prune(provider.as_ref()).await;
        if let Ok(stats) = provider.stats(queue).await {
            metrics::set_queue_depth(queue, &stats);
        }

        self.stats.ticks.fetch_add(1, Ordering::Relaxed);
        Ok(summary)
    }

    /// Start ticking in the background until shut down.
    ///
    /// Providers are registered before the first tick. A tick that claimed a
    /// full batch is followed immediately by another one; otherwise the
    /// worker sleeps for `poll_interval`.
    pub fn start(self) -> WorkerHandle {
        let (shutdown_tx, mut shutdown_rx) = tokio::sync::watch::channel(false);
        let stats = self.stats.clone();

        let task = tokio::spawn(async move {
            let config = self.config.clone();
            tracing::info!(
                worker = %config.name,
                queue = %config.queue,
                batch_size = config.batch_size,
                "Queue worker started"
            );

            loop {
                if *shutdown_rx.borrow() {
                    break;
                }

                let drained = match self.manager.register_providers(self.events.as_ref()).await {
                    Ok(()) => match self.tick().await {
                        Ok(summary) => config.batch_size == 0 || summary.claimed < config.batch_size,
                        Err(e) => {
                            e.log();
                            true
                        }
                    },
                    Err(e) => {
                        e.log();
                        true
                    }
                };

                if !drained {
                    continue;
                }

                tokio::select! {
                    changed = shutdown_rx.changed() => {
                        if changed.is_err() {
                            break;
                        }
                    }
                    _ = tokio::time::sleep(config.poll_interval) => {}
                }
            }

            tracing::info!(worker = %config.name, "Worker stopped");
        });

        WorkerHandle {
            shutdown: shutdown_tx,
            stats,
            task,
        }
    }

    // ─────────────────────────────────────────────────────────────────────────
    // Per-job processing
    // ─────────────────────────────────────────────────────────────────────────

    async fn process(&self, provider: &dyn Provider, record: JobRecord) -> Result<JobOutcome> {
        let claim = record.claim().ok_or_else(|| {
            QueueError::invalid_state_transition(record.id, record.status.as_str(), "processing")
        })?;
        let ctx = JobContext::from_record(&record);
        let queue = record.queue.clone();

        self.stats.processed.fetch_add(1, Ordering::Relaxed);
        self.events.emit(&QueueEvent::JobProcessing {
            provider: provider.name().to_string(),
            queue: queue.clone(),
            job: record.clone(),
        });

        let started = Instant::now();
        let (job, result) = match self.registry.decode(&record.job_type, record.payload.clone()) {
            Ok(job) => {
                let result = handle_guarded(job.as_ref(), &ctx).await;
                (Some(job), result)
            }
            Err(e) => (
                None,
                Err(JobError::fatal(e.user_message()).with_code(e.code().to_string())),
            ),
        };

        match result {
            Ok(()) => {
                let done = provider.complete(&claim).await?;
                metrics::record_job_processed(&queue, &record.job_type, started.elapsed().as_secs_f64());
                self.stats.succeeded.fetch_add(1, Ordering::Relaxed);
                self.events.emit(&QueueEvent::JobProcessed {
                    provider: provider.name().to_string(),
                    queue,
                    job: done,
                });
                Ok(JobOutcome::Processed)
            }
            Err(error) => {
                let policy = job
                    .as_ref()
                    .and_then(|job| job.retry_policy())
                    .unwrap_or_else(|| self.config.retry.clone());
                let now = provider.now();
                // A record that could not be decoded fails permanently.
                let retry_at = match &job {
                    Some(_) if policy.should_retry(record.attempts, &error, record.created_at, now) => {
                        Some(now + to_chrono(policy.next_retry_delay(record.attempts)))
                    }
                    _ => None,
                };

                let failed = provider
                    .fail(&claim, JobFailure::from_error(&error, now), retry_at)
                    .await?;

                metrics::record_job_failed(&queue, &record.job_type, retry_at.is_none());
                self.stats.failed.fetch_add(1, Ordering::Relaxed);
                self.events.emit(&QueueEvent::JobFailed {
                    provider: provider.name().to_string(),
                    queue,
                    job: failed,
                    error: error.clone(),
                    retry_at,
                });

                if retry_at.is_some() {
                    self.stats.retried.fetch_add(1, Ordering::Relaxed);
                    return Ok(JobOutcome::Retried);
                }

                if let Some(job) = &job {
                    if AssertUnwindSafe(job.failed(&ctx, &error))
                        .catch_unwind()
                        .await
                        .is_err()
                    {
                        ctx.log_error("failed() hook panicked");
                    }
                }
                Ok(JobOutcome::Failed)
            }
        }
    }

    /// Delete finished records past the provider's retention.
    async fn prune(&self, provider: &dyn Provider) -> u64 {
        let cutoff = provider.now() - to_chrono(provider.settings().delete_after);
        match provider.prune(cutoff).await {
            Ok(count) => {
                if count > 0 {
                    tracing::debug!(provider = provider.name(), count, "Pruned finished jobs");
                    metrics::record_pruned(provider.name(), count);
                }
                count
            }
            Err(e) => {
                tracing::warn!(provider = provider.name(), error = %e, "Failed to prune finished jobs");
                0
            }
        }
    }
}

/// Run `handle()`, turning a panic into a retryable failure.
async fn handle_guarded(job: &dyn Job, ctx: &JobContext) -> JobResult {
    match AssertUnwindSafe(job.handle(ctx)).catch_unwind().await {
        Ok(result) => result,
        Err(panic) => {
            let message = panic_message(panic.as_ref());
            ctx.log_error(&format!("job panicked: {}", message));
            Err(JobError::retryable(format!("job panicked: {}", message)).with_code("PANIC"))
        }
    }
}

fn panic_message(panic: &(dyn Any + Send)) -> String {
    if let Some(message) = panic.downcast_ref::<&str>() {
        (*message).to_string()
    } else if let Some(message) = panic.downcast_ref::<String>() {
        message.clone()
    } else {
        "unknown panic".to_string()
    }
}
