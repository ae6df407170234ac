//! Job lifecycle events.

use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};

use crate::jobs::{JobError, JobId, JobRecord};

// =============================================================================
// Queue Events
// =============================================================================

/// A notification about a queue state transition.
///
/// Events are immutable facts; they reference the provider, the queue and the
/// job at the moment of the transition and are never persisted by the queue.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(tag = "type", rename_all = "snake_case")]
pub enum QueueEvent {
    /// Every configured provider finished its one-time setup.
    ProvidersRegistered { providers: Vec<String> },

    /// A queueable job was persisted by a provider.
    JobQueued {
        provider: String,
        queue: String,
        job_id: JobId,
        job_type: String,
    },

    /// A runner claimed a batch and is about to process it.
    RunStart {
        provider: String,
        queue: String,
        jobs: Vec<JobId>,
    },

    /// A claimed job is about to be handled.
    JobProcessing {
        provider: String,
        queue: String,
        job: JobRecord,
    },

    /// A job was handled successfully.
    JobProcessed {
        provider: String,
        queue: String,
        job: JobRecord,
    },

    /// A job failed; `retry_at` is set when it was re-queued.
    JobFailed {
        provider: String,
        queue: String,
        job: JobRecord,
        error: JobError,
        retry_at: Option<DateTime<Utc>>,
    },

    /// A runner finished processing a batch.
    RunComplete {
        provider: String,
        queue: String,
        processed: usize,
        failed: usize,
    },
}

impl QueueEvent {
    /// Get the event type name.
    pub fn event_type(&self) -> &'static str {
        match self {
            Self::ProvidersRegistered { .. } => "providers_registered",
            Self::JobQueued { .. } => "job_queued",
            Self::RunStart { .. } => "run_start",
            Self::JobProcessing { .. } => "job_processing",
            Self::JobProcessed { .. } => "job_processed",
            Self::JobFailed { .. } => "job_failed",
            Self::RunComplete { .. } => "run_complete",
        }
    }

    /// Provider the event refers to, if any.
    pub fn provider(&self) -> Option<&str> {
        match self {
            Self::ProvidersRegistered { .. } => None,
            Self::JobQueued { provider, .. }
            | Self::RunStart { provider, .. }
            | Self::JobProcessing { provider, .. }
            | Self::JobProcessed { provider, .. }
            | Self::JobFailed { provider, .. }
            | Self::RunComplete { provider, .. } => Some(provider),
        }
    }

    /// Queue the event refers to, if any.
    pub fn queue(&self) -> Option<&str> {
        match self {
            Self::ProvidersRegistered { .. } => None,
            Self::JobQueued { queue, .. }
            | Self::RunStart { queue, .. }
            | Self::JobProcessing { queue, .. }
            | Self::JobProcessed { queue, .. }
            | Self::JobFailed { queue, .. }
            | Self::RunComplete { queue, .. } => Some(queue),
        }
    }

    /// Id of the single job the event refers to, if any.
    pub fn job_id(&self) -> Option<JobId> {
        match self {
            Self::JobQueued { job_id, .. } => Some(*job_id),
            Self::JobProcessing { job, .. }
            | Self::JobProcessed { job, .. }
            | Self::JobFailed { job, .. } => Some(job.id),
            _ => None,
        }
    }

    /// Whether this event reports a job failure.
    pub fn is_failure(&self) -> bool {
        matches!(self, Self::JobFailed { .. })
    }

    /// Log this event with structured fields.
    pub fn log(&self) {
        match self {
            Self::ProvidersRegistered { providers } => {
                tracing::info!(providers = ?providers, "Queue providers registered");
            }
            Self::JobQueued {
                provider,
                queue,
                job_id,
                job_type,
            } => {
                tracing::debug!(
                    provider = %provider,
                    queue = %queue,
                    job_id = %job_id,
                    job_type = %job_type,
                    "Job queued"
                );
            }
            Self::RunStart {
                provider,
                queue,
                jobs,
            } => {
                tracing::info!(
                    provider = %provider,
                    queue = %queue,
                    batch_size = jobs.len(),
                    "Queue run started"
                );
            }
            Self::JobProcessing {
                provider,
                queue,
                job,
            } => {
                tracing::debug!(
                    provider = %provider,
                    queue = %queue,
                    job_id = %job.id,
                    job_type = %job.job_type,
                    attempt = job.attempts + 1,
                    "Job processing"
                );
            }
            Self::JobProcessed {
                provider,
                queue,
                job,
            } => {
                tracing::info!(
                    provider = %provider,
                    queue = %queue,
                    job_id = %job.id,
                    job_type = %job.job_type,
                    "Job processed"
                );
            }
            Self::JobFailed {
                provider,
                queue,
                job,
                error,
                retry_at,
            } => match retry_at {
                Some(at) => tracing::warn!(
                    provider = %provider,
                    queue = %queue,
                    job_id = %job.id,
                    job_type = %job.job_type,
                    attempts = job.attempts,
                    retry_at = %at,
                    error = %error,
                    "Job failed, retry scheduled"
                ),
                None => tracing::error!(
                    provider = %provider,
                    queue = %queue,
                    job_id = %job.id,
                    job_type = %job.job_type,
                    attempts = job.attempts,
                    error = %error,
                    "Job failed permanently"
                ),
            },
            Self::RunComplete {
                provider,
                queue,
                processed,
                failed,
            } => {
                tracing::info!(
                    provider = %provider,
                    queue = %queue,
                    processed = processed,
                    failed = failed,
                    "Queue run complete"
                );
            }
        }
    }
}

// =============================================================================
// Tests
// =============================================================================

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_event_accessors() {
        let id = JobId::new();
        let event = QueueEvent::JobQueued {
            provider: "memory".to_string(),
            queue: "default".to_string(),
            job_id: id,
            job_type: "send_email".to_string(),
        };

        assert_eq!(event.event_type(), "job_queued");
        assert_eq!(event.provider(), Some("memory"));
        assert_eq!(event.queue(), Some("default"));
        assert_eq!(event.job_id(), Some(id));
        assert!(!event.is_failure());

        let registered = QueueEvent::ProvidersRegistered {
            providers: vec!["memory".to_string()],
        };
        assert_eq!(registered.queue(), None);
        assert_eq!(registered.job_id(), None);
    }

    #[test]
    fn test_event_serializes_with_type_tag() {
        let event = QueueEvent::RunComplete {
            provider: "memory".to_string(),
            queue: "default".to_string(),
            processed: 2,
            failed: 1,
        };

        let json = serde_json::to_value(&event).unwrap();
        assert_eq!(json["type"], "run_complete");
        assert_eq!(json["failed"], 1);

        let back: QueueEvent = serde_json::from_value(json).unwrap();
        assert_eq!(back, event);
    }
}
