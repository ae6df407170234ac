//! The provider contract: durable storage and atomic claiming of queued jobs.

use async_trait::async_trait;
use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};
use std::time::Duration;

use super::record::{Claim, JobFailure, JobRecord, NewJob};
use super::JobId;
use crate::error::Result;

/// Tunables shared by every provider implementation.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
#[serde(default)]
pub struct ProviderSettings {
    /// How long a claim stays locked before another runner may reclaim it
    #[serde(with = "humantime_serde")]
    pub lock_timeout: Duration,
    /// How long completed and failed jobs are retained; zero deletes them at
    /// the end of the tick that finished them
    #[serde(with = "humantime_serde")]
    pub delete_after: Duration,
}

impl Default for ProviderSettings {
    fn default() -> Self {
        Self {
            lock_timeout: Duration::from_secs(600),
            delete_after: Duration::from_secs(7 * 24 * 60 * 60),
        }
    }
}

/// Per-queue counters reported by a provider.
#[derive(Debug, Clone, Default, PartialEq, Eq, Serialize, Deserialize)]
pub struct QueueStats {
    /// Pending jobs eligible now
    pub pending: usize,
    /// Pending jobs waiting for their delay to elapse
    pub delayed: usize,
    /// Jobs currently claimed (including stale locks)
    pub processing: usize,
    /// Completed jobs still retained
    pub completed: usize,
    /// Permanently failed jobs still retained
    pub failed: usize,
}

impl QueueStats {
    /// Jobs that have not reached a terminal state.
    pub fn outstanding(&self) -> usize {
        self.pending + self.delayed + self.processing
    }
}

/// A backend that persists queued jobs and hands them out to runners.
///
/// Implementations must make [`pop`](Provider::pop) an atomic
/// claim-and-transition: two concurrent calls never return the same job.
/// [`complete`](Provider::complete) and [`fail`](Provider::fail) apply only
/// while the caller's [`Claim`] is still current.
#[async_trait]
pub trait Provider: Send + Sync {
    /// Name this provider is registered under.
    fn name(&self) -> &str;

    /// Lock and retention settings.
    fn settings(&self) -> &ProviderSettings;

    /// One-time, idempotent setup such as creating the storage schema.
    async fn register(&self) -> Result<()>;

    /// Persist a job and return its newly assigned id.
    async fn push(&self, job: NewJob) -> Result<JobId>;

    /// Claim the oldest eligible job on `queue`, or `None` when nothing is
    /// eligible. The returned record is `processing` with a fresh lock.
    async fn pop(&self, queue: &str) -> Result<Option<JobRecord>>;

    /// Claim up to `count` jobs, oldest first.
    async fn pop_batch(&self, queue: &str, count: usize) -> Result<Vec<JobRecord>> {
        let mut jobs = Vec::with_capacity(count.min(64));
        while jobs.len() < count {
            match self.pop(queue).await? {
                Some(job) => jobs.push(job),
                None => break,
            }
        }
        Ok(jobs)
    }

    /// Mark a claimed job as completed.
    async fn complete(&self, claim: &Claim) -> Result<JobRecord>;

    /// Record a failure; `retry_at` re-queues the job with one more attempt
    /// spent, `None` fails it permanently.
    async fn fail(
        &self,
        claim: &Claim,
        failure: JobFailure,
        retry_at: Option<DateTime<Utc>>,
    ) -> Result<JobRecord>;

    /// Look up a job by id.
    async fn get(&self, id: JobId) -> Result<Option<JobRecord>>;

    /// Counters for one queue.
    async fn stats(&self, queue: &str) -> Result<QueueStats>;

    /// Delete terminal jobs that finished before `finished_before`. Returns
    /// the number of records removed.
    async fn prune(&self, finished_before: DateTime<Utc>) -> Result<u64>;

    /// Current time as seen by this provider.
    fn now(&self) -> DateTime<Utc>;
}
