//! In-memory provider for tests, development and single-process deployments.

use async_trait::async_trait;
use chrono::{DateTime, Utc};
use parking_lot::Mutex;
use std::collections::{BTreeMap, HashMap};
use std::sync::Arc;

use super::clock::{Clock, SystemClock};
use super::provider::{Provider, ProviderSettings, QueueStats};
use super::record::{Claim, JobFailure, JobRecord, NewJob};
use super::{JobId, JobStatus};
use crate::error::{QueueError, Result};

/// Records indexed by id and by enqueue sequence.
#[derive(Debug, Default)]
struct MemoryState {
    records: HashMap<JobId, JobRecord>,
    /// Enqueue order of records that can still be claimed (oldest first)
    order: BTreeMap<i64, JobId>,
    next_sequence: i64,
}

impl MemoryState {
    fn insert(&mut self, record: JobRecord) {
        self.order.insert(record.sequence, record.id);
        self.records.insert(record.id, record);
    }

    /// Claim the oldest eligible record on `queue`.
    fn claim_next(
        &mut self,
        queue: &str,
        now: DateTime<Utc>,
        settings: &ProviderSettings,
    ) -> Option<JobRecord> {
        let records = &self.records;
        let id = self.order.values().copied().find(|id| {
            records
                .get(id)
                .is_some_and(|r| r.queue == queue && r.is_eligible(now))
        })?;

        let record = self.records.get_mut(&id)?;
        record.mark_claimed(now, settings.lock_timeout);
        Some(record.clone())
    }

    /// Apply a state transition, dropping the record from the claim order
    /// once it is terminal.
    fn transition<F>(&mut self, id: &JobId, apply: F) -> Result<JobRecord>
    where
        F: FnOnce(&mut JobRecord) -> Result<()>,
    {
        let record = self
            .records
            .get_mut(id)
            .ok_or_else(|| QueueError::job_not_found(*id))?;
        apply(record)?;

        let record = record.clone();
        if record.status.is_terminal() {
            self.order.remove(&record.sequence);
        }
        Ok(record)
    }
}

/// Provider keeping all jobs in process memory.
///
/// Every operation runs under a single mutex, which makes `pop()` an atomic
/// claim across any number of concurrent runners in the same process.
#[derive(Clone)]
pub struct InMemoryProvider {
    name: String,
    settings: ProviderSettings,
    state: Arc<Mutex<MemoryState>>,
    clock: Arc<dyn Clock>,
}

impl std::fmt::Debug for InMemoryProvider {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("InMemoryProvider")
            .field("name", &self.name)
            .field("settings", &self.settings)
            .field("jobs", &self.state.lock().records.len())
            .finish()
    }
}

impl Default for InMemoryProvider {
    fn default() -> Self {
        Self::new("memory")
    }
}

impl InMemoryProvider {
    pub fn new(name: impl Into<String>) -> Self {
        Self {
            name: name.into(),
            settings: ProviderSettings::default(),
            state: Arc::new(Mutex::new(MemoryState::default())),
            clock: Arc::new(SystemClock),
        }
    }

    pub fn with_settings(mut self, settings: ProviderSettings) -> Self {
        self.settings = settings;
        self
    }

    pub fn with_clock(mut self, clock: Arc<dyn Clock>) -> Self {
        self.clock = clock;
        self
    }

    /// Number of stored records across all queues.
    pub fn len(&self) -> usize {
        self.state.lock().records.len()
    }

    pub fn is_empty(&self) -> bool {
        self.len() == 0
    }
}

#[async_trait]
impl Provider for InMemoryProvider {
    fn name(&self) -> &str {
        &self.name
    }

    fn settings(&self) -> &ProviderSettings {
        &self.settings
    }

    async fn register(&self) -> Result<()> {
        tracing::debug!(provider = %self.name, "In-memory provider registered");
        Ok(())
    }

    async fn push(&self, job: NewJob) -> Result<JobId> {
        if job.queue.is_empty() {
            return Err(QueueError::enqueue_failed("", "queue name must not be empty"));
        }

        let now = self.clock.now();
        let id = JobId::new();
        let mut state = self.state.lock();
        state.next_sequence += 1;
        let record = JobRecord::pending(id, state.next_sequence, job, now);
        tracing::debug!(
            provider = %self.name,
            queue = %record.queue,
            job_id = %id,
            available_at = %record.available_at,
            "Job pushed"
        );
        state.insert(record);
        Ok(id)
    }

    async fn pop(&self, queue: &str) -> Result<Option<JobRecord>> {
        let now = self.clock.now();
        let claimed = self.state.lock().claim_next(queue, now, &self.settings);
        Ok(claimed)
    }

    async fn pop_batch(&self, queue: &str, count: usize) -> Result<Vec<JobRecord>> {
        let now = self.clock.now();
        let mut state = self.state.lock();
        let mut jobs = Vec::new();
        while jobs.len() < count {
            match state.claim_next(queue, now, &self.settings) {
                Some(job) => jobs.push(job),
                None => break,
            }
        }
        Ok(jobs)
    }

    async fn complete(&self, claim: &Claim) -> Result<JobRecord> {
        let now = self.clock.now();
        self.state
            .lock()
            .transition(&claim.job_id, |record| record.mark_completed(claim, now))
    }

    async fn fail(
        &self,
        claim: &Claim,
        failure: JobFailure,
        retry_at: Option<DateTime<Utc>>,
    ) -> Result<JobRecord> {
        let now = self.clock.now();
        self.state.lock().transition(&claim.job_id, |record| {
            record.mark_failed(claim, failure, retry_at, now)
        })
    }

    async fn get(&self, id: JobId) -> Result<Option<JobRecord>> {
        Ok(self.state.lock().records.get(&id).cloned())
    }

    async fn stats(&self, queue: &str) -> Result<QueueStats> {
        let now = self.clock.now();
        let state = self.state.lock();
        let mut stats = QueueStats::default();
        for record in state.records.values().filter(|r| r.queue == queue) {
            match record.status {
                JobStatus::Pending if record.available_at <= now => stats.pending += 1,
                JobStatus::Pending => stats.delayed += 1,
                JobStatus::Processing => stats.processing += 1,
                JobStatus::Completed => stats.completed += 1,
                JobStatus::Failed => stats.failed += 1,
            }
        }
        Ok(stats)
    }

    async fn prune(&self, finished_before: DateTime<Utc>) -> Result<u64> {
        let mut state = self.state.lock();
        let expired: Vec<(i64, JobId)> = state
            .records
            .values()
            .filter(|r| r.status.is_terminal())
            .filter(|r| r.finished_at.is_some_and(|at| at <= finished_before))
            .map(|r| (r.sequence, r.id))
            .collect();

        for (sequence, id) in &expired {
            state.order.remove(sequence);
            state.records.remove(id);
        }
        Ok(expired.len() as u64)
    }

    fn now(&self) -> DateTime<Utc> {
        self.clock.now()
    }
}
