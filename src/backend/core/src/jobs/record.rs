//! Stored job records and their state transitions.
//!
//! A [`JobRecord`] is what a provider persists for every queued job. The
//! transition methods here are the single definition of the lifecycle
//! (`pending -> processing -> completed | failed`, with retries going back to
//! `pending`); every provider applies them, storage-backed ones while holding
//! the row lock.

use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};
use std::time::Duration;
use uuid::Uuid;

use super::{JobError, JobId, JobStatus};
use crate::error::{QueueError, Result};

/// A job handed to [`Provider::push`](super::Provider::push).
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct NewJob {
    /// Target queue
    pub queue: String,
    /// Registry key used to decode the payload when the job is claimed
    pub job_type: String,
    /// Serialized job
    pub payload: serde_json::Value,
    /// Delay before the job becomes eligible for pickup
    #[serde(default, with = "humantime_serde")]
    pub delay: Option<Duration>,
}

impl NewJob {
    pub fn new(queue: impl Into<String>, job_type: impl Into<String>, payload: serde_json::Value) -> Self {
        Self {
            queue: queue.into(),
            job_type: job_type.into(),
            payload,
            delay: None,
        }
    }

    /// Delay pickup by `delay`.
    pub fn with_delay(mut self, delay: Duration) -> Self {
        self.delay = Some(delay);
        self
    }
}

/// Proof of a successful `pop()`.
///
/// Completion and failure updates only apply while the token still matches
/// the record; a runner whose lock expired and was reclaimed gets
/// `ClaimLost` instead of overwriting the new claimant's state.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
pub struct Claim {
    pub job_id: JobId,
    pub token: Uuid,
}

/// Failure payload stored with a job.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct JobFailure {
    pub message: String,
    pub code: Option<String>,
    pub retryable: bool,
    pub failed_at: DateTime<Utc>,
}

impl JobFailure {
    pub fn from_error(error: &JobError, failed_at: DateTime<Utc>) -> Self {
        Self {
            message: error.message.clone(),
            code: error.code.clone(),
            retryable: error.retryable,
            failed_at,
        }
    }
}

/// One entry of the append-only status log.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct JobLogEntry {
    pub at: DateTime<Utc>,
    pub status: JobStatus,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub message: Option<String>,
}

impl JobLogEntry {
    pub fn new(at: DateTime<Utc>, status: JobStatus, message: Option<String>) -> Self {
        Self { at, status, message }
    }
}

/// A job as persisted by a provider.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct JobRecord {
    pub id: JobId,
    /// Enqueue order within the provider
    pub sequence: i64,
    pub queue: String,
    pub job_type: String,
    pub payload: serde_json::Value,
    pub status: JobStatus,
    /// Number of retries already spent
    pub attempts: u32,
    /// Earliest pickup time
    pub available_at: DateTime<Utc>,
    pub lock_until: Option<DateTime<Utc>>,
    pub claim_token: Option<Uuid>,
    pub started_at: Option<DateTime<Utc>>,
    pub finished_at: Option<DateTime<Utc>>,
    pub failure: Option<JobFailure>,
    pub log: Vec<JobLogEntry>,
    pub created_at: DateTime<Utc>,
}

impl JobRecord {
    /// Build the pending record for a freshly pushed job.
    pub fn pending(id: JobId, sequence: i64, job: NewJob, now: DateTime<Utc>) -> Self {
        let available_at = match job.delay {
            Some(delay) => now + to_chrono(delay),
            None => now,
        };

        Self {
            id,
            sequence,
            queue: job.queue,
            job_type: job.job_type,
            payload: job.payload,
            status: JobStatus::Pending,
            attempts: 0,
            available_at,
            lock_until: None,
            claim_token: None,
            started_at: None,
            finished_at: None,
            failure: None,
            log: vec![JobLogEntry::new(now, JobStatus::Pending, Some("queued".to_string()))],
            created_at: now,
        }
    }

    /// Whether a runner may claim this record at `now`.
    ///
    /// Pending records are eligible once their delay has elapsed; processing
    /// records are eligible again once their lock has expired.
    pub fn is_eligible(&self, now: DateTime<Utc>) -> bool {
        match self.status {
            JobStatus::Pending => self.available_at <= now,
            JobStatus::Processing => self.lock_until.map_or(true, |until| until <= now),
            JobStatus::Completed | JobStatus::Failed => false,
        }
    }

    /// Whether this record is processing under an expired lock.
    pub fn is_stale(&self, now: DateTime<Utc>) -> bool {
        self.status == JobStatus::Processing && self.is_eligible(now)
    }

    /// The claim currently held on this record, if any.
    pub fn claim(&self) -> Option<Claim> {
        match (self.status, self.claim_token) {
            (JobStatus::Processing, Some(token)) => Some(Claim {
                job_id: self.id,
                token,
            }),
            _ => None,
        }
    }

    /// Transition to `processing` under a fresh lock. Callers check
    /// [`is_eligible`](Self::is_eligible) first.
    pub fn mark_claimed(&mut self, now: DateTime<Utc>, lock_timeout: Duration) -> Claim {
        let reclaimed = self.status == JobStatus::Processing;
        let token = Uuid::new_v4();

        self.status = JobStatus::Processing;
        self.lock_until = Some(now + to_chrono(lock_timeout));
        self.claim_token = Some(token);
        self.started_at = Some(now);
        self.log.push(JobLogEntry::new(
            now,
            JobStatus::Processing,
            reclaimed.then(|| "reclaimed after lock expiry".to_string()),
        ));

        Claim {
            job_id: self.id,
            token,
        }
    }

    /// Transition to `completed`.
    pub fn mark_completed(&mut self, claim: &Claim, now: DateTime<Utc>) -> Result<()> {
        self.check_claim(claim)?;
        self.status = JobStatus::Completed;
        self.lock_until = None;
        self.claim_token = None;
        self.finished_at = Some(now);
        self.log.push(JobLogEntry::new(now, JobStatus::Completed, None));
        Ok(())
    }

    /// Record a failure. With `retry_at` the record goes back to `pending`
    /// with one more attempt spent; without it the failure is permanent.
    pub fn mark_failed(
        &mut self,
        claim: &Claim,
        failure: JobFailure,
        retry_at: Option<DateTime<Utc>>,
        now: DateTime<Utc>,
    ) -> Result<()> {
        self.check_claim(claim)?;
        self.lock_until = None;
        self.claim_token = None;
        self.log.push(JobLogEntry::new(
            now,
            JobStatus::Failed,
            Some(failure.message.clone()),
        ));
        self.failure = Some(failure);

        match retry_at {
            Some(at) => {
                self.status = JobStatus::Pending;
                self.attempts += 1;
                self.available_at = at;
                self.log.push(JobLogEntry::new(
                    now,
                    JobStatus::Pending,
                    Some(format!("retry {} scheduled", self.attempts)),
                ));
            }
            None => {
                self.status = JobStatus::Failed;
                self.finished_at = Some(now);
            }
        }
        Ok(())
    }

    fn check_claim(&self, claim: &Claim) -> Result<()> {
        if claim.job_id != self.id {
            return Err(QueueError::internal(format!(
                "claim for {} applied to {}",
                claim.job_id, self.id
            )));
        }
        if self.status != JobStatus::Processing || self.claim_token != Some(claim.token) {
            return Err(QueueError::claim_lost(self.id));
        }
        Ok(())
    }
}

/// Convert a std duration into a chrono duration, capped at a century.
pub(crate) fn to_chrono(duration: Duration) -> chrono::Duration {
    let cap = chrono::Duration::days(36_500);
    chrono::Duration::from_std(duration).map_or(cap, |d| d.min(cap))
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::error::ErrorCode;

    fn record(now: DateTime<Utc>) -> JobRecord {
        JobRecord::pending(
            JobId::new(),
            1,
            NewJob::new("default", "send_email", serde_json::json!({"to": "a@b.c"})),
            now,
        )
    }

    #[test]
    fn test_pending_record() {
        let now = Utc::now();
        let record = record(now);
        assert_eq!(record.status, JobStatus::Pending);
        assert_eq!(record.available_at, now);
        assert!(record.is_eligible(now));
        assert_eq!(record.log.len(), 1);
    }

    #[test]
    fn test_delay_boundary_is_inclusive() {
        let now = Utc::now();
        let job = NewJob::new("default", "x", serde_json::Value::Null).with_delay(Duration::from_secs(30));
        let record = JobRecord::pending(JobId::new(), 1, job, now);

        assert!(!record.is_eligible(now + chrono::Duration::seconds(29)));
        assert!(record.is_eligible(now + chrono::Duration::seconds(30)));
    }

    #[test]
    fn test_claim_and_complete() {
        let now = Utc::now();
        let mut record = record(now);
        let claim = record.mark_claimed(now, Duration::from_secs(60));

        assert_eq!(record.status, JobStatus::Processing);
        assert_eq!(record.lock_until, Some(now + chrono::Duration::seconds(60)));
        assert_eq!(record.claim(), Some(claim));
        assert!(!record.is_eligible(now + chrono::Duration::seconds(59)));
        assert!(record.is_stale(now + chrono::Duration::seconds(60)));

        record.mark_completed(&claim, now).unwrap();
        assert_eq!(record.status, JobStatus::Completed);
        assert!(record.lock_until.is_none());
        assert!(!record.is_eligible(now + chrono::Duration::days(1)));
    }

    #[test]
    fn test_reclaimed_record_rejects_old_claim() {
        let now = Utc::now();
        let mut record = record(now);
        let first = record.mark_claimed(now, Duration::from_secs(10));
        let later = now + chrono::Duration::seconds(10);
        let second = record.mark_claimed(later, Duration::from_secs(10));

        assert_ne!(first.token, second.token);
        let err = record.mark_completed(&first, later).unwrap_err();
        assert_eq!(err.code(), ErrorCode::ClaimLost);
        assert!(record.mark_completed(&second, later).is_ok());
        assert_eq!(
            record.log.iter().filter(|e| e.status == JobStatus::Processing).count(),
            2
        );
    }

    #[test]
    fn test_failure_with_retry_requeues() {
        let now = Utc::now();
        let mut record = record(now);
        let claim = record.mark_claimed(now, Duration::from_secs(10));
        let failure = JobFailure::from_error(&JobError::retryable("timeout"), now);
        let retry_at = now + chrono::Duration::seconds(5);

        record.mark_failed(&claim, failure, Some(retry_at), now).unwrap();

        assert_eq!(record.status, JobStatus::Pending);
        assert_eq!(record.attempts, 1);
        assert_eq!(record.available_at, retry_at);
        assert_eq!(record.failure.as_ref().unwrap().message, "timeout");
        assert!(record.log.iter().any(|e| e.status == JobStatus::Failed));
    }

    #[test]
    fn test_failure_without_retry_is_terminal() {
        let now = Utc::now();
        let mut record = record(now);
        let claim = record.mark_claimed(now, Duration::from_secs(10));
        let failure = JobFailure::from_error(&JobError::fatal("bad input"), now);

        record.mark_failed(&claim, failure, None, now).unwrap();

        assert_eq!(record.status, JobStatus::Failed);
        assert_eq!(record.attempts, 0);
        assert!(record.finished_at.is_some());
        assert!(record.claim().is_none());
    }
}
