//! Integration tests for the queue worker.
//!
//! Tests cover:
//! - Lifecycle event order for a batch
//! - Retry bookkeeping up to the ceiling
//! - Per-job retry overrides and the failed() hook
//! - Panics and unknown job types contained per job
//! - Retention after a tick
//! - Background ticking and graceful shutdown

use async_trait::async_trait;
use mantle_queue::config::QueueConfig;
use mantle_queue::events::{EventLog, QueueEvent};
use mantle_queue::jobs::{
    BackoffStrategy, Dispatchable, Dispatcher, InMemoryProvider, Job, JobContext, JobError,
    JobRegistry, JobResult, JobStatus, NewJob, Provider, ProviderSettings, QueueManager,
    QueueWorker, RetryPolicy, RunSummary, ShouldQueue, WorkerConfig,
};
use serde::{Deserialize, Serialize};
use std::sync::atomic::{AtomicUsize, Ordering};
use std::sync::Arc;
use std::time::Duration;

// ============================================================================
// Test Jobs
// ============================================================================

static GREETED: AtomicUsize = AtomicUsize::new(0);
static FLAKY_CALLS: AtomicUsize = AtomicUsize::new(0);
static FLAKY_FAILED_HOOK: AtomicUsize = AtomicUsize::new(0);
static STUBBORN_FAILED_HOOK: AtomicUsize = AtomicUsize::new(0);
static TICKER_RUNS: AtomicUsize = AtomicUsize::new(0);

#[derive(Debug, Serialize, Deserialize)]
struct Greet {
    name: String,
}

#[async_trait]
impl Job for Greet {
    fn name(&self) -> &'static str {
        "greet"
    }

    async fn handle(&self, ctx: &JobContext) -> JobResult {
        assert!(!ctx.is_inline());
        ctx.log_info(&format!("hello {}", self.name));
        GREETED.fetch_add(1, Ordering::SeqCst);
        Ok(())
    }
}

impl ShouldQueue for Greet {
    const JOB_TYPE: &'static str = "tests.greet";
}

/// Always fails with a retryable error.
#[derive(Debug, Serialize, Deserialize)]
struct Flaky;

#[async_trait]
impl Job for Flaky {
    fn name(&self) -> &'static str {
        "flaky"
    }

    async fn handle(&self, _ctx: &JobContext) -> JobResult {
        FLAKY_CALLS.fetch_add(1, Ordering::SeqCst);
        Err(JobError::retryable("upstream unavailable"))
    }

    async fn failed(&self, _ctx: &JobContext, _error: &JobError) {
        FLAKY_FAILED_HOOK.fetch_add(1, Ordering::SeqCst);
    }
}

impl ShouldQueue for Flaky {
    const JOB_TYPE: &'static str = "tests.flaky";
}

/// Fails retryably but opts out of retries.
#[derive(Debug, Serialize, Deserialize)]
struct Stubborn;

#[async_trait]
impl Job for Stubborn {
    fn name(&self) -> &'static str {
        "stubborn"
    }

    async fn handle(&self, _ctx: &JobContext) -> JobResult {
        Err(JobError::retryable("nope"))
    }

    fn retry_policy(&self) -> Option<RetryPolicy> {
        Some(RetryPolicy::no_retry())
    }

    async fn failed(&self, ctx: &JobContext, error: &JobError) {
        assert_eq!(ctx.attempt, 1);
        assert_eq!(error.message, "nope");
        STUBBORN_FAILED_HOOK.fetch_add(1, Ordering::SeqCst);
    }
}

impl ShouldQueue for Stubborn {
    const JOB_TYPE: &'static str = "tests.stubborn";
}

#[derive(Debug, Serialize, Deserialize)]
struct Explode;

#[async_trait]
impl Job for Explode {
    fn name(&self) -> &'static str {
        "explode"
    }

    async fn handle(&self, _ctx: &JobContext) -> JobResult {
        panic!("kaboom");
    }
}

impl ShouldQueue for Explode {
    const JOB_TYPE: &'static str = "tests.explode";
}

#[derive(Debug, Serialize, Deserialize)]
struct Ticker;

#[async_trait]
impl Job for Ticker {
    fn name(&self) -> &'static str {
        "ticker"
    }

    async fn handle(&self, _ctx: &JobContext) -> JobResult {
        TICKER_RUNS.fetch_add(1, Ordering::SeqCst);
        Ok(())
    }
}

impl ShouldQueue for Ticker {
    const JOB_TYPE: &'static str = "tests.ticker";
}

// ============================================================================
// Helpers
// ============================================================================

struct Harness {
    provider: Arc<InMemoryProvider>,
    dispatcher: Dispatcher,
    worker: QueueWorker,
    events: EventLog,
}

fn harness(settings: ProviderSettings, retry: RetryPolicy) -> Harness {
    let provider = Arc::new(InMemoryProvider::new("memory").with_settings(settings));
    let manager = Arc::new(QueueManager::new(QueueConfig::default()).with_provider(provider.clone()));
    let events = EventLog::new();
    let registry = Arc::new(
        JobRegistry::new()
            .with::<Greet>()
            .with::<Flaky>()
            .with::<Stubborn>()
            .with::<Explode>()
            .with::<Ticker>(),
    );
    let config = WorkerConfig {
        poll_interval: Duration::from_millis(10),
        retry,
        ..Default::default()
    };

    Harness {
        provider,
        dispatcher: Dispatcher::new(manager.clone(), Arc::new(events.clone())),
        worker: QueueWorker::new(manager, registry, Arc::new(events.clone()), config),
        events,
    }
}

fn immediate_retries(max_attempts: u32) -> RetryPolicy {
    RetryPolicy::with_retries(max_attempts).with_backoff(BackoffStrategy::None)
}

// ============================================================================
// Tick Behaviour
// ============================================================================

#[tokio::test]
async fn test_idle_tick_emits_nothing() {
    let h = harness(ProviderSettings::default(), RetryPolicy::default());

    let summary = h.worker.tick().await.unwrap();
    assert!(summary.is_idle());
    assert!(h.events.events().is_empty());
}

#[tokio::test]
async fn test_successful_batch_event_order() {
    let h = harness(ProviderSettings::default(), RetryPolicy::default());
    let before = GREETED.load(Ordering::SeqCst);

    for name in ["ada", "grace"] {
        h.dispatcher
            .dispatch(Dispatchable::queued(Greet { name: name.to_string() }))
            .await
            .unwrap();
    }
    h.events.clear();

    let summary = h.worker.tick().await.unwrap();
    assert_eq!(
        summary,
        RunSummary {
            claimed: 2,
            processed: 2,
            ..Default::default()
        }
    );
    assert!(GREETED.load(Ordering::SeqCst) >= before + 2);

    assert_eq!(
        h.events.event_types(),
        vec![
            "run_start",
            "job_processing",
            "job_processed",
            "job_processing",
            "job_processed",
            "run_complete",
        ]
    );

    for event in h.events.events() {
        if let QueueEvent::JobProcessed { job, .. } = event {
            assert_eq!(job.status, JobStatus::Completed);
        }
    }
    assert_eq!(h.worker.stats().succeeded(), 2);
}

#[tokio::test]
async fn test_retry_until_ceiling() {
    let h = harness(ProviderSettings::default(), immediate_retries(2));
    let calls_before = FLAKY_CALLS.load(Ordering::SeqCst);
    let hook_before = FLAKY_FAILED_HOOK.load(Ordering::SeqCst);

    let id = h
        .dispatcher
        .dispatch(Dispatchable::queued(Flaky))
        .await
        .unwrap()
        .job_id()
        .unwrap();

    // Two retries are granted, the third failure is permanent.
    for expected_attempts in [1, 2] {
        let summary = h.worker.tick().await.unwrap();
        assert_eq!(summary.retried, 1);

        let record = h.provider.get(id).await.unwrap().unwrap();
        assert_eq!(record.status, JobStatus::Pending);
        assert_eq!(record.attempts, expected_attempts);
    }

    let summary = h.worker.tick().await.unwrap();
    assert_eq!(summary.failed, 1);
    assert_eq!(summary.retried, 0);

    let record = h.provider.get(id).await.unwrap().unwrap();
    assert_eq!(record.status, JobStatus::Failed);
    assert_eq!(record.attempts, 2);
    assert_eq!(
        record.failure.as_ref().map(|f| f.message.as_str()),
        Some("upstream unavailable")
    );

    // Never re-queued again.
    assert!(h.worker.tick().await.unwrap().is_idle());
    assert!(FLAKY_CALLS.load(Ordering::SeqCst) >= calls_before + 3);
    assert!(FLAKY_FAILED_HOOK.load(Ordering::SeqCst) > hook_before);

    let failures: Vec<_> = h
        .events
        .events()
        .into_iter()
        .filter_map(|event| match event {
            QueueEvent::JobFailed { retry_at, job, .. } => Some((retry_at.is_some(), job.attempts)),
            _ => None,
        })
        .collect();
    assert_eq!(failures, vec![(true, 1), (true, 2), (false, 2)]);
}

#[tokio::test]
async fn test_job_retry_override_and_failed_hook() {
    let h = harness(ProviderSettings::default(), immediate_retries(5));
    let hook_before = STUBBORN_FAILED_HOOK.load(Ordering::SeqCst);

    let id = h
        .dispatcher
        .dispatch(Dispatchable::queued(Stubborn))
        .await
        .unwrap()
        .job_id()
        .unwrap();

    let summary = h.worker.tick().await.unwrap();
    assert_eq!(summary.failed, 1);
    assert_eq!(summary.retried, 0);
    assert_eq!(
        h.provider.get(id).await.unwrap().unwrap().status,
        JobStatus::Failed
    );
    assert!(STUBBORN_FAILED_HOOK.load(Ordering::SeqCst) > hook_before);
}

#[tokio::test]
async fn test_failure_does_not_abort_batch() {
    let h = harness(ProviderSettings::default(), RetryPolicy::no_retry());

    let explode = h
        .dispatcher
        .dispatch(Dispatchable::queued(Explode))
        .await
        .unwrap()
        .job_id()
        .unwrap();
    let unknown = h
        .provider
        .push(NewJob::new("default", "tests.unregistered", serde_json::json!({})))
        .await
        .unwrap();
    let greet = h
        .dispatcher
        .dispatch(Dispatchable::queued(Greet {
            name: "linus".to_string(),
        }))
        .await
        .unwrap()
        .job_id()
        .unwrap();

    let summary = h.worker.tick().await.unwrap();
    assert_eq!(summary.claimed, 3);
    assert_eq!(summary.processed, 1);
    assert_eq!(summary.failed, 2);

    let exploded = h.provider.get(explode).await.unwrap().unwrap();
    assert_eq!(exploded.status, JobStatus::Failed);
    let failure = exploded.failure.unwrap();
    assert!(failure.message.contains("kaboom"));
    assert_eq!(failure.code.as_deref(), Some("PANIC"));

    let unregistered = h.provider.get(unknown).await.unwrap().unwrap();
    assert_eq!(unregistered.status, JobStatus::Failed);
    assert_eq!(
        unregistered.failure.unwrap().code.as_deref(),
        Some("UnknownJobType")
    );

    assert_eq!(
        h.provider.get(greet).await.unwrap().unwrap().status,
        JobStatus::Completed
    );
    assert_eq!(h.events.count("job_failed"), 2);
    assert_eq!(h.events.count("run_complete"), 1);
}

#[tokio::test]
async fn test_unknown_job_type_is_not_retried() {
    let h = harness(ProviderSettings::default(), immediate_retries(3));
    let id = h
        .provider
        .push(NewJob::new("default", "tests.unregistered", serde_json::Value::Null))
        .await
        .unwrap();

    let summary = h.worker.tick().await.unwrap();
    assert_eq!(summary.retried, 0);
    assert_eq!(
        h.provider.get(id).await.unwrap().unwrap().status,
        JobStatus::Failed
    );
}

#[tokio::test]
async fn test_undecodable_job_fails_even_when_retrying_any_error() {
    let retry = RetryPolicy {
        retry_on_any_error: true,
        ..immediate_retries(3)
    };
    let h = harness(ProviderSettings::default(), retry);
    let unknown = h
        .provider
        .push(NewJob::new("default", "tests.unregistered", serde_json::Value::Null))
        .await
        .unwrap();
    let malformed = h
        .provider
        .push(NewJob::new("default", "tests.greet", serde_json::json!({ "nom": 7 })))
        .await
        .unwrap();

    let summary = h.worker.tick().await.unwrap();
    assert_eq!(summary.failed, 2);
    assert_eq!(summary.retried, 0);

    for id in [unknown, malformed] {
        let record = h.provider.get(id).await.unwrap().unwrap();
        assert_eq!(record.status, JobStatus::Failed);
        assert_eq!(record.attempts, 0);
    }
    assert!(h.worker.tick().await.unwrap().is_idle());
}

#[tokio::test]
async fn test_zero_retention_prunes_in_same_tick() {
    let settings = ProviderSettings {
        delete_after: Duration::ZERO,
        ..Default::default()
    };
    let h = harness(settings, RetryPolicy::default());

    let id = h
        .dispatcher
        .dispatch(Dispatchable::queued(Greet {
            name: "margaret".to_string(),
        }))
        .await
        .unwrap()
        .job_id()
        .unwrap();

    let summary = h.worker.tick().await.unwrap();
    assert_eq!(summary.processed, 1);
    assert_eq!(summary.pruned, 1);
    assert!(h.provider.get(id).await.unwrap().is_none());
}

// ============================================================================
// Background Worker
// ============================================================================

#[tokio::test]
async fn test_started_worker_processes_and_stops() {
    let h = harness(ProviderSettings::default(), RetryPolicy::default());
    let before = TICKER_RUNS.load(Ordering::SeqCst);

    let handle = h.worker.clone().start();
    h.dispatcher
        .dispatch(Dispatchable::queued(Ticker))
        .await
        .unwrap();

    let waited = tokio::time::timeout(Duration::from_secs(5), async {
        while handle.stats().succeeded() == 0 {
            tokio::time::sleep(Duration::from_millis(5)).await;
        }
    })
    .await;
    assert!(waited.is_ok(), "worker did not process the job in time");

    handle.stop().await;
    assert!(TICKER_RUNS.load(Ordering::SeqCst) > before);
    assert_eq!(h.events.count("providers_registered"), 1);
}
