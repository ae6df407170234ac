//! Integration tests for the PostgreSQL provider contract.
//!
//! These need a live database: set `DATABASE_URL` and run with
//! `cargo test -- --ignored`. Each test works in its own table and drops it
//! when done.

use chrono::{SubsecRound, Utc};
use mantle_queue::config::ConnectionConfig;
use mantle_queue::db::Database;
use mantle_queue::error::ErrorCode;
use mantle_queue::jobs::{
    Clock, JobError, JobFailure, JobStatus, ManualClock, NewJob, PostgresProvider, Provider,
    ProviderSettings,
};
use std::collections::HashSet;
use std::sync::Arc;
use std::time::Duration;

struct TestTable {
    provider: Arc<PostgresProvider>,
    clock: ManualClock,
    db: Database,
}

impl TestTable {
    async fn drop_table(self) {
        sqlx::query(&format!("DROP TABLE IF EXISTS {}", self.provider.table()))
            .execute(self.db.pool())
            .await
            .unwrap();
    }
}

/// Provider over a fresh table, or `None` when no database is configured.
async fn setup() -> Option<TestTable> {
    let url = std::env::var("DATABASE_URL").ok()?;
    let connection = ConnectionConfig {
        max_connections: 4,
        ..ConnectionConfig::postgres(url)
    };
    let db = Database::connect(&connection).await.unwrap();

    let simple = uuid::Uuid::new_v4().simple().to_string();
    let table = format!("mantle_jobs_t_{}", &simple[..12]);
    // Postgres stores microseconds; keep the manual clock on whole seconds.
    let clock = ManualClock::new(Utc::now().trunc_subsecs(0));
    let provider = PostgresProvider::new("pg", db.clone(), table)
        .unwrap()
        .with_settings(ProviderSettings {
            lock_timeout: Duration::from_secs(60),
            delete_after: Duration::from_secs(3600),
        })
        .with_clock(Arc::new(clock.clone()));
    provider.register().await.unwrap();

    Some(TestTable {
        provider: Arc::new(provider),
        clock,
        db,
    })
}

fn job(n: u32) -> NewJob {
    NewJob::new("default", "tests.numbered", serde_json::json!({ "n": n }))
}

// ============================================================================
// Push / Pop
// ============================================================================

#[tokio::test]
#[ignore = "requires DATABASE_URL"]
async fn test_pg_push_then_pop_returns_processing_job() {
    let Some(t) = setup().await else { return };
    let id = t.provider.push(job(1)).await.unwrap();

    let record = t.provider.pop("default").await.unwrap().expect("eligible job");
    assert_eq!(record.id, id);
    assert_eq!(record.payload, serde_json::json!({ "n": 1 }));
    assert_eq!(record.status, JobStatus::Processing);
    assert_eq!(
        record.lock_until,
        Some(t.clock.now() + chrono::Duration::seconds(60))
    );

    let stored = t.provider.get(id).await.unwrap().expect("stored record");
    assert_eq!(stored.claim_token, record.claim_token);
    t.drop_table().await;
}

#[tokio::test]
#[ignore = "requires DATABASE_URL"]
async fn test_pg_fifo_then_empty() {
    let Some(t) = setup().await else { return };
    let mut pushed = Vec::new();
    for n in 0..3 {
        pushed.push(t.provider.push(job(n)).await.unwrap());
    }

    let batch = t.provider.pop_batch("default", 2).await.unwrap();
    let mut popped: Vec<_> = batch.iter().map(|r| r.id).collect();
    popped.push(t.provider.pop("default").await.unwrap().expect("job").id);

    assert_eq!(popped, pushed);
    assert!(t.provider.pop("default").await.unwrap().is_none());
    assert!(t.provider.pop("other").await.unwrap().is_none());
    t.drop_table().await;
}

#[tokio::test]
#[ignore = "requires DATABASE_URL"]
async fn test_pg_delay_boundary_is_inclusive() {
    let Some(t) = setup().await else { return };
    t.provider
        .push(job(1).with_delay(Duration::from_secs(30)))
        .await
        .unwrap();

    t.clock.advance(Duration::from_secs(29));
    assert!(t.provider.pop("default").await.unwrap().is_none());

    t.clock.advance(Duration::from_secs(1));
    assert!(t.provider.pop("default").await.unwrap().is_some());
    t.drop_table().await;
}

// ============================================================================
// Concurrency
// ============================================================================

#[tokio::test(flavor = "multi_thread", worker_threads = 4)]
#[ignore = "requires DATABASE_URL"]
async fn test_pg_concurrent_pops_claim_once() {
    let Some(t) = setup().await else { return };
    for n in 0..10 {
        t.provider.push(job(n)).await.unwrap();
    }

    let mut handles = Vec::new();
    for _ in 0..4 {
        let provider = t.provider.clone();
        handles.push(tokio::spawn(async move {
            let mut claimed = Vec::new();
            while let Some(record) = provider.pop("default").await.unwrap() {
                claimed.push(record.id);
            }
            claimed
        }));
    }

    let mut all = Vec::new();
    for handle in handles {
        all.extend(handle.await.unwrap());
    }
    assert_eq!(all.len(), 10);
    assert_eq!(all.into_iter().collect::<HashSet<_>>().len(), 10);
    t.drop_table().await;
}

// ============================================================================
// Locks, Failures and Retention
// ============================================================================

#[tokio::test]
#[ignore = "requires DATABASE_URL"]
async fn test_pg_stale_lock_is_reclaimed_once() {
    let Some(t) = setup().await else { return };
    let id = t.provider.push(job(1)).await.unwrap();

    let first = t.provider.pop("default").await.unwrap().unwrap();
    t.clock.advance(Duration::from_secs(59));
    assert!(t.provider.pop("default").await.unwrap().is_none());

    t.clock.advance(Duration::from_secs(1));
    let second = t.provider.pop("default").await.unwrap().expect("reclaimed");
    assert_eq!(second.id, id);
    assert!(t.provider.pop("default").await.unwrap().is_none());

    let err = t
        .provider
        .complete(&first.claim().unwrap())
        .await
        .unwrap_err();
    assert_eq!(err.code(), ErrorCode::ClaimLost);

    let done = t.provider.complete(&second.claim().unwrap()).await.unwrap();
    assert_eq!(done.status, JobStatus::Completed);
    t.drop_table().await;
}

#[tokio::test]
#[ignore = "requires DATABASE_URL"]
async fn test_pg_fail_with_retry_then_permanent_failure() {
    let Some(t) = setup().await else { return };
    t.provider.push(job(1)).await.unwrap();

    let claimed = t.provider.pop("default").await.unwrap().unwrap();
    let failure = JobFailure::from_error(&JobError::retryable("timeout"), t.clock.now());
    let retry_at = t.clock.now() + chrono::Duration::seconds(10);
    let record = t
        .provider
        .fail(&claimed.claim().unwrap(), failure, Some(retry_at))
        .await
        .unwrap();
    assert_eq!(record.status, JobStatus::Pending);
    assert_eq!(record.attempts, 1);
    assert!(t.provider.pop("default").await.unwrap().is_none());

    t.clock.advance(Duration::from_secs(10));
    let again = t.provider.pop("default").await.unwrap().expect("retried job");
    assert_eq!(again.id, claimed.id);

    let failure = JobFailure::from_error(&JobError::fatal("bad input"), t.clock.now());
    let failed = t
        .provider
        .fail(&again.claim().unwrap(), failure, None)
        .await
        .unwrap();
    assert_eq!(failed.status, JobStatus::Failed);
    assert_eq!(
        failed.failure.as_ref().map(|f| f.message.as_str()),
        Some("bad input")
    );

    let stats = t.provider.stats("default").await.unwrap();
    assert_eq!(stats.failed, 1);
    assert_eq!(stats.pending + stats.processing, 0);
    t.drop_table().await;
}

#[tokio::test]
#[ignore = "requires DATABASE_URL"]
async fn test_pg_prune_honours_retention() {
    let Some(t) = setup().await else { return };
    let id = t.provider.push(job(1)).await.unwrap();
    let claimed = t.provider.pop("default").await.unwrap().unwrap();
    t.provider.complete(&claimed.claim().unwrap()).await.unwrap();

    let cutoff = |clock: &ManualClock| clock.now() - chrono::Duration::seconds(3600);

    t.clock.advance(Duration::from_secs(3599));
    assert_eq!(t.provider.prune(cutoff(&t.clock)).await.unwrap(), 0);

    t.clock.advance(Duration::from_secs(1));
    assert_eq!(t.provider.prune(cutoff(&t.clock)).await.unwrap(), 1);
    assert!(t.provider.get(id).await.unwrap().is_none());
    t.drop_table().await;
}
