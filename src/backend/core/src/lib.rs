#![allow(clippy::result_large_err)]
//! # Mantle Queue
//!
//! Job dispatching for the Mantle framework: jobs are either pushed to a
//! pluggable queue provider and handled later by a worker, or run inline.
//!
//! ## Architecture
//!
//! - **Jobs**: `Job` trait, `ShouldQueue` capability, retry policies with backoff
//! - **Dispatcher**: Enqueues queueable jobs, runs inline jobs immediately
//! - **Providers**: In-memory and PostgreSQL stores with atomic claiming and stale-lock recovery
//! - **Queue Manager**: Explicit provider map built from configuration, with per-queue routes
//! - **Worker**: Batch runner emitting lifecycle events and applying retry and retention
//! - **Events**: Lifecycle notifications delivered to an injected sink
//! - **Observability**: Structured logging and Prometheus metrics

pub mod config;
pub mod db;
pub mod error;
pub mod events;
pub mod jobs;
pub mod observability;

pub use error::{ErrorCode, ErrorContext, ErrorDetails, ErrorSeverity, QueueError, Result};

/// Re-export commonly used types
pub mod prelude {
    pub use crate::config::{Config, ConnectionConfig, Driver, QueueConfig};
    pub use crate::error::{ErrorCode, ErrorContext, ErrorDetails, ErrorSeverity, QueueError, Result};
    pub use crate::events::{EventBus, EventLog, EventSink, Listeners, NullSink, QueueEvent, TracingSink};
    pub use crate::jobs::{
        BackoffStrategy, Claim, ClosureJob, Dispatchable, Dispatched, Dispatcher, InMemoryProvider,
        Job, JobContext, JobError, JobId, JobRecord, JobRegistry, JobResult, JobStatus, NewJob,
        PostgresProvider, Provider, ProviderSettings, QueueManager, QueueStats, QueueWorker,
        RetryPolicy, RunSummary, ShouldQueue, WorkerConfig, WorkerHandle,
    };
}
