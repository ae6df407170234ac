//! Queue dispatch and job providers.
//!
//! This module provides:
//!
//! - **Job Definitions**: The `Job` trait, the `ShouldQueue` capability, retry and backoff
//! - **Dispatcher**: Pushes queueable jobs to a provider or runs inline jobs in-process
//! - **Providers**: Durable storage with atomic claiming (in-memory and PostgreSQL)
//! - **Queue Manager**: Resolves the provider responsible for a queue
//! - **Worker**: Claims batches, handles them and applies the retry policy
//!
//! # Architecture
//!
//! ```text
//! ┌─────────────────────────────────────────────────────────────────────────────┐
//! │                               Job Queue                                     │
//! ├─────────────────────────────────────────────────────────────────────────────┤
//! │  ┌─────────────┐    ┌─────────────┐    ┌─────────────┐    ┌─────────────┐   │
//! │  │    Job      │    │ Dispatcher  │    │  Provider   │    │   Worker    │   │
//! │  │ (Inline /   │───▶│ (push or    │───▶│ (memory /   │───▶│ (pop, run,  │   │
//! │  │  Queueable) │    │  run now)   │    │  postgres)  │    │  retry)     │   │
//! │  └─────────────┘    └─────────────┘    └─────────────┘    └─────────────┘   │
//! │                            │                  ▲                  │          │
//! │                            ▼                  │                  ▼          │
//! │                     ┌─────────────┐    ┌─────────────┐    ┌─────────────┐   │
//! │                     │ Event Sink  │    │Queue Manager│    │ Job Registry│   │
//! │                     └─────────────┘    └─────────────┘    └─────────────┘   │
//! └─────────────────────────────────────────────────────────────────────────────┘
//! ```
//!
//! # Usage
//!
//! ```rust,ignore
//! use mantle_queue::prelude::*;
//!
//! #[derive(Debug, Serialize, Deserialize)]
//! struct SendInvoice {
//!     invoice_id: u64,
//! }
//!
//! #[async_trait]
//! impl Job for SendInvoice {
//!     fn name(&self) -> &'static str { "send_invoice" }
//!
//!     async fn handle(&self, ctx: &JobContext) -> JobResult {
//!         // Do work...
//!         Ok(())
//!     }
//! }
//!
//! impl ShouldQueue for SendInvoice {
//!     const JOB_TYPE: &'static str = "billing.send_invoice";
//! }
//!
//! let manager = Arc::new(QueueManager::from_config(config.queue).await?);
//! let events: Arc<dyn EventSink> = Arc::new(TracingSink);
//!
//! let dispatcher = Dispatcher::new(manager.clone(), events.clone());
//! dispatcher.dispatch(Dispatchable::queued(SendInvoice { invoice_id: 7 })).await?;
//!
//! let registry = Arc::new(JobRegistry::new().with::<SendInvoice>());
//! let worker = QueueWorker::new(manager, registry, events, config.worker);
//! let handle = worker.start();
//! ```

pub mod clock;
pub mod dispatch;
pub mod job;
pub mod manager;
pub mod memory;
pub mod postgres;
pub mod provider;
pub mod record;
pub mod registry;
pub mod retry;
pub mod worker;

pub use clock::{Clock, ManualClock, SystemClock};
pub use dispatch::{ClosureJob, Dispatchable, Dispatched, Dispatcher, ErasedQueueable, QueueableDispatch};
pub use job::{Job, JobContext, JobError, JobId, JobResult, JobStatus, ShouldQueue};
pub use manager::QueueManager;
pub use memory::InMemoryProvider;
pub use postgres::PostgresProvider;
pub use provider::{Provider, ProviderSettings, QueueStats};
pub use record::{Claim, JobFailure, JobLogEntry, JobRecord, NewJob};
pub use registry::JobRegistry;
pub use retry::{BackoffStrategy, RetryPolicy};
pub use worker::{QueueWorker, RunSummary, WorkerConfig, WorkerHandle, WorkerStats};

// Built-in jobs
mod builtin;
pub use builtin::{LogLevel, LogMessageJob};
