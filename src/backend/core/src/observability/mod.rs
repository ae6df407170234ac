//! Observability: Logging and Metrics.

use tracing_subscriber::{layer::SubscriberExt, util::SubscriberInitExt, EnvFilter};

use crate::config::ObservabilityConfig;
use crate::error::{QueueError, Result};

/// Initialize the observability stack.
///
/// `RUST_LOG` takes precedence over the configured log level. When a metrics
/// address is configured a Prometheus scrape endpoint is started on it.
pub fn init(service_name: &str, config: &ObservabilityConfig) -> Result<()> {
    let filter = EnvFilter::try_from_default_env()
        .or_else(|_| EnvFilter::try_new(&config.log_level))
        .map_err(|e| {
            QueueError::invalid_configuration(format!("invalid log level: {}", e))
        })?;

    let registry = tracing_subscriber::registry().with(filter);
    let installed = if config.json_logging {
        registry
            .with(tracing_subscriber::fmt::layer().json())
            .try_init()
    } else {
        registry.with(tracing_subscriber::fmt::layer()).try_init()
    };
    installed.map_err(|e| QueueError::internal(format!("failed to install subscriber: {}", e)))?;

    if let Some(addr) = config.metrics_addr {
        metrics_exporter_prometheus::PrometheusBuilder::new()
            .with_http_listener(addr)
            .install()
            .map_err(|e| QueueError::internal(format!("failed to start metrics exporter: {}", e)))?;
        metrics::register_metrics();
        tracing::info!(service = service_name, address = %addr, "Metrics exporter listening");
    }

    Ok(())
}

/// Metrics registry and helpers.
pub mod metrics {
    use metrics::{counter, describe_counter, describe_gauge, describe_histogram, gauge, histogram};

    use crate::jobs::QueueStats;

    /// Register all metric descriptions.
    pub fn register_metrics() {
        // Counters
        describe_counter!(
            "mantle_queue_jobs_queued_total",
            "Total number of jobs pushed to a provider"
        );
        describe_counter!(
            "mantle_queue_jobs_processed_total",
            "Total number of jobs handled successfully"
        );
        describe_counter!(
            "mantle_queue_jobs_failed_total",
            "Total number of job failures, including retried ones"
        );
        describe_counter!(
            "mantle_queue_jobs_pruned_total",
            "Total number of finished jobs deleted by retention"
        );
        describe_counter!(
            "mantle_queue_errors_total",
            "Total number of queue errors by code"
        );
        describe_counter!(
            "mantle_queue_events_total",
            "Total number of lifecycle events broadcast"
        );

        // Gauges
        describe_gauge!(
            "mantle_queue_depth",
            "Number of outstanding jobs in a queue"
        );

        // Histograms
        describe_histogram!(
            "mantle_queue_job_duration_seconds",
            "Job handle() duration in seconds"
        );
        describe_histogram!(
            "mantle_queue_run_batch_size",
            "Number of jobs claimed per runner tick"
        );
    }

    /// Record a job pushed to a provider.
    pub fn record_job_queued(provider: &str, queue: &str) {
        counter!(
            "mantle_queue_jobs_queued_total",
            "provider" => provider.to_string(),
            "queue" => queue.to_string()
        )
        .increment(1);
    }

    /// Record a successful job.
    pub fn record_job_processed(queue: &str, job_type: &str, duration_secs: f64) {
        counter!(
            "mantle_queue_jobs_processed_total",
            "queue" => queue.to_string(),
            "job_type" => job_type.to_string()
        )
        .increment(1);
        histogram!("mantle_queue_job_duration_seconds", "queue" => queue.to_string())
            .record(duration_secs);
    }

    /// Record a job failure.
    pub fn record_job_failed(queue: &str, job_type: &str, permanent: bool) {
        counter!(
            "mantle_queue_jobs_failed_total",
            "queue" => queue.to_string(),
            "job_type" => job_type.to_string(),
            "permanent" => permanent.to_string()
        )
        .increment(1);
    }

    /// Record the size of a claimed batch.
    pub fn record_batch(queue: &str, size: usize) {
        histogram!("mantle_queue_run_batch_size", "queue" => queue.to_string()).record(size as f64);
    }

    /// Record records removed by retention.
    pub fn record_pruned(provider: &str, count: u64) {
        counter!("mantle_queue_jobs_pruned_total", "provider" => provider.to_string())
            .increment(count);
    }

    /// Update queue depth.
    pub fn set_queue_depth(queue: &str, stats: &QueueStats) {
        gauge!("mantle_queue_depth", "queue" => queue.to_string()).set(stats.outstanding() as f64);
    }
}
