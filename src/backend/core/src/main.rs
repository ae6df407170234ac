//! Mantle Queue - worker and queue administration entry point.

use clap::{Parser, Subcommand, ValueEnum};
use std::sync::Arc;
use std::time::Duration;

use mantle_queue::{
    config::Config,
    events::{EventSink, TracingSink},
    jobs::{
        Dispatchable, Dispatcher, JobRegistry, LogLevel, LogMessageJob, QueueManager,
        QueueWorker, RunSummary,
    },
    observability,
};

// ═══════════════════════════════════════════════════════════════════════════════
// CLI Structure
// ═══════════════════════════════════════════════════════════════════════════════

#[derive(Parser)]
#[command(
    name = "mantle-queue",
    version,
    about = "Mantle queue worker and administration tool",
    propagate_version = true
)]
struct Cli {
    /// Configuration file path
    #[arg(short, long, global = true, env = "MANTLE_QUEUE_CONFIG")]
    config: Option<String>,

    /// Output format
    #[arg(short, long, global = true, default_value = "text")]
    format: OutputFormat,

    #[command(subcommand)]
    command: Commands,
}

#[derive(Clone, Copy, ValueEnum, Default)]
enum OutputFormat {
    #[default]
    Text,
    Json,
}

#[derive(Subcommand)]
enum Commands {
    /// Run every provider's one-time setup (e.g. create tables)
    Register,

    /// Process jobs
    Work {
        /// Queue to process (defaults to worker.queue)
        #[arg(short, long)]
        queue: Option<String>,

        /// Run a single tick and exit
        #[arg(long)]
        once: bool,
    },

    /// Show queue statistics
    Stats {
        /// Queue to inspect (defaults to queue.default_queue)
        #[arg(short, long)]
        queue: Option<String>,
    },

    /// Delete finished jobs past their provider's retention
    Prune {
        /// Provider to prune (defaults to all)
        #[arg(short, long)]
        provider: Option<String>,
    },

    /// Queue a log message job to check a queue end to end
    Ping {
        /// Message to log
        #[arg(short, long, default_value = "ping")]
        message: String,

        /// Target queue
        #[arg(short, long)]
        queue: Option<String>,

        /// Delay in seconds before the job becomes eligible
        #[arg(short, long)]
        delay: Option<u64>,

        /// Run one worker tick after queueing
        #[arg(long)]
        work: bool,
    },
}

// ═══════════════════════════════════════════════════════════════════════════════
// Entry Point
// ═══════════════════════════════════════════════════════════════════════════════

#[tokio::main]
async fn main() -> anyhow::Result<()> {
    // Load environment variables
    dotenvy::dotenv().ok();

    let cli = Cli::parse();

    let config = match cli.config.as_deref() {
        Some(path) => Config::from_file(path)?,
        None => Config::load()?,
    };

    observability::init("mantle-queue", &config.observability)?;

    tracing::info!(
        version = env!("CARGO_PKG_VERSION"),
        default_provider = %config.queue.default,
        "Starting Mantle queue"
    );

    let events: Arc<dyn EventSink> = Arc::new(TracingSink);
    let manager = Arc::new(QueueManager::open(config.queue.clone(), events.as_ref()).await?);
    let registry = Arc::new(JobRegistry::new().with::<LogMessageJob>());

    match cli.command {
        Commands::Register => {
            print_line(cli.format, "registered", &manager.provider_names());
        }

        Commands::Work { queue, once } => {
            let mut worker_config = config.worker.clone();
            if let Some(queue) = queue {
                worker_config.queue = queue;
            }
            let worker = QueueWorker::new(manager, registry, events, worker_config);

            if once {
                let summary = worker.tick().await?;
                print_summary(cli.format, &summary);
            } else {
                let handle = worker.start();
                shutdown_signal().await;
                handle.stop().await;
            }
        }

        Commands::Stats { queue } => {
            let queue = queue.unwrap_or_else(|| manager.default_queue().to_string());
            let provider = manager.provider_for_queue(&queue)?;
            let stats = provider.stats(&queue).await?;
            match cli.format {
                OutputFormat::Json => println!("{}", serde_json::to_string_pretty(&stats)?),
                OutputFormat::Text => println!(
                    "{} ({}): pending={} delayed={} processing={} completed={} failed={}",
                    queue,
                    provider.name(),
                    stats.pending,
                    stats.delayed,
                    stats.processing,
                    stats.completed,
                    stats.failed
                ),
            }
        }

        Commands::Prune { provider } => {
            let names = match provider {
                Some(name) => vec![name],
                None => manager.provider_names(),
            };
            for name in names {
                let provider = manager.get_provider(Some(&name))?;
                let cutoff = provider.now()
                    - chrono::Duration::from_std(provider.settings().delete_after)
                        .unwrap_or_else(|_| chrono::Duration::days(36_500));
                let removed = provider.prune(cutoff).await?;
                print_line(cli.format, &format!("pruned {}", name), &removed);
            }
        }

        Commands::Ping {
            message,
            queue,
            delay,
            work,
        } => {
            let dispatcher = Dispatcher::new(manager.clone(), events.clone());
            let mut job = Dispatchable::queued(LogMessageJob::new(message).with_level(LogLevel::Info));
            if let Some(queue) = &queue {
                job = job.on_queue(queue.clone());
            }
            if let Some(secs) = delay {
                job = job.delay(Duration::from_secs(secs));
            }

            let dispatched = dispatcher.dispatch(job).await?;
            print_line(cli.format, "queued", &dispatched.job_id());

            if work {
                let mut worker_config = config.worker.clone();
                worker_config.queue = queue.unwrap_or_else(|| manager.default_queue().to_string());
                let worker = QueueWorker::new(manager, registry, events, worker_config);
                let summary = worker.tick().await?;
                print_summary(cli.format, &summary);
            }
        }
    }

    Ok(())
}

fn print_line<T: serde::Serialize + std::fmt::Debug>(format: OutputFormat, label: &str, value: &T) {
    match format {
        OutputFormat::Json => println!("{}", serde_json::json!({ label: value })),
        OutputFormat::Text => println!("{}: {:?}", label, value),
    }
}

fn print_summary(format: OutputFormat, summary: &RunSummary) {
    match format {
        OutputFormat::Json => println!(
            "{}",
            serde_json::json!({
                "claimed": summary.claimed,
                "processed": summary.processed,
                "failed": summary.failed,
                "retried": summary.retried,
                "pruned": summary.pruned,
            })
        ),
        OutputFormat::Text => println!(
            "claimed={} processed={} failed={} retried={} pruned={}",
            summary.claimed, summary.processed, summary.failed, summary.retried, summary.pruned
        ),
    }
}

/// Wait for shutdown signal.
async fn shutdown_signal() {
    let ctrl_c = async {
        if let Err(e) = tokio::signal::ctrl_c().await {
            tracing::error!(error = %e, "Failed to install Ctrl+C handler");
            std::future::pending::<()>().await;
        }
    };

    #[cfg(unix)]
    let terminate = async {
        match tokio::signal::unix::signal(tokio::signal::unix::SignalKind::terminate()) {
            Ok(mut signal) => {
                signal.recv().await;
            }
            Err(e) => {
                tracing::error!(error = %e, "Failed to install signal handler");
                std::future::pending::<()>().await;
            }
        }
    };

    #[cfg(not(unix))]
    let terminate = std::future::pending::<()>();

    tokio::select! {
        _ = ctrl_c => {},
        _ = terminate => {},
    }

    tracing::info!("Shutdown signal received");
}
