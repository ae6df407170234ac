//! Integration tests for configuration loading.

use mantle_queue::config::{Config, Driver};
use mantle_queue::error::ErrorCode;
use mantle_queue::jobs::{BackoffStrategy, QueueManager};
use std::io::Write;
use std::time::Duration;
use tempfile::NamedTempFile;

fn write_toml(contents: &str) -> NamedTempFile {
    let mut file = tempfile::Builder::new()
        .suffix(".toml")
        .tempfile()
        .unwrap();
    file.write_all(contents.as_bytes()).unwrap();
    file.flush().unwrap();
    file
}

fn load(contents: &str) -> mantle_queue::Result<Config> {
    let file = write_toml(contents);
    Config::from_file(file.path().to_str().unwrap())
}

#[test]
fn test_empty_file_uses_defaults() {
    let config = load("").unwrap();

    assert_eq!(config.queue.default, "memory");
    assert_eq!(config.queue.default_queue, "default");
    assert_eq!(config.queue.connections["memory"].driver, Driver::Memory);
    assert_eq!(config.worker.batch_size, 100);
    assert_eq!(config.observability.log_level, "info");
    assert!(config.observability.metrics_addr.is_none());
}

#[test]
fn test_full_file() {
    let config = load(
        r#"
[queue]
default = "primary"
default_queue = "jobs"

[queue.connections.primary]
driver = "memory"
lock_timeout = "2m"
delete_after = "1day"

[queue.connections.reports]
driver = "postgres"
url = "postgres://localhost/mantle"
table = "report_jobs"
max_connections = 4

[queue.routes]
monthly = "reports"

[worker]
name = "reporter"
queue = "jobs"
batch_size = 25
poll_interval = "10s"

[worker.retry]
max_attempts = 5

[worker.retry.backoff]
type = "fixed"
delay_secs = 30

[observability]
log_level = "debug"
json_logging = false
metrics_addr = "127.0.0.1:9464"
"#,
    )
    .unwrap();

    assert_eq!(config.queue.provider_name_for("monthly"), "reports");
    assert_eq!(config.queue.provider_name_for("jobs"), "primary");

    let primary = &config.queue.connections["primary"];
    assert_eq!(primary.lock_timeout, Duration::from_secs(120));
    assert_eq!(primary.delete_after, Duration::from_secs(86_400));

    let reports = &config.queue.connections["reports"];
    assert_eq!(reports.driver, Driver::Postgres);
    assert_eq!(reports.table, "report_jobs");
    assert_eq!(reports.max_connections, 4);
    assert_eq!(reports.min_connections, 1);

    assert_eq!(config.worker.name, "reporter");
    assert_eq!(config.worker.batch_size, 25);
    assert_eq!(config.worker.poll_interval, Duration::from_secs(10));
    assert_eq!(config.worker.retry.max_attempts, 5);
    assert_eq!(
        config.worker.retry.backoff,
        BackoffStrategy::Fixed { delay_secs: 30 }
    );

    assert!(!config.observability.json_logging);
    assert_eq!(
        config.observability.metrics_addr.map(|addr| addr.port()),
        Some(9464)
    );
}

#[test]
fn test_unknown_default_provider_is_rejected() {
    let err = load(
        r#"
[queue]
default = "redis"
"#,
    )
    .unwrap_err();

    assert_eq!(err.code(), ErrorCode::ProviderNotRegistered);
}

#[test]
fn test_route_to_unknown_provider_is_rejected() {
    let err = load(
        r#"
[queue.routes]
emails = "smtp"
"#,
    )
    .unwrap_err();

    assert!(err.is_configuration());
    assert_eq!(err.code(), ErrorCode::ProviderNotRegistered);
}

#[test]
fn test_postgres_without_url_is_rejected() {
    let err = load(
        r#"
[queue]
default = "pg"

[queue.connections.pg]
driver = "postgres"
"#,
    )
    .unwrap_err();

    assert_eq!(err.code(), ErrorCode::InvalidConfiguration);
}

#[test]
fn test_malformed_duration_is_rejected() {
    let err = load(
        r#"
[worker]
poll_interval = "soon"
"#,
    )
    .unwrap_err();

    assert!(err.is_configuration());
}

#[test]
fn test_added_connection_keeps_builtin_memory() {
    let config = load(
        r#"
[queue.connections.reports]
driver = "memory"
lock_timeout = "30s"
"#,
    )
    .unwrap();

    assert_eq!(config.queue.default, "memory");
    assert_eq!(config.queue.connections.len(), 2);
    assert_eq!(config.queue.connections["memory"].driver, Driver::Memory);
    assert_eq!(
        config.queue.connections["reports"].lock_timeout,
        Duration::from_secs(30)
    );
}

#[test]
fn test_zero_batch_size_is_rejected() {
    let err = load(
        r#"
[worker]
batch_size = 0
"#,
    )
    .unwrap_err();

    assert_eq!(err.code(), ErrorCode::InvalidConfiguration);
}

#[test]
fn test_missing_file_is_a_configuration_error() {
    let err = Config::from_file("/nonexistent/mantle-queue.toml").unwrap_err();
    assert!(err.is_configuration());
}

#[tokio::test]
async fn test_manager_from_memory_config() {
    let config = load(
        r#"
[queue.connections.reports]
driver = "memory"

[queue.routes]
monthly = "reports"
"#,
    )
    .unwrap();

    let manager = QueueManager::from_config(config.queue).await.unwrap();
    assert_eq!(manager.provider_names(), vec!["memory", "reports"]);
    assert_eq!(manager.provider_for_queue("monthly").unwrap().name(), "reports");
    assert_eq!(manager.provider_for_queue("other").unwrap().name(), "memory");
}
