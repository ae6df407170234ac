//! Configuration management.

use serde::Deserialize;
use std::collections::HashMap;
use std::net::SocketAddr;
use std::time::Duration;

use crate::error::{QueueError, Result};
use crate::jobs::{ProviderSettings, WorkerConfig};

const ENV_PREFIX: &str = "MANTLE_QUEUE";

/// Main application configuration.
#[derive(Debug, Clone, Default, Deserialize)]
pub struct Config {
    /// Queue providers and routing
    #[serde(default)]
    pub queue: QueueConfig,

    /// Runner configuration
    #[serde(default)]
    pub worker: WorkerConfig,

    /// Observability configuration
    #[serde(default)]
    pub observability: ObservabilityConfig,
}

/// Providers known to the queue manager.
#[derive(Debug, Clone, Deserialize)]
pub struct QueueConfig {
    /// Provider used when no name or route is given
    #[serde(default = "default_provider")]
    pub default: String,

    /// Queue used when a dispatch does not name one
    #[serde(default = "default_queue")]
    pub default_queue: String,

    /// Provider name -> connection settings
    #[serde(default = "default_connections")]
    pub connections: HashMap<String, ConnectionConfig>,

    /// Queue name -> provider name
    #[serde(default)]
    pub routes: HashMap<String, String>,
}

impl Default for QueueConfig {
    fn default() -> Self {
        Self {
            default: default_provider(),
            default_queue: default_queue(),
            connections: default_connections(),
            routes: HashMap::new(),
        }
    }
}

impl QueueConfig {
    /// Add or replace a connection.
    pub fn with_connection(mut self, name: impl Into<String>, connection: ConnectionConfig) -> Self {
        self.connections.insert(name.into(), connection);
        self
    }

    /// Route a queue to a provider.
    pub fn with_route(mut self, queue: impl Into<String>, provider: impl Into<String>) -> Self {
        self.routes.insert(queue.into(), provider.into());
        self
    }

    /// Provider name responsible for `queue`.
    pub fn provider_name_for(&self, queue: &str) -> &str {
        self.routes.get(queue).map_or(self.default.as_str(), String::as_str)
    }

    /// Keep the built-in memory connection when a file only adds others.
    fn with_builtin_connection(mut self) -> Self {
        self.connections
            .entry(default_provider())
            .or_insert_with(ConnectionConfig::memory);
        self
    }

    /// Check that the default provider and every route point at a configured
    /// connection, and that each connection is usable.
    pub fn validate(&self) -> Result<()> {
        if !self.connections.contains_key(&self.default) {
            return Err(QueueError::provider_not_registered(&self.default));
        }
        if self.default_queue.is_empty() {
            return Err(QueueError::invalid_configuration(
                "queue.default_queue must not be empty",
            ));
        }
        for (queue, provider) in &self.routes {
            if !self.connections.contains_key(provider) {
                return Err(QueueError::provider_not_registered(provider)
                    .with_context("queue", queue));
            }
        }
        for (name, connection) in &self.connections {
            connection
                .validate()
                .map_err(|e| e.with_context("connection", name))?;
        }
        Ok(())
    }
}

/// Storage backend of a connection.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum Driver {
    Memory,
    Postgres,
}

/// Settings for one named provider.
#[derive(Debug, Clone, Deserialize)]
pub struct ConnectionConfig {
    pub driver: Driver,

    /// PostgreSQL connection URL (postgres driver only)
    #[serde(default)]
    pub url: Option<String>,

    /// Table holding job records (postgres driver only)
    #[serde(default = "default_table")]
    pub table: String,

    /// Maximum number of connections
    #[serde(default = "default_max_connections")]
    pub max_connections: u32,

    /// Minimum number of connections
    #[serde(default = "default_min_connections")]
    pub min_connections: u32,

    /// Claim lock duration
    #[serde(default = "default_lock_timeout", with = "humantime_serde")]
    pub lock_timeout: Duration,

    /// Retention of completed and failed jobs
    #[serde(default = "default_delete_after", with = "humantime_serde")]
    pub delete_after: Duration,
}

impl ConnectionConfig {
    pub fn memory() -> Self {
        Self {
            driver: Driver::Memory,
            url: None,
            table: default_table(),
            max_connections: default_max_connections(),
            min_connections: default_min_connections(),
            lock_timeout: default_lock_timeout(),
            delete_after: default_delete_after(),
        }
    }

    pub fn postgres(url: impl Into<String>) -> Self {
        Self {
            driver: Driver::Postgres,
            url: Some(url.into()),
            ..Self::memory()
        }
    }

    /// Lock and retention settings handed to the provider.
    pub fn settings(&self) -> ProviderSettings {
        ProviderSettings {
            lock_timeout: self.lock_timeout,
            delete_after: self.delete_after,
        }
    }

    pub fn validate(&self) -> Result<()> {
        if self.lock_timeout.is_zero() {
            return Err(QueueError::invalid_configuration("lock_timeout must be positive"));
        }
        if self.driver == Driver::Postgres {
            if self.url.as_deref().map_or(true, str::is_empty) {
                return Err(QueueError::invalid_configuration(
                    "postgres connections require a url",
                ));
            }
            if self.min_connections > self.max_connections {
                return Err(QueueError::invalid_configuration(
                    "min_connections must not exceed max_connections",
                ));
            }
        }
        Ok(())
    }
}

#[derive(Debug, Clone, Deserialize)]
pub struct ObservabilityConfig {
    /// Log level used when RUST_LOG is not set
    #[serde(default = "default_log_level")]
    pub log_level: String,

    /// Enable JSON logging
    #[serde(default = "default_json_logging")]
    pub json_logging: bool,

    /// Prometheus exporter listen address
    #[serde(default)]
    pub metrics_addr: Option<SocketAddr>,
}

impl Default for ObservabilityConfig {
    fn default() -> Self {
        Self {
            log_level: default_log_level(),
            json_logging: default_json_logging(),
            metrics_addr: None,
        }
    }
}

// Default value functions
fn default_provider() -> String { "memory".to_string() }
fn default_queue() -> String { "default".to_string() }
fn default_connections() -> HashMap<String, ConnectionConfig> {
    HashMap::from([(default_provider(), ConnectionConfig::memory())])
}
fn default_table() -> String { "mantle_jobs".to_string() }
fn default_max_connections() -> u32 { 10 }
fn default_min_connections() -> u32 { 1 }
fn default_lock_timeout() -> Duration { ProviderSettings::default().lock_timeout }
fn default_delete_after() -> Duration { ProviderSettings::default().delete_after }
fn default_log_level() -> String { "info".to_string() }
fn default_json_logging() -> bool { true }

impl Config {
    /// Load configuration from the environment.
    pub fn load() -> Result<Self> {
        Self::build(None)
    }

    /// Load from a specific file path, with environment overrides on top.
    pub fn from_file(path: &str) -> Result<Self> {
        Self::build(Some(path))
    }

    fn build(path: Option<&str>) -> Result<Self> {
        let mut builder = config::Config::builder();
        if let Some(path) = path {
            builder = builder.add_source(config::File::with_name(path));
        }

        let config = builder
            .add_source(
                config::Environment::with_prefix(ENV_PREFIX)
                    .separator("__")
                    .try_parsing(true),
            )
            .build()?;

        let mut cfg: Config = config.try_deserialize()?;
        cfg.queue = cfg.queue.with_builtin_connection();
        cfg.queue.validate()?;
        cfg.worker.validate()?;
        Ok(cfg)
    }
}
