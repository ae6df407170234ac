//! Queue manager: owns the configured providers and resolves them by name.

use std::collections::HashMap;
use std::sync::Arc;
use tokio::sync::OnceCell;

use super::memory::InMemoryProvider;
use super::postgres::PostgresProvider;
use super::Provider;
use crate::config::{Driver, QueueConfig};
use crate::error::{QueueError, Result};
use crate::events::{EventSink, QueueEvent};

/// Resolves the provider responsible for a queue.
///
/// Built from an explicit [`QueueConfig`]; provider instances are created once
/// and held for the manager's lifetime.
pub struct QueueManager {
    config: QueueConfig,
    providers: HashMap<String, Arc<dyn Provider>>,
    registered: OnceCell<()>,
}

impl std::fmt::Debug for QueueManager {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("QueueManager")
            .field("default", &self.config.default)
            .field("providers", &self.provider_names())
            .field("registered", &self.is_registered())
            .finish()
    }
}

impl QueueManager {
    /// Create a manager with no providers; add them with
    /// [`with_provider`](Self::with_provider).
    pub fn new(config: QueueConfig) -> Self {
        Self {
            config,
            providers: HashMap::new(),
            registered: OnceCell::new(),
        }
    }

    /// Build every configured connection.
    pub async fn from_config(config: QueueConfig) -> Result<Self> {
        config.validate()?;

        let mut manager = Self::new(config.clone());
        for (name, connection) in &config.connections {
            let provider: Arc<dyn Provider> = match connection.driver {
                Driver::Memory => {
                    Arc::new(InMemoryProvider::new(name.clone()).with_settings(connection.settings()))
                }
                Driver::Postgres => Arc::new(PostgresProvider::connect(name.clone(), connection).await?),
            };
            tracing::debug!(provider = %name, driver = ?connection.driver, "Queue provider created");
            manager.add_provider(provider);
        }
        Ok(manager)
    }

    /// Build every configured connection and register the providers.
    ///
    /// Entry points that read or prune queues use this so a fresh database
    /// has its tables before the first query.
    pub async fn open(config: QueueConfig, events: &dyn EventSink) -> Result<Self> {
        let manager = Self::from_config(config).await?;
        manager.register_providers(events).await?;
        Ok(manager)
    }

    /// Add a provider under its own name, replacing any previous one.
    pub fn with_provider(mut self, provider: Arc<dyn Provider>) -> Self {
        self.add_provider(provider);
        self
    }

    pub fn add_provider(&mut self, provider: Arc<dyn Provider>) {
        self.providers.insert(provider.name().to_string(), provider);
    }

    pub fn config(&self) -> &QueueConfig {
        &self.config
    }

    /// Queue used when a dispatch names none.
    pub fn default_queue(&self) -> &str {
        &self.config.default_queue
    }

    /// Registered provider names, sorted.
    pub fn provider_names(&self) -> Vec<String> {
        let mut names: Vec<_> = self.providers.keys().cloned().collect();
        names.sort();
        names
    }

    /// Provider registered under `name`, or the default provider.
    pub fn get_provider(&self, name: Option<&str>) -> Result<Arc<dyn Provider>> {
        let name = name.unwrap_or(&self.config.default);
        self.providers
            .get(name)
            .cloned()
            .ok_or_else(|| QueueError::provider_not_registered(name))
    }

    /// Provider responsible for `queue`, following configured routes.
    pub fn provider_for_queue(&self, queue: &str) -> Result<Arc<dyn Provider>> {
        self.get_provider(Some(self.config.provider_name_for(queue)))
    }

    /// Run every provider's one-time setup and emit `ProvidersRegistered`.
    ///
    /// Only the first successful call does any work; a failed registration
    /// may be retried.
    pub async fn register_providers(&self, events: &dyn EventSink) -> Result<()> {
        self.registered
            .get_or_try_init(|| async {
                let names = self.provider_names();
                for name in &names {
                    self.get_provider(Some(name))?.register().await?;
                }
                tracing::info!(providers = ?names, "Queue providers registered");
                events.emit(&QueueEvent::ProvidersRegistered { providers: names });
                Ok::<(), QueueError>(())
            })
            .await?;
        Ok(())
    }

    pub fn is_registered(&self) -> bool {
        self.registered.initialized()
    }
}
