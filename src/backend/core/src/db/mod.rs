//! Database layer.
//!
//! Uses PostgreSQL with sqlx for the durable queue provider.

use sqlx::{postgres::PgPoolOptions, PgPool};
use std::time::Duration;

use crate::config::ConnectionConfig;
use crate::error::{QueueError, Result};

/// Database connection pool.
#[derive(Debug, Clone)]
pub struct Database {
    pool: PgPool,
}

impl Database {
    /// Create a new database connection pool.
    pub async fn new(database_url: &str, max_connections: u32, min_connections: u32) -> Result<Self> {
        let pool = PgPoolOptions::new()
            .max_connections(max_connections)
            .min_connections(min_connections)
            .acquire_timeout(Duration::from_secs(5))
            .connect(database_url)
            .await?;

        Ok(Self { pool })
    }

    /// Connect using a postgres connection config.
    pub async fn connect(connection: &ConnectionConfig) -> Result<Self> {
        let url = connection
            .url
            .as_deref()
            .ok_or_else(|| QueueError::invalid_configuration("postgres connections require a url"))?;

        Self::new(url, connection.max_connections, connection.min_connections).await
    }

    /// Wrap an existing pool.
    pub fn from_pool(pool: PgPool) -> Self {
        Self { pool }
    }

    /// Get the connection pool.
    pub fn pool(&self) -> &PgPool {
        &self.pool
    }

    /// Round-trip a trivial query.
    pub async fn ping(&self) -> Result<()> {
        sqlx::query("SELECT 1").execute(&self.pool).await?;
        Ok(())
    }
}
