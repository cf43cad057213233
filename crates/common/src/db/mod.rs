//! Database layer for CareHub
//!
//! Provides:
//! - SeaORM entity models for the shared registry tables
//! - Repository pattern for registry access
//! - Connection pool management
//! - An in-memory registry for tests and local development

pub mod memory;
pub mod models;
mod repository;

pub use memory::MemoryRegistry;
pub use repository::Repository;

use crate::config::DatabaseConfig;
use crate::errors::{AppError, Result};
use crate::session::ensure_identifier;
use sea_orm::{DatabaseConnection, SqlxPostgresConnector};
use sqlx::postgres::PgPoolOptions;
use sqlx::{Executor, PgPool};
use std::time::Duration;
use tracing::info;

/// Database connection pool wrapper.
///
/// A single bounded sqlx pool serves both the registry (through SeaORM) and
/// tenant sessions, so pool pressure is shared across every tenant.
#[derive(Clone)]
pub struct DbPool {
    /// SeaORM handle for registry queries
    pub registry: DatabaseConnection,

    /// Raw pool for tenant sessions
    pub sessions: PgPool,
}

impl DbPool {
    /// Create a new database pool from configuration
    pub async fn new(config: &DatabaseConfig) -> Result<Self> {
        ensure_identifier(&config.default_search_path).map_err(|_| AppError::Configuration {
            message: "database.default_search_path must be a single lowercase schema name"
                .to_string(),
        })?;

        info!("Connecting to database...");

        let reset = format!("SET search_path TO \"{}\"", config.default_search_path);
        let pool = PgPoolOptions::new()
            .max_connections(config.max_connections)
            .min_connections(config.min_connections)
            .acquire_timeout(config.acquire_timeout())
            .idle_timeout(Duration::from_secs(config.idle_timeout_secs))
            // Pool-level reset, independent of session release
            .after_release(move |conn, _meta| {
                let reset = reset.clone();
                Box::pin(async move {
                    conn.execute(reset.as_str()).await?;
                    Ok(true)
                })
            })
            .connect(&config.url)
            .await
            .map_err(|e| AppError::DatabaseUnavailable {
                message: format!("Failed to connect: {}", e),
            })?;

        let registry = SqlxPostgresConnector::from_sqlx_postgres_pool(pool.clone());

        info!("Database connections established");

        Ok(Self {
            registry,
            sessions: pool,
        })
    }

    /// Get the registry connection
    pub fn registry(&self) -> &DatabaseConnection {
        &self.registry
    }
}
