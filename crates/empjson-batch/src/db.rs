//! Connection pool setup

use sqlx::postgres::{PgPool, PgPoolOptions};
use std::time::Duration;
use tracing::info;

use crate::config::DatabaseConfig;
use crate::error::{BatchError, BatchResult};

/// Open the shared pool every reader, writer and repository borrows from
pub async fn create_pool(config: &DatabaseConfig) -> BatchResult<PgPool> {
    let pool = PgPoolOptions::new()
        .max_connections(config.max_connections)
        .min_connections(config.min_connections)
        .acquire_timeout(Duration::from_secs(config.connect_timeout_secs))
        .idle_timeout(Duration::from_secs(config.idle_timeout_secs))
        .connect(&config.url)
        .await?;

    info!(
        max_connections = config.max_connections,
        min_connections = config.min_connections,
        "Database connection pool established"
    );

    Ok(pool)
}

/// Create the run and checkpoint tables if they are missing
pub async fn run_migrations(pool: &PgPool) -> BatchResult<()> {
    sqlx::migrate!("../../migrations")
        .run(pool)
        .await
        .map_err(|e| BatchError::Checkpoint(format!("Failed to run migrations: {e}")))?;

    info!("Database migrations completed");
    Ok(())
}
