//! Restraint Database Layer
//!
//! Storage for resource restraints and their consumers, plus the PostgreSQL
//! notification channel.

pub mod db;
pub mod registry;

use std::time::Duration;

use anyhow::{Context, Result};
use sqlx::postgres::PgPoolOptions;
use sqlx::PgPool;

use restraint_core::RestraintConfig;

// Re-exports: storage traits
pub use registry::{CasOutcome, ConstraintRepository, ConsumerRegistry, UnitSnapshot};

// Re-exports: implementations
pub use db::{
    InMemoryConstraintRepository, InMemoryConsumerRegistry, PgConsumerRegistry,
    PgConstraintRepository, PgNotifyChannel, PERMIT_READY_CHANNEL,
};

/// Connect to `database_url` with the configured pool limits.
pub async fn connect_pool(config: &RestraintConfig, database_url: &str) -> Result<PgPool> {
    let pool = PgPoolOptions::new()
        .max_connections(config.db_max_connections)
        .acquire_timeout(config.db_timeout())
        .idle_timeout(Some(Duration::from_secs(600)))
        .connect(database_url)
        .await
        .context("Failed to connect to database")?;

    tracing::info!(
        max_connections = config.db_max_connections,
        "Database pool created"
    );

    Ok(pool)
}

/// Apply the workspace migrations.
pub async fn run_migrations(pool: &PgPool) -> Result<()> {
    sqlx::migrate!("../../migrations")
        .run(pool)
        .await
        .context("Failed to run migrations")?;
    Ok(())
}
