use anyhow::{Context, Result};
use async_trait::async_trait;
use sqlx::{PgPool, Postgres};
use uuid::Uuid;

use restraint_core::models::{Consumer, ReleaseEntityType};

use crate::registry::{CasOutcome, ConsumerRegistry, UnitSnapshot};

const CONSUMER_COLUMNS: &str = r#"
    id,
    constraint_id,
    resource_unit,
    permits,
    state,
    release_entity_type,
    release_entity_id,
    consumer_order,
    created_at
"#;

/// PostgreSQL consumer registry.
///
/// Each (constraint, unit) ledger has a row in `resource_restraint_units`
/// whose `version` guards every rewrite of its consumer rows.
#[derive(Clone)]
pub struct PgConsumerRegistry {
    pool: PgPool,
}

impl PgConsumerRegistry {
    pub fn new(pool: PgPool) -> Self {
        Self { pool }
    }

    async fn current_version(&self, constraint_id: &str, resource_unit: &str) -> Result<i64> {
        let version: Option<i64> = sqlx::query_scalar(
            r#"
            SELECT version
            FROM resource_restraint_units
            WHERE constraint_id = $1 AND resource_unit = $2
            "#,
        )
        .bind(constraint_id)
        .bind(resource_unit)
        .fetch_optional(&self.pool)
        .await
        .context("Failed to fetch unit version")?;

        Ok(version.unwrap_or(0))
    }
}

#[async_trait]
impl ConsumerRegistry for PgConsumerRegistry {
    #[tracing::instrument(skip(self))]
    async fn load(&self, constraint_id: &str, resource_unit: &str) -> Result<UnitSnapshot> {
        let mut tx = self
            .pool
            .begin()
            .await
            .context("Failed to begin transaction for unit load")?;

        // Version and rows must come from the same snapshot.
        sqlx::query("SET TRANSACTION ISOLATION LEVEL REPEATABLE READ READ ONLY")
            .execute(&mut *tx)
            .await
            .context("Failed to set isolation level")?;

        let version: Option<i64> = sqlx::query_scalar(
            r#"
            SELECT version
            FROM resource_restraint_units
            WHERE constraint_id = $1 AND resource_unit = $2
            "#,
        )
        .bind(constraint_id)
        .bind(resource_unit)
        .fetch_optional(&mut *tx)
        .await
        .context("Failed to fetch unit version")?;

        let consumers: Vec<Consumer> = sqlx::query_as::<Postgres, Consumer>(&format!(
            r#"
            SELECT {CONSUMER_COLUMNS}
            FROM resource_restraint_consumers
            WHERE constraint_id = $1 AND resource_unit = $2
            ORDER BY consumer_order ASC, created_at ASC
            "#
        ))
        .bind(constraint_id)
        .bind(resource_unit)
        .fetch_all(&mut *tx)
        .await
        .context("Failed to fetch unit consumers")?;

        tx.commit().await.context("Failed to commit unit load")?;

        Ok(UnitSnapshot {
            version: version.unwrap_or(0),
            consumers,
        })
    }

    #[tracing::instrument(skip(self, records), fields(records = records.len()))]
    async fn compare_and_swap(
        &self,
        constraint_id: &str,
        resource_unit: &str,
        expected_version: i64,
        records: Vec<Consumer>,
    ) -> Result<CasOutcome> {
        let mut tx = self
            .pool
            .begin()
            .await
            .context("Failed to begin transaction for unit swap")?;

        let claimed = if expected_version == 0 {
            sqlx::query(
                r#"
                INSERT INTO resource_restraint_units (constraint_id, resource_unit, version)
                VALUES ($1, $2, 1)
                ON CONFLICT (constraint_id, resource_unit) DO NOTHING
                "#,
            )
            .bind(constraint_id)
            .bind(resource_unit)
            .execute(&mut *tx)
            .await
            .context("Failed to create unit ledger")?
            .rows_affected()
        } else {
            sqlx::query(
                r#"
                UPDATE resource_restraint_units
                SET version = version + 1,
                    updated_at = NOW()
                WHERE constraint_id = $1 AND resource_unit = $2 AND version = $3
                "#,
            )
            .bind(constraint_id)
            .bind(resource_unit)
            .bind(expected_version)
            .execute(&mut *tx)
            .await
            .context("Failed to bump unit version")?
            .rows_affected()
        };

        if claimed == 0 {
            tx.rollback().await.ok();
            let current_version = self.current_version(constraint_id, resource_unit).await?;
            tracing::debug!(
                constraint_id = %constraint_id,
                resource_unit = %resource_unit,
                expected_version,
                current_version,
                "Unit swap lost to a concurrent writer"
            );
            return Ok(CasOutcome::Conflict { current_version });
        }

        sqlx::query(
            r#"
            DELETE FROM resource_restraint_consumers
            WHERE constraint_id = $1 AND resource_unit = $2
            "#,
        )
        .bind(constraint_id)
        .bind(resource_unit)
        .execute(&mut *tx)
        .await
        .context("Failed to clear unit consumers")?;

        for consumer in &records {
            sqlx::query(
                r#"
                INSERT INTO resource_restraint_consumers (
                    id, constraint_id, resource_unit, permits, state,
                    release_entity_type, release_entity_id, consumer_order, created_at
                )
                VALUES ($1, $2, $3, $4, $5, $6, $7, $8, $9)
                "#,
            )
            .bind(consumer.id)
            .bind(constraint_id)
            .bind(resource_unit)
            .bind(consumer.permits)
            .bind(consumer.state.to_string())
            .bind(consumer.context.release_entity_type.to_string())
            .bind(&consumer.context.release_entity_id)
            .bind(consumer.context.order)
            .bind(consumer.created_at)
            .execute(&mut *tx)
            .await
            .with_context(|| format!("Failed to insert consumer {}", consumer.id))?;
        }

        tx.commit().await.context("Failed to commit unit swap")?;

        Ok(CasOutcome::Committed {
            version: expected_version + 1,
        })
    }

    #[tracing::instrument(skip(self))]
    async fn next_order(&self, constraint_id: &str) -> Result<i64> {
        let order: i64 = sqlx::query_scalar(
            r#"
            INSERT INTO resource_restraint_order_counters (constraint_id, last_order)
            VALUES ($1, 1)
            ON CONFLICT (constraint_id)
            DO UPDATE SET last_order = resource_restraint_order_counters.last_order + 1
            RETURNING last_order
            "#,
        )
        .bind(constraint_id)
        .fetch_one(&self.pool)
        .await
        .context("Failed to allocate consumer order")?;

        Ok(order)
    }

    #[tracing::instrument(skip(self))]
    async fn find_consumer(&self, consumer_id: Uuid) -> Result<Option<Consumer>> {
        let consumer = sqlx::query_as::<Postgres, Consumer>(&format!(
            "SELECT {CONSUMER_COLUMNS} FROM resource_restraint_consumers WHERE id = $1"
        ))
        .bind(consumer_id)
        .fetch_optional(&self.pool)
        .await
        .context("Failed to fetch consumer")?;

        Ok(consumer)
    }

    #[tracing::instrument(skip(self))]
    async fn find_by_release_entity(
        &self,
        entity_type: ReleaseEntityType,
        entity_id: &str,
    ) -> Result<Vec<Consumer>> {
        let consumers = sqlx::query_as::<Postgres, Consumer>(&format!(
            r#"
            SELECT {CONSUMER_COLUMNS}
            FROM resource_restraint_consumers
            WHERE release_entity_type = $1 AND release_entity_id = $2
            ORDER BY created_at ASC
            "#
        ))
        .bind(entity_type.to_string())
        .bind(entity_id)
        .fetch_all(&self.pool)
        .await
        .context("Failed to fetch consumers by release entity")?;

        Ok(consumers)
    }

    #[tracing::instrument(skip(self))]
    async fn blocked_units(&self, constraint_id: &str) -> Result<Vec<String>> {
        let units: Vec<String> = sqlx::query_scalar(
            r#"
            SELECT DISTINCT resource_unit
            FROM resource_restraint_consumers
            WHERE constraint_id = $1 AND state = 'BLOCKED'
            ORDER BY resource_unit
            "#,
        )
        .bind(constraint_id)
        .fetch_all(&self.pool)
        .await
        .context("Failed to list blocked units")?;

        Ok(units)
    }

    #[tracing::instrument(skip(self))]
    async fn constraints_with_blocked(&self) -> Result<Vec<String>> {
        let constraints: Vec<String> = sqlx::query_scalar(
            r#"
            SELECT DISTINCT constraint_id
            FROM resource_restraint_consumers
            WHERE state = 'BLOCKED'
            ORDER BY constraint_id
            "#,
        )
        .fetch_all(&self.pool)
        .await
        .context("Failed to list constraints with blocked consumers")?;

        Ok(constraints)
    }
}
