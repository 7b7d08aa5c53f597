use anyhow::{Context, Result};
use async_trait::async_trait;
use sqlx::{PgPool, Postgres};

use restraint_core::models::ResourceRestraint;

use crate::registry::ConstraintRepository;

#[derive(Clone)]
pub struct PgConstraintRepository {
    pool: PgPool,
}

impl PgConstraintRepository {
    pub fn new(pool: PgPool) -> Self {
        Self { pool }
    }
}

#[async_trait]
impl ConstraintRepository for PgConstraintRepository {
    #[tracing::instrument(skip(self))]
    async fn get(&self, constraint_id: &str) -> Result<Option<ResourceRestraint>> {
        let restraint = sqlx::query_as::<Postgres, ResourceRestraint>(
            r#"
            SELECT id, name, capacity, created_at
            FROM resource_restraints
            WHERE id = $1
            "#,
        )
        .bind(constraint_id)
        .fetch_optional(&self.pool)
        .await
        .context("Failed to fetch resource restraint")?;

        Ok(restraint)
    }

    #[tracing::instrument(skip(self), fields(restraint_id = %restraint.id))]
    async fn create(&self, restraint: ResourceRestraint) -> Result<ResourceRestraint> {
        let created = sqlx::query_as::<Postgres, ResourceRestraint>(
            r#"
            INSERT INTO resource_restraints (id, name, capacity, created_at)
            VALUES ($1, $2, $3, $4)
            RETURNING id, name, capacity, created_at
            "#,
        )
        .bind(&restraint.id)
        .bind(&restraint.name)
        .bind(restraint.capacity)
        .bind(restraint.created_at)
        .fetch_one(&self.pool)
        .await
        .context("Failed to insert resource restraint")?;

        tracing::info!(
            restraint_id = %created.id,
            capacity = created.capacity,
            "Resource restraint created"
        );

        Ok(created)
    }
}
