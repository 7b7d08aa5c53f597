use anyhow::{Context, Result};
use async_trait::async_trait;
use sqlx::PgPool;

use restraint_core::hooks::{NotifyChannel, NotifyEvent};

/// LISTEN/NOTIFY channel carrying JSON-encoded [`NotifyEvent`]s.
pub const PERMIT_READY_CHANNEL: &str = "restraint_permit_ready";

/// Publishes events with `pg_notify` so every host listening on
/// [`PERMIT_READY_CHANNEL`] can wake its suspended steps.
#[derive(Clone)]
pub struct PgNotifyChannel {
    pool: PgPool,
}

impl PgNotifyChannel {
    pub fn new(pool: PgPool) -> Self {
        Self { pool }
    }
}

#[async_trait]
impl NotifyChannel for PgNotifyChannel {
    #[tracing::instrument(skip(self))]
    async fn publish(&self, event: NotifyEvent) -> Result<()> {
        // Waiters register locally; only readiness needs to cross hosts.
        if let NotifyEvent::AwaitToken(_) = event {
            return Ok(());
        }

        let payload = serde_json::to_string(&event).context("Failed to encode notify event")?;
        sqlx::query("SELECT pg_notify($1, $2)")
            .bind(PERMIT_READY_CHANNEL)
            .bind(payload)
            .execute(&self.pool)
            .await
            .context("Failed to send pg_notify")?;

        tracing::debug!(token = %event.token(), "Permit-ready notification sent");
        Ok(())
    }
}
