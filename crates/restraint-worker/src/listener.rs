use std::sync::Arc;
use std::time::Duration;

use sqlx::postgres::PgListener;
use sqlx::PgPool;
use tokio::task::JoinHandle;

use restraint_core::{NotifyChannel, NotifyEvent};
use restraint_db::PERMIT_READY_CHANNEL;

use crate::hub::WaitNotifyHub;

const RECONNECT_DELAY: Duration = Duration::from_secs(5);

/// Forward `pg_notify` permit-ready events into `hub`, reconnecting on failure.
///
/// Runs until the returned handle is aborted.
pub fn spawn_pg_listener(pool: PgPool, hub: Arc<WaitNotifyHub>) -> JoinHandle<()> {
    tokio::spawn(async move {
        loop {
            match PgListener::connect_with(&pool).await {
                Ok(mut listener) => {
                    if let Err(e) = listener.listen(PERMIT_READY_CHANNEL).await {
                        tracing::warn!(error = %e, "LISTEN failed, will retry");
                        tokio::time::sleep(RECONNECT_DELAY).await;
                        continue;
                    }
                    tracing::info!(channel = PERMIT_READY_CHANNEL, "Listening for permit-ready events");

                    loop {
                        match listener.recv().await {
                            Ok(notification) => forward(&hub, notification.payload()).await,
                            Err(e) => {
                                tracing::warn!(error = %e, "PgListener connection lost, reconnecting");
                                break;
                            }
                        }
                    }
                }
                Err(e) => {
                    tracing::warn!(error = %e, "PgListener connect failed, will retry");
                }
            }
            tokio::time::sleep(RECONNECT_DELAY).await;
        }
    })
}

async fn forward(hub: &WaitNotifyHub, payload: &str) {
    match serde_json::from_str::<NotifyEvent>(payload) {
        Ok(event) => {
            if let Err(e) = hub.publish(event).await {
                tracing::warn!(error = %e, "Failed to deliver permit-ready event");
            }
        }
        Err(e) => {
            tracing::warn!(error = %e, payload = %payload, "Ignoring malformed notification");
        }
    }
}
