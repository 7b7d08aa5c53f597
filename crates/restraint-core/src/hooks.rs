//! Notification boundary towards the external wait/notify engine
//!
//! The engine only emits opaque events keyed by consumer id. How they are
//! delivered (in-process hub, PostgreSQL NOTIFY, a message bus) is up to the
//! [`NotifyChannel`] implementation.

use async_trait::async_trait;
use serde::{Deserialize, Serialize};
use tokio::sync::mpsc;
use uuid::Uuid;

/// Event crossing the wait/notify boundary.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(tag = "kind", content = "token", rename_all = "snake_case")]
pub enum NotifyEvent {
    /// A suspended step waits for exactly one response on this token.
    AwaitToken(Uuid),
    /// The consumer behind this token changed state; wake its step.
    PermitReady(Uuid),
}

impl NotifyEvent {
    pub fn token(&self) -> Uuid {
        match self {
            NotifyEvent::AwaitToken(token) | NotifyEvent::PermitReady(token) => *token,
        }
    }
}

/// Outbound channel for [`NotifyEvent`]s.
#[async_trait]
pub trait NotifyChannel: Send + Sync {
    async fn publish(&self, event: NotifyEvent) -> anyhow::Result<()>;
}

/// Discards every event. For deployments that poll instead.
pub struct NoOpNotifyChannel;

#[async_trait]
impl NotifyChannel for NoOpNotifyChannel {
    async fn publish(&self, _event: NotifyEvent) -> anyhow::Result<()> {
        Ok(())
    }
}

/// Forwards events onto a tokio mpsc channel.
#[derive(Clone)]
pub struct MpscNotifyChannel {
    tx: mpsc::Sender<NotifyEvent>,
}

impl MpscNotifyChannel {
    pub fn new(tx: mpsc::Sender<NotifyEvent>) -> Self {
        Self { tx }
    }

    /// Channel plus its receiving end, with room for `buffer` undelivered events.
    pub fn channel(buffer: usize) -> (Self, mpsc::Receiver<NotifyEvent>) {
        let (tx, rx) = mpsc::channel(buffer);
        (Self { tx }, rx)
    }
}

#[async_trait]
impl NotifyChannel for MpscNotifyChannel {
    async fn publish(&self, event: NotifyEvent) -> anyhow::Result<()> {
        self.tx
            .send(event)
            .await
            .map_err(|_| anyhow::anyhow!("Notify receiver dropped, event {:?} lost", event))
    }
}
