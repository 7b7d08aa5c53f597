//! In-process wait/notify hub
//!
//! Correlates `PermitReady` events with suspended steps by token and delivers
//! at most one wake-up per subscription. A token announced with `AwaitToken`
//! (or already subscribed) keeps a readiness signal that arrives before the
//! waiter subscribes; readiness for tokens nobody here cares about is dropped.

use std::collections::HashMap;

use async_trait::async_trait;
use tokio::sync::{oneshot, Mutex};
use uuid::Uuid;

use restraint_core::{NotifyChannel, NotifyEvent};

enum Slot {
    /// Announced, nobody waiting yet.
    Interested,
    /// Readiness arrived before the waiter.
    Ready,
    Waiting(oneshot::Sender<()>),
}

#[derive(Default)]
pub struct WaitNotifyHub {
    slots: Mutex<HashMap<Uuid, Slot>>,
}

/// Pending wake-up for one token.
pub struct PermitWait {
    token: Uuid,
    rx: oneshot::Receiver<()>,
}

impl PermitWait {
    pub fn token(&self) -> Uuid {
        self.token
    }

    /// Resolves once the token is signalled. Errors if the subscription was replaced or cancelled.
    pub async fn wait(self) -> anyhow::Result<()> {
        self.rx
            .await
            .map_err(|_| anyhow::anyhow!("Wait for token {} was cancelled", self.token))
    }
}

impl WaitNotifyHub {
    pub fn new() -> Self {
        Self::default()
    }

    /// Subscribe to the next readiness signal for `token`.
    pub async fn subscribe(&self, token: Uuid) -> PermitWait {
        let (tx, rx) = oneshot::channel();
        let mut slots = self.slots.lock().await;

        match slots.remove(&token) {
            Some(Slot::Ready) => {
                tracing::debug!(token = %token, "Readiness already delivered, waking immediately");
                let _ = tx.send(());
            }
            _ => {
                slots.insert(token, Slot::Waiting(tx));
            }
        }

        PermitWait { token, rx }
    }

    /// Forget a token, dropping any waiter or stored readiness.
    pub async fn cancel(&self, token: Uuid) {
        self.slots.lock().await.remove(&token);
    }

    pub async fn pending(&self) -> usize {
        self.slots.lock().await.len()
    }

    async fn announce(&self, token: Uuid) {
        self.slots
            .lock()
            .await
            .entry(token)
            .or_insert(Slot::Interested);
    }

    async fn signal(&self, token: Uuid) {
        let mut slots = self.slots.lock().await;
        match slots.remove(&token) {
            Some(Slot::Waiting(tx)) => {
                if tx.send(()).is_err() {
                    tracing::debug!(token = %token, "Waiter went away before wake-up");
                } else {
                    tracing::debug!(token = %token, "Waiter woken");
                }
            }
            Some(Slot::Interested) | Some(Slot::Ready) => {
                slots.insert(token, Slot::Ready);
            }
            None => {
                tracing::debug!(token = %token, "No local interest in token, ignoring");
            }
        }
    }
}

#[async_trait]
impl NotifyChannel for WaitNotifyHub {
    async fn publish(&self, event: NotifyEvent) -> anyhow::Result<()> {
        match event {
            NotifyEvent::AwaitToken(token) => self.announce(token).await,
            NotifyEvent::PermitReady(token) => self.signal(token).await,
        }
        Ok(())
    }
}
