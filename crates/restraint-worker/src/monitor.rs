use std::sync::Arc;
use std::time::Duration;

use tokio::sync::mpsc;

use restraint_core::{RestraintConfig, RestraintError};
use restraint_services::RestraintAccountingService;

/// Configuration for the blocked-constraint monitor
#[derive(Clone, Debug)]
pub struct MonitorConfig {
    /// Zero disables the monitor.
    pub interval: Duration,
}

impl Default for MonitorConfig {
    fn default() -> Self {
        Self {
            interval: Duration::from_secs(60),
        }
    }
}

impl From<&RestraintConfig> for MonitorConfig {
    fn from(config: &RestraintConfig) -> Self {
        Self {
            interval: Duration::from_secs(config.monitor_interval_secs),
        }
    }
}

/// Background loop that re-runs promotion for every constraint with BLOCKED
/// consumers, picking up promotions a crashed host never performed.
pub struct RestraintMonitor {
    shutdown_tx: mpsc::Sender<()>,
}

impl RestraintMonitor {
    /// Spawn the monitor. Returns `None` when the interval is zero.
    pub fn start(accounting: Arc<RestraintAccountingService>, config: MonitorConfig) -> Option<Self> {
        if config.interval.is_zero() {
            tracing::info!("Restraint monitor disabled");
            return None;
        }

        let (shutdown_tx, shutdown_rx) = mpsc::channel(1);
        tokio::spawn(async move {
            Self::monitor_loop(accounting, config, shutdown_rx).await;
        });

        Some(Self { shutdown_tx })
    }

    async fn monitor_loop(
        accounting: Arc<RestraintAccountingService>,
        config: MonitorConfig,
        mut shutdown_rx: mpsc::Receiver<()>,
    ) {
        let mut interval = tokio::time::interval(config.interval);
        interval.set_missed_tick_behavior(tokio::time::MissedTickBehavior::Skip);

        tracing::info!(
            interval_ms = config.interval.as_millis() as u64,
            "Restraint monitor started"
        );

        loop {
            tokio::select! {
                _ = interval.tick() => {
                    if let Err(e) = Self::sweep(&accounting).await {
                        tracing::error!(error = %e, "Blocked constraint sweep failed");
                    }
                }
                _ = shutdown_rx.recv() => {
                    tracing::info!("Restraint monitor shutting down");
                    break;
                }
            }
        }
    }

    /// One pass over all constraints with BLOCKED consumers.
    ///
    /// Returns the number of consumers promoted or rejected.
    pub async fn sweep(accounting: &RestraintAccountingService) -> Result<usize, RestraintError> {
        let constraints = accounting.constraints_with_blocked().await?;
        if constraints.is_empty() {
            return Ok(0);
        }

        let changed = accounting.update_blocked_constraints(&constraints).await?;
        if changed > 0 {
            tracing::info!(
                constraints = constraints.len(),
                changed,
                "Monitor promoted stranded consumers"
            );
        }
        Ok(changed)
    }

    pub async fn shutdown(&self) {
        if let Err(e) = self.shutdown_tx.send(()).await {
            tracing::warn!(error = %e, "Failed to send shutdown signal to restraint monitor");
        }
    }
}
