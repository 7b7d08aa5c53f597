//! Orchestrator-side glue for restraint steps
//!
//! Runs facilitation, starts the step, waits on the hub while it is
//! suspended and releases anything registered when the step times out or
//! fails. Releasing is retried; a consumer that still cannot be finished is
//! reported in the returned error. A suspended step re-reads its consumer
//! every `recheck_interval`, so a lost wake-up only delays it. Recoverable
//! failures are retried with capped exponential backoff.

use std::sync::Arc;
use std::time::Duration;

use tokio::time::Instant;
use uuid::Uuid;

use restraint_core::models::{
    FacilitationMode, RestraintOutcome, RestraintStepParameters, StepState,
};
use restraint_core::{RestraintConfig, StepError};
use restraint_services::{
    compute_register_backoff, AdmissionFacilitator, RestraintStepExecutor, StepExecution,
    StepResponse,
};

use crate::hub::WaitNotifyHub;

#[derive(Clone, Debug)]
pub struct StepDriverConfig {
    /// Used when the step carries no timeout of its own.
    pub default_timeout: Duration,
    pub max_retries: u32,
    pub initial_retry_backoff: Duration,
    pub max_retry_backoff: Duration,
    /// Attempts to finish the consumer on abort before giving up.
    pub max_release_attempts: u32,
    /// Re-read the consumer this often while suspended. Zero waits for the wake-up only.
    pub recheck_interval: Duration,
}

impl Default for StepDriverConfig {
    fn default() -> Self {
        Self {
            default_timeout: Duration::from_secs(600),
            max_retries: 3,
            initial_retry_backoff: Duration::from_secs(1),
            max_retry_backoff: Duration::from_secs(60),
            max_release_attempts: 5,
            recheck_interval: Duration::from_secs(30),
        }
    }
}

impl From<&RestraintConfig> for StepDriverConfig {
    fn from(config: &RestraintConfig) -> Self {
        Self {
            default_timeout: config.step_timeout(),
            max_retries: config.step_max_retries,
            recheck_interval: config.step_recheck_interval(),
            ..Default::default()
        }
    }
}

/// A finished restraint step.
#[derive(Debug, Clone)]
pub struct StepRun {
    pub facilitation: FacilitationMode,
    pub outcome: RestraintOutcome,
    pub final_state: StepState,
    /// Attempts including the successful one.
    pub attempts: u32,
    /// Consumer holding the permits, released with the owning release entity.
    pub consumer_id: Uuid,
}

#[derive(Debug, thiserror::Error)]
#[error("Restraint step on {constraint_id}/{resource_unit} timed out after {timeout:?}")]
pub struct StepTimedOut {
    pub constraint_id: String,
    pub resource_unit: String,
    pub timeout: Duration,
}

/// Context attached to a step error when the consumer could not be finished.
///
/// The consumer is still in the ledger and must be finished by whoever
/// handles this error, e.g. through the release entity.
#[derive(Debug, thiserror::Error)]
#[error("Consumer {consumer_id} could not be released after {attempts} attempts (step failed with: {step_error})")]
pub struct ReleaseFailed {
    pub consumer_id: Uuid,
    pub attempts: u32,
    pub step_error: String,
}

pub struct StepDriver {
    facilitator: AdmissionFacilitator,
    executor: RestraintStepExecutor,
    hub: Arc<WaitNotifyHub>,
    config: StepDriverConfig,
}

impl StepDriver {
    pub fn new(
        facilitator: AdmissionFacilitator,
        executor: RestraintStepExecutor,
        hub: Arc<WaitNotifyHub>,
        config: StepDriverConfig,
    ) -> Self {
        Self {
            facilitator,
            executor,
            hub,
            config,
        }
    }

    /// Run a restraint step to completion, retrying recoverable failures.
    #[tracing::instrument(
        skip(self, parameters),
        fields(
            constraint_id = %parameters.resource_restraint_id,
            resource_unit = %parameters.resource_unit
        )
    )]
    pub async fn run(&self, parameters: RestraintStepParameters) -> Result<StepRun, StepError> {
        let mut attempt: u32 = 0;

        loop {
            attempt += 1;
            let mut execution = StepExecution::new(parameters.clone());

            match self.run_once(&mut execution).await {
                Ok((facilitation, outcome)) => {
                    return Ok(StepRun {
                        facilitation,
                        outcome,
                        final_state: execution.state(),
                        attempts: attempt,
                        consumer_id: execution.consumer_id(),
                    });
                }
                Err(e) if e.is_recoverable() && attempt <= self.config.max_retries => {
                    let backoff = compute_register_backoff(
                        attempt,
                        self.config.initial_retry_backoff,
                        self.config.max_retry_backoff,
                    );
                    tracing::warn!(
                        error = %e,
                        attempt,
                        max_retries = self.config.max_retries,
                        backoff_ms = backoff.as_millis() as u64,
                        "Restraint step failed, retrying"
                    );
                    tokio::time::sleep(backoff).await;
                }
                Err(e) => {
                    tracing::error!(
                        error = %e,
                        attempt,
                        recoverable = e.is_recoverable(),
                        "Restraint step failed"
                    );
                    return Err(e);
                }
            }
        }
    }

    async fn run_once(
        &self,
        execution: &mut StepExecution,
    ) -> Result<(FacilitationMode, RestraintOutcome), StepError> {
        let facilitation = self.facilitator.facilitate(execution.parameters()).await?;
        let token = execution.consumer_id();
        let timeout = self.timeout_for(execution.parameters());
        let deadline = Instant::now() + timeout;

        // Subscribe first so a promotion racing the registration is not lost.
        let mut wait = self.hub.subscribe(token).await;

        let mut response = match self.executor.start(execution).await {
            Ok(response) => response,
            Err(e) => return Err(self.fail(execution, e).await),
        };

        loop {
            match response {
                StepResponse::Completed(outcome) => {
                    self.hub.cancel(token).await;
                    return Ok((facilitation, outcome));
                }
                StepResponse::Suspended { callback_id } => {
                    tracing::debug!(callback_id = %callback_id, "Step suspended");
                    let wake_by = self.next_check(deadline);
                    match tokio::time::timeout_at(wake_by, wait.wait()).await {
                        Ok(Ok(())) => {}
                        Ok(Err(e)) => {
                            return Err(self.fail(execution, StepError::recoverable(e)).await);
                        }
                        Err(_) if Instant::now() >= deadline => {
                            tracing::warn!(
                                timeout_secs = timeout.as_secs(),
                                "Step timed out while waiting"
                            );
                            let params = execution.parameters();
                            let timed_out = StepError::unrecoverable(StepTimedOut {
                                constraint_id: params.resource_restraint_id.clone(),
                                resource_unit: params.resource_unit.clone(),
                                timeout,
                            });
                            return Err(self.fail(execution, timed_out).await);
                        }
                        Err(_) => {
                            tracing::debug!("No wake-up yet, re-checking consumer");
                        }
                    }

                    wait = self.hub.subscribe(token).await;
                    response = match self.executor.handle_async_response(execution).await {
                        Ok(response) => response,
                        Err(e) => return Err(self.fail(execution, e).await),
                    };
                }
            }
        }
    }

    fn timeout_for(&self, parameters: &RestraintStepParameters) -> Duration {
        if parameters.timeout_secs == 0 {
            self.config.default_timeout
        } else {
            parameters.timeout()
        }
    }

    /// Earliest of the step deadline and the next consumer re-check.
    fn next_check(&self, deadline: Instant) -> Instant {
        if self.config.recheck_interval.is_zero() {
            return deadline;
        }
        (Instant::now() + self.config.recheck_interval).min(deadline)
    }

    /// Release the step, then return `error`, or an unrecoverable error
    /// naming the leaked consumer when releasing failed.
    async fn fail(&self, execution: &mut StepExecution, error: StepError) -> StepError {
        match self.release(execution).await {
            Ok(()) => error,
            Err(release_error) => {
                let attempts = self.config.max_release_attempts.max(1);
                let leaked = release_error.into_inner().context(ReleaseFailed {
                    consumer_id: execution.consumer_id(),
                    attempts,
                    step_error: error.to_string(),
                });
                StepError::unrecoverable(leaked)
            }
        }
    }

    /// Abort path: drop the hub slot and finish the consumer, retrying with backoff.
    async fn release(&self, execution: &mut StepExecution) -> Result<(), StepError> {
        self.hub.cancel(execution.consumer_id()).await;
        let max_attempts = self.config.max_release_attempts.max(1);

        let mut attempt: u32 = 0;
        loop {
            attempt += 1;
            match self.executor.handle_abort(execution).await {
                Ok(()) => return Ok(()),
                Err(e) if attempt < max_attempts => {
                    let backoff = compute_register_backoff(
                        attempt,
                        self.config.initial_retry_backoff,
                        self.config.max_retry_backoff,
                    );
                    tracing::warn!(
                        error = %e,
                        consumer_id = %execution.consumer_id(),
                        attempt,
                        backoff_ms = backoff.as_millis() as u64,
                        "Failed to release consumer on abort, retrying"
                    );
                    tokio::time::sleep(backoff).await;
                }
                Err(e) => {
                    tracing::error!(
                        error = %e,
                        consumer_id = %execution.consumer_id(),
                        attempts = max_attempts,
                        "Giving up on releasing consumer"
                    );
                    return Err(e);
                }
            }
        }
    }
}
