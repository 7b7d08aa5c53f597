//! Restraint step executor
//!
//! Drives one restraint step through
//! `INITIATED -> REGISTERING -> {COMPLETED_SYNC | WAITING}` and
//! `WAITING -> {COMPLETED_ASYNC | ABORTED}`. A consumer that was registered
//! must be finished on abort, otherwise its permits or queue slot leak.

use std::sync::Arc;

use uuid::Uuid;
use validator::Validate;

use restraint_core::models::{
    ConsumerState, ResourceRestraint, RestraintOutcome, RestraintStepParameters, StepState,
    StepStateMachine,
};
use restraint_core::{NotifyEvent, RestraintError, StepError};

use super::accounting::RestraintAccountingService;

/// What the orchestrator gets back from the executor.
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum StepResponse {
    Completed(RestraintOutcome),
    /// Execution suspends until a response arrives for `callback_id`.
    Suspended { callback_id: Uuid },
}

/// Per-step state carried between `start`, resume and abort.
#[derive(Debug, Clone)]
pub struct StepExecution {
    consumer_id: Uuid,
    parameters: RestraintStepParameters,
    machine: StepStateMachine,
    permits_requested: i32,
    already_held: i64,
    outcome: Option<RestraintOutcome>,
}

impl StepExecution {
    pub fn new(parameters: RestraintStepParameters) -> Self {
        Self::with_consumer_id(Uuid::new_v4(), parameters)
    }

    /// Fixed consumer id, e.g. one derived from the orchestrator's step instance.
    pub fn with_consumer_id(consumer_id: Uuid, parameters: RestraintStepParameters) -> Self {
        Self {
            consumer_id,
            permits_requested: parameters.permits,
            parameters,
            machine: StepStateMachine::new(),
            already_held: 0,
            outcome: None,
        }
    }

    /// Rebuild a suspended step from its callback id, e.g. after a host restart.
    pub fn suspended(
        callback_id: Uuid,
        parameters: RestraintStepParameters,
    ) -> Result<Self, RestraintError> {
        let mut execution = Self::with_consumer_id(callback_id, parameters);
        execution.machine.transition(StepState::Registering)?;
        execution.machine.transition(StepState::Waiting)?;
        Ok(execution)
    }

    pub fn consumer_id(&self) -> Uuid {
        self.consumer_id
    }

    pub fn parameters(&self) -> &RestraintStepParameters {
        &self.parameters
    }

    pub fn state(&self) -> StepState {
        self.machine.current()
    }

    pub fn machine(&self) -> &StepStateMachine {
        &self.machine
    }

    pub fn outcome(&self) -> Option<&RestraintOutcome> {
        self.outcome.as_ref()
    }
}

#[derive(Clone)]
pub struct RestraintStepExecutor {
    accounting: Arc<RestraintAccountingService>,
}

impl RestraintStepExecutor {
    pub fn new(accounting: Arc<RestraintAccountingService>) -> Self {
        Self { accounting }
    }

    pub fn accounting(&self) -> &Arc<RestraintAccountingService> {
        &self.accounting
    }

    #[tracing::instrument(
        skip(self, execution),
        fields(
            consumer_id = %execution.consumer_id,
            constraint_id = %execution.parameters.resource_restraint_id,
            resource_unit = %execution.parameters.resource_unit
        )
    )]
    pub async fn start(&self, execution: &mut StepExecution) -> Result<StepResponse, StepError> {
        execution.parameters.validate().map_err(RestraintError::from)?;

        let request = self.accounting.effective_permits(&execution.parameters).await?;
        execution.already_held = request.already_held;

        let restraint = self
            .accounting
            .get_constraint(&execution.parameters.resource_restraint_id)
            .await?;

        if request.is_satisfied() {
            execution.permits_requested = 0;
            execution.machine.transition(StepState::CompletedSync)?;
            let outcome = Self::outcome(&restraint, execution);
            tracing::info!(
                already_held = request.already_held,
                "Permits already held, nothing to acquire"
            );
            execution.outcome = Some(outcome.clone());
            return Ok(StepResponse::Completed(outcome));
        }

        execution.permits_requested = request.to_request;
        execution.machine.transition(StepState::Registering)?;

        let state = self
            .accounting
            .register_consumer(
                &restraint.id,
                &execution.parameters.resource_unit,
                execution.consumer_id,
                request.to_request,
                &execution.parameters.release_entity(),
            )
            .await
            .map_err(|e| {
                tracing::error!(error = %e, "Consumer registration failed");
                StepError::from(e)
            })?;

        match state {
            ConsumerState::Active => {
                execution.machine.transition(StepState::CompletedSync)?;
                let outcome = Self::outcome(&restraint, execution);
                execution.outcome = Some(outcome.clone());
                Ok(StepResponse::Completed(outcome))
            }
            ConsumerState::Blocked => {
                execution.machine.transition(StepState::Waiting)?;
                if let Err(e) = self
                    .accounting
                    .notifier()
                    .publish(NotifyEvent::AwaitToken(execution.consumer_id))
                    .await
                {
                    // Nobody would ever wake this step; release and let the orchestrator retry.
                    tracing::error!(error = %e, "Failed to register await token");
                    self.handle_abort(execution).await?;
                    return Err(StepError::recoverable(e));
                }
                tracing::info!("Step waiting for permits");
                Ok(StepResponse::Suspended {
                    callback_id: execution.consumer_id,
                })
            }
            ConsumerState::Rejected => Err(self.reject(&restraint, execution).await),
        }
    }

    /// Resume a WAITING step after its notification was delivered.
    ///
    /// A consumer that is still BLOCKED suspends again on the same token.
    #[tracing::instrument(
        skip(self, execution),
        fields(
            consumer_id = %execution.consumer_id,
            constraint_id = %execution.parameters.resource_restraint_id
        )
    )]
    pub async fn handle_async_response(
        &self,
        execution: &mut StepExecution,
    ) -> Result<StepResponse, StepError> {
        if execution.state() != StepState::Waiting {
            return Err(RestraintError::InvalidStateTransition {
                from: execution.state(),
                to: StepState::CompletedAsync,
            }
            .into());
        }

        let constraint_id = execution.parameters.resource_restraint_id.clone();
        self.accounting
            .update_blocked_constraints(std::slice::from_ref(&constraint_id))
            .await?;

        let restraint = self.accounting.get_constraint(&constraint_id).await?;
        let consumer = self
            .accounting
            .find_consumer(execution.consumer_id)
            .await?
            .ok_or(RestraintError::ConsumerNotFound(execution.consumer_id))
            .map_err(StepError::unrecoverable)?;

        match consumer.state {
            ConsumerState::Active => {
                execution.permits_requested = consumer.permits;
                execution.machine.transition(StepState::CompletedAsync)?;
                let outcome = Self::outcome(&restraint, execution);
                tracing::info!("Step resumed with permits");
                execution.outcome = Some(outcome.clone());
                Ok(StepResponse::Completed(outcome))
            }
            ConsumerState::Blocked => {
                tracing::debug!("Consumer still blocked, suspending again");
                self.accounting
                    .notifier()
                    .publish(NotifyEvent::AwaitToken(execution.consumer_id))
                    .await
                    .map_err(StepError::recoverable)?;
                Ok(StepResponse::Suspended {
                    callback_id: execution.consumer_id,
                })
            }
            ConsumerState::Rejected => Err(self.reject(&restraint, execution).await),
        }
    }

    /// Release whatever the step registered. Safe to call repeatedly and in any state.
    #[tracing::instrument(skip(self, execution), fields(consumer_id = %execution.consumer_id))]
    pub async fn handle_abort(&self, execution: &mut StepExecution) -> Result<(), StepError> {
        if execution.state() != StepState::Initiated {
            self.accounting
                .finish_instance(execution.consumer_id, &execution.parameters.resource_unit)
                .await?;
        }

        if execution.state().can_transition_to(StepState::Aborted) {
            execution.machine.transition(StepState::Aborted)?;
            tracing::info!("Step aborted");
        } else {
            tracing::debug!(state = %execution.state(), "Abort without state change");
        }
        Ok(())
    }

    async fn reject(
        &self,
        restraint: &ResourceRestraint,
        execution: &mut StepExecution,
    ) -> StepError {
        let error = RestraintError::PermanentlyBlocked {
            consumer_id: execution.consumer_id,
            constraint_id: restraint.id.clone(),
            resource_unit: execution.parameters.resource_unit.clone(),
            permits: execution.permits_requested,
            capacity: restraint.capacity,
        };
        tracing::warn!(error = %error, "Consumer can never be admitted");

        if let Err(e) = self.handle_abort(execution).await {
            tracing::error!(error = %e, "Failed to release rejected consumer");
        }
        StepError::from(error)
    }

    fn outcome(restraint: &ResourceRestraint, execution: &StepExecution) -> RestraintOutcome {
        RestraintOutcome {
            resource_name: restraint.name.clone(),
            capacity: restraint.capacity,
            resource_unit: execution.parameters.resource_unit.clone(),
            permits_used: execution.permits_requested,
            already_held_permits: execution.already_held,
        }
    }
}
