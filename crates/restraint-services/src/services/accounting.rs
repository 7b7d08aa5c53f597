//! Restraint accounting service
//!
//! All stateful bookkeeping around the admission decision: usage,
//! idempotent re-acquisition, FIFO ordering, release and promotion. Every
//! mutation is a read-modify-write of one unit ledger through
//! [`ConsumerRegistry::compare_and_swap`], retried with backoff on conflict.

use std::sync::Arc;
use std::time::Duration;

use rand::Rng;
use uuid::Uuid;
use validator::Validate;

use restraint_core::constraint::{apply_promotions, plan_promotions, PromotionPlan};
use restraint_core::models::{
    AcquireMode, Consumer, ConsumerContext, ConsumerState, ReleaseEntity, ReleaseEntityType,
    ResourceRestraint, RestraintStepParameters,
};
use restraint_core::{NotifyChannel, NotifyEvent, RestraintConfig, RestraintError};
use restraint_db::{CasOutcome, ConstraintRepository, ConsumerRegistry, UnitSnapshot};

/// Retry settings for optimistic ledger writes.
#[derive(Clone, Debug)]
pub struct AccountingConfig {
    pub max_register_attempts: u32,
    pub initial_backoff: Duration,
    pub max_backoff: Duration,
}

impl Default for AccountingConfig {
    fn default() -> Self {
        Self {
            max_register_attempts: 5,
            initial_backoff: Duration::from_millis(20),
            max_backoff: Duration::from_millis(1000),
        }
    }
}

impl From<&RestraintConfig> for AccountingConfig {
    fn from(config: &RestraintConfig) -> Self {
        Self {
            max_register_attempts: config.register_max_attempts.max(1),
            initial_backoff: Duration::from_millis(config.register_backoff_ms),
            max_backoff: Duration::from_millis(config.register_max_backoff_ms),
        }
    }
}

/// Exponential backoff before retry `attempt` (1-based), capped at `max`.
pub fn compute_register_backoff(attempt: u32, initial: Duration, max: Duration) -> Duration {
    let exponent = attempt.saturating_sub(1).min(16);
    initial.saturating_mul(2_u32.pow(exponent)).min(max)
}

/// Permits a step still has to request after netting out what it holds.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct PermitRequest {
    pub to_request: i32,
    pub already_held: i64,
}

impl PermitRequest {
    pub fn is_satisfied(&self) -> bool {
        self.to_request <= 0
    }
}

/// Outcome of one unit rewrite.
enum UnitChange<T> {
    Unchanged(T),
    Replace { records: Vec<Consumer>, result: T },
}

#[derive(Clone)]
pub struct RestraintAccountingService {
    constraints: Arc<dyn ConstraintRepository>,
    registry: Arc<dyn ConsumerRegistry>,
    notifier: Arc<dyn NotifyChannel>,
    config: AccountingConfig,
}

impl RestraintAccountingService {
    pub fn new(
        constraints: Arc<dyn ConstraintRepository>,
        registry: Arc<dyn ConsumerRegistry>,
        notifier: Arc<dyn NotifyChannel>,
        config: AccountingConfig,
    ) -> Self {
        Self {
            constraints,
            registry,
            notifier,
            config,
        }
    }

    pub fn config(&self) -> &AccountingConfig {
        &self.config
    }

    pub fn notifier(&self) -> &Arc<dyn NotifyChannel> {
        &self.notifier
    }

    #[tracing::instrument(skip(self), fields(restraint_id = %restraint.id))]
    pub async fn create_constraint(
        &self,
        restraint: ResourceRestraint,
    ) -> Result<ResourceRestraint, RestraintError> {
        restraint.validate()?;
        self.constraints
            .create(restraint)
            .await
            .map_err(RestraintError::registry)
    }

    pub async fn get_constraint(
        &self,
        constraint_id: &str,
    ) -> Result<ResourceRestraint, RestraintError> {
        self.constraints
            .get(constraint_id)
            .await
            .map_err(RestraintError::registry)?
            .ok_or_else(|| RestraintError::ConstraintNotFound(constraint_id.to_string()))
    }

    pub async fn find_consumer(&self, consumer_id: Uuid) -> Result<Option<Consumer>, RestraintError> {
        self.registry
            .find_consumer(consumer_id)
            .await
            .map_err(RestraintError::registry)
    }

    /// Read-only snapshot of one unit ledger.
    pub async fn unit_snapshot(
        &self,
        constraint_id: &str,
        resource_unit: &str,
    ) -> Result<UnitSnapshot, RestraintError> {
        self.registry
            .load(constraint_id, resource_unit)
            .await
            .map_err(RestraintError::registry)
    }

    /// Permits held (ACTIVE or BLOCKED) by a release entity across all constraints.
    #[tracing::instrument(skip(self))]
    pub async fn currently_held_permits(
        &self,
        entity_type: ReleaseEntityType,
        entity_id: &str,
    ) -> Result<i64, RestraintError> {
        let consumers = self
            .registry
            .find_by_release_entity(entity_type, entity_id)
            .await
            .map_err(RestraintError::registry)?;

        Ok(consumers
            .iter()
            .filter(|c| c.is_held())
            .map(|c| i64::from(c.permits))
            .sum())
    }

    /// Permits a release entity holds on one (constraint, unit) ledger.
    #[tracing::instrument(skip(self))]
    pub async fn held_permits_for_unit(
        &self,
        constraint_id: &str,
        resource_unit: &str,
        release_entity: &ReleaseEntity,
    ) -> Result<i64, RestraintError> {
        let consumers = self
            .registry
            .find_by_release_entity(release_entity.entity_type, &release_entity.id)
            .await
            .map_err(RestraintError::registry)?;

        Ok(consumers
            .iter()
            .filter(|c| {
                c.is_held() && c.constraint_id == constraint_id && c.resource_unit == resource_unit
            })
            .map(|c| i64::from(c.permits))
            .sum())
    }

    /// Permits to request for a step, with ENSURE netting applied.
    pub async fn effective_permits(
        &self,
        parameters: &RestraintStepParameters,
    ) -> Result<PermitRequest, RestraintError> {
        let already_held = self
            .held_permits_for_unit(
                &parameters.resource_restraint_id,
                &parameters.resource_unit,
                &parameters.release_entity(),
            )
            .await?;

        let to_request = match parameters.acquire_mode {
            AcquireMode::Accumulate => parameters.permits,
            AcquireMode::Ensure => {
                let missing = (i64::from(parameters.permits) - already_held).max(0);
                i32::try_from(missing).unwrap_or(i32::MAX)
            }
        };

        Ok(PermitRequest {
            to_request,
            already_held,
        })
    }

    pub async fn next_order(&self, constraint_id: &str) -> Result<i64, RestraintError> {
        self.registry
            .next_order(constraint_id)
            .await
            .map_err(RestraintError::registry)
    }

    /// Decide and persist a new consumer in one conflict-checked write.
    ///
    /// Re-registering an id that is already in the ledger returns its stored
    /// state without writing.
    #[tracing::instrument(skip(self, release_entity), fields(release_entity = %release_entity))]
    pub async fn register_consumer(
        &self,
        constraint_id: &str,
        resource_unit: &str,
        consumer_id: Uuid,
        permits: i32,
        release_entity: &ReleaseEntity,
    ) -> Result<ConsumerState, RestraintError> {
        if permits < 1 {
            return Err(RestraintError::InvalidInput(format!(
                "permits must be at least 1, got {}",
                permits
            )));
        }

        let restraint = self.get_constraint(constraint_id).await?;
        let mut order: Option<i64> = None;
        let max_attempts = self.config.max_register_attempts.max(1);

        for attempt in 1..=max_attempts {
            let snapshot = self.unit_snapshot(constraint_id, resource_unit).await?;

            if let Some(existing) = snapshot.get(consumer_id) {
                tracing::debug!(
                    consumer_id = %consumer_id,
                    state = %existing.state,
                    "Consumer already registered"
                );
                return Ok(existing.state);
            }

            let state = restraint.decide_state(resource_unit, permits, &snapshot.consumers)?;

            let consumer_order = match (state, order) {
                (ConsumerState::Blocked, Some(assigned)) => assigned,
                (ConsumerState::Blocked, None) => {
                    let assigned = self.next_order(constraint_id).await?;
                    order = Some(assigned);
                    assigned
                }
                _ => 0,
            };

            let mut records = snapshot.consumers.clone();
            records.push(Consumer::new(
                consumer_id,
                constraint_id,
                resource_unit,
                permits,
                state,
                ConsumerContext::new(release_entity, consumer_order),
            ));

            match self
                .registry
                .compare_and_swap(constraint_id, resource_unit, snapshot.version, records)
                .await
                .map_err(RestraintError::registry)?
            {
                CasOutcome::Committed { version } => {
                    tracing::info!(
                        constraint_id = %constraint_id,
                        resource_unit = %resource_unit,
                        consumer_id = %consumer_id,
                        permits,
                        state = %state,
                        order = consumer_order,
                        version,
                        "Consumer registered"
                    );
                    return Ok(state);
                }
                CasOutcome::Conflict { current_version } => {
                    tracing::warn!(
                        constraint_id = %constraint_id,
                        resource_unit = %resource_unit,
                        consumer_id = %consumer_id,
                        attempt,
                        expected_version = snapshot.version,
                        current_version,
                        "Concurrent ledger write, retrying registration"
                    );
                    if attempt < max_attempts {
                        self.backoff(attempt).await;
                    }
                }
            }
        }

        tracing::error!(
            constraint_id = %constraint_id,
            resource_unit = %resource_unit,
            consumer_id = %consumer_id,
            attempts = max_attempts,
            "Giving up on consumer registration"
        );

        Err(RestraintError::UnableToRegisterConsumer {
            constraint_id: constraint_id.to_string(),
            resource_unit: resource_unit.to_string(),
            attempts: max_attempts,
        })
    }

    /// Remove a consumer and promote whoever can move up. Unknown ids are a no-op.
    #[tracing::instrument(skip(self))]
    pub async fn finish_instance(
        &self,
        consumer_id: Uuid,
        resource_unit: &str,
    ) -> Result<(), RestraintError> {
        let Some(consumer) = self.find_consumer(consumer_id).await? else {
            tracing::debug!(consumer_id = %consumer_id, "Consumer already finished");
            return Ok(());
        };

        if consumer.resource_unit != resource_unit {
            tracing::warn!(
                consumer_id = %consumer_id,
                requested_unit = %resource_unit,
                stored_unit = %consumer.resource_unit,
                "Finish requested on a different unit than the consumer was registered on"
            );
        }

        let restraint = self.get_constraint(&consumer.constraint_id).await?;
        let capacity = restraint.capacity;

        let (removed, plan) = self
            .rewrite_unit(&consumer.constraint_id, &consumer.resource_unit, |snapshot| {
                if !snapshot.contains(consumer_id) {
                    return UnitChange::Unchanged((false, PromotionPlan::default()));
                }
                let remaining: Vec<Consumer> = snapshot
                    .consumers
                    .iter()
                    .filter(|c| c.id != consumer_id)
                    .cloned()
                    .collect();
                let plan = plan_promotions(capacity, &remaining);
                UnitChange::Replace {
                    records: apply_promotions(remaining, &plan),
                    result: (true, plan),
                }
            })
            .await?;

        if removed {
            tracing::info!(
                constraint_id = %consumer.constraint_id,
                resource_unit = %consumer.resource_unit,
                consumer_id = %consumer_id,
                permits = consumer.permits,
                promoted = plan.promoted.len(),
                rejected = plan.rejected.len(),
                "Consumer finished"
            );
        } else {
            tracing::debug!(consumer_id = %consumer_id, "Consumer removed concurrently");
        }

        self.notify_promotions(&plan).await;
        Ok(())
    }

    /// Promote BLOCKED consumers of one unit in ascending order while capacity allows.
    #[tracing::instrument(skip(self))]
    pub async fn promote_blocked(
        &self,
        constraint_id: &str,
        resource_unit: &str,
    ) -> Result<PromotionPlan, RestraintError> {
        let restraint = self.get_constraint(constraint_id).await?;
        let capacity = restraint.capacity;

        let plan = self
            .rewrite_unit(constraint_id, resource_unit, |snapshot| {
                let plan = plan_promotions(capacity, &snapshot.consumers);
                if plan.is_empty() {
                    return UnitChange::Unchanged(plan);
                }
                UnitChange::Replace {
                    records: apply_promotions(snapshot.consumers.clone(), &plan),
                    result: plan,
                }
            })
            .await?;

        if !plan.is_empty() {
            tracing::info!(
                constraint_id = %constraint_id,
                resource_unit = %resource_unit,
                promoted = plan.promoted.len(),
                rejected = plan.rejected.len(),
                "Blocked consumers re-evaluated"
            );
        }

        self.notify_promotions(&plan).await;
        Ok(plan)
    }

    /// Run promotion on every unit of the given constraints that has BLOCKED consumers.
    ///
    /// Returns the number of consumers promoted or rejected.
    #[tracing::instrument(skip(self))]
    pub async fn update_blocked_constraints(
        &self,
        constraint_ids: &[String],
    ) -> Result<usize, RestraintError> {
        let mut changed = 0;
        for constraint_id in constraint_ids {
            let units = self
                .registry
                .blocked_units(constraint_id)
                .await
                .map_err(RestraintError::registry)?;
            for unit in units {
                let plan = self.promote_blocked(constraint_id, &unit).await?;
                changed += plan.promoted.len() + plan.rejected.len();
            }
        }
        Ok(changed)
    }

    /// Constraints that currently have BLOCKED consumers on any unit.
    pub async fn constraints_with_blocked(&self) -> Result<Vec<String>, RestraintError> {
        self.registry
            .constraints_with_blocked()
            .await
            .map_err(RestraintError::registry)
    }

    /// Finish every consumer held by a release entity. Returns how many were finished.
    ///
    /// A failing consumer does not stop the others; failures are reported
    /// together once every consumer has been tried.
    #[tracing::instrument(skip(self), fields(release_entity = %release_entity))]
    pub async fn finish_release_entity(
        &self,
        release_entity: &ReleaseEntity,
    ) -> Result<usize, RestraintError> {
        let consumers = self
            .registry
            .find_by_release_entity(release_entity.entity_type, &release_entity.id)
            .await
            .map_err(RestraintError::registry)?;

        let mut failures = Vec::new();
        for consumer in &consumers {
            if let Err(e) = self
                .finish_instance(consumer.id, &consumer.resource_unit)
                .await
            {
                tracing::error!(
                    error = %e,
                    consumer_id = %consumer.id,
                    resource_unit = %consumer.resource_unit,
                    "Failed to finish consumer of release entity"
                );
                failures.push(format!("{}: {}", consumer.id, e));
            }
        }

        let finished = consumers.len() - failures.len();
        if finished > 0 {
            tracing::info!(finished, "Release entity permits released");
        }

        if failures.is_empty() {
            Ok(finished)
        } else {
            Err(RestraintError::registry(anyhow::anyhow!(
                "Failed to finish {} of {} consumers held by {}: {}",
                failures.len(),
                consumers.len(),
                release_entity,
                failures.join("; ")
            )))
        }
    }

    /// Optimistic read-modify-write of one unit ledger.
    async fn rewrite_unit<T, F>(
        &self,
        constraint_id: &str,
        resource_unit: &str,
        mut change: F,
    ) -> Result<T, RestraintError>
    where
        F: FnMut(&UnitSnapshot) -> UnitChange<T>,
    {
        let max_attempts = self.config.max_register_attempts.max(1);

        for attempt in 1..=max_attempts {
            let snapshot = self.unit_snapshot(constraint_id, resource_unit).await?;
            let (records, result) = match change(&snapshot) {
                UnitChange::Unchanged(result) => return Ok(result),
                UnitChange::Replace { records, result } => (records, result),
            };

            match self
                .registry
                .compare_and_swap(constraint_id, resource_unit, snapshot.version, records)
                .await
                .map_err(RestraintError::registry)?
            {
                CasOutcome::Committed { .. } => return Ok(result),
                CasOutcome::Conflict { current_version } => {
                    tracing::warn!(
                        constraint_id = %constraint_id,
                        resource_unit = %resource_unit,
                        attempt,
                        expected_version = snapshot.version,
                        current_version,
                        "Concurrent ledger write, retrying"
                    );
                    if attempt < max_attempts {
                        self.backoff(attempt).await;
                    }
                }
            }
        }

        Err(RestraintError::registry(anyhow::anyhow!(
            "Ledger {}/{} still contended after {} attempts",
            constraint_id,
            resource_unit,
            max_attempts
        )))
    }

    async fn notify_promotions(&self, plan: &PromotionPlan) {
        for consumer_id in plan.notified() {
            self.publish_permit_ready(*consumer_id).await;
        }
    }

    /// Publish with backoff. A wake-up that is still lost afterwards is only
    /// recovered by the waiting step re-reading its consumer.
    async fn publish_permit_ready(&self, consumer_id: Uuid) {
        let max_attempts = self.config.max_register_attempts.max(1);

        for attempt in 1..=max_attempts {
            match self
                .notifier
                .publish(NotifyEvent::PermitReady(consumer_id))
                .await
            {
                Ok(()) => return,
                Err(e) if attempt < max_attempts => {
                    tracing::warn!(
                        error = %e,
                        consumer_id = %consumer_id,
                        attempt,
                        "Failed to publish permit-ready event, retrying"
                    );
                    self.backoff(attempt).await;
                }
                Err(e) => {
                    tracing::error!(
                        error = %e,
                        consumer_id = %consumer_id,
                        attempts = max_attempts,
                        "Giving up on permit-ready event"
                    );
                }
            }
        }
    }

    async fn backoff(&self, attempt: u32) {
        let base = compute_register_backoff(
            attempt,
            self.config.initial_backoff,
            self.config.max_backoff,
        );
        let jitter_ms = (base.as_millis() / 2) as u64;
        let jitter = if jitter_ms > 0 {
            Duration::from_millis(rand::rng().random_range(0..=jitter_ms))
        } else {
            Duration::ZERO
        };
        tokio::time::sleep(base + jitter).await;
    }
}
