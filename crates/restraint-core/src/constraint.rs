//! Admission decisions for a single (constraint, unit) ledger.
//!
//! Pure functions over a snapshot of consumers; callers own persistence.
//! The same decision runs as a dry run (facilitation) and again at
//! registration on a freshly loaded snapshot, where the result is authoritative.
//!
//! Known limitation: [`decide_state`] compares usage with capacity and does
//! not look at the queue. A new request that fits is admitted even while
//! older BLOCKED consumers wait, so a steady stream of small requests can
//! starve a large request at the head of the queue. FIFO ordering only holds
//! among consumers that are already BLOCKED ([`plan_promotions`]).

use uuid::Uuid;

use crate::error::RestraintError;
use crate::models::{Consumer, ConsumerState, ResourceRestraint};

/// The request can never fit, even into an empty ledger.
#[derive(Debug, Clone, Copy, PartialEq, Eq, thiserror::Error)]
#[error("requested {requested} permits exceeds capacity {capacity}")]
pub struct InvalidPermits {
    pub requested: i32,
    pub capacity: i32,
}

/// Sum of permits held by ACTIVE consumers.
pub fn used_permits(consumers: &[Consumer]) -> i64 {
    consumers
        .iter()
        .filter(|c| c.is_active())
        .map(|c| i64::from(c.permits))
        .sum()
}

/// Decide whether a request for `requested` permits is admitted now or queued.
pub fn decide_state(
    requested: i32,
    capacity: i32,
    existing: &[Consumer],
) -> Result<ConsumerState, InvalidPermits> {
    if requested > capacity {
        return Err(InvalidPermits {
            requested,
            capacity,
        });
    }

    if used_permits(existing) + i64::from(requested) <= i64::from(capacity) {
        Ok(ConsumerState::Active)
    } else {
        Ok(ConsumerState::Blocked)
    }
}

/// Consumers to change state in one promotion pass.
#[derive(Debug, Clone, Default, PartialEq, Eq)]
pub struct PromotionPlan {
    /// BLOCKED consumers that now fit, in queue order.
    pub promoted: Vec<Uuid>,
    /// BLOCKED consumers that ask for more than the whole capacity.
    pub rejected: Vec<Uuid>,
}

impl PromotionPlan {
    pub fn is_empty(&self) -> bool {
        self.promoted.is_empty() && self.rejected.is_empty()
    }

    /// Every consumer whose waiting step must be woken.
    pub fn notified(&self) -> impl Iterator<Item = &Uuid> {
        self.promoted.iter().chain(self.rejected.iter())
    }
}

/// Walk BLOCKED consumers in ascending order and promote while capacity allows.
///
/// Stops at the first consumer that does not fit; later, smaller requests are
/// never admitted ahead of it. A consumer that exceeds the whole capacity can
/// never fit and is rejected instead of stalling the queue.
pub fn plan_promotions(capacity: i32, consumers: &[Consumer]) -> PromotionPlan {
    let mut blocked: Vec<&Consumer> = consumers.iter().filter(|c| c.is_blocked()).collect();
    blocked.sort_by(|a, b| {
        a.order()
            .cmp(&b.order())
            .then_with(|| a.created_at.cmp(&b.created_at))
    });

    let capacity = i64::from(capacity);
    let mut used = used_permits(consumers);
    let mut plan = PromotionPlan::default();

    for consumer in blocked {
        let permits = i64::from(consumer.permits);
        if permits > capacity {
            plan.rejected.push(consumer.id);
            continue;
        }
        if used + permits > capacity {
            break;
        }
        used += permits;
        plan.promoted.push(consumer.id);
    }

    plan
}

/// Apply a promotion plan to a snapshot, returning the new record set.
pub fn apply_promotions(consumers: Vec<Consumer>, plan: &PromotionPlan) -> Vec<Consumer> {
    consumers
        .into_iter()
        .map(|c| {
            if plan.promoted.contains(&c.id) {
                c.with_state(ConsumerState::Active)
            } else if plan.rejected.contains(&c.id) {
                c.with_state(ConsumerState::Rejected)
            } else {
                c
            }
        })
        .collect()
}

impl ResourceRestraint {
    /// [`decide_state`] against this restraint's capacity, with unit context on failure.
    pub fn decide_state(
        &self,
        resource_unit: &str,
        requested: i32,
        existing: &[Consumer],
    ) -> Result<ConsumerState, RestraintError> {
        decide_state(requested, self.capacity, existing).map_err(|e| {
            RestraintError::InvalidPermits {
                constraint_id: self.id.clone(),
                resource_unit: resource_unit.to_string(),
                requested: e.requested,
                capacity: e.capacity,
            }
        })
    }
}
