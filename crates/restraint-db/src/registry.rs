//! Storage traits for restraints and their consumers
//!
//! The consumer registry is a versioned key-value store keyed by
//! (constraint id, resource unit). Writers load a snapshot, compute the new
//! record set and swap it in only if nobody committed in between.

use anyhow::Result;
use async_trait::async_trait;
use uuid::Uuid;

use restraint_core::models::{Consumer, ReleaseEntityType, ResourceRestraint};

/// All consumers of one (constraint, unit) ledger at a given version.
///
/// Version 0 means the ledger has never been written.
#[derive(Debug, Clone, Default, PartialEq, Eq)]
pub struct UnitSnapshot {
    pub version: i64,
    pub consumers: Vec<Consumer>,
}

impl UnitSnapshot {
    pub fn contains(&self, consumer_id: Uuid) -> bool {
        self.consumers.iter().any(|c| c.id == consumer_id)
    }

    pub fn get(&self, consumer_id: Uuid) -> Option<&Consumer> {
        self.consumers.iter().find(|c| c.id == consumer_id)
    }
}

/// Result of a conditional write.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum CasOutcome {
    Committed { version: i64 },
    /// Another writer got there first; reload and retry.
    Conflict { current_version: i64 },
}

impl CasOutcome {
    pub fn is_committed(&self) -> bool {
        matches!(self, CasOutcome::Committed { .. })
    }
}

#[async_trait]
pub trait ConsumerRegistry: Send + Sync {
    async fn load(&self, constraint_id: &str, resource_unit: &str) -> Result<UnitSnapshot>;

    /// Replace the unit's record set if its version still equals `expected_version`.
    async fn compare_and_swap(
        &self,
        constraint_id: &str,
        resource_unit: &str,
        expected_version: i64,
        records: Vec<Consumer>,
    ) -> Result<CasOutcome>;

    /// Next FIFO order for the constraint. Never hands out the same value twice.
    async fn next_order(&self, constraint_id: &str) -> Result<i64>;

    async fn find_consumer(&self, consumer_id: Uuid) -> Result<Option<Consumer>>;

    async fn find_by_release_entity(
        &self,
        entity_type: ReleaseEntityType,
        entity_id: &str,
    ) -> Result<Vec<Consumer>>;

    /// Units of the constraint that have at least one BLOCKED consumer.
    async fn blocked_units(&self, constraint_id: &str) -> Result<Vec<String>>;

    /// Constraints that have at least one BLOCKED consumer on any unit.
    async fn constraints_with_blocked(&self) -> Result<Vec<String>>;
}

#[async_trait]
pub trait ConstraintRepository: Send + Sync {
    async fn get(&self, constraint_id: &str) -> Result<Option<ResourceRestraint>>;

    async fn create(&self, restraint: ResourceRestraint) -> Result<ResourceRestraint>;
}
