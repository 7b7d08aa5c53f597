//! In-process registry implementations
//!
//! Used by single-process deployments and by tests. The whole store sits
//! behind one tokio mutex, so every operation is atomic.

use std::collections::{BTreeSet, HashMap};

use anyhow::Result;
use async_trait::async_trait;
use tokio::sync::Mutex;
use uuid::Uuid;

use restraint_core::models::{Consumer, ReleaseEntityType, ResourceRestraint};

use crate::registry::{CasOutcome, ConstraintRepository, ConsumerRegistry, UnitSnapshot};

type UnitKey = (String, String);

#[derive(Default)]
struct RegistryState {
    /// Non-empty ledgers only.
    units: HashMap<UnitKey, Vec<Consumer>>,
    /// Outlives the ledger so a unit that empties and refills never reuses a version.
    versions: HashMap<UnitKey, i64>,
    order_counters: HashMap<String, i64>,
    injected_conflicts: u32,
}

#[derive(Default)]
pub struct InMemoryConsumerRegistry {
    state: Mutex<RegistryState>,
}

impl InMemoryConsumerRegistry {
    pub fn new() -> Self {
        Self::default()
    }

    /// Make the next `count` swaps fail as if a concurrent writer had won.
    pub async fn inject_conflicts(&self, count: u32) {
        self.state.lock().await.injected_conflicts = count;
    }

    /// Every stored consumer across all units.
    pub async fn all_consumers(&self) -> Vec<Consumer> {
        let state = self.state.lock().await;
        state
            .units
            .values()
            .flat_map(|consumers| consumers.iter().cloned())
            .collect()
    }

    /// Number of units currently holding at least one consumer.
    pub async fn unit_count(&self) -> usize {
        self.state.lock().await.units.len()
    }
}

#[async_trait]
impl ConsumerRegistry for InMemoryConsumerRegistry {
    async fn load(&self, constraint_id: &str, resource_unit: &str) -> Result<UnitSnapshot> {
        let state = self.state.lock().await;
        let key = (constraint_id.to_string(), resource_unit.to_string());
        Ok(UnitSnapshot {
            version: state.versions.get(&key).copied().unwrap_or(0),
            consumers: state.units.get(&key).cloned().unwrap_or_default(),
        })
    }

    async fn compare_and_swap(
        &self,
        constraint_id: &str,
        resource_unit: &str,
        expected_version: i64,
        records: Vec<Consumer>,
    ) -> Result<CasOutcome> {
        let mut state = self.state.lock().await;
        let key = (constraint_id.to_string(), resource_unit.to_string());
        let current_version = state.versions.get(&key).copied().unwrap_or(0);

        if state.injected_conflicts > 0 {
            state.injected_conflicts -= 1;
            return Ok(CasOutcome::Conflict { current_version });
        }

        if current_version != expected_version {
            return Ok(CasOutcome::Conflict { current_version });
        }

        let version = current_version + 1;
        state.versions.insert(key.clone(), version);
        if records.is_empty() {
            state.units.remove(&key);
        } else {
            state.units.insert(key, records);
        }
        Ok(CasOutcome::Committed { version })
    }

    async fn next_order(&self, constraint_id: &str) -> Result<i64> {
        let mut state = self.state.lock().await;
        let counter = state
            .order_counters
            .entry(constraint_id.to_string())
            .or_insert(0);
        *counter += 1;
        Ok(*counter)
    }

    async fn find_consumer(&self, consumer_id: Uuid) -> Result<Option<Consumer>> {
        let state = self.state.lock().await;
        Ok(state
            .units
            .values()
            .flatten()
            .find(|c| c.id == consumer_id)
            .cloned())
    }

    async fn find_by_release_entity(
        &self,
        entity_type: ReleaseEntityType,
        entity_id: &str,
    ) -> Result<Vec<Consumer>> {
        let state = self.state.lock().await;
        Ok(state
            .units
            .values()
            .flatten()
            .filter(|c| c.is_owned_by(entity_type, entity_id))
            .cloned()
            .collect())
    }

    async fn blocked_units(&self, constraint_id: &str) -> Result<Vec<String>> {
        let state = self.state.lock().await;
        let units: BTreeSet<String> = state
            .units
            .iter()
            .filter(|((cid, _), consumers)| {
                cid == constraint_id && consumers.iter().any(|c| c.is_blocked())
            })
            .map(|((_, unit), _)| unit.clone())
            .collect();
        Ok(units.into_iter().collect())
    }

    async fn constraints_with_blocked(&self) -> Result<Vec<String>> {
        let state = self.state.lock().await;
        let constraints: BTreeSet<String> = state
            .units
            .iter()
            .filter(|(_, consumers)| consumers.iter().any(|c| c.is_blocked()))
            .map(|((cid, _), _)| cid.clone())
            .collect();
        Ok(constraints.into_iter().collect())
    }
}

#[derive(Default)]
pub struct InMemoryConstraintRepository {
    restraints: Mutex<HashMap<String, ResourceRestraint>>,
}

impl InMemoryConstraintRepository {
    pub fn new() -> Self {
        Self::default()
    }
}

#[async_trait]
impl ConstraintRepository for InMemoryConstraintRepository {
    async fn get(&self, constraint_id: &str) -> Result<Option<ResourceRestraint>> {
        Ok(self.restraints.lock().await.get(constraint_id).cloned())
    }

    async fn create(&self, restraint: ResourceRestraint) -> Result<ResourceRestraint> {
        let mut restraints = self.restraints.lock().await;
        if restraints.contains_key(&restraint.id) {
            return Err(anyhow::anyhow!(
                "Resource restraint {} already exists",
                restraint.id
            ));
        }
        restraints.insert(restraint.id.clone(), restraint.clone());
        Ok(restraint)
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use restraint_core::models::{ConsumerContext, ConsumerState, ReleaseEntity};

    fn consumer(unit: &str, state: ConsumerState, entity: &ReleaseEntity) -> Consumer {
        Consumer::new(
            Uuid::new_v4(),
            "deployments",
            unit,
            1,
            state,
            ConsumerContext::new(entity, 0),
        )
    }

    #[tokio::test]
    async fn test_unwritten_unit_loads_at_version_zero() {
        let registry = InMemoryConsumerRegistry::new();
        let snapshot = registry.load("deployments", "cluster-a").await.unwrap();
        assert_eq!(snapshot, UnitSnapshot::default());
    }

    #[tokio::test]
    async fn test_swap_requires_current_version() {
        let registry = InMemoryConsumerRegistry::new();
        let entity = ReleaseEntity::plan("exec-1");
        let c = consumer("cluster-a", ConsumerState::Active, &entity);

        let first = registry
            .compare_and_swap("deployments", "cluster-a", 0, vec![c.clone()])
            .await
            .unwrap();
        assert_eq!(first, CasOutcome::Committed { version: 1 });

        let stale = registry
            .compare_and_swap("deployments", "cluster-a", 0, vec![])
            .await
            .unwrap();
        assert_eq!(stale, CasOutcome::Conflict { current_version: 1 });

        let snapshot = registry.load("deployments", "cluster-a").await.unwrap();
        assert!(snapshot.contains(c.id));
    }

    #[tokio::test]
    async fn test_emptied_unit_is_dropped_but_version_keeps_growing() {
        let registry = InMemoryConsumerRegistry::new();
        let entity = ReleaseEntity::plan("exec-1");
        let c = consumer("cluster-a", ConsumerState::Active, &entity);

        registry
            .compare_and_swap("deployments", "cluster-a", 0, vec![c.clone()])
            .await
            .unwrap();
        assert_eq!(registry.unit_count().await, 1);

        let emptied = registry
            .compare_and_swap("deployments", "cluster-a", 1, vec![])
            .await
            .unwrap();
        assert_eq!(emptied, CasOutcome::Committed { version: 2 });
        assert_eq!(registry.unit_count().await, 0);

        let snapshot = registry.load("deployments", "cluster-a").await.unwrap();
        assert_eq!(snapshot.version, 2);
        assert!(snapshot.consumers.is_empty());

        let stale = registry
            .compare_and_swap("deployments", "cluster-a", 0, vec![c.clone()])
            .await
            .unwrap();
        assert_eq!(stale, CasOutcome::Conflict { current_version: 2 });

        let refilled = registry
            .compare_and_swap("deployments", "cluster-a", 2, vec![c])
            .await
            .unwrap();
        assert_eq!(refilled, CasOutcome::Committed { version: 3 });
        assert_eq!(registry.unit_count().await, 1);
    }

    #[tokio::test]
    async fn test_injected_conflicts_are_consumed() {
        let registry = InMemoryConsumerRegistry::new();
        registry.inject_conflicts(2).await;
        for _ in 0..2 {
            let outcome = registry
                .compare_and_swap("deployments", "cluster-a", 0, vec![])
                .await
                .unwrap();
            assert!(!outcome.is_committed());
        }
        let outcome = registry
            .compare_and_swap("deployments", "cluster-a", 0, vec![])
            .await
            .unwrap();
        assert!(outcome.is_committed());
    }

    #[tokio::test]
    async fn test_next_order_is_per_constraint() {
        let registry = InMemoryConsumerRegistry::new();
        assert_eq!(registry.next_order("deployments").await.unwrap(), 1);
        assert_eq!(registry.next_order("deployments").await.unwrap(), 2);
        assert_eq!(registry.next_order("rate-limits").await.unwrap(), 1);
    }

    #[tokio::test]
    async fn test_queries_across_units() {
        let registry = InMemoryConsumerRegistry::new();
        let plan = ReleaseEntity::plan("exec-1");
        let other = ReleaseEntity::plan("exec-2");
        let active = consumer("cluster-a", ConsumerState::Active, &plan);
        let blocked = consumer("cluster-b", ConsumerState::Blocked, &plan);
        let foreign = consumer("cluster-b", ConsumerState::Active, &other);

        registry
            .compare_and_swap("deployments", "cluster-a", 0, vec![active.clone()])
            .await
            .unwrap();
        registry
            .compare_and_swap(
                "deployments",
                "cluster-b",
                0,
                vec![blocked.clone(), foreign],
            )
            .await
            .unwrap();

        let owned = registry
            .find_by_release_entity(ReleaseEntityType::Plan, "exec-1")
            .await
            .unwrap();
        assert_eq!(owned.len(), 2);

        assert_eq!(
            registry.find_consumer(blocked.id).await.unwrap(),
            Some(blocked)
        );
        assert_eq!(
            registry.blocked_units("deployments").await.unwrap(),
            vec!["cluster-b".to_string()]
        );
        assert_eq!(
            registry.constraints_with_blocked().await.unwrap(),
            vec!["deployments".to_string()]
        );
    }

    #[tokio::test]
    async fn test_constraint_repository_rejects_duplicates() {
        let repo = InMemoryConstraintRepository::new();
        repo.create(ResourceRestraint::new("deployments", "Max deployments", 2))
            .await
            .unwrap();
        assert!(repo
            .create(ResourceRestraint::new("deployments", "Again", 3))
            .await
            .is_err());
        let stored = repo.get("deployments").await.unwrap().unwrap();
        assert_eq!(stored.capacity, 2);
        assert!(repo.get("missing").await.unwrap().is_none());
    }
}
