use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};
use std::fmt::{Display, Formatter, Result as FmtResult};
use std::str::FromStr;
use uuid::Uuid;

/// Admission state of a consumer against its (constraint, unit) ledger.
#[derive(Debug, Clone, Copy, Serialize, Deserialize, PartialEq, Eq, Hash)]
#[serde(rename_all = "SCREAMING_SNAKE_CASE")]
pub enum ConsumerState {
    /// Holds its permits; counted against capacity.
    Active,
    /// Queued behind capacity; promoted in ascending `order`.
    Blocked,
    /// Can never be admitted (asks for more than the whole capacity).
    Rejected,
}

impl Display for ConsumerState {
    fn fmt(&self, f: &mut Formatter<'_>) -> FmtResult {
        match self {
            ConsumerState::Active => write!(f, "ACTIVE"),
            ConsumerState::Blocked => write!(f, "BLOCKED"),
            ConsumerState::Rejected => write!(f, "REJECTED"),
        }
    }
}

impl FromStr for ConsumerState {
    type Err = anyhow::Error;

    fn from_str(s: &str) -> Result<Self, Self::Err> {
        match s {
            "ACTIVE" => Ok(ConsumerState::Active),
            "BLOCKED" => Ok(ConsumerState::Blocked),
            "REJECTED" => Ok(ConsumerState::Rejected),
            _ => Err(anyhow::anyhow!("Invalid consumer state: {}", s)),
        }
    }
}

/// Kind of owner on whose behalf permits are held.
#[derive(Debug, Clone, Copy, Serialize, Deserialize, PartialEq, Eq, Hash)]
#[serde(rename_all = "SCREAMING_SNAKE_CASE")]
pub enum ReleaseEntityType {
    /// The whole pipeline execution.
    Plan,
    /// A single step node within a pipeline execution.
    Stage,
}

impl Display for ReleaseEntityType {
    fn fmt(&self, f: &mut Formatter<'_>) -> FmtResult {
        match self {
            ReleaseEntityType::Plan => write!(f, "PLAN"),
            ReleaseEntityType::Stage => write!(f, "STAGE"),
        }
    }
}

impl FromStr for ReleaseEntityType {
    type Err = anyhow::Error;

    fn from_str(s: &str) -> Result<Self, Self::Err> {
        match s {
            "PLAN" => Ok(ReleaseEntityType::Plan),
            "STAGE" => Ok(ReleaseEntityType::Stage),
            _ => Err(anyhow::anyhow!("Invalid release entity type: {}", s)),
        }
    }
}

/// Separator between plan execution id and node id in a STAGE release entity id.
pub const RELEASE_ENTITY_ID_SEPARATOR: char = '|';

/// Logical owner of held permits.
#[derive(Debug, Clone, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct ReleaseEntity {
    pub entity_type: ReleaseEntityType,
    pub id: String,
}

impl ReleaseEntity {
    /// Release entity for a whole pipeline execution.
    pub fn plan(plan_execution_id: impl Into<String>) -> Self {
        Self {
            entity_type: ReleaseEntityType::Plan,
            id: plan_execution_id.into(),
        }
    }

    /// Release entity for one node of a pipeline execution.
    pub fn stage(plan_execution_id: &str, node_id: &str) -> Self {
        Self {
            entity_type: ReleaseEntityType::Stage,
            id: format!(
                "{}{}{}",
                plan_execution_id, RELEASE_ENTITY_ID_SEPARATOR, node_id
            ),
        }
    }
}

impl Display for ReleaseEntity {
    fn fmt(&self, f: &mut Formatter<'_>) -> FmtResult {
        write!(f, "{}:{}", self.entity_type, self.id)
    }
}

/// Ownership and queue position of a consumer.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct ConsumerContext {
    pub release_entity_type: ReleaseEntityType,
    pub release_entity_id: String,
    /// FIFO position among BLOCKED consumers; 0 for consumers admitted on registration.
    pub order: i64,
}

impl ConsumerContext {
    pub fn new(release_entity: &ReleaseEntity, order: i64) -> Self {
        Self {
            release_entity_type: release_entity.entity_type,
            release_entity_id: release_entity.id.clone(),
            order,
        }
    }

    pub fn release_entity(&self) -> ReleaseEntity {
        ReleaseEntity {
            entity_type: self.release_entity_type,
            id: self.release_entity_id.clone(),
        }
    }
}

/// A request to hold `permits` against a (constraint id, resource unit) pair.
///
/// Records are immutable once created except for `state`, which only moves
/// through [`Consumer::with_state`].
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct Consumer {
    /// Globally unique; doubles as the callback / await token.
    pub id: Uuid,
    pub constraint_id: String,
    pub resource_unit: String,
    pub permits: i32,
    pub state: ConsumerState,
    pub context: ConsumerContext,
    pub created_at: DateTime<Utc>,
}

#[cfg(feature = "sqlx")]
impl sqlx::FromRow<'_, sqlx::postgres::PgRow> for Consumer {
    fn from_row(row: &sqlx::postgres::PgRow) -> Result<Self, sqlx::Error> {
        use sqlx::Row;
        Ok(Consumer {
            id: row.try_get("id")?,
            constraint_id: row.try_get("constraint_id")?,
            resource_unit: row.try_get("resource_unit")?,
            permits: row.try_get("permits")?,
            state: row.try_get::<String, _>("state")?.parse().map_err(|e| {
                sqlx::Error::Decode(format!("Failed to parse consumer state: {}", e).into())
            })?,
            context: ConsumerContext {
                release_entity_type: row
                    .try_get::<String, _>("release_entity_type")?
                    .parse()
                    .map_err(|e| {
                        sqlx::Error::Decode(
                            format!("Failed to parse release entity type: {}", e).into(),
                        )
                    })?,
                release_entity_id: row.try_get("release_entity_id")?,
                order: row.try_get("consumer_order")?,
            },
            created_at: row.try_get("created_at")?,
        })
    }
}

impl Consumer {
    pub fn new(
        id: Uuid,
        constraint_id: impl Into<String>,
        resource_unit: impl Into<String>,
        permits: i32,
        state: ConsumerState,
        context: ConsumerContext,
    ) -> Self {
        Self {
            id,
            constraint_id: constraint_id.into(),
            resource_unit: resource_unit.into(),
            permits,
            state,
            context,
            created_at: Utc::now(),
        }
    }

    pub fn is_active(&self) -> bool {
        self.state == ConsumerState::Active
    }

    pub fn is_blocked(&self) -> bool {
        self.state == ConsumerState::Blocked
    }

    /// ACTIVE and BLOCKED consumers both count as "held" for idempotent re-acquisition.
    pub fn is_held(&self) -> bool {
        matches!(self.state, ConsumerState::Active | ConsumerState::Blocked)
    }

    pub fn order(&self) -> i64 {
        self.context.order
    }

    pub fn is_owned_by(&self, entity_type: ReleaseEntityType, entity_id: &str) -> bool {
        self.context.release_entity_type == entity_type
            && self.context.release_entity_id == entity_id
    }

    /// Returns a copy in `state`; the only permitted change to a stored consumer.
    pub fn with_state(mut self, state: ConsumerState) -> Self {
        self.state = state;
        self
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_consumer_state_round_trips_through_text() {
        for state in [
            ConsumerState::Active,
            ConsumerState::Blocked,
            ConsumerState::Rejected,
        ] {
            assert_eq!(state.to_string().parse::<ConsumerState>().unwrap(), state);
        }
        assert!("FINISHED".parse::<ConsumerState>().is_err());
    }

    #[test]
    fn test_stage_release_entity_id_joins_plan_and_node() {
        let entity = ReleaseEntity::stage("plan-1", "node-7");
        assert_eq!(entity.entity_type, ReleaseEntityType::Stage);
        assert_eq!(entity.id, "plan-1|node-7");
        assert_eq!(entity.to_string(), "STAGE:plan-1|node-7");
    }

    #[test]
    fn test_consumer_ownership_checks_type_and_id() {
        let plan = ReleaseEntity::plan("exec-1");
        let consumer = Consumer::new(
            Uuid::new_v4(),
            "deployments",
            "cluster-a",
            2,
            ConsumerState::Blocked,
            ConsumerContext::new(&plan, 4),
        );
        assert!(consumer.is_owned_by(ReleaseEntityType::Plan, "exec-1"));
        assert!(!consumer.is_owned_by(ReleaseEntityType::Stage, "exec-1"));
        assert!(consumer.is_held());
        assert_eq!(consumer.order(), 4);
        assert_eq!(consumer.context.release_entity(), plan);
    }

    #[test]
    fn test_with_state_only_changes_state() {
        let consumer = Consumer::new(
            Uuid::new_v4(),
            "deployments",
            "cluster-a",
            1,
            ConsumerState::Blocked,
            ConsumerContext::new(&ReleaseEntity::plan("exec-1"), 1),
        );
        let promoted = consumer.clone().with_state(ConsumerState::Active);
        assert!(promoted.is_active());
        assert_eq!(promoted.id, consumer.id);
        assert_eq!(promoted.context, consumer.context);
        assert_eq!(promoted.created_at, consumer.created_at);
    }

    #[test]
    fn test_consumer_serializes_camel_case() {
        let consumer = Consumer::new(
            Uuid::nil(),
            "deployments",
            "cluster-a",
            1,
            ConsumerState::Active,
            ConsumerContext::new(&ReleaseEntity::plan("exec-1"), 0),
        );
        let json = serde_json::to_value(&consumer).unwrap();
        assert_eq!(json["resourceUnit"], "cluster-a");
        assert_eq!(json["state"], "ACTIVE");
        assert_eq!(json["context"]["releaseEntityType"], "PLAN");
    }
}
