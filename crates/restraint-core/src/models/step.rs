//! Restraint step contract: parameters consumed from the orchestrator, the
//! facilitation hint, the completion outcome and the step lifecycle.

use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};
use std::fmt::{Display, Formatter, Result as FmtResult};
use std::time::Duration;
use validator::Validate;

use super::consumer::ReleaseEntity;
use crate::error::RestraintError;

/// Default step timeout when the orchestrator does not provide one.
pub const DEFAULT_STEP_TIMEOUT_SECS: u64 = 600;

/// How the requested permit count is interpreted.
#[derive(Debug, Default, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
pub enum AcquireMode {
    /// Request `permits` more on top of anything already held.
    #[default]
    #[serde(rename = "DEFAULT", alias = "ACCUMULATE")]
    Accumulate,
    /// Make sure the release entity holds `permits` in total.
    #[serde(rename = "ENSURE")]
    Ensure,
}

/// Owner on whose behalf permits are held.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
#[serde(tag = "scope", rename_all = "SCREAMING_SNAKE_CASE")]
pub enum HoldingScope {
    #[serde(rename_all = "camelCase")]
    Plan { plan_execution_id: String },
    #[serde(rename_all = "camelCase")]
    Stage {
        plan_execution_id: String,
        node_id: String,
    },
}

impl HoldingScope {
    pub fn release_entity(&self) -> ReleaseEntity {
        match self {
            HoldingScope::Plan { plan_execution_id } => ReleaseEntity::plan(plan_execution_id),
            HoldingScope::Stage {
                plan_execution_id,
                node_id,
            } => ReleaseEntity::stage(plan_execution_id, node_id),
        }
    }
}

fn default_timeout_secs() -> u64 {
    DEFAULT_STEP_TIMEOUT_SECS
}

/// Resolved step parameters handed over by the orchestrator.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize, Validate)]
#[serde(rename_all = "camelCase")]
pub struct RestraintStepParameters {
    #[validate(length(min = 1, message = "resource restraint id must not be empty"))]
    pub resource_restraint_id: String,
    #[validate(length(min = 1, message = "resource unit must not be empty"))]
    pub resource_unit: String,
    #[validate(range(min = 1, message = "permits must be at least 1"))]
    pub permits: i32,
    #[serde(default)]
    pub acquire_mode: AcquireMode,
    pub holding_scope: HoldingScope,
    #[serde(default = "default_timeout_secs")]
    pub timeout_secs: u64,
}

impl RestraintStepParameters {
    pub fn new(
        resource_restraint_id: impl Into<String>,
        resource_unit: impl Into<String>,
        permits: i32,
        acquire_mode: AcquireMode,
        holding_scope: HoldingScope,
    ) -> Self {
        Self {
            resource_restraint_id: resource_restraint_id.into(),
            resource_unit: resource_unit.into(),
            permits,
            acquire_mode,
            holding_scope,
            timeout_secs: DEFAULT_STEP_TIMEOUT_SECS,
        }
    }

    pub fn with_timeout(mut self, timeout: Duration) -> Self {
        self.timeout_secs = timeout.as_secs();
        self
    }

    pub fn timeout(&self) -> Duration {
        Duration::from_secs(self.timeout_secs)
    }

    pub fn release_entity(&self) -> ReleaseEntity {
        self.holding_scope.release_entity()
    }
}

/// Dry-run hint for the orchestrator.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "SCREAMING_SNAKE_CASE")]
pub enum FacilitationMode {
    /// Permits are free now; the step can run inline.
    Sync,
    /// The step would have to wait for a permit.
    Async,
}

/// Completion payload consumed by the orchestrator and UI.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct RestraintOutcome {
    pub resource_name: String,
    pub capacity: i32,
    pub resource_unit: String,
    pub permits_used: i32,
    pub already_held_permits: i64,
}

/// Lifecycle of one restraint step.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "SCREAMING_SNAKE_CASE")]
pub enum StepState {
    Initiated,
    Registering,
    CompletedSync,
    Waiting,
    CompletedAsync,
    Aborted,
}

impl Display for StepState {
    fn fmt(&self, f: &mut Formatter<'_>) -> FmtResult {
        match self {
            StepState::Initiated => write!(f, "INITIATED"),
            StepState::Registering => write!(f, "REGISTERING"),
            StepState::CompletedSync => write!(f, "COMPLETED_SYNC"),
            StepState::Waiting => write!(f, "WAITING"),
            StepState::CompletedAsync => write!(f, "COMPLETED_ASYNC"),
            StepState::Aborted => write!(f, "ABORTED"),
        }
    }
}

impl StepState {
    pub fn is_terminal(&self) -> bool {
        matches!(
            self,
            StepState::CompletedSync | StepState::CompletedAsync | StepState::Aborted
        )
    }

    /// Completed steps may still be unwound to `Aborted` for cleanup.
    pub fn can_transition_to(&self, next: StepState) -> bool {
        use StepState::*;

        matches!(
            (self, next),
            (Initiated, Registering)
                | (Initiated, CompletedSync)
                | (Registering, CompletedSync)
                | (Registering, Waiting)
                | (Waiting, CompletedAsync)
                | (Waiting, Aborted)
                | (CompletedSync, Aborted)
                | (CompletedAsync, Aborted)
        )
    }
}

/// Validated step lifecycle with a timestamped history.
#[derive(Debug, Clone)]
pub struct StepStateMachine {
    current: StepState,
    history: Vec<(StepState, DateTime<Utc>)>,
}

impl StepStateMachine {
    pub fn new() -> Self {
        Self {
            current: StepState::Initiated,
            history: vec![(StepState::Initiated, Utc::now())],
        }
    }

    pub fn current(&self) -> StepState {
        self.current
    }

    pub fn transition(&mut self, next: StepState) -> Result<(), RestraintError> {
        if !self.current.can_transition_to(next) {
            return Err(RestraintError::InvalidStateTransition {
                from: self.current,
                to: next,
            });
        }
        self.current = next;
        self.history.push((next, Utc::now()));
        Ok(())
    }

    pub fn history(&self) -> &[(StepState, DateTime<Utc>)] {
        &self.history
    }
}

impl Default for StepStateMachine {
    fn default() -> Self {
        Self::new()
    }
}
