//! Resource restraint (constraint) definition

use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};
use validator::Validate;

/// A limited resource type with a fixed number of permits per resource unit.
///
/// Created at configuration time; capacity is immutable afterwards.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize, Validate)]
#[cfg_attr(feature = "sqlx", derive(sqlx::FromRow))]
#[serde(rename_all = "camelCase")]
pub struct ResourceRestraint {
    #[validate(length(min = 1, message = "restraint id must not be empty"))]
    pub id: String,
    #[validate(length(min = 1, message = "restraint name must not be empty"))]
    pub name: String,
    #[validate(range(min = 1, message = "capacity must be greater than zero"))]
    pub capacity: i32,
    pub created_at: DateTime<Utc>,
}

impl ResourceRestraint {
    pub fn new(id: impl Into<String>, name: impl Into<String>, capacity: i32) -> Self {
        Self {
            id: id.into(),
            name: name.into(),
            capacity,
            created_at: Utc::now(),
        }
    }
}
