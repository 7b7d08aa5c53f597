//! Restraint Core Library
//!
//! Domain models, the admission decision function, error types, configuration
//! and collaborator traits shared by every restraint component.

pub mod config;
pub mod constraint;
pub mod error;
pub mod hooks;
pub mod models;
pub mod step_error;

// Re-export commonly used types
pub use config::RestraintConfig;
pub use constraint::{
    apply_promotions, decide_state, plan_promotions, used_permits, InvalidPermits, PromotionPlan,
};
pub use error::{ErrorMetadata, LogLevel, RestraintError};
pub use hooks::{MpscNotifyChannel, NoOpNotifyChannel, NotifyChannel, NotifyEvent};
pub use step_error::{StepError, StepResultExt};
