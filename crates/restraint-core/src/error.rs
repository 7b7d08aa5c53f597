//! Error types module
//!
//! All restraint failures are unified under [`RestraintError`]. Each variant
//! self-describes its code, retryability and log level through
//! [`ErrorMetadata`] so the step layer can decide between failing a step and
//! asking the orchestrator to retry it.

use uuid::Uuid;

use crate::models::StepState;

/// Log level for error reporting
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum LogLevel {
    /// Expected outcomes such as validation failures
    Debug,
    /// Recoverable issues such as contention
    Warn,
    /// Unexpected failures
    Error,
}

/// Metadata describing how an error should be presented and handled
pub trait ErrorMetadata {
    /// Machine-readable error code (e.g., "INVALID_PERMITS")
    fn error_code(&self) -> &'static str;

    /// Whether the failed operation may succeed if retried
    fn is_recoverable(&self) -> bool;

    /// Message suitable for users of the pipeline
    fn client_message(&self) -> String;

    /// Log level for this error
    fn log_level(&self) -> LogLevel;
}

#[derive(Debug, thiserror::Error)]
pub enum RestraintError {
    #[error("Requested {requested} permits on {constraint_id}/{resource_unit} but capacity is {capacity}")]
    InvalidPermits {
        constraint_id: String,
        resource_unit: String,
        requested: i32,
        capacity: i32,
    },

    #[error("Unable to register consumer on {constraint_id}/{resource_unit} after {attempts} attempts")]
    UnableToRegisterConsumer {
        constraint_id: String,
        resource_unit: String,
        attempts: u32,
    },

    #[error("Consumer {consumer_id} on {constraint_id}/{resource_unit} can never be admitted: needs {permits} permits, capacity is {capacity}")]
    PermanentlyBlocked {
        consumer_id: Uuid,
        constraint_id: String,
        resource_unit: String,
        permits: i32,
        capacity: i32,
    },

    #[error("Resource restraint not found: {0}")]
    ConstraintNotFound(String),

    #[error("Consumer not found: {0}")]
    ConsumerNotFound(Uuid),

    #[error("Invalid input: {0}")]
    InvalidInput(String),

    #[error("Invalid step transition from {from} to {to}")]
    InvalidStateTransition { from: StepState, to: StepState },

    #[error("Registry error: {0}")]
    Registry(#[source] anyhow::Error),
}

impl From<validator::ValidationErrors> for RestraintError {
    fn from(err: validator::ValidationErrors) -> Self {
        RestraintError::InvalidInput(format!("Validation error: {}", err))
    }
}

/// Static metadata for each variant: (error_code, recoverable, log_level).
fn restraint_error_static_metadata(err: &RestraintError) -> (&'static str, bool, LogLevel) {
    match err {
        RestraintError::InvalidPermits { .. } => ("INVALID_PERMITS", false, LogLevel::Debug),
        RestraintError::UnableToRegisterConsumer { .. } => {
            ("UNABLE_TO_REGISTER_CONSUMER", true, LogLevel::Warn)
        }
        RestraintError::PermanentlyBlocked { .. } => {
            ("PERMANENTLY_BLOCKED", false, LogLevel::Warn)
        }
        RestraintError::ConstraintNotFound(_) => ("CONSTRAINT_NOT_FOUND", false, LogLevel::Debug),
        RestraintError::ConsumerNotFound(_) => ("CONSUMER_NOT_FOUND", false, LogLevel::Debug),
        RestraintError::InvalidInput(_) => ("INVALID_INPUT", false, LogLevel::Debug),
        RestraintError::InvalidStateTransition { .. } => {
            ("INVALID_STATE_TRANSITION", false, LogLevel::Error)
        }
        RestraintError::Registry(_) => ("REGISTRY_ERROR", true, LogLevel::Error),
    }
}

impl RestraintError {
    /// Wraps a persistence failure.
    pub fn registry(err: impl Into<anyhow::Error>) -> Self {
        RestraintError::Registry(err.into())
    }

    /// Get detailed error information including error chain
    pub fn detailed_message(&self) -> String {
        use std::error::Error;

        let mut details = self.to_string();

        let mut source = self.source();
        let mut depth = 0;
        while let Some(err) = source {
            depth += 1;
            if depth > 5 {
                details.push_str("\n  ... (truncated)");
                break;
            }
            details.push_str(&format!("\n  Caused by: {}", err));
            source = err.source();
        }

        details
    }
}

impl ErrorMetadata for RestraintError {
    fn error_code(&self) -> &'static str {
        restraint_error_static_metadata(self).0
    }

    fn is_recoverable(&self) -> bool {
        restraint_error_static_metadata(self).1
    }

    fn log_level(&self) -> LogLevel {
        restraint_error_static_metadata(self).2
    }

    fn client_message(&self) -> String {
        match self {
            RestraintError::InvalidPermits {
                resource_unit,
                requested,
                capacity,
                ..
            } => format!(
                "Resource unit {} cannot grant {} permits: maximum capacity is {}",
                resource_unit, requested, capacity
            ),
            RestraintError::UnableToRegisterConsumer { resource_unit, .. } => format!(
                "Resource unit {} is busy, the step will be retried",
                resource_unit
            ),
            RestraintError::PermanentlyBlocked {
                resource_unit,
                permits,
                capacity,
                ..
            } => format!(
                "Resource unit {} is unavailable: {} permits can never fit capacity {}",
                resource_unit, permits, capacity
            ),
            RestraintError::ConstraintNotFound(id) => {
                format!("Resource restraint {} does not exist", id)
            }
            RestraintError::ConsumerNotFound(id) => format!("Permit holder {} not found", id),
            RestraintError::InvalidInput(msg) => msg.clone(),
            RestraintError::InvalidStateTransition { .. } => "Internal step error".to_string(),
            RestraintError::Registry(_) => "Failed to access restraint registry".to_string(),
        }
    }
}
