//! Step execution error types
//!
//! The step executor hands these to the orchestrator. A recoverable error asks
//! the orchestrator to re-run the whole step; an unrecoverable one fails the
//! step immediately.

use std::fmt;

use crate::error::{ErrorMetadata, RestraintError};

/// Step execution error that can be either recoverable or unrecoverable
#[derive(Debug)]
pub struct StepError {
    inner: anyhow::Error,
    recoverable: bool,
}

impl StepError {
    /// Create an error that fails the step without retrying
    pub fn unrecoverable(err: impl Into<anyhow::Error>) -> Self {
        Self {
            inner: err.into(),
            recoverable: false,
        }
    }

    /// Create an error the orchestrator should retry
    pub fn recoverable(err: impl Into<anyhow::Error>) -> Self {
        Self {
            inner: err.into(),
            recoverable: true,
        }
    }

    pub fn is_recoverable(&self) -> bool {
        self.recoverable
    }

    pub fn inner(&self) -> &anyhow::Error {
        &self.inner
    }

    pub fn into_inner(self) -> anyhow::Error {
        self.inner
    }

    /// The restraint error behind this step failure, if any.
    pub fn restraint_error(&self) -> Option<&RestraintError> {
        self.inner.downcast_ref::<RestraintError>()
    }
}

impl fmt::Display for StepError {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "{}", self.inner)
    }
}

impl std::error::Error for StepError {
    fn source(&self) -> Option<&(dyn std::error::Error + 'static)> {
        self.inner.source()
    }
}

impl From<anyhow::Error> for StepError {
    /// Plain errors are treated as recoverable
    fn from(err: anyhow::Error) -> Self {
        Self::recoverable(err)
    }
}

impl From<RestraintError> for StepError {
    fn from(err: RestraintError) -> Self {
        let recoverable = err.is_recoverable();
        Self {
            inner: err.into(),
            recoverable,
        }
    }
}

/// Extension trait for Result to mark failures as unrecoverable
pub trait StepResultExt<T> {
    fn unrecoverable(self) -> Result<T, StepError>;
}

impl<T, E: Into<anyhow::Error>> StepResultExt<T> for Result<T, E> {
    fn unrecoverable(self) -> Result<T, StepError> {
        self.map_err(|e| StepError::unrecoverable(e.into()))
    }
}
