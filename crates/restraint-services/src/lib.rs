//! Restraint services
//!
//! Accounting over the consumer registry, the dry-run admission facilitator
//! and the step executor that suspends and resumes restraint steps.

pub mod services;

pub use services::{
    compute_register_backoff, AccountingConfig, AdmissionFacilitator, PermitRequest,
    RestraintAccountingService, RestraintStepExecutor, StepExecution, StepResponse,
};
