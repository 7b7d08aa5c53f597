pub mod accounting;
pub mod executor;
pub mod facilitator;

pub use accounting::{
    compute_register_backoff, AccountingConfig, PermitRequest, RestraintAccountingService,
};
pub use executor::{RestraintStepExecutor, StepExecution, StepResponse};
pub use facilitator::AdmissionFacilitator;
