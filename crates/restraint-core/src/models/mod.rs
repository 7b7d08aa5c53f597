//! Data models for resource restraints
//!
//! Restraint definitions, consumers (permit holders) and the step contract
//! exchanged with the orchestrator.

mod consumer;
mod restraint;
mod step;

pub use consumer::*;
pub use restraint::*;
pub use step::*;
