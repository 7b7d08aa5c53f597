//! Restraint infrastructure
//!
//! Process-level concerns shared by binaries embedding the restraint engine.

pub mod telemetry;

pub use telemetry::{init_telemetry, shutdown_telemetry, TelemetryConfig};
