//! Restraint worker
//!
//! Runtime pieces that live next to the orchestrator: the wait/notify hub
//! that wakes suspended steps, the PostgreSQL LISTEN bridge feeding it, the
//! step driver and the background promotion monitor.

pub mod driver;
pub mod hub;
pub mod listener;
pub mod monitor;

pub use driver::{ReleaseFailed, StepDriver, StepDriverConfig, StepRun, StepTimedOut};
pub use hub::{PermitWait, WaitNotifyHub};
pub use listener::spawn_pg_listener;
pub use monitor::{MonitorConfig, RestraintMonitor};
