//! Registry and repository implementations
//!
//! `memory` keeps everything in process; the other modules talk to
//! PostgreSQL through a shared `PgPool`.

pub mod consumer;
pub mod memory;
pub mod notify;
pub mod restraint;

pub use consumer::PgConsumerRegistry;
pub use memory::{InMemoryConstraintRepository, InMemoryConsumerRegistry};
pub use notify::{PgNotifyChannel, PERMIT_READY_CHANNEL};
pub use restraint::PgConstraintRepository;
