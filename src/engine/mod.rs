//! The pipeline: trigger scheduler, fetch pool and persistence pool.
//!
//! Triggers discover due work and enqueue it; fetch workers call the API
//! and publish results on the bus; persistence workers upsert them.

pub mod fetch;
pub mod handlers;
pub mod operations;
pub mod persist;
pub mod scheduler;
pub mod triggers;

pub use fetch::{FetchPool, Operation, OperationRegistry, WorkOutcome};
pub use persist::{Disposition, PersistPool, TopicHandler, TopicRegistry};
pub use scheduler::{FireOutcome, Scheduler, TriggerHandler};
