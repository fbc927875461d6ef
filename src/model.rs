//! Core data model.
//!
//! Work items flow from triggers to fetch workers; result messages flow from
//! fetch workers to persistence workers; API types describe what the external
//! service returns.

pub mod esi;
pub mod message;
pub mod work;

pub use message::{Notification, Topic};
pub use work::{OperationKind, Priority, Work, WorkId, WorkItem};
