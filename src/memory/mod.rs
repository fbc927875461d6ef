//! In-process backends for the queue, the bus, and the store.
//!
//! They back the test suite and single-process dry runs. Expiry and
//! visibility use `tokio::time::Instant`, so paused-clock tests can move
//! through ledger windows without sleeping.

mod bus;
mod queue;
mod store;

pub use bus::MemoryBus;
pub use queue::MemoryQueue;
pub use store::{MemoryStore, StoredOrder, Tables};
