//! Tessera Worker
//!
//! Drives finalized uploads through `pending -> processing -> {completed, failed}`.
//! [`ProcessingQueue`] is a bounded channel served by a fixed pool of workers;
//! each run is claimed with a compare-and-set on the record so that a session
//! is processed exactly once per finalize.

pub mod context;
pub mod queue;
pub mod task;

pub use context::ProcessingContext;
pub use queue::{ProcessingQueue, ProcessingQueueConfig};
