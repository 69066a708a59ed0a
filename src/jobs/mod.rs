//! Job records and the worker-local pending queue.

pub mod model;
pub mod queue;

pub use model::{JobKind, JobPayload, JobRecord, JobStatus, RunPayload};
pub use queue::LocalPriorityQueue;
