//! Worker system: listens for queued jobs, claims them, and runs them one at
//! a time.
//!
//! Core components:
//! - `listener`: change feed + bulk load into the worker
//! - `claim`: exclusive queued → running transition
//! - `executor`: child process supervision (timeouts, signals, output relay)
//! - `args`: `$NAME` substitution and command display
//! - `runner`: the worker loop and its handle
//! - `events`: lifecycle and diagnostic events

pub mod args;
pub mod claim;
pub mod events;
pub mod executor;
pub mod listener;
pub mod runner;

pub use claim::{ClaimCoordinator, ClaimOutcome};
pub use events::{DiagnosticSource, WorkerEvent, WorkerState};
pub use executor::{ExecutionControl, ProcessExecutor, ProcessSpec};
pub use listener::{ChangeListener, WorkerCommand};
pub use runner::{Worker, WorkerHandle};
