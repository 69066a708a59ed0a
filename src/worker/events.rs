//! Worker lifecycle and diagnostic events.
//!
//! Events are broadcast to whoever owns the worker (a CLI, a test, a UI
//! bridge). Sending never fails the worker: with no subscribers, events are
//! simply dropped.

use tokio::sync::broadcast;
use tracing::warn;
use uuid::Uuid;

use crate::jobs::{JobKind, JobStatus};

/// Default broadcast channel capacity.
pub const EVENT_CHANNEL_CAPACITY: usize = 256;

/// What the worker loop is doing right now.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum WorkerState {
    Idle,
    Claiming,
    Executing,
    Finalizing,
    Stopped,
}

impl std::fmt::Display for WorkerState {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        let s = match self {
            Self::Idle => "idle",
            Self::Claiming => "claiming",
            Self::Executing => "executing",
            Self::Finalizing => "finalizing",
            Self::Stopped => "stopped",
        };
        write!(f, "{s}")
    }
}

/// Where a non-fatal problem was observed.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum DiagnosticSource {
    /// Change feed subscription.
    Listener,
    /// Bulk query of queued jobs (startup or re-scan).
    BulkLoad,
    /// Queued → running conditional write.
    Claim,
    /// Terminal status write.
    Finalize,
}

/// Event published by a running worker.
#[derive(Debug, Clone)]
pub enum WorkerEvent {
    StateChanged {
        state: WorkerState,
        job_id: Option<Uuid>,
    },
    JobStarted {
        job_id: Uuid,
        kind: JobKind,
    },
    JobFinished {
        job_id: Uuid,
        status: JobStatus,
        error_message: Option<String>,
    },
    /// Another worker claimed the job first.
    ClaimLost { job_id: Uuid },
    /// A running job was signalled because a terminate job arrived.
    TerminateRequested {
        terminate_id: Uuid,
        target_id: Uuid,
    },
    /// Non-fatal error; the worker keeps running.
    Diagnostic {
        source: DiagnosticSource,
        job_id: Option<Uuid>,
        message: String,
    },
}

/// Log a diagnostic and publish it.
pub(crate) fn emit_diagnostic(
    events: &broadcast::Sender<WorkerEvent>,
    source: DiagnosticSource,
    job_id: Option<Uuid>,
    message: impl Into<String>,
) {
    let message = message.into();
    warn!(?source, job_id = ?job_id, "{message}");
    let _ = events.send(WorkerEvent::Diagnostic {
        source,
        job_id,
        message,
    });
}
