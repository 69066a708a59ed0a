//! Error types for the job worker.

use crate::jobs::JobStatus;

/// Configuration-related errors.
#[derive(Debug, thiserror::Error)]
pub enum ConfigError {
    #[error("Invalid configuration value for {key}: {message}")]
    InvalidValue { key: String, message: String },
}

/// Job store errors.
#[derive(Debug, thiserror::Error)]
pub enum DatabaseError {
    #[error("Connection pool error: {0}")]
    Pool(String),

    #[error("Query failed: {0}")]
    Query(String),

    #[error("Invalid status transition: {from} -> {to}")]
    InvalidTransition { from: JobStatus, to: JobStatus },

    #[error("Migration failed: {0}")]
    Migration(String),

    #[error("Serialization error: {0}")]
    Serialization(String),
}

/// Failures on the job execution path. Each one ends the job with a
/// terminal status; none of them stop the worker.
#[derive(Debug, thiserror::Error)]
pub enum ExecError {
    #[error("Unknown provider: {name}")]
    UnknownProvider { name: String },

    #[error("Run job has neither a provider nor a command")]
    MissingCommand,

    #[error("Failed to spawn {program}: {source}")]
    SpawnFailure {
        program: String,
        #[source]
        source: std::io::Error,
    },

    #[error("Process exited with code {code}")]
    NonZeroExit { code: i32 },

    #[error("Process terminated: {reason}")]
    SignalTermination { reason: String },

    #[error("IO error: {0}")]
    Io(#[from] std::io::Error),
}

impl ExecError {
    /// Status recorded for a job that ended with this error.
    ///
    /// Signal terminations are `cancelled` so retry policies built on top
    /// of the status can tell them apart from genuine failures.
    pub fn terminal_status(&self) -> JobStatus {
        match self {
            Self::SignalTermination { .. } => JobStatus::Cancelled,
            _ => JobStatus::Failed,
        }
    }
}
