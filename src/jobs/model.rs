//! Job data model: records, kinds, statuses, and run payloads.

use std::collections::BTreeMap;
use std::path::PathBuf;
use std::str::FromStr;

use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};
use uuid::Uuid;

/// What a job asks the worker to do.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum JobKind {
    /// Execute a command or provider.
    Run,
    /// Cancel the job currently executing on the worker.
    Terminate,
}

impl JobKind {
    pub fn as_str(&self) -> &'static str {
        match self {
            Self::Run => "run",
            Self::Terminate => "terminate",
        }
    }
}

impl std::fmt::Display for JobKind {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.write_str(self.as_str())
    }
}

impl FromStr for JobKind {
    type Err = String;

    fn from_str(s: &str) -> Result<Self, Self::Err> {
        match s {
            "run" => Ok(Self::Run),
            "terminate" => Ok(Self::Terminate),
            other => Err(format!("unknown job kind: {other}")),
        }
    }
}

/// Lifecycle status of a job.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum JobStatus {
    /// Waiting to be claimed.
    Queued,
    /// Claimed by a worker and executing.
    Running,
    /// Finished successfully.
    Completed,
    /// Finished with an error.
    Failed,
    /// Stopped by a signal, a timeout, or a terminate request.
    Cancelled,
}

impl JobStatus {
    /// Check if this status allows transitioning to another status.
    pub fn can_transition_to(&self, target: JobStatus) -> bool {
        use JobStatus::*;

        matches!(
            (self, target),
            (Queued, Running) | (Running, Completed) | (Running, Failed) | (Running, Cancelled)
        )
    }

    /// Terminal statuses are never rewritten.
    pub fn is_terminal(&self) -> bool {
        matches!(self, Self::Completed | Self::Failed | Self::Cancelled)
    }

    pub fn as_str(&self) -> &'static str {
        match self {
            Self::Queued => "queued",
            Self::Running => "running",
            Self::Completed => "completed",
            Self::Failed => "failed",
            Self::Cancelled => "cancelled",
        }
    }
}

impl std::fmt::Display for JobStatus {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.write_str(self.as_str())
    }
}

impl FromStr for JobStatus {
    type Err = String;

    fn from_str(s: &str) -> Result<Self, Self::Err> {
        match s {
            "queued" => Ok(Self::Queued),
            "running" => Ok(Self::Running),
            "completed" => Ok(Self::Completed),
            "failed" => Ok(Self::Failed),
            "cancelled" => Ok(Self::Cancelled),
            other => Err(format!("unknown job status: {other}")),
        }
    }
}

/// Payload of a `run` job.
#[derive(Debug, Clone, Default, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct RunPayload {
    /// Named provider to run instead of `cmd`.
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub provider: Option<String>,
    /// Program to spawn when no provider is named.
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub cmd: Option<String>,
    /// Arguments; `$NAME` tokens are resolved against the merged environment.
    #[serde(default)]
    pub args: Vec<String>,
    /// Overlaid onto the worker's environment.
    #[serde(default)]
    pub env: BTreeMap<String, String>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub cwd: Option<PathBuf>,
    /// Per-job timeout; falls back to the worker default.
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub timeout_ms: Option<u64>,
    /// Hand the worker's own stdio to the child.
    #[serde(default)]
    pub interactive: bool,
}

impl RunPayload {
    /// Payload that spawns `cmd` with `args`.
    pub fn command(cmd: impl Into<String>, args: impl IntoIterator<Item = impl Into<String>>) -> Self {
        Self {
            cmd: Some(cmd.into()),
            args: args.into_iter().map(Into::into).collect(),
            ..Self::default()
        }
    }

    /// Payload that runs a registered provider.
    pub fn provider(name: impl Into<String>, args: impl IntoIterator<Item = impl Into<String>>) -> Self {
        Self {
            provider: Some(name.into()),
            args: args.into_iter().map(Into::into).collect(),
            ..Self::default()
        }
    }

    pub fn with_env(mut self, key: impl Into<String>, value: impl Into<String>) -> Self {
        self.env.insert(key.into(), value.into());
        self
    }

    pub fn with_cwd(mut self, cwd: impl Into<PathBuf>) -> Self {
        self.cwd = Some(cwd.into());
        self
    }

    pub fn with_timeout_ms(mut self, timeout_ms: u64) -> Self {
        self.timeout_ms = Some(timeout_ms);
        self
    }

    pub fn interactive(mut self) -> Self {
        self.interactive = true;
        self
    }
}

/// Kind-specific job payload.
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum JobPayload {
    Run(RunPayload),
    Terminate,
}

impl JobPayload {
    pub fn kind(&self) -> JobKind {
        match self {
            Self::Run(_) => JobKind::Run,
            Self::Terminate => JobKind::Terminate,
        }
    }

    /// JSON text stored in the `payload` column.
    pub fn to_json(&self) -> Result<String, serde_json::Error> {
        match self {
            Self::Run(run) => serde_json::to_string(run),
            Self::Terminate => Ok("{}".to_string()),
        }
    }

    /// Parse the `payload` column for a job of the given kind.
    pub fn from_json(kind: JobKind, json: &str) -> Result<Self, serde_json::Error> {
        match kind {
            JobKind::Run => serde_json::from_str(json).map(Self::Run),
            JobKind::Terminate => Ok(Self::Terminate),
        }
    }
}

/// The unit of schedulable work.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct JobRecord {
    /// Stable across claim attempts.
    pub id: Uuid,
    pub status: JobStatus,
    /// Higher values are serviced first.
    pub priority: i64,
    /// FIFO tiebreak within equal priority.
    pub created_at: DateTime<Utc>,
    pub started_at: Option<DateTime<Utc>>,
    pub finished_at: Option<DateTime<Utc>>,
    /// Set only on `failed` / `cancelled`.
    pub error_message: Option<String>,
    /// Owner scope key.
    pub user_id: Option<String>,
    pub payload: JobPayload,
}

impl JobRecord {
    fn new(payload: JobPayload) -> Self {
        Self {
            id: Uuid::new_v4(),
            status: JobStatus::Queued,
            priority: 0,
            created_at: Utc::now(),
            started_at: None,
            finished_at: None,
            error_message: None,
            user_id: None,
            payload,
        }
    }

    /// A queued `run` job.
    pub fn run(payload: RunPayload) -> Self {
        Self::new(JobPayload::Run(payload))
    }

    /// A queued `terminate` job.
    pub fn terminate() -> Self {
        Self::new(JobPayload::Terminate)
    }

    pub fn kind(&self) -> JobKind {
        self.payload.kind()
    }

    /// Builder: set priority.
    pub fn with_priority(mut self, priority: i64) -> Self {
        self.priority = priority;
        self
    }

    /// Builder: set owner.
    pub fn with_owner(mut self, user_id: impl Into<String>) -> Self {
        self.user_id = Some(user_id.into());
        self
    }

    /// Builder: set creation time.
    pub fn with_created_at(mut self, created_at: DateTime<Utc>) -> Self {
        self.created_at = created_at;
        self
    }

    /// Whether this record belongs to `owner` (no owner scope matches everything).
    pub fn is_owned_by(&self, owner: Option<&str>) -> bool {
        match owner {
            Some(owner) => self.user_id.as_deref() == Some(owner),
            None => true,
        }
    }
}
