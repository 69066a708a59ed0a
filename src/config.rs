//! Configuration types.

use std::path::PathBuf;
use std::time::Duration;

use crate::error::ConfigError;

/// Grace window between SIGTERM and SIGKILL.
pub const DEFAULT_KILL_GRACE: Duration = Duration::from_millis(500);

/// Worker configuration.
#[derive(Debug, Clone)]
pub struct WorkerConfig {
    /// Path of the libSQL job database.
    pub db_path: PathBuf,
    /// Only jobs owned by this user are considered (None = all jobs).
    pub owner: Option<String>,
    /// Applied to jobs that don't set their own timeout (None = no timeout).
    pub default_timeout: Option<Duration>,
    /// Delay between graceful termination and a forceful kill.
    pub kill_grace: Duration,
    /// Periodic re-scan of queued jobs (None = change feed only).
    pub rescan_interval: Option<Duration>,
}

impl Default for WorkerConfig {
    fn default() -> Self {
        Self {
            db_path: PathBuf::from("./data/jobs.db"),
            owner: None,
            default_timeout: None,
            kill_grace: DEFAULT_KILL_GRACE,
            rescan_interval: None,
        }
    }
}

impl WorkerConfig {
    /// Build config from environment variables.
    pub fn from_env() -> Result<Self, ConfigError> {
        Self::from_lookup(|key| std::env::var(key).ok())
    }

    /// Build config from an arbitrary variable lookup.
    pub fn from_lookup(lookup: impl Fn(&str) -> Option<String>) -> Result<Self, ConfigError> {
        let defaults = Self::default();

        let db_path = lookup("JOB_WORKER_DB_PATH")
            .map(PathBuf::from)
            .unwrap_or(defaults.db_path);

        let owner = lookup("JOB_WORKER_OWNER")
            .map(|s| s.trim().to_string())
            .filter(|s| !s.is_empty());

        let default_timeout = parse_u64(&lookup, "JOB_WORKER_DEFAULT_TIMEOUT_MS")?
            .filter(|ms| *ms > 0)
            .map(Duration::from_millis);

        let kill_grace = parse_u64(&lookup, "JOB_WORKER_KILL_GRACE_MS")?
            .map(Duration::from_millis)
            .unwrap_or(defaults.kill_grace);

        let rescan_interval = parse_u64(&lookup, "JOB_WORKER_RESCAN_INTERVAL_SECS")?
            .filter(|secs| *secs > 0)
            .map(Duration::from_secs);

        Ok(Self {
            db_path,
            owner,
            default_timeout,
            kill_grace,
            rescan_interval,
        })
    }
}

fn parse_u64(
    lookup: &impl Fn(&str) -> Option<String>,
    key: &str,
) -> Result<Option<u64>, ConfigError> {
    match lookup(key) {
        None => Ok(None),
        Some(raw) => raw
            .trim()
            .parse()
            .map(Some)
            .map_err(|e| ConfigError::InvalidValue {
                key: key.to_string(),
                message: format!("{raw:?}: {e}"),
            }),
    }
}
