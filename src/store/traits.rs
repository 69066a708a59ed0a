//! `JobStore` trait: the contract the worker needs from its backing store.

use async_trait::async_trait;
use tokio::sync::broadcast;
use uuid::Uuid;

use crate::error::DatabaseError;
use crate::jobs::{JobRecord, JobStatus};

/// Backend-agnostic job store.
///
/// Implementations must make `claim_job` a conditional write: only a record
/// still `queued` at write time may move to `running`, so that exactly one
/// of several racing workers wins.
#[async_trait]
pub trait JobStore: Send + Sync {
    /// Run all pending schema migrations.
    async fn run_migrations(&self) -> Result<(), DatabaseError>;

    /// Insert a new job record.
    async fn insert_job(&self, job: &JobRecord) -> Result<(), DatabaseError>;

    /// Get a job by ID.
    async fn get_job(&self, id: Uuid) -> Result<Option<JobRecord>, DatabaseError>;

    /// Set `status = running` and `started_at = now` if the job is still
    /// queued. Returns the updated record, or `None` if another claimant got
    /// there first (or the job does not exist).
    async fn claim_job(&self, id: Uuid) -> Result<Option<JobRecord>, DatabaseError>;

    /// Move a `running` job to a terminal status, setting `finished_at = now`
    /// and the error message. Returns `false` if no row was updated (unknown
    /// id, or the job is not running). A non-terminal `status` is an
    /// `InvalidTransition` error.
    async fn finish_job(
        &self,
        id: Uuid,
        status: JobStatus,
        error_message: Option<&str>,
    ) -> Result<bool, DatabaseError>;

    /// Queued jobs ordered by priority desc, then `created_at` asc,
    /// optionally scoped to one owner.
    async fn list_queued(&self, owner: Option<&str>) -> Result<Vec<JobRecord>, DatabaseError>;

    /// Change feed: every inserted or updated record is published here.
    fn subscribe(&self) -> broadcast::Receiver<JobRecord>;
}
