//! Claim coordinator: the exclusive queued → running transition.

use std::sync::Arc;

use tracing::debug;
use uuid::Uuid;

use crate::error::DatabaseError;
use crate::jobs::JobRecord;
use crate::store::JobStore;

/// Result of a claim attempt.
#[derive(Debug)]
pub enum ClaimOutcome {
    /// This worker now owns the job; the record is post-claim.
    Claimed(JobRecord),
    /// The job was no longer queued at write time.
    LostRace,
    StoreError(DatabaseError),
}

/// Claims jobs through the store's conditional update.
#[derive(Clone)]
pub struct ClaimCoordinator {
    store: Arc<dyn JobStore>,
}

impl ClaimCoordinator {
    pub fn new(store: Arc<dyn JobStore>) -> Self {
        Self { store }
    }

    /// Attempt to claim `id`. Never retries.
    pub async fn claim(&self, id: Uuid) -> ClaimOutcome {
        match self.store.claim_job(id).await {
            Ok(Some(record)) => {
                debug!(job_id = %id, "Job claimed");
                ClaimOutcome::Claimed(record)
            }
            Ok(None) => {
                debug!(job_id = %id, "Job already claimed elsewhere");
                ClaimOutcome::LostRace
            }
            Err(e) => ClaimOutcome::StoreError(e),
        }
    }
}
