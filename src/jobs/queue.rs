//! Local priority queue: pending jobs for one worker instance.
//!
//! Ordered by priority (highest first), then creation time (oldest first).
//! Enqueue is idempotent by job id, so at-least-once change feeds never
//! produce duplicate entries.

use std::cmp::Reverse;
use std::collections::{BTreeMap, HashSet};

use chrono::{DateTime, Utc};
use tracing::debug;
use uuid::Uuid;

use super::model::JobRecord;

/// Sort key: priority desc, created_at asc, id for a stable total order.
type QueueKey = (Reverse<i64>, DateTime<Utc>, Uuid);

/// In-memory queue of jobs awaiting a claim attempt.
#[derive(Debug, Default)]
pub struct LocalPriorityQueue {
    entries: BTreeMap<QueueKey, JobRecord>,
    ids: HashSet<Uuid>,
}

impl LocalPriorityQueue {
    pub fn new() -> Self {
        Self::default()
    }

    /// Insert a record. Returns `false` if a record with the same id is
    /// already queued.
    pub fn enqueue(&mut self, record: JobRecord) -> bool {
        if !self.ids.insert(record.id) {
            debug!(job_id = %record.id, "Job already queued, skipping");
            return false;
        }
        let key = (Reverse(record.priority), record.created_at, record.id);
        self.entries.insert(key, record);
        true
    }

    /// Remove and return the highest-priority record.
    pub fn dequeue_next(&mut self) -> Option<JobRecord> {
        let (_, record) = self.entries.pop_first()?;
        self.ids.remove(&record.id);
        Some(record)
    }

    pub fn contains(&self, id: &Uuid) -> bool {
        self.ids.contains(id)
    }

    pub fn len(&self) -> usize {
        self.entries.len()
    }

    pub fn is_empty(&self) -> bool {
        self.entries.is_empty()
    }
}
