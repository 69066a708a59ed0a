//! libSQL backend: async `JobStore` trait implementation.
//!
//! Supports local file and in-memory databases. Every write that changes a
//! job is republished on an in-process broadcast channel, which serves as the
//! store's change feed.

use std::path::Path;
use std::sync::Arc;

use async_trait::async_trait;
use chrono::{DateTime, SecondsFormat, Utc};
use libsql::{Connection, Database as LibSqlDatabase, params};
use tokio::sync::broadcast;
use tracing::{debug, info, warn};
use uuid::Uuid;

use crate::error::DatabaseError;
use crate::jobs::{JobKind, JobPayload, JobRecord, JobStatus};
use crate::store::migrations;
use crate::store::traits::JobStore;

/// Change feed capacity. Slow subscribers past this see `Lagged`.
const CHANGE_FEED_CAPACITY: usize = 1024;

/// libSQL job store.
///
/// Stores a single connection that is reused for all operations.
/// `libsql::Connection` is `Send + Sync` and safe for concurrent async use.
pub struct LibSqlBackend {
    #[allow(dead_code)]
    db: Arc<LibSqlDatabase>,
    conn: Connection,
    changes: broadcast::Sender<JobRecord>,
}

impl LibSqlBackend {
    /// Open (or create) a local database file and run migrations.
    pub async fn new_local(path: &Path) -> Result<Self, DatabaseError> {
        if let Some(parent) = path.parent() {
            std::fs::create_dir_all(parent).map_err(|e| {
                DatabaseError::Pool(format!("Failed to create database directory: {e}"))
            })?;
        }

        let db = libsql::Builder::new_local(path)
            .build()
            .await
            .map_err(|e| DatabaseError::Pool(format!("Failed to open libSQL database: {e}")))?;

        let backend = Self::from_database(db)?;
        backend.run_migrations().await?;
        info!(path = %path.display(), "Job database opened");
        Ok(backend)
    }

    /// Create an in-memory database (for tests).
    pub async fn new_memory() -> Result<Self, DatabaseError> {
        let db = libsql::Builder::new_local(":memory:")
            .build()
            .await
            .map_err(|e| {
                DatabaseError::Pool(format!("Failed to create in-memory database: {e}"))
            })?;

        let backend = Self::from_database(db)?;
        backend.run_migrations().await?;
        Ok(backend)
    }

    fn from_database(db: LibSqlDatabase) -> Result<Self, DatabaseError> {
        let conn = db
            .connect()
            .map_err(|e| DatabaseError::Pool(format!("Failed to create connection: {e}")))?;
        let (changes, _rx) = broadcast::channel(CHANGE_FEED_CAPACITY);
        Ok(Self {
            db: Arc::new(db),
            conn,
            changes,
        })
    }

    fn conn(&self) -> &Connection {
        &self.conn
    }

    /// Publish a record on the change feed: ok if nobody is subscribed.
    fn publish(&self, job: JobRecord) {
        let _ = self.changes.send(job);
    }

    /// Re-read a job after a write and publish it.
    async fn publish_current(&self, id: Uuid) -> Result<Option<JobRecord>, DatabaseError> {
        let job = self.get_job(id).await?;
        if let Some(ref job) = job {
            self.publish(job.clone());
        }
        Ok(job)
    }
}

// ── Helper functions ────────────────────────────────────────────────

/// Canonical timestamp format. Fixed width, so text order is time order.
fn format_datetime(dt: &DateTime<Utc>) -> String {
    dt.to_rfc3339_opts(SecondsFormat::Micros, true)
}

fn parse_datetime(s: &str) -> Result<DateTime<Utc>, DatabaseError> {
    DateTime::parse_from_rfc3339(s)
        .map(|dt| dt.with_timezone(&Utc))
        .map_err(|e| DatabaseError::Serialization(format!("bad timestamp {s:?}: {e}")))
}

fn parse_optional_datetime(s: Option<String>) -> Result<Option<DateTime<Utc>>, DatabaseError> {
    s.filter(|s| !s.is_empty())
        .map(|s| parse_datetime(&s))
        .transpose()
}

/// Convert `Option<&str>` to libsql Value.
fn opt_text(s: Option<&str>) -> libsql::Value {
    match s {
        Some(s) => libsql::Value::Text(s.to_string()),
        None => libsql::Value::Null,
    }
}

const JOB_COLUMNS: &str =
    "id, kind, status, priority, created_at, started_at, finished_at, error_message, user_id, payload";

/// Map a libsql Row to a JobRecord. Column order matches JOB_COLUMNS.
fn row_to_job(row: &libsql::Row) -> Result<JobRecord, DatabaseError> {
    let column = |name: &str, e: libsql::Error| DatabaseError::Query(format!("job.{name}: {e}"));

    let id_str: String = row.get(0).map_err(|e| column("id", e))?;
    let id = Uuid::parse_str(&id_str)
        .map_err(|e| DatabaseError::Serialization(format!("job.id parse: {e}")))?;

    let kind_str: String = row.get(1).map_err(|e| column("kind", e))?;
    let kind: JobKind = kind_str.parse().map_err(DatabaseError::Serialization)?;

    let status_str: String = row.get(2).map_err(|e| column("status", e))?;
    let status: JobStatus = status_str.parse().map_err(DatabaseError::Serialization)?;

    let priority: i64 = row.get(3).map_err(|e| column("priority", e))?;
    let created_str: String = row.get(4).map_err(|e| column("created_at", e))?;
    let payload_str: String = row.get(9).unwrap_or_else(|_| "{}".to_string());

    let payload = JobPayload::from_json(kind, &payload_str)
        .map_err(|e| DatabaseError::Serialization(format!("job {id} payload: {e}")))?;

    Ok(JobRecord {
        id,
        status,
        priority,
        created_at: parse_datetime(&created_str)?,
        started_at: parse_optional_datetime(row.get(5).ok())?,
        finished_at: parse_optional_datetime(row.get(6).ok())?,
        error_message: row.get(7).ok(),
        user_id: row.get(8).ok(),
        payload,
    })
}

// ── Trait implementation ────────────────────────────────────────────

#[async_trait]
impl JobStore for LibSqlBackend {
    async fn run_migrations(&self) -> Result<(), DatabaseError> {
        migrations::run_migrations(self.conn()).await
    }

    async fn insert_job(&self, job: &JobRecord) -> Result<(), DatabaseError> {
        let payload_json = job
            .payload
            .to_json()
            .map_err(|e| DatabaseError::Serialization(e.to_string()))?;

        self.conn()
            .execute(
                &format!("INSERT INTO jobs ({JOB_COLUMNS}) VALUES (?1, ?2, ?3, ?4, ?5, ?6, ?7, ?8, ?9, ?10)"),
                params![
                    job.id.to_string(),
                    job.kind().as_str(),
                    job.status.as_str(),
                    job.priority,
                    format_datetime(&job.created_at),
                    opt_text(job.started_at.map(|t| format_datetime(&t)).as_deref()),
                    opt_text(job.finished_at.map(|t| format_datetime(&t)).as_deref()),
                    opt_text(job.error_message.as_deref()),
                    opt_text(job.user_id.as_deref()),
                    payload_json,
                ],
            )
            .await
            .map_err(|e| DatabaseError::Query(format!("insert_job: {e}")))?;

        debug!(job_id = %job.id, kind = %job.kind(), priority = job.priority, "Job inserted");
        // Committed; publish the record as written.
        self.publish(job.clone());
        Ok(())
    }

    async fn get_job(&self, id: Uuid) -> Result<Option<JobRecord>, DatabaseError> {
        let mut rows = self
            .conn()
            .query(
                &format!("SELECT {JOB_COLUMNS} FROM jobs WHERE id = ?1"),
                params![id.to_string()],
            )
            .await
            .map_err(|e| DatabaseError::Query(format!("get_job: {e}")))?;

        match rows.next().await {
            Ok(Some(row)) => Ok(Some(row_to_job(&row)?)),
            Ok(None) => Ok(None),
            Err(e) => Err(DatabaseError::Query(format!("get_job: {e}"))),
        }
    }

    async fn claim_job(&self, id: Uuid) -> Result<Option<JobRecord>, DatabaseError> {
        let now = format_datetime(&Utc::now());
        let affected = self
            .conn()
            .execute(
                "UPDATE jobs SET status = 'running', started_at = ?1 WHERE id = ?2 AND status = 'queued'",
                params![now, id.to_string()],
            )
            .await
            .map_err(|e| DatabaseError::Query(format!("claim_job: {e}")))?;

        if affected == 0 {
            return Ok(None);
        }

        let claimed = self.publish_current(id).await?;
        if claimed.is_none() {
            warn!(job_id = %id, "Claimed job vanished before it could be read back");
        }
        Ok(claimed)
    }

    async fn finish_job(
        &self,
        id: Uuid,
        status: JobStatus,
        error_message: Option<&str>,
    ) -> Result<bool, DatabaseError> {
        if !JobStatus::Running.can_transition_to(status) {
            return Err(DatabaseError::InvalidTransition {
                from: JobStatus::Running,
                to: status,
            });
        }

        let now = format_datetime(&Utc::now());
        let affected = self
            .conn()
            .execute(
                "UPDATE jobs SET status = ?1, finished_at = ?2, error_message = ?3 \
                 WHERE id = ?4 AND status = 'running'",
                params![status.as_str(), now, opt_text(error_message), id.to_string()],
            )
            .await
            .map_err(|e| DatabaseError::Query(format!("finish_job: {e}")))?;

        if affected == 0 {
            return Ok(false);
        }

        debug!(job_id = %id, status = %status, "Job finished");
        if let Err(e) = self.publish_current(id).await {
            warn!(job_id = %id, error = %e, "Finished job could not be republished");
        }
        Ok(true)
    }

    async fn list_queued(&self, owner: Option<&str>) -> Result<Vec<JobRecord>, DatabaseError> {
        let conn = self.conn();
        let mut rows = match owner {
            Some(owner) => conn
                .query(
                    &format!("SELECT {JOB_COLUMNS} FROM jobs WHERE status = 'queued' AND user_id = ?1 ORDER BY priority DESC, created_at ASC"),
                    params![owner],
                )
                .await,
            None => conn
                .query(
                    &format!("SELECT {JOB_COLUMNS} FROM jobs WHERE status = 'queued' ORDER BY priority DESC, created_at ASC"),
                    (),
                )
                .await,
        }
        .map_err(|e| DatabaseError::Query(format!("list_queued: {e}")))?;

        let mut jobs = Vec::new();
        while let Some(row) = rows
            .next()
            .await
            .map_err(|e| DatabaseError::Query(format!("list_queued: {e}")))?
        {
            // One bad row must not hide the rest of the backlog.
            match row_to_job(&row) {
                Ok(job) => jobs.push(job),
                Err(e) => {
                    let id: Option<String> = row.get(0).ok();
                    warn!(job_id = ?id, error = %e, "Skipping undecodable queued job");
                }
            }
        }
        Ok(jobs)
    }

    fn subscribe(&self) -> broadcast::Receiver<JobRecord> {
        self.changes.subscribe()
    }
}

#[cfg(test)]
mod tests {
    use chrono::Duration;

    use super::*;
    use crate::jobs::RunPayload;

    async fn test_db() -> LibSqlBackend {
        LibSqlBackend::new_memory().await.unwrap()
    }

    fn make_job(priority: i64) -> JobRecord {
        JobRecord::run(RunPayload::command("echo", ["hi"])).with_priority(priority)
    }

    #[tokio::test]
    async fn insert_and_get_by_id() {
        let db = test_db().await;
        let job = make_job(3).with_owner("alice");
        db.insert_job(&job).await.unwrap();

        let fetched = db.get_job(job.id).await.unwrap().unwrap();
        assert_eq!(fetched.id, job.id);
        assert_eq!(fetched.status, JobStatus::Queued);
        assert_eq!(fetched.priority, 3);
        assert_eq!(fetched.user_id.as_deref(), Some("alice"));
        assert_eq!(fetched.payload, job.payload);
        assert_eq!(fetched.started_at, None);
    }

    #[tokio::test]
    async fn get_by_id_not_found() {
        let db = test_db().await;
        assert!(db.get_job(Uuid::new_v4()).await.unwrap().is_none());
    }

    #[tokio::test]
    async fn terminate_jobs_roundtrip() {
        let db = test_db().await;
        let job = JobRecord::terminate();
        db.insert_job(&job).await.unwrap();

        let fetched = db.get_job(job.id).await.unwrap().unwrap();
        assert_eq!(fetched.kind(), JobKind::Terminate);
        assert_eq!(fetched.payload, JobPayload::Terminate);
    }

    #[tokio::test]
    async fn claim_sets_running_and_started_at() {
        let db = test_db().await;
        let job = make_job(0);
        db.insert_job(&job).await.unwrap();

        let claimed = db.claim_job(job.id).await.unwrap().unwrap();
        assert_eq!(claimed.status, JobStatus::Running);
        assert!(claimed.started_at.is_some());
    }

    #[tokio::test]
    async fn second_claim_loses() {
        let db = test_db().await;
        let job = make_job(0);
        db.insert_job(&job).await.unwrap();

        assert!(db.claim_job(job.id).await.unwrap().is_some());
        assert!(db.claim_job(job.id).await.unwrap().is_none());
    }

    #[tokio::test]
    async fn concurrent_claims_have_one_winner() {
        let db = Arc::new(test_db().await);
        let job = make_job(0);
        db.insert_job(&job).await.unwrap();

        let (a, b) = tokio::join!(
            {
                let db = Arc::clone(&db);
                async move { db.claim_job(job.id).await.unwrap() }
            },
            {
                let db = Arc::clone(&db);
                async move { db.claim_job(job.id).await.unwrap() }
            }
        );
        assert_eq!(a.is_some() as u8 + b.is_some() as u8, 1);
    }

    #[tokio::test]
    async fn claim_unknown_job_is_none() {
        let db = test_db().await;
        assert!(db.claim_job(Uuid::new_v4()).await.unwrap().is_none());
    }

    #[tokio::test]
    async fn finish_writes_terminal_fields() {
        let db = test_db().await;
        let job = make_job(0);
        db.insert_job(&job).await.unwrap();
        db.claim_job(job.id).await.unwrap();

        let updated = db
            .finish_job(job.id, JobStatus::Failed, Some("Process exited with code 7"))
            .await
            .unwrap();
        assert!(updated);

        let fetched = db.get_job(job.id).await.unwrap().unwrap();
        assert_eq!(fetched.status, JobStatus::Failed);
        assert!(fetched.finished_at.is_some());
        assert_eq!(
            fetched.error_message.as_deref(),
            Some("Process exited with code 7")
        );
    }

    #[tokio::test]
    async fn terminal_status_is_immutable() {
        let db = test_db().await;
        let job = make_job(0);
        db.insert_job(&job).await.unwrap();
        db.claim_job(job.id).await.unwrap();

        assert!(db.finish_job(job.id, JobStatus::Cancelled, Some("stop")).await.unwrap());
        assert!(!db.finish_job(job.id, JobStatus::Completed, None).await.unwrap());

        let fetched = db.get_job(job.id).await.unwrap().unwrap();
        assert_eq!(fetched.status, JobStatus::Cancelled);
    }

    #[tokio::test]
    async fn queued_job_cannot_jump_to_terminal() {
        let db = test_db().await;
        let job = make_job(0);
        db.insert_job(&job).await.unwrap();

        assert!(!db.finish_job(job.id, JobStatus::Completed, None).await.unwrap());

        let fetched = db.get_job(job.id).await.unwrap().unwrap();
        assert_eq!(fetched.status, JobStatus::Queued);
        assert_eq!(fetched.finished_at, None);
    }

    #[tokio::test]
    async fn finish_rejects_non_terminal_status() {
        let db = test_db().await;
        let job = make_job(0);
        db.insert_job(&job).await.unwrap();
        db.claim_job(job.id).await.unwrap();

        let err = db.finish_job(job.id, JobStatus::Queued, None).await.unwrap_err();
        assert!(matches!(err, DatabaseError::InvalidTransition { .. }));
        let fetched = db.get_job(job.id).await.unwrap().unwrap();
        assert_eq!(fetched.status, JobStatus::Running);
    }

    #[tokio::test]
    async fn list_queued_orders_by_priority_then_age() {
        let db = test_db().await;
        let now = Utc::now();
        let low = make_job(1).with_created_at(now - Duration::seconds(30));
        let high_new = make_job(9).with_created_at(now);
        let high_old = make_job(9).with_created_at(now - Duration::seconds(5));
        let running = make_job(50);

        for job in [&low, &high_new, &high_old, &running] {
            db.insert_job(job).await.unwrap();
        }
        db.claim_job(running.id).await.unwrap();

        let ids: Vec<Uuid> = db
            .list_queued(None)
            .await
            .unwrap()
            .into_iter()
            .map(|j| j.id)
            .collect();
        assert_eq!(ids, vec![high_old.id, high_new.id, low.id]);
    }

    #[tokio::test]
    async fn list_queued_skips_undecodable_rows() {
        let db = test_db().await;
        let good = make_job(0);
        db.insert_job(&good).await.unwrap();

        let bad_id = Uuid::new_v4();
        db.conn()
            .execute(
                &format!("INSERT INTO jobs ({JOB_COLUMNS}) VALUES (?1, 'run', 'queued', 5, ?2, NULL, NULL, NULL, NULL, 'not json')"),
                params![bad_id.to_string(), format_datetime(&Utc::now())],
            )
            .await
            .unwrap();
        let unknown_kind = Uuid::new_v4();
        db.conn()
            .execute(
                &format!("INSERT INTO jobs ({JOB_COLUMNS}) VALUES (?1, 'reboot', 'queued', 5, ?2, NULL, NULL, NULL, NULL, '{{}}')"),
                params![unknown_kind.to_string(), format_datetime(&Utc::now())],
            )
            .await
            .unwrap();

        let ids: Vec<Uuid> = db
            .list_queued(None)
            .await
            .unwrap()
            .into_iter()
            .map(|j| j.id)
            .collect();
        assert_eq!(ids, vec![good.id]);
    }

    #[tokio::test]
    async fn list_queued_scoped_to_owner() {
        let db = test_db().await;
        let mine = make_job(0).with_owner("alice");
        let theirs = make_job(0).with_owner("bob");
        db.insert_job(&mine).await.unwrap();
        db.insert_job(&theirs).await.unwrap();

        let queued = db.list_queued(Some("alice")).await.unwrap();
        assert_eq!(queued.len(), 1);
        assert_eq!(queued[0].id, mine.id);
    }

    #[tokio::test]
    async fn change_feed_publishes_each_write() {
        let db = test_db().await;
        let mut rx = db.subscribe();
        let job = make_job(0);

        db.insert_job(&job).await.unwrap();
        db.claim_job(job.id).await.unwrap();
        db.finish_job(job.id, JobStatus::Completed, None).await.unwrap();

        let statuses: Vec<JobStatus> = vec![
            rx.recv().await.unwrap().status,
            rx.recv().await.unwrap().status,
            rx.recv().await.unwrap().status,
        ];
        assert_eq!(
            statuses,
            vec![JobStatus::Queued, JobStatus::Running, JobStatus::Completed]
        );
    }

    #[tokio::test]
    async fn open_local_creates_directory() {
        let tmp = tempfile::tempdir().unwrap();
        let path = tmp.path().join("nested").join("jobs.db");
        let db = LibSqlBackend::new_local(&path).await.unwrap();
        assert!(path.exists());
        db.insert_job(&make_job(0)).await.unwrap();
    }
}
