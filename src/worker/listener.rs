//! Change listener: feeds queued jobs from the store into the worker.
//!
//! On start it subscribes to the store's change feed, then bulk-loads every
//! queued job, so nothing inserted in between is missed. Afterwards:
//! 1. Every `queued` record on the feed is forwarded as `WorkerCommand::Enqueue`
//! 2. Feed lag triggers a re-scan of queued jobs
//! 3. An optional timer re-scans periodically (jobs from other processes)
//!
//! Duplicates are expected; the worker's queue drops them by id.

use std::sync::Arc;
use std::time::Duration;

use tokio::sync::broadcast::error::RecvError;
use tokio::sync::{broadcast, mpsc};
use tokio::task::JoinHandle;
use tokio::time::{Interval, MissedTickBehavior};
use tracing::{debug, info};

use crate::jobs::{JobRecord, JobStatus};
use crate::store::JobStore;
use crate::worker::events::{DiagnosticSource, WorkerEvent, emit_diagnostic};

/// Messages accepted by the worker loop.
#[derive(Debug)]
pub enum WorkerCommand {
    /// A queued record to consider.
    Enqueue(JobRecord),
    /// Result of a bulk query, delivered as one unit so the worker orders
    /// the whole backlog before starting anything.
    EnqueueBatch(Vec<JobRecord>),
    /// Stop after the current job; with `cancel_current`, terminate it first.
    Stop { cancel_current: bool },
}

/// Forwards store changes to the worker loop.
pub struct ChangeListener {
    store: Arc<dyn JobStore>,
    owner: Option<String>,
    commands: mpsc::UnboundedSender<WorkerCommand>,
    events: broadcast::Sender<WorkerEvent>,
    rescan_interval: Option<Duration>,
}

impl ChangeListener {
    pub fn new(
        store: Arc<dyn JobStore>,
        owner: Option<String>,
        commands: mpsc::UnboundedSender<WorkerCommand>,
        events: broadcast::Sender<WorkerEvent>,
    ) -> Self {
        Self {
            store,
            owner,
            commands,
            events,
            rescan_interval: None,
        }
    }

    /// Builder: periodically re-run the bulk queued query.
    pub fn with_rescan_interval(mut self, interval: Option<Duration>) -> Self {
        self.rescan_interval = interval;
        self
    }

    /// Spawn the listener task.
    pub fn spawn(self) -> JoinHandle<()> {
        let feed = self.store.subscribe();
        tokio::spawn(self.run(feed))
    }

    async fn run(self, mut feed: broadcast::Receiver<JobRecord>) {
        info!(owner = ?self.owner, rescan = ?self.rescan_interval, "Change listener started");

        if !self.load_queued().await {
            return;
        }

        let mut rescan = self.rescan_interval.map(|period| {
            let mut tick = tokio::time::interval_at(tokio::time::Instant::now() + period, period);
            tick.set_missed_tick_behavior(MissedTickBehavior::Skip);
            tick
        });
        let mut feed_open = true;

        loop {
            if !feed_open && rescan.is_none() {
                debug!("Change feed closed and no re-scan configured, listener exiting");
                return;
            }

            let keep_going = tokio::select! {
                received = feed.recv(), if feed_open => match received {
                    Ok(record) => self.forward(record),
                    Err(RecvError::Lagged(skipped)) => {
                        emit_diagnostic(
                            &self.events,
                            DiagnosticSource::Listener,
                            None,
                            format!("Change feed lagged, {skipped} notifications dropped; re-scanning"),
                        );
                        self.load_queued().await
                    }
                    Err(RecvError::Closed) => {
                        emit_diagnostic(
                            &self.events,
                            DiagnosticSource::Listener,
                            None,
                            "Change feed closed",
                        );
                        feed_open = false;
                        true
                    }
                },
                _ = next_tick(rescan.as_mut()) => self.load_queued().await,
            };

            if !keep_going {
                debug!("Worker gone, listener exiting");
                return;
            }
        }
    }

    fn in_scope(&self, record: &JobRecord) -> bool {
        record.status == JobStatus::Queued && record.is_owned_by(self.owner.as_deref())
    }

    /// Forward a feed record if it is queued and in scope. Returns `false`
    /// once the worker has stopped accepting commands.
    fn forward(&self, record: JobRecord) -> bool {
        if !self.in_scope(&record) {
            return true;
        }
        debug!(job_id = %record.id, kind = %record.kind(), "Queued job observed");
        self.commands.send(WorkerCommand::Enqueue(record)).is_ok()
    }

    /// Bulk query of queued jobs. Store errors are diagnostics; the return
    /// value only reports whether the worker is still listening.
    async fn load_queued(&self) -> bool {
        match self.store.list_queued(self.owner.as_deref()).await {
            Ok(jobs) => {
                let jobs: Vec<JobRecord> = jobs.into_iter().filter(|j| self.in_scope(j)).collect();
                if jobs.is_empty() {
                    return !self.commands.is_closed();
                }
                debug!(count = jobs.len(), "Loaded queued jobs");
                self.commands.send(WorkerCommand::EnqueueBatch(jobs)).is_ok()
            }
            Err(e) => {
                emit_diagnostic(
                    &self.events,
                    DiagnosticSource::BulkLoad,
                    None,
                    format!("Failed to load queued jobs: {e}"),
                );
                !self.commands.is_closed()
            }
        }
    }
}

async fn next_tick(interval: Option<&mut Interval>) {
    match interval {
        Some(interval) => {
            interval.tick().await;
        }
        None => std::future::pending().await,
    }
}
