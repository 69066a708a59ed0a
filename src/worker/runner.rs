//! Worker loop: the serial driver that claims, executes and finalizes jobs.
//!
//! A single task owns the local queue and the current-job state. The change
//! listener talks to it over an unbounded channel, and the loop keeps
//! draining that channel while a job executes, so new work and terminate
//! requests are never held up by a long-running child.

use std::collections::{HashSet, VecDeque};
use std::sync::Arc;
use std::time::Duration;

use tokio::sync::{broadcast, mpsc, watch};
use tokio::task::JoinHandle;
use tracing::{debug, info, warn};
use uuid::Uuid;

use crate::config::WorkerConfig;
use crate::error::ExecError;
use crate::jobs::{JobKind, JobPayload, JobRecord, JobStatus, LocalPriorityQueue, RunPayload};
use crate::providers::{ProviderRegistry, ProviderRequest};
use crate::store::JobStore;
use crate::worker::claim::{ClaimCoordinator, ClaimOutcome};
use crate::worker::events::{
    DiagnosticSource, EVENT_CHANNEL_CAPACITY, WorkerEvent, WorkerState, emit_diagnostic,
};
use crate::worker::executor::{ExecutionControl, ProcessExecutor, ProcessSpec};
use crate::worker::listener::{ChangeListener, WorkerCommand};

/// How many terminate ids are remembered for fast-path dedup.
const HANDLED_TERMINATES_CAP: usize = 1024;

/// Terminate ids whose fast path already fired, oldest forgotten first.
struct HandledTerminates {
    ids: HashSet<Uuid>,
    order: VecDeque<Uuid>,
    cap: usize,
}

impl HandledTerminates {
    fn new(cap: usize) -> Self {
        Self {
            ids: HashSet::new(),
            order: VecDeque::new(),
            cap,
        }
    }

    /// Record `id`. Returns `false` if it is already remembered.
    fn insert(&mut self, id: Uuid) -> bool {
        if !self.ids.insert(id) {
            return false;
        }
        self.order.push_back(id);
        if self.order.len() > self.cap {
            if let Some(oldest) = self.order.pop_front() {
                self.ids.remove(&oldest);
            }
        }
        true
    }

    fn len(&self) -> usize {
        self.order.len()
    }
}

/// The job this worker is executing.
struct RunningJob {
    id: Uuid,
    control: Arc<ExecutionControl>,
}

/// Serial job worker. Constructed and driven through [`Worker::spawn`].
pub struct Worker {
    config: WorkerConfig,
    store: Arc<dyn JobStore>,
    claims: ClaimCoordinator,
    registry: Arc<ProviderRegistry>,
    executor: ProcessExecutor,
    events: broadcast::Sender<WorkerEvent>,
    state: watch::Sender<WorkerState>,
    queue: LocalPriorityQueue,
    current: Option<RunningJob>,
    handled_terminates: HandledTerminates,
    stopping: bool,
    last_state: (WorkerState, Option<Uuid>),
}

impl Worker {
    /// Start the worker and its change listener.
    pub fn spawn(
        config: WorkerConfig,
        store: Arc<dyn JobStore>,
        registry: ProviderRegistry,
    ) -> WorkerHandle {
        let (commands_tx, commands_rx) = mpsc::unbounded_channel();
        let (events, _) = broadcast::channel(EVENT_CHANNEL_CAPACITY);
        let (state, state_rx) = watch::channel(WorkerState::Idle);

        let listener = ChangeListener::new(
            Arc::clone(&store),
            config.owner.clone(),
            commands_tx.clone(),
            events.clone(),
        )
        .with_rescan_interval(config.rescan_interval)
        .spawn();

        let worker = Self {
            executor: ProcessExecutor::new(config.kill_grace),
            claims: ClaimCoordinator::new(Arc::clone(&store)),
            config,
            store,
            registry: Arc::new(registry),
            events: events.clone(),
            state,
            queue: LocalPriorityQueue::new(),
            current: None,
            handled_terminates: HandledTerminates::new(HANDLED_TERMINATES_CAP),
            stopping: false,
            last_state: (WorkerState::Idle, None),
        };
        let task = tokio::spawn(worker.run(commands_rx));

        WorkerHandle {
            commands: commands_tx,
            events,
            state: state_rx,
            task,
            listener,
        }
    }

    async fn run(mut self, mut commands: mpsc::UnboundedReceiver<WorkerCommand>) {
        info!(owner = ?self.config.owner, default_timeout = ?self.config.default_timeout, "Worker started");

        loop {
            // Take in everything already delivered so the next pick sees the
            // full backlog.
            while let Ok(command) = commands.try_recv() {
                self.handle_command(command);
            }
            if self.stopping {
                break;
            }

            let Some(job) = self.queue.dequeue_next() else {
                self.set_state(WorkerState::Idle, None);
                match commands.recv().await {
                    Some(command) => {
                        self.handle_command(command);
                        continue;
                    }
                    None => break,
                }
            };

            self.process(job, &mut commands).await;
        }

        self.set_state(WorkerState::Stopped, None);
        info!(queued = self.queue.len(), "Worker stopped");
    }

    fn handle_command(&mut self, command: WorkerCommand) {
        match command {
            WorkerCommand::Enqueue(record) => self.accept(record),
            WorkerCommand::EnqueueBatch(records) => {
                for record in records {
                    self.accept(record);
                }
            }
            WorkerCommand::Stop { cancel_current } => {
                self.stopping = true;
                if cancel_current {
                    if let Some(current) = &self.current {
                        current.control.terminate("worker shutting down");
                    }
                }
            }
        }
    }

    fn accept(&mut self, record: JobRecord) {
        if record.status != JobStatus::Queued
            || !record.is_owned_by(self.config.owner.as_deref())
        {
            return;
        }
        if self.current.as_ref().is_some_and(|c| c.id == record.id) {
            return;
        }

        if record.kind() == JobKind::Terminate && self.handled_terminates.insert(record.id) {
            debug!(remembered = self.handled_terminates.len(), "Terminate observed");
            self.signal_current(record.id);
        }

        if self.queue.enqueue(record) {
            debug!(queued = self.queue.len(), "Job enqueued");
        }
    }

    /// Signal the running job on behalf of terminate job `terminate_id`.
    /// The running job's own exit path records `cancelled`.
    fn signal_current(&self, terminate_id: Uuid) {
        let Some(current) = self.current.as_ref().filter(|c| c.id != terminate_id) else {
            return;
        };
        info!(terminate_id = %terminate_id, job_id = %current.id, "Terminating running job");
        current
            .control
            .terminate(format!("terminated by job {terminate_id}"));
        let _ = self.events.send(WorkerEvent::TerminateRequested {
            terminate_id,
            target_id: current.id,
        });
    }

    async fn process(
        &mut self,
        job: JobRecord,
        commands: &mut mpsc::UnboundedReceiver<WorkerCommand>,
    ) {
        let job_id = job.id;
        self.set_state(WorkerState::Claiming, Some(job_id));

        let record = match self.claims.claim(job_id).await {
            ClaimOutcome::Claimed(record) => record,
            ClaimOutcome::LostRace => {
                let _ = self.events.send(WorkerEvent::ClaimLost { job_id });
                return;
            }
            ClaimOutcome::StoreError(e) => {
                emit_diagnostic(
                    &self.events,
                    DiagnosticSource::Claim,
                    Some(job_id),
                    format!("Failed to claim job: {e}"),
                );
                return;
            }
        };

        info!(job_id = %job_id, kind = %record.kind(), priority = record.priority, "Job started");
        let _ = self.events.send(WorkerEvent::JobStarted {
            job_id,
            kind: record.kind(),
        });

        let result = match record.payload {
            JobPayload::Terminate => {
                self.handled_terminates.insert(job_id);
                self.signal_current(job_id);
                Ok(())
            }
            JobPayload::Run(payload) => self.execute(job_id, payload, commands).await,
        };

        self.finalize(job_id, result).await;
    }

    async fn execute(
        &mut self,
        job_id: Uuid,
        payload: RunPayload,
        commands: &mut mpsc::UnboundedReceiver<WorkerCommand>,
    ) -> Result<(), ExecError> {
        let control = Arc::new(ExecutionControl::new());
        self.current = Some(RunningJob {
            id: job_id,
            control: Arc::clone(&control),
        });
        self.set_state(WorkerState::Executing, Some(job_id));

        let run = dispatch(
            Arc::clone(&self.registry),
            self.executor.clone(),
            self.config.default_timeout,
            payload,
            control,
        );
        tokio::pin!(run);

        let mut commands_open = true;
        let result = loop {
            tokio::select! {
                result = &mut run => break result,
                command = commands.recv(), if commands_open => match command {
                    Some(command) => self.handle_command(command),
                    None => commands_open = false,
                },
            }
        };

        self.current = None;
        result
    }

    async fn finalize(&mut self, job_id: Uuid, result: Result<(), ExecError>) {
        self.set_state(WorkerState::Finalizing, Some(job_id));

        let (status, error_message) = match result {
            Ok(()) => (JobStatus::Completed, None),
            Err(e) => (e.terminal_status(), Some(e.to_string())),
        };

        match status {
            JobStatus::Completed => info!(job_id = %job_id, "Job completed"),
            _ => warn!(
                job_id = %job_id,
                status = %status,
                error = error_message.as_deref().unwrap_or_default(),
                "Job did not complete"
            ),
        }

        match self
            .store
            .finish_job(job_id, status, error_message.as_deref())
            .await
        {
            Ok(true) => {}
            Ok(false) => emit_diagnostic(
                &self.events,
                DiagnosticSource::Finalize,
                Some(job_id),
                format!("Terminal write for {status} matched no running job"),
            ),
            Err(e) => emit_diagnostic(
                &self.events,
                DiagnosticSource::Finalize,
                Some(job_id),
                format!("Failed to record terminal status {status}: {e}"),
            ),
        }

        let _ = self.events.send(WorkerEvent::JobFinished {
            job_id,
            status,
            error_message,
        });
    }

    fn set_state(&mut self, state: WorkerState, job_id: Option<Uuid>) {
        if self.last_state == (state, job_id) {
            return;
        }
        self.last_state = (state, job_id);
        self.state.send_replace(state);
        let _ = self.events.send(WorkerEvent::StateChanged { state, job_id });
    }
}

/// Run one `run` payload to completion. Owns everything it touches so the
/// worker can keep handling commands while it is pending.
async fn dispatch(
    registry: Arc<ProviderRegistry>,
    executor: ProcessExecutor,
    default_timeout: Option<Duration>,
    payload: RunPayload,
    control: Arc<ExecutionControl>,
) -> Result<(), ExecError> {
    let timeout = payload
        .timeout_ms
        .filter(|ms| *ms > 0)
        .map(Duration::from_millis)
        .or(default_timeout);

    let provider = payload.provider.filter(|p| !p.trim().is_empty());
    let code = match provider {
        Some(name) => {
            let provider = registry.resolve(&name)?;
            let request = ProviderRequest {
                args: payload.args,
                cwd: payload.cwd,
                env: payload.env,
                interactive: payload.interactive,
                timeout,
            };
            provider.run(request, &control).await?
        }
        None => {
            let program = payload
                .cmd
                .filter(|c| !c.trim().is_empty())
                .ok_or(ExecError::MissingCommand)?;
            let spec = ProcessSpec {
                program,
                args: payload.args,
                env: payload.env,
                cwd: payload.cwd,
                interactive: payload.interactive,
                timeout,
            };
            executor.run(&spec, &control).await?
        }
    };

    match code {
        0 => Ok(()),
        code => Err(ExecError::NonZeroExit { code }),
    }
}

/// Owner-side handle to a running worker.
pub struct WorkerHandle {
    commands: mpsc::UnboundedSender<WorkerCommand>,
    events: broadcast::Sender<WorkerEvent>,
    state: watch::Receiver<WorkerState>,
    task: JoinHandle<()>,
    listener: JoinHandle<()>,
}

impl WorkerHandle {
    /// Lifecycle and diagnostic events from now on.
    pub fn subscribe_events(&self) -> broadcast::Receiver<WorkerEvent> {
        self.events.subscribe()
    }

    pub fn state(&self) -> WorkerState {
        *self.state.borrow()
    }

    /// Watch channel following the worker's state.
    pub fn state_watch(&self) -> watch::Receiver<WorkerState> {
        self.state.clone()
    }

    /// Finish the current job, then exit.
    pub fn stop(&self) {
        let _ = self.commands.send(WorkerCommand::Stop {
            cancel_current: false,
        });
    }

    /// Cancel the current job, then exit.
    pub fn shutdown(&self) {
        let _ = self.commands.send(WorkerCommand::Stop {
            cancel_current: true,
        });
    }

    /// Wait for the worker loop to exit. The listener is stopped with it.
    pub async fn join(self) {
        if let Err(e) = self.task.await {
            warn!(error = %e, "Worker task ended abnormally");
        }
        self.listener.abort();
    }
}

#[cfg(all(test, unix))]
mod tests {
    use std::sync::atomic::{AtomicUsize, Ordering};
    use std::time::Instant;

    use async_trait::async_trait;

    use super::*;
    use crate::error::DatabaseError;
    use crate::store::LibSqlBackend;

    async fn memory_store() -> Arc<dyn JobStore> {
        Arc::new(LibSqlBackend::new_memory().await.unwrap())
    }

    async fn wait_for_terminal(store: &Arc<dyn JobStore>, id: Uuid) -> JobRecord {
        let deadline = Instant::now() + Duration::from_secs(5);
        loop {
            let job = store.get_job(id).await.unwrap().unwrap();
            if job.status.is_terminal() {
                return job;
            }
            assert!(Instant::now() < deadline, "job {id} still {}", job.status);
            tokio::time::sleep(Duration::from_millis(20)).await;
        }
    }

    #[test]
    fn handled_terminates_are_bounded() {
        let mut handled = HandledTerminates::new(2);
        let (a, b, c) = (Uuid::new_v4(), Uuid::new_v4(), Uuid::new_v4());

        assert!(handled.insert(a));
        assert!(!handled.insert(a));
        assert!(handled.insert(b));
        assert!(handled.insert(c));
        assert_eq!(handled.len(), 2);

        // `a` was evicted; `b` and `c` are still deduplicated.
        assert!(!handled.insert(b));
        assert!(!handled.insert(c));
        assert!(handled.insert(a));
    }

    #[tokio::test]
    async fn runs_a_command_to_completion() {
        let store = memory_store().await;
        let job = JobRecord::run(RunPayload::command("true", Vec::<String>::new()));
        store.insert_job(&job).await.unwrap();

        let handle = Worker::spawn(WorkerConfig::default(), Arc::clone(&store), ProviderRegistry::default());
        let done = wait_for_terminal(&store, job.id).await;
        assert_eq!(done.status, JobStatus::Completed);
        assert!(done.error_message.is_none());
        assert!(done.finished_at.is_some());

        handle.stop();
        handle.join().await;
    }

    #[tokio::test]
    async fn emits_lifecycle_events() {
        let store = memory_store().await;
        let handle = Worker::spawn(WorkerConfig::default(), Arc::clone(&store), ProviderRegistry::default());
        let mut events = handle.subscribe_events();

        let job = JobRecord::run(RunPayload::command("sh", ["-c", "exit 2"]));
        store.insert_job(&job).await.unwrap();

        let finished = tokio::time::timeout(Duration::from_secs(5), async {
            loop {
                if let Ok(WorkerEvent::JobFinished { job_id, status, error_message }) =
                    events.recv().await
                {
                    return (job_id, status, error_message);
                }
            }
        })
        .await
        .unwrap();

        assert_eq!(finished.0, job.id);
        assert_eq!(finished.1, JobStatus::Failed);
        assert!(finished.2.unwrap().contains('2'));

        handle.stop();
        handle.join().await;
    }

    #[tokio::test]
    async fn default_timeout_applies_when_job_sets_none() {
        let store = memory_store().await;
        let job = JobRecord::run(RunPayload::command("sleep", ["5"]));
        store.insert_job(&job).await.unwrap();

        let config = WorkerConfig {
            default_timeout: Some(Duration::from_millis(200)),
            ..WorkerConfig::default()
        };
        let handle = Worker::spawn(config, Arc::clone(&store), ProviderRegistry::default());

        let done = wait_for_terminal(&store, job.id).await;
        assert_eq!(done.status, JobStatus::Cancelled);
        assert!(done.error_message.unwrap().contains("timed out"));

        handle.stop();
        handle.join().await;
    }

    #[tokio::test]
    async fn terminate_without_running_job_completes() {
        let store = memory_store().await;
        let terminate = JobRecord::terminate();
        store.insert_job(&terminate).await.unwrap();

        let handle = Worker::spawn(WorkerConfig::default(), Arc::clone(&store), ProviderRegistry::default());
        let done = wait_for_terminal(&store, terminate.id).await;
        assert_eq!(done.status, JobStatus::Completed);

        handle.stop();
        handle.join().await;
    }

    #[tokio::test]
    async fn shutdown_cancels_running_job() {
        let store = memory_store().await;
        let job = JobRecord::run(RunPayload::command("sleep", ["5"]));
        store.insert_job(&job).await.unwrap();

        let handle = Worker::spawn(WorkerConfig::default(), Arc::clone(&store), ProviderRegistry::default());
        let mut state = handle.state_watch();
        tokio::time::timeout(
            Duration::from_secs(5),
            state.wait_for(|s| *s == WorkerState::Executing),
        )
        .await
        .unwrap()
        .unwrap();
        // Give the executor a moment to attach the child.
        tokio::time::sleep(Duration::from_millis(100)).await;

        let start = Instant::now();
        handle.shutdown();
        handle.join().await;
        assert!(start.elapsed() < Duration::from_secs(2));

        let done = store.get_job(job.id).await.unwrap().unwrap();
        assert_eq!(done.status, JobStatus::Cancelled);
        assert!(done.error_message.unwrap().contains("shutting down"));
    }

    #[tokio::test]
    async fn stop_leaves_queued_jobs_untouched() {
        let store = memory_store().await;
        let handle = Worker::spawn(WorkerConfig::default(), Arc::clone(&store), ProviderRegistry::default());
        handle.stop();
        handle.join().await;

        let job = JobRecord::run(RunPayload::command("true", Vec::<String>::new()));
        store.insert_job(&job).await.unwrap();
        tokio::time::sleep(Duration::from_millis(100)).await;

        let still = store.get_job(job.id).await.unwrap().unwrap();
        assert_eq!(still.status, JobStatus::Queued);
    }

    /// libSQL store whose first N claims and first M terminal writes fail.
    struct FlakyStore {
        inner: LibSqlBackend,
        claim_failures: AtomicUsize,
        finish_failures: AtomicUsize,
    }

    fn take_failure(remaining: &AtomicUsize) -> bool {
        remaining
            .fetch_update(Ordering::SeqCst, Ordering::SeqCst, |n| n.checked_sub(1))
            .is_ok()
    }

    #[async_trait]
    impl JobStore for FlakyStore {
        async fn run_migrations(&self) -> Result<(), DatabaseError> {
            self.inner.run_migrations().await
        }
        async fn insert_job(&self, job: &JobRecord) -> Result<(), DatabaseError> {
            self.inner.insert_job(job).await
        }
        async fn get_job(&self, id: Uuid) -> Result<Option<JobRecord>, DatabaseError> {
            self.inner.get_job(id).await
        }
        async fn claim_job(&self, id: Uuid) -> Result<Option<JobRecord>, DatabaseError> {
            if take_failure(&self.claim_failures) {
                return Err(DatabaseError::Query("claim_job: database is locked".into()));
            }
            self.inner.claim_job(id).await
        }
        async fn finish_job(
            &self,
            id: Uuid,
            status: JobStatus,
            error_message: Option<&str>,
        ) -> Result<bool, DatabaseError> {
            if take_failure(&self.finish_failures) {
                return Err(DatabaseError::Query("finish_job: database is locked".into()));
            }
            self.inner.finish_job(id, status, error_message).await
        }
        async fn list_queued(&self, owner: Option<&str>) -> Result<Vec<JobRecord>, DatabaseError> {
            self.inner.list_queued(owner).await
        }
        fn subscribe(&self) -> broadcast::Receiver<JobRecord> {
            self.inner.subscribe()
        }
    }

    #[tokio::test]
    async fn store_failures_do_not_stop_the_loop() {
        let store: Arc<dyn JobStore> = Arc::new(FlakyStore {
            inner: LibSqlBackend::new_memory().await.unwrap(),
            claim_failures: AtomicUsize::new(1),
            finish_failures: AtomicUsize::new(1),
        });
        let unclaimed = JobRecord::run(RunPayload::command("true", Vec::<String>::new())).with_priority(3);
        let unrecorded = JobRecord::run(RunPayload::command("true", Vec::<String>::new())).with_priority(2);
        let last = JobRecord::run(RunPayload::command("true", Vec::<String>::new())).with_priority(1);
        for job in [&unclaimed, &unrecorded, &last] {
            store.insert_job(job).await.unwrap();
        }

        let handle = Worker::spawn(WorkerConfig::default(), Arc::clone(&store), ProviderRegistry::default());
        let mut events = handle.subscribe_events();

        let done = wait_for_terminal(&store, last.id).await;
        assert_eq!(done.status, JobStatus::Completed);

        // Claim failure: not retried, the record stays queued.
        let unclaimed = store.get_job(unclaimed.id).await.unwrap().unwrap();
        assert_eq!(unclaimed.status, JobStatus::Queued);
        // Terminal write failure: the job is abandoned as running.
        let unrecorded_now = store.get_job(unrecorded.id).await.unwrap().unwrap();
        assert_eq!(unrecorded_now.status, JobStatus::Running);

        let mut diagnostics = Vec::new();
        while let Ok(event) = events.try_recv() {
            if let WorkerEvent::Diagnostic { source, job_id, .. } = event {
                diagnostics.push((source, job_id));
            }
        }
        assert!(diagnostics.contains(&(DiagnosticSource::Claim, Some(unclaimed.id))));
        assert!(diagnostics.contains(&(DiagnosticSource::Finalize, Some(unrecorded.id))));

        handle.stop();
        handle.join().await;
    }
}
