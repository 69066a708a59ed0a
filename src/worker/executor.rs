//! Process executor: runs one child process per job.
//!
//! Provides:
//! - `$NAME` argument substitution against the merged environment
//! - stdout/stderr relay (or inherited stdio for interactive jobs)
//! - timeout enforcement with SIGTERM → grace window → SIGKILL escalation
//! - an `ExecutionControl` handle so the worker can signal the child directly

use std::collections::{BTreeMap, HashMap};
use std::path::PathBuf;
use std::process::{ExitStatus, Stdio};
use std::sync::atomic::{AtomicBool, AtomicI32, AtomicU64, Ordering};
use std::sync::{Arc, Mutex};
use std::time::Duration;

use tokio::io::{AsyncBufReadExt, AsyncRead, AsyncWrite, AsyncWriteExt, BufReader};
use tokio::process::{Child, Command};
use tokio::sync::Notify;
use tokio::task::JoinHandle;
use tracing::{debug, info, warn};

use crate::config::DEFAULT_KILL_GRACE;
use crate::error::ExecError;
use crate::worker::args::{display_command, substitute_all};

/// After the child is gone, a relay that makes no progress for this long is
/// assumed to be held open by a grandchild that inherited the pipe.
const RELAY_DRAIN: Duration = Duration::from_millis(250);

/// Upper bound on relaying after the child is gone, even with progress.
const RELAY_DRAIN_MAX: Duration = Duration::from_secs(10);

/// Everything needed to spawn one process.
#[derive(Debug, Clone, Default)]
pub struct ProcessSpec {
    pub program: String,
    /// Raw arguments; placeholders are resolved at spawn time.
    pub args: Vec<String>,
    /// Overlaid onto the worker's environment.
    pub env: BTreeMap<String, String>,
    pub cwd: Option<PathBuf>,
    pub interactive: bool,
    /// None (or zero) means no timeout.
    pub timeout: Option<Duration>,
}

impl ProcessSpec {
    pub fn new(program: impl Into<String>, args: Vec<String>) -> Self {
        Self {
            program: program.into(),
            args,
            ..Self::default()
        }
    }
}

/// Shared handle to the child of the job currently executing.
///
/// The worker loop holds one per running job and calls [`terminate`] to
/// stop it early; the executor reacts by escalating to a forceful kill if
/// the child ignores the graceful signal.
///
/// [`terminate`]: ExecutionControl::terminate
#[derive(Debug, Default)]
pub struct ExecutionControl {
    /// Signal target: `-pgid` for a child in its own process group, `pid`
    /// otherwise, 0 when nothing is running.
    target: AtomicI32,
    reason: Mutex<Option<String>>,
    notify: Notify,
}

impl ExecutionControl {
    pub fn new() -> Self {
        Self::default()
    }

    /// Request cancellation. Signals the child right away if one is running.
    /// Only the first reason is kept.
    pub fn terminate(&self, reason: impl Into<String>) {
        {
            let mut slot = self.reason.lock().unwrap_or_else(|e| e.into_inner());
            if slot.is_none() {
                *slot = Some(reason.into());
            }
        }
        let target = self.target.load(Ordering::SeqCst);
        if target != 0 {
            send_signal(target, false);
        }
        self.notify.notify_one();
    }

    pub fn is_cancelled(&self) -> bool {
        self.reason().is_some()
    }

    pub fn reason(&self) -> Option<String> {
        self.reason.lock().unwrap_or_else(|e| e.into_inner()).clone()
    }

    /// Whether a child process is currently attached.
    pub fn has_child(&self) -> bool {
        self.target.load(Ordering::SeqCst) != 0
    }

    fn attach(&self, target: i32) {
        self.target.store(target, Ordering::SeqCst);
    }

    fn detach(&self) {
        self.target.store(0, Ordering::SeqCst);
    }

    async fn cancelled(&self) {
        loop {
            let notified = self.notify.notified();
            if self.is_cancelled() {
                return;
            }
            notified.await;
        }
    }

    fn cancelled_error(&self) -> ExecError {
        ExecError::SignalTermination {
            reason: self.reason().unwrap_or_else(|| "cancelled".to_string()),
        }
    }
}

/// Spawns and supervises child processes.
#[derive(Debug, Clone)]
pub struct ProcessExecutor {
    kill_grace: Duration,
}

impl Default for ProcessExecutor {
    fn default() -> Self {
        Self::new(DEFAULT_KILL_GRACE)
    }
}

impl ProcessExecutor {
    pub fn new(kill_grace: Duration) -> Self {
        Self { kill_grace }
    }

    /// Run a process to completion.
    ///
    /// Returns the exit code when the process exited on its own. Signal
    /// deaths, timeouts, and cancellations come back as
    /// [`ExecError::SignalTermination`].
    pub async fn run(&self, spec: &ProcessSpec, control: &ExecutionControl) -> Result<i32, ExecError> {
        let env = merged_env(&spec.env);
        let args = substitute_all(&spec.args, &env);
        let timeout = spec.timeout.filter(|t| !t.is_zero());

        info!(
            command = %display_command(&spec.program, &args),
            cwd = ?spec.cwd,
            timeout_ms = ?timeout.map(|t| t.as_millis()),
            interactive = spec.interactive,
            "Spawning process"
        );

        if control.is_cancelled() {
            return Err(control.cancelled_error());
        }

        let mut child = spawn(spec, &args)?;
        let pid = child.id().map(|p| p as i32).unwrap_or(0);
        let target = if spec.interactive { pid } else { -pid };
        control.attach(target);

        // A terminate that raced the spawn found no child to signal.
        if control.is_cancelled() && pid != 0 {
            send_signal(target, false);
        }

        let mut relays = Vec::new();
        if let Some(stdout) = child.stdout.take() {
            relays.push(relay(stdout, tokio::io::stdout()));
        }
        if let Some(stderr) = child.stderr.take() {
            relays.push(relay(stderr, tokio::io::stderr()));
        }

        let result = self.supervise(&mut child, target, timeout, control).await;
        control.detach();
        drain_relays(relays).await;

        match &result {
            Ok(code) => debug!(pid, code, "Process exited"),
            Err(e) => debug!(pid, error = %e, "Process did not exit cleanly"),
        }
        result
    }

    async fn supervise(
        &self,
        child: &mut Child,
        target: i32,
        timeout: Option<Duration>,
        control: &ExecutionControl,
    ) -> Result<i32, ExecError> {
        let deadline = async {
            match timeout {
                Some(t) => tokio::time::sleep(t).await,
                None => std::future::pending().await,
            }
        };

        let escalate_reason = tokio::select! {
            status = child.wait() => {
                let status = status?;
                if control.is_cancelled() {
                    return Err(control.cancelled_error());
                }
                return exit_code(status);
            }
            _ = deadline => format!(
                "timed out after {} ms",
                timeout.map(|t| t.as_millis()).unwrap_or_default()
            ),
            _ = control.cancelled() => control
                .reason()
                .unwrap_or_else(|| "cancelled".to_string()),
        };

        warn!(signal_target = target, reason = %escalate_reason, "Terminating process");
        self.escalate(child, target).await;
        Err(ExecError::SignalTermination {
            reason: escalate_reason,
        })
    }

    /// SIGTERM, wait out the grace window, then SIGKILL.
    async fn escalate(&self, child: &mut Child, target: i32) {
        if target != 0 {
            send_signal(target, false);
        }
        match tokio::time::timeout(self.kill_grace, child.wait()).await {
            Ok(_) => {}
            Err(_) => {
                warn!(
                    signal_target = target,
                    grace_ms = self.kill_grace.as_millis() as u64,
                    "Process ignored graceful termination, killing"
                );
                if target != 0 {
                    send_signal(target, true);
                }
                if let Err(e) = child.kill().await {
                    debug!(error = %e, "Kill after grace window failed");
                }
            }
        }
    }
}

/// Worker environment overlaid with the job's variables.
pub fn merged_env(overlay: &BTreeMap<String, String>) -> HashMap<String, String> {
    let mut env: HashMap<String, String> = std::env::vars().collect();
    env.extend(overlay.iter().map(|(k, v)| (k.clone(), v.clone())));
    env
}

fn spawn(spec: &ProcessSpec, args: &[String]) -> Result<Child, ExecError> {
    let mut command = Command::new(&spec.program);
    command.args(args).envs(&spec.env).kill_on_drop(true);

    if let Some(ref cwd) = spec.cwd {
        command.current_dir(cwd);
    }

    if spec.interactive {
        command
            .stdin(Stdio::inherit())
            .stdout(Stdio::inherit())
            .stderr(Stdio::inherit());
    } else {
        command
            .stdin(Stdio::null())
            .stdout(Stdio::piped())
            .stderr(Stdio::piped());
        // Own process group, so signals reach anything the child spawns.
        #[cfg(unix)]
        command.process_group(0);
    }

    command.spawn().map_err(|source| ExecError::SpawnFailure {
        program: spec.program.clone(),
        source,
    })
}

fn exit_code(status: ExitStatus) -> Result<i32, ExecError> {
    if let Some(code) = status.code() {
        return Ok(code);
    }

    #[cfg(unix)]
    {
        use std::os::unix::process::ExitStatusExt;
        if let Some(signal) = status.signal() {
            return Err(ExecError::SignalTermination {
                reason: format!("killed by signal {signal}"),
            });
        }
    }

    Err(ExecError::SignalTermination {
        reason: format!("terminated abnormally ({status})"),
    })
}

/// A running output relay and its progress counters.
struct Relay {
    handle: JoinHandle<()>,
    progress: Arc<RelayProgress>,
}

#[derive(Default)]
struct RelayProgress {
    bytes_read: AtomicU64,
    writing: AtomicBool,
}

impl Relay {
    fn bytes_read(&self) -> u64 {
        self.progress.bytes_read.load(Ordering::SeqCst)
    }

    /// Blocked on the worker's own stream rather than waiting for input.
    fn is_writing(&self) -> bool {
        self.progress.writing.load(Ordering::SeqCst)
    }
}

/// Copy lines from a child stream to one of the worker's own streams.
fn relay<R, W>(reader: R, mut writer: W) -> Relay
where
    R: AsyncRead + Unpin + Send + 'static,
    W: AsyncWrite + Unpin + Send + 'static,
{
    let progress = Arc::new(RelayProgress::default());
    let counters = Arc::clone(&progress);
    let handle = tokio::spawn(async move {
        let mut reader = BufReader::new(reader);
        let mut line = Vec::new();
        loop {
            line.clear();
            match reader.read_until(b'\n', &mut line).await {
                Ok(0) => break,
                Ok(n) => {
                    counters.bytes_read.fetch_add(n as u64, Ordering::SeqCst);
                    counters.writing.store(true, Ordering::SeqCst);
                    let written = writer.write_all(&line).await;
                    let _ = writer.flush().await;
                    counters.writing.store(false, Ordering::SeqCst);
                    if written.is_err() {
                        break;
                    }
                }
                Err(e) => {
                    debug!(error = %e, "Output relay read failed");
                    break;
                }
            }
        }
    });
    Relay { handle, progress }
}

/// Let relays finish after the child exits. A relay is aborted only when it
/// sat idle on its pipe for a whole drain window, or the overall cap passed.
async fn drain_relays(mut relays: Vec<Relay>) {
    let deadline = tokio::time::Instant::now() + RELAY_DRAIN_MAX;
    loop {
        relays.retain(|r| !r.handle.is_finished());
        if relays.is_empty() {
            return;
        }

        let before: Vec<u64> = relays.iter().map(Relay::bytes_read).collect();
        let window = futures::future::join_all(relays.iter_mut().map(|r| &mut r.handle));
        if tokio::time::timeout(RELAY_DRAIN, window).await.is_ok() {
            return;
        }

        let out_of_time = tokio::time::Instant::now() >= deadline;
        let mut remaining = Vec::with_capacity(relays.len());
        for (relay, read_before) in relays.into_iter().zip(before) {
            let stalled = !relay.is_writing() && relay.bytes_read() == read_before;
            if relay.handle.is_finished() {
                continue;
            }
            if stalled || out_of_time {
                debug!(stalled, "Abandoning output relay");
                relay.handle.abort();
            } else {
                remaining.push(relay);
            }
        }
        relays = remaining;
    }
}

#[cfg(unix)]
fn send_signal(target: i32, force: bool) {
    use nix::sys::signal::{Signal, kill};
    use nix::unistd::Pid;

    let signal = if force {
        Signal::SIGKILL
    } else {
        Signal::SIGTERM
    };
    if let Err(e) = kill(Pid::from_raw(target), signal) {
        debug!(signal_target = target, ?signal, error = %e, "Signal delivery failed");
    }
}

#[cfg(not(unix))]
fn send_signal(_target: i32, _force: bool) {}
