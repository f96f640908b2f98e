//! Supervision of the managed HAProxy process.
//!
//! One task owns the worker and drives it through
//!
//! ```text
//! NotRunning -> Starting -> Running -> Exited -> Starting -> ...
//! ```
//!
//! until shutdown. Whatever the exit reason, the worker is started again
//! (after the restart backoff). On shutdown the worker is killed and reaped
//! and the loop ends without restarting.
//!
//! The running worker's pid is published through a `WorkerSlot` so the config
//! reconciler can send it a reload signal. Reads are lock-free and may see a
//! worker that has just exited; signalling such a worker fails with `ESRCH`,
//! which is reported as `ReloadOutcome::Vanished` rather than an error.

use std::ffi::OsString;
use std::path::PathBuf;
use std::process::Stdio;
use std::sync::atomic::{AtomicU64, Ordering};
use std::sync::Arc;
use std::time::{Duration, Instant};

use arc_swap::ArcSwapOption;
use hctg_reconcile::{wait_for_shutdown, Backoff, BackoffPolicy};
use nix::errno::Errno;
use nix::sys::signal::{kill, Signal};
use nix::unistd::Pid;
use thiserror::Error;
use tokio::process::{Child, Command};
use tokio::sync::watch;
use tracing::{debug, error, info, warn};

/// Signal asking the worker to reload its configuration.
pub const RELOAD_SIGNAL: Signal = Signal::SIGHUP;

/// Supervisor errors.
#[derive(Debug, Error)]
pub enum SupervisorError {
    /// Delivering a signal to the worker failed.
    #[error("signalling worker pid {pid} failed: {source}")]
    Signal {
        pid: u32,
        #[source]
        source: Errno,
    },
}

/// Lifecycle states of the worker slot.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum WorkerState {
    NotRunning,
    Starting,
    Running { pid: u32 },
    Exited,
}

/// Handle to a running worker process.
#[derive(Debug)]
pub struct WorkerHandle {
    pid: u32,
    started_at: Instant,
}

impl WorkerHandle {
    /// OS process id.
    pub fn pid(&self) -> u32 {
        self.pid
    }

    /// How long the worker has been running.
    pub fn uptime(&self) -> Duration {
        self.started_at.elapsed()
    }
}

/// Result of a reload request.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum ReloadOutcome {
    /// The signal was delivered.
    Signalled { pid: u32 },

    /// No worker is running; nothing to reload.
    NotRunning,

    /// The published worker was already gone.
    Vanished { pid: u32 },
}

#[derive(Debug, Default)]
struct SlotInner {
    handle: ArcSwapOption<WorkerHandle>,
    launches: AtomicU64,
}

/// Shared view of the currently running worker.
///
/// Written only by the supervisor task; read by anyone holding a clone.
#[derive(Debug, Clone, Default)]
pub struct WorkerSlot(Arc<SlotInner>);

impl WorkerSlot {
    /// Create an empty slot.
    pub fn new() -> Self {
        Self::default()
    }

    /// The currently published worker, if any.
    pub fn current(&self) -> Option<Arc<WorkerHandle>> {
        self.0.handle.load_full()
    }

    /// Number of launch attempts so far.
    pub fn launches(&self) -> u64 {
        self.0.launches.load(Ordering::SeqCst)
    }

    /// Send the reload signal to the current worker.
    pub fn reload(&self) -> Result<ReloadOutcome, SupervisorError> {
        let Some(handle) = self.current() else {
            return Ok(ReloadOutcome::NotRunning);
        };

        match send_signal(handle.pid, RELOAD_SIGNAL) {
            Ok(()) => Ok(ReloadOutcome::Signalled { pid: handle.pid }),
            Err(Errno::ESRCH) => Ok(ReloadOutcome::Vanished { pid: handle.pid }),
            Err(source) => Err(SupervisorError::Signal {
                pid: handle.pid,
                source,
            }),
        }
    }

    pub(crate) fn publish(&self, pid: u32) {
        self.0.handle.store(Some(Arc::new(WorkerHandle {
            pid,
            started_at: Instant::now(),
        })));
    }

    fn clear(&self) {
        self.0.handle.store(None);
    }

    fn record_launch(&self) {
        self.0.launches.fetch_add(1, Ordering::SeqCst);
    }
}

fn send_signal(pid: u32, signal: Signal) -> Result<(), Errno> {
    let pid = i32::try_from(pid).map_err(|_| Errno::ESRCH)?;
    kill(Pid::from_raw(pid), signal)
}

/// Program and arguments of the worker.
#[derive(Debug, Clone)]
pub struct WorkerCommand {
    pub program: PathBuf,
    pub args: Vec<OsString>,
}

impl WorkerCommand {
    pub fn new(program: impl Into<PathBuf>) -> Self {
        Self {
            program: program.into(),
            args: Vec::new(),
        }
    }

    pub fn arg(mut self, arg: impl Into<OsString>) -> Self {
        self.args.push(arg.into());
        self
    }

    fn spawn(&self) -> std::io::Result<Child> {
        Command::new(&self.program)
            .args(&self.args)
            .stdin(Stdio::null())
            .stdout(Stdio::inherit())
            .stderr(Stdio::inherit())
            .kill_on_drop(true)
            .spawn()
    }
}

/// Restart behaviour of the supervisor.
#[derive(Debug, Clone)]
pub struct RestartPolicy {
    /// Delay between restarts. `BackoffPolicy::none()` restarts immediately.
    pub backoff: BackoffPolicy,

    /// A run lasting at least this long resets the backoff.
    pub reset_after: Duration,
}

impl Default for RestartPolicy {
    fn default() -> Self {
        Self {
            backoff: BackoffPolicy::default(),
            reset_after: Duration::from_secs(10),
        }
    }
}

/// Keeps exactly one worker process running.
pub struct ProcessSupervisor {
    command: WorkerCommand,
    slot: WorkerSlot,
    policy: RestartPolicy,
}

impl ProcessSupervisor {
    pub fn new(command: WorkerCommand, slot: WorkerSlot, policy: RestartPolicy) -> Self {
        Self {
            command,
            slot,
            policy,
        }
    }

    /// Run the supervision loop until shutdown.
    pub async fn run(self, mut shutdown: watch::Receiver<bool>) {
        let program = self.command.program.display().to_string();
        debug!(program = %program, "Starting running worker");

        let mut backoff = Backoff::new(self.policy.backoff.clone());
        let mut state = WorkerState::NotRunning;

        while !*shutdown.borrow() {
            transition(&mut state, WorkerState::Starting);
            self.slot.record_launch();

            let mut child = match self.command.spawn() {
                Ok(child) => child,
                Err(e) => {
                    error!(program = %program, error = %e, "Starting worker failed");
                    transition(&mut state, WorkerState::Exited);
                    if !pause(&mut backoff, &mut shutdown).await {
                        break;
                    }
                    continue;
                }
            };

            let Some(pid) = child.id() else {
                // Already reaped; treat like an immediate exit.
                warn!(program = %program, "Worker exited before it could be observed");
                transition(&mut state, WorkerState::Exited);
                if !pause(&mut backoff, &mut shutdown).await {
                    break;
                }
                continue;
            };

            let started = Instant::now();
            self.slot.publish(pid);
            transition(&mut state, WorkerState::Running { pid });
            info!(program = %program, pid, "Started worker");

            let exit = tokio::select! {
                status = child.wait() => Some(status),
                _ = wait_for_shutdown(&mut shutdown) => None,
            };

            // Once reaped the pid may be reused; unpublish before anything else.
            self.slot.clear();

            match exit {
                Some(Ok(status)) if status.success() => {
                    info!(pid, "Worker exited");
                }
                Some(Ok(status)) => {
                    error!(pid, status = %status, "Worker failed");
                }
                Some(Err(e)) => {
                    error!(pid, error = %e, "Waiting for worker failed");
                }
                None => {
                    info!(pid, "Stopping worker");
                    if let Err(e) = child.kill().await {
                        warn!(pid, error = %e, "Killing worker failed");
                    }
                    transition(&mut state, WorkerState::Exited);
                    break;
                }
            }

            transition(&mut state, WorkerState::Exited);

            if started.elapsed() >= self.policy.reset_after {
                backoff.reset();
            }
            if !pause(&mut backoff, &mut shutdown).await {
                break;
            }
        }

        transition(&mut state, WorkerState::NotRunning);
        debug!(program = %program, "Stopped running worker");
    }
}

fn transition(state: &mut WorkerState, next: WorkerState) {
    debug!(from = ?*state, to = ?next, "Worker state");
    *state = next;
}

/// Wait out the restart delay. Returns false if shutdown arrived first.
async fn pause(backoff: &mut Backoff, shutdown: &mut watch::Receiver<bool>) -> bool {
    let delay = backoff.next_delay();
    if delay.is_zero() {
        return !*shutdown.borrow();
    }

    debug!(delay_ms = delay.as_millis() as u64, "Delaying worker restart");
    tokio::select! {
        biased;
        _ = wait_for_shutdown(shutdown) => false,
        _ = tokio::time::sleep(delay) => true,
    }
}
