/// Transcoder lifecycle: spawn on demand, forward bytes to its stdin,
/// kill and reap on stop, report per-run statistics.
///
/// All state transitions (start, stop, liveness check, idle check) run under
/// one async mutex. The stdin write itself happens outside that lock, under
/// a per-run pipe lock, so a slow transcoder never stalls the watchdog.
use crate::signals::{Shutdown, ShutdownReason};
use crate::stats::RunStats;
use crate::status::{RelayState, StatusTracker};
use crate::timer::ElapsedTimer;
use nix::sys::signal::{killpg, Signal};
use nix::unistd::Pid;
use std::net::SocketAddr;
use std::path::PathBuf;
use std::process::Stdio;
use std::sync::atomic::{AtomicU64, Ordering};
use std::sync::{Arc, PoisonError};
use std::time::{Duration, Instant};
use tokio::io::AsyncWriteExt;
use tokio::process::{Child, ChildStdin, Command};
use tokio::sync::Mutex;

/// Result of `ensure_started`.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum StartOutcome {
    /// A new transcoder was launched.
    Started { pid: u32 },
    /// A live transcoder was already attached.
    AlreadyRunning,
}

/// Errors surfaced by the supervisor.
#[derive(Debug)]
pub enum SupervisorError {
    /// The transcoder could not be spawned. Fatal: shutdown has been triggered.
    Launch {
        program: String,
        source: std::io::Error,
    },
    /// No transcoder is attached.
    NotRunning,
    /// Writing to the transcoder's stdin failed; the run was discarded.
    Write { pid: u32, source: std::io::Error },
}

impl std::fmt::Display for SupervisorError {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        match self {
            SupervisorError::Launch { program, source } => {
                write!(f, "failed to launch transcoder {program:?}: {source}")
            }
            SupervisorError::NotRunning => write!(f, "transcoder is not running"),
            SupervisorError::Write { pid, source } => {
                write!(f, "failed to write to transcoder pid={pid}: {source}")
            }
        }
    }
}

impl std::error::Error for SupervisorError {
    fn source(&self) -> Option<&(dyn std::error::Error + 'static)> {
        match self {
            SupervisorError::Launch { source, .. } => Some(source),
            SupervisorError::NotRunning => None,
            SupervisorError::Write { source, .. } => Some(source),
        }
    }
}

/// The write side of one run, cloned out of the lock by `forward`.
#[derive(Clone)]
struct RunPipe {
    generation: u64,
    pid: u32,
    stdin: Arc<Mutex<ChildStdin>>,
    /// Only modified while `stdin` is locked.
    bytes: Arc<AtomicU64>,
}

struct Run {
    child: Child,
    timer: ElapsedTimer,
    pipe: RunPipe,
}

#[derive(Default)]
struct State {
    run: Option<Run>,
    generation: u64,
    status: Option<StatusTracker>,
}

pub struct ProcessSupervisor {
    command: Vec<String>,
    state: Mutex<State>,
    last_packet: std::sync::Mutex<Instant>,
    shutdown: Shutdown,
}

/// Render a peer address for logs, `<unknown>` when absent.
pub fn describe_origin(origin: Option<SocketAddr>) -> String {
    match origin {
        Some(addr) => addr.to_string(),
        None => "<unknown>".to_string(),
    }
}

impl ProcessSupervisor {
    /// `command` is program followed by its arguments.
    pub fn new(command: Vec<String>, shutdown: Shutdown) -> Self {
        Self {
            command,
            state: Mutex::new(State::default()),
            last_packet: std::sync::Mutex::new(Instant::now()),
            shutdown,
        }
    }

    /// Mirror every state transition into a JSON status file.
    pub fn with_status_file(mut self, path: PathBuf) -> Self {
        let tracker = StatusTracker::new(path);
        tracker.update(RelayState::Stopped);
        self.state.get_mut().status = Some(tracker);
        self
    }

    /// Record that a datagram just arrived.
    pub fn touch(&self) {
        *self
            .last_packet
            .lock()
            .unwrap_or_else(PoisonError::into_inner) = Instant::now();
    }

    /// Time since the last datagram (or since construction).
    pub fn idle_for(&self) -> Duration {
        self.last_packet
            .lock()
            .unwrap_or_else(PoisonError::into_inner)
            .elapsed()
    }

    /// Launch the transcoder unless one is already live.
    ///
    /// A spawn failure triggers shutdown and is returned as `Launch`.
    pub async fn ensure_started(
        &self,
        origin: Option<SocketAddr>,
    ) -> Result<StartOutcome, SupervisorError> {
        let mut state = self.state.lock().await;
        self.start_locked(&mut state, origin)
    }

    /// Non-blocking liveness check. Discards the run if the child has exited.
    pub async fn is_running(&self) -> bool {
        let mut state = self.state.lock().await;
        Self::poll_locked(&mut state)
    }

    /// Kill and reap the transcoder, returning the run's statistics.
    ///
    /// `None` if nothing was running.
    pub async fn stop(&self) -> Option<RunStats> {
        let mut state = self.state.lock().await;
        Self::stop_locked(&mut state).await
    }

    /// Stop then start again, atomically with respect to other callers.
    pub async fn restart(&self) -> Result<StartOutcome, SupervisorError> {
        let mut state = self.state.lock().await;
        Self::stop_locked(&mut state).await;
        self.start_locked(&mut state, None)
    }

    /// Stop the transcoder if no datagram arrived within `timeout`.
    pub async fn stop_if_idle(&self, timeout: Duration) -> Option<RunStats> {
        let mut state = self.state.lock().await;
        let idle = self.idle_for();
        if idle <= timeout || !Self::poll_locked(&mut state) {
            return None;
        }
        tracing::info!(
            idle_secs = idle.as_secs_f64(),
            timeout_secs = timeout.as_secs_f64(),
            "no traffic received, stopping transcoder"
        );
        Self::stop_locked(&mut state).await
    }

    /// Write `data` to the transcoder's stdin and count it.
    ///
    /// May wait on a full pipe. A broken pipe discards the run so the next
    /// `ensure_started` relaunches.
    pub async fn forward(&self, data: &[u8]) -> Result<(), SupervisorError> {
        let pipe = {
            let state = self.state.lock().await;
            match &state.run {
                Some(run) => run.pipe.clone(),
                None => return Err(SupervisorError::NotRunning),
            }
        };

        let result = {
            let mut stdin = pipe.stdin.lock().await;
            let result = stdin.write_all(data).await;
            if result.is_ok() {
                pipe.bytes.fetch_add(data.len() as u64, Ordering::Relaxed);
            }
            result
        };

        match result {
            Ok(()) => Ok(()),
            Err(e) => {
                self.discard(pipe.generation).await;
                Err(SupervisorError::Write {
                    pid: pipe.pid,
                    source: e,
                })
            }
        }
    }

    /// Bytes forwarded during the current run (0 when stopped).
    #[cfg(test)]
    pub async fn bytes_forwarded(&self) -> u64 {
        let state = self.state.lock().await;
        state
            .run
            .as_ref()
            .map(|run| run.pipe.bytes.load(Ordering::Relaxed))
            .unwrap_or(0)
    }

    /// Pid of the attached transcoder, if any.
    #[cfg(test)]
    pub async fn pid(&self) -> Option<u32> {
        let state = self.state.lock().await;
        state.run.as_ref().map(|run| run.pipe.pid)
    }

    /// Record in the status file that the relay is going away.
    pub async fn mark_shutting_down(&self) {
        let state = self.state.lock().await;
        if let Some(status) = &state.status {
            status.update(RelayState::ShuttingDown);
        }
    }

    fn start_locked(
        &self,
        state: &mut State,
        origin: Option<SocketAddr>,
    ) -> Result<StartOutcome, SupervisorError> {
        if Self::poll_locked(state) {
            return Ok(StartOutcome::AlreadyRunning);
        }

        let origin = describe_origin(origin);
        tracing::info!(%origin, "transcoder not running, starting");

        let Some((program, args)) = self.command.split_first() else {
            return Err(self.launch_failed(
                "",
                std::io::Error::new(std::io::ErrorKind::InvalidInput, "empty command line"),
            ));
        };

        let mut child = Command::new(program)
            .args(args)
            .stdin(Stdio::piped())
            .process_group(0) // New process group for clean kill
            .kill_on_drop(true)
            .spawn()
            .map_err(|e| self.launch_failed(program, e))?;

        let Some(stdin) = child.stdin.take() else {
            // Unreachable with Stdio::piped(), but never leave an orphan behind.
            let _ = child.start_kill();
            return Err(self.launch_failed(
                program,
                std::io::Error::other("transcoder stdin was not captured"),
            ));
        };

        let pid = child.id().unwrap_or(0);
        state.generation += 1;
        state.run = Some(Run {
            child,
            timer: ElapsedTimer::started(),
            pipe: RunPipe {
                generation: state.generation,
                pid,
                stdin: Arc::new(Mutex::new(stdin)),
                bytes: Arc::new(AtomicU64::new(0)),
            },
        });
        if let Some(status) = state.status.as_mut() {
            status.run_started(pid, &origin);
        }

        tracing::info!(pid, %origin, "transcoder started");
        Ok(StartOutcome::Started { pid })
    }

    fn launch_failed(&self, program: &str, source: std::io::Error) -> SupervisorError {
        tracing::error!(
            program,
            error = %source,
            "unable to start transcoder, shutting down"
        );
        self.shutdown.trigger(ShutdownReason::LaunchFailure);
        SupervisorError::Launch {
            program: program.to_string(),
            source,
        }
    }

    fn poll_locked(state: &mut State) -> bool {
        let Some(run) = state.run.as_mut() else {
            return false;
        };
        match run.child.try_wait() {
            Ok(None) => true,
            Ok(Some(status)) => {
                tracing::warn!(pid = run.pipe.pid, %status, "transcoder exited unexpectedly");
                Self::discard_exited(state);
                false
            }
            Err(e) => {
                tracing::warn!(pid = run.pipe.pid, error = %e, "transcoder liveness check failed");
                Self::discard_exited(state);
                false
            }
        }
    }

    /// Drop a run whose child has already exited. The pipe lock may still be
    /// held by a failing write, so the byte count is read without it.
    fn discard_exited(state: &mut State) {
        if let Some(mut run) = state.run.take() {
            let bytes = run.pipe.bytes.load(Ordering::Relaxed);
            Self::report(state, &mut run, bytes);
        }
    }

    async fn stop_locked(state: &mut State) -> Option<RunStats> {
        if !Self::poll_locked(state) {
            return None;
        }
        let mut run = state.run.take()?;
        let pid = run.pipe.pid;
        tracing::info!(pid, "stopping transcoder");

        let mut stop_timer = ElapsedTimer::started();
        kill_process_group(&mut run.child);
        if let Err(e) = run.child.wait().await {
            tracing::warn!(pid, error = %e, "failed to reap transcoder");
        }
        // Any in-flight write fails once the child is gone; taking the pipe
        // lock waits it out so the byte count is final.
        let bytes = {
            let _stdin = run.pipe.stdin.lock().await;
            run.pipe.bytes.load(Ordering::Relaxed)
        };
        if let Some(elapsed) = stop_timer.stop() {
            tracing::debug!(
                pid,
                elapsed_secs = elapsed.as_secs_f64(),
                "time taken to stop transcoder"
            );
        }

        Some(Self::report(state, &mut run, bytes))
    }

    /// Discard the run of `generation` after its pipe broke.
    async fn discard(&self, generation: u64) {
        let mut state = self.state.lock().await;
        let current = state
            .run
            .as_ref()
            .is_some_and(|run| run.pipe.generation == generation);
        if !current {
            return;
        }
        if let Some(mut run) = state.run.take() {
            tracing::warn!(pid = run.pipe.pid, "transcoder pipe closed, discarding process");
            kill_process_group(&mut run.child);
            if let Err(e) = run.child.wait().await {
                tracing::warn!(pid = run.pipe.pid, error = %e, "failed to reap transcoder");
            }
            let bytes = run.pipe.bytes.load(Ordering::Relaxed);
            Self::report(&mut state, &mut run, bytes);
        }
    }

    fn report(state: &mut State, run: &mut Run, bytes: u64) -> RunStats {
        let elapsed = run.timer.stop().unwrap_or_default();
        let stats = RunStats { elapsed, bytes };
        tracing::info!(
            pid = run.pipe.pid,
            runtime_secs = elapsed.as_secs_f64(),
            bytes,
            rate_bytes_per_sec = stats.rate(),
            "transcoder run stats: {stats}"
        );
        if let Some(status) = state.status.as_mut() {
            status.run_ended(bytes);
        }
        stats
    }
}

/// SIGKILL the child's process group, falling back to the child alone.
fn kill_process_group(child: &mut Child) {
    // `id()` is None once the child has been reaped; never signal a stale pid.
    let Some(pid) = child.id() else {
        return;
    };
    let group = i32::try_from(pid).ok().filter(|p| *p > 0);
    let killed = match group {
        Some(pgid) => killpg(Pid::from_raw(pgid), Signal::SIGKILL)
            .map_err(|e| tracing::debug!(pid, error = %e, "killpg failed"))
            .is_ok(),
        None => false,
    };
    if !killed {
        if let Err(e) = child.start_kill() {
            tracing::debug!(pid, error = %e, "kill failed");
        }
    }
}
