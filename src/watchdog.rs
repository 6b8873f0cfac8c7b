/// Idle monitor for the transcoder.
///
/// Runs alongside the relay, periodically checking the last-packet timestamp.
/// If no datagram arrived for `timeout` and the transcoder is alive, stops it.
/// Never starts a process; only the packet path does that.
use crate::signals::Shutdown;
use crate::stats::RunStats;
use crate::supervisor::ProcessSupervisor;
use std::sync::Arc;
use std::time::Duration;

/// Result of a single watchdog check.
#[derive(Debug, Clone, PartialEq)]
pub enum WatchdogOutcome {
    /// Traffic is recent, or nothing is running.
    Quiet,
    /// The transcoder was idle past the timeout and has been stopped.
    Stopped(RunStats),
}

pub struct IdleWatchdog {
    supervisor: Arc<ProcessSupervisor>,
    timeout: Duration,
}

/// Sleep between checks: `max(1s, timeout/2 - 1s)`, roughly two checks per window.
pub fn check_interval(timeout: Duration) -> Duration {
    let secs = (timeout.as_secs_f64() / 2.0 - 1.0).max(1.0);
    Duration::from_secs_f64(secs)
}

impl IdleWatchdog {
    pub fn new(supervisor: Arc<ProcessSupervisor>, timeout: Duration) -> Self {
        Self {
            supervisor,
            timeout,
        }
    }

    pub fn interval(&self) -> Duration {
        check_interval(self.timeout)
    }

    /// Stop the transcoder if it has been idle past the timeout.
    pub async fn check(&self) -> WatchdogOutcome {
        match self.supervisor.stop_if_idle(self.timeout).await {
            Some(stats) => WatchdogOutcome::Stopped(stats),
            None => {
                tracing::trace!(
                    idle_secs = self.supervisor.idle_for().as_secs_f64(),
                    "watchdog check"
                );
                WatchdogOutcome::Quiet
            }
        }
    }

    /// Sleep, check, repeat until shutdown.
    pub async fn run(self, shutdown: Shutdown) {
        let interval = self.interval();
        tracing::debug!(
            timeout_secs = self.timeout.as_secs_f64(),
            interval_secs = interval.as_secs_f64(),
            "watchdog started"
        );
        loop {
            tokio::select! {
                _ = shutdown.wait() => {
                    tracing::debug!("watchdog stopping");
                    return;
                }
                _ = tokio::time::sleep(interval) => {}
            }
            if let WatchdogOutcome::Stopped(stats) = self.check().await {
                tracing::debug!(bytes = stats.bytes, "watchdog stopped idle transcoder");
            }
        }
    }
}
