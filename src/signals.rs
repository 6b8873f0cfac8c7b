/// Shutdown coordination and OS signal handling.
///
/// SIGINT (Ctrl-C) and SIGTERM shut the relay down.
/// SIGHUP restarts the transcoder without touching the listener.
use crate::supervisor::{ProcessSupervisor, StartOutcome};
use std::sync::Arc;
use tokio::signal::unix::{signal, Signal, SignalKind};
use tokio::sync::watch;

/// Why the relay is shutting down.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum ShutdownReason {
    /// SIGINT or SIGTERM received.
    Signal,
    /// The transcoder could not be launched.
    LaunchFailure,
}

/// Cloneable handle shared by every long-running task.
///
/// The first `trigger` wins; later reasons are ignored.
#[derive(Debug, Clone)]
pub struct Shutdown {
    tx: Arc<watch::Sender<Option<ShutdownReason>>>,
}

impl Shutdown {
    pub fn new() -> Self {
        let (tx, _rx) = watch::channel(None);
        Self { tx: Arc::new(tx) }
    }

    /// Request shutdown. Returns `true` if this call set the reason.
    pub fn trigger(&self, reason: ShutdownReason) -> bool {
        let won = self.tx.send_if_modified(|current| {
            if current.is_none() {
                *current = Some(reason);
                true
            } else {
                false
            }
        });
        if won {
            tracing::info!(?reason, "shutdown requested");
        }
        won
    }

    pub fn reason(&self) -> Option<ShutdownReason> {
        *self.tx.borrow()
    }

    #[cfg(test)]
    pub fn is_triggered(&self) -> bool {
        self.reason().is_some()
    }

    /// Resolve once shutdown has been triggered.
    pub async fn wait(&self) -> ShutdownReason {
        let mut rx = self.tx.subscribe();
        loop {
            if let Some(reason) = *rx.borrow_and_update() {
                return reason;
            }
            // The sender lives as long as `self`, so this only fails if
            // the channel is torn down underneath us.
            if rx.changed().await.is_err() {
                return ShutdownReason::Signal;
            }
        }
    }
}

impl Default for Shutdown {
    fn default() -> Self {
        Self::new()
    }
}

/// Process signal streams, registered up front so no signal is missed
/// between startup and the first `run` poll.
pub struct SignalHandler {
    sigterm: Signal,
    sighup: Signal,
}

impl SignalHandler {
    /// Register SIGTERM and SIGHUP. Must be called inside a tokio runtime.
    pub fn install() -> Result<Self, std::io::Error> {
        Ok(Self {
            sigterm: signal(SignalKind::terminate())?,
            sighup: signal(SignalKind::hangup())?,
        })
    }

    /// Handle signals until shutdown.
    pub async fn run(
        mut self,
        shutdown: Shutdown,
        supervisor: Arc<ProcessSupervisor>,
    ) -> Result<(), std::io::Error> {
        loop {
            tokio::select! {
                _ = shutdown.wait() => return Ok(()),
                res = tokio::signal::ctrl_c() => {
                    res?;
                    tracing::info!("received SIGINT");
                    shutdown.trigger(ShutdownReason::Signal);
                }
                _ = self.sigterm.recv() => {
                    tracing::info!("received SIGTERM");
                    shutdown.trigger(ShutdownReason::Signal);
                }
                _ = self.sighup.recv() => {
                    tracing::info!("received SIGHUP, restarting transcoder");
                    match supervisor.restart().await {
                        Ok(StartOutcome::Started { pid }) => tracing::info!(pid, "transcoder restarted"),
                        Ok(StartOutcome::AlreadyRunning) => {}
                        Err(e) => tracing::error!(error = %e, "restart failed"),
                    }
                }
            }
        }
    }
}
