/// UDP listener feeding the supervised transcoder.
///
/// Datagrams are handled one at a time, so bytes reach the transcoder in
/// arrival order. Per-datagram failures are logged and dropped; only a
/// launch failure (or an external shutdown) ends the loop.
use crate::signals::Shutdown;
use crate::supervisor::{ProcessSupervisor, SupervisorError};
use socket2::{Domain, Protocol, Socket, Type};
use std::net::SocketAddr;
use std::sync::Arc;
use std::time::Duration;
use tokio::net::UdpSocket;

/// Maximum UDP payload we accept.
const MAX_DATAGRAM_SIZE: usize = 65535;

/// Errors that end the relay.
#[derive(Debug)]
pub enum RelayError {
    /// The listen address did not resolve.
    Resolve {
        addr: String,
        source: std::io::Error,
    },
    /// The UDP socket could not be created or bound.
    Bind {
        addr: SocketAddr,
        source: std::io::Error,
    },
    /// The transcoder could not be launched; shutdown is in progress.
    Launch(SupervisorError),
    /// Signal handlers could not be registered.
    Signals(std::io::Error),
}

impl std::fmt::Display for RelayError {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        match self {
            RelayError::Resolve { addr, source } => {
                write!(f, "failed to resolve listen address {addr}: {source}")
            }
            RelayError::Bind { addr, source } => {
                write!(f, "failed to bind UDP socket on {addr}: {source}")
            }
            RelayError::Launch(e) => write!(f, "relay stopped: {e}"),
            RelayError::Signals(e) => write!(f, "failed to install signal handlers: {e}"),
        }
    }
}

impl std::error::Error for RelayError {
    fn source(&self) -> Option<&(dyn std::error::Error + 'static)> {
        match self {
            RelayError::Resolve { source, .. } => Some(source),
            RelayError::Bind { source, .. } => Some(source),
            RelayError::Launch(e) => Some(e),
            RelayError::Signals(e) => Some(e),
        }
    }
}

/// Resolve `host:port` to the first matching socket address.
pub async fn resolve(addr: &str) -> Result<SocketAddr, RelayError> {
    let mut addrs = tokio::net::lookup_host(addr)
        .await
        .map_err(|e| RelayError::Resolve {
            addr: addr.to_string(),
            source: e,
        })?;
    addrs.next().ok_or_else(|| RelayError::Resolve {
        addr: addr.to_string(),
        source: std::io::Error::new(std::io::ErrorKind::NotFound, "no addresses found"),
    })
}

pub struct PacketRelay {
    socket: UdpSocket,
    recv_buf: Vec<u8>,
}

impl PacketRelay {
    /// Bind the listener. Must be called from within a tokio runtime.
    ///
    /// `recv_buffer_bytes` sets SO_RCVBUF so bursts survive a slow start of
    /// the transcoder; the kernel may clamp it.
    pub fn bind(addr: SocketAddr, recv_buffer_bytes: Option<usize>) -> Result<Self, RelayError> {
        let bind_err = |source| RelayError::Bind { addr, source };

        let socket = Socket::new(Domain::for_address(addr), Type::DGRAM, Some(Protocol::UDP))
            .map_err(bind_err)?;
        socket.set_reuse_address(true).map_err(bind_err)?;
        if let Some(size) = recv_buffer_bytes {
            if let Err(e) = socket.set_recv_buffer_size(size) {
                tracing::warn!(size, error = %e, "failed to set UDP receive buffer size");
            }
        }
        socket.set_nonblocking(true).map_err(bind_err)?;
        socket.bind(&addr.into()).map_err(bind_err)?;

        let socket = UdpSocket::from_std(socket.into()).map_err(bind_err)?;
        Ok(Self {
            socket,
            recv_buf: vec![0u8; MAX_DATAGRAM_SIZE],
        })
    }

    pub fn local_addr(&self) -> std::io::Result<SocketAddr> {
        self.socket.local_addr()
    }

    /// Receive and forward datagrams until shutdown or a launch failure.
    pub async fn run(
        mut self,
        supervisor: Arc<ProcessSupervisor>,
        shutdown: Shutdown,
    ) -> Result<(), RelayError> {
        if let Ok(addr) = self.local_addr() {
            tracing::info!(%addr, "relay listening");
        }

        let mut recv_failures = 0u32;
        loop {
            let (len, peer) = tokio::select! {
                biased;
                reason = shutdown.wait() => {
                    tracing::info!(?reason, "relay stopping");
                    return Ok(());
                }
                res = self.socket.recv_from(&mut self.recv_buf) => match res {
                    Ok(received) => received,
                    Err(e) => {
                        recv_failures = recv_failures.saturating_add(1);
                        let delay = recv_backoff(recv_failures);
                        if recv_failures >= RECV_FAILURES_BEFORE_ERROR {
                            tracing::error!(error = %e, failures = recv_failures, "UDP receive keeps failing");
                        } else {
                            tracing::warn!(error = %e, "failed to receive datagram");
                        }
                        tokio::time::sleep(delay).await;
                        continue;
                    }
                },
            };
            recv_failures = 0;

            // A write stuck on a full pipe must not outlive shutdown; dropping
            // it releases the pipe lock so the caller can stop the transcoder.
            let handled = tokio::select! {
                biased;
                reason = shutdown.wait() => {
                    tracing::info!(?reason, %peer, "relay stopping, abandoning datagram");
                    return Ok(());
                }
                res = handle_datagram(&supervisor, &self.recv_buf[..len], peer) => res,
            };

            match handled {
                Ok(()) => {}
                Err(e @ SupervisorError::Launch { .. }) => return Err(RelayError::Launch(e)),
                Err(e) => {
                    tracing::warn!(%peer, error = %e, "error while handling datagram");
                }
            }
        }
    }
}

/// Consecutive receive failures after which they are logged as errors.
const RECV_FAILURES_BEFORE_ERROR: u32 = 10;

/// Pause after the `failures`-th consecutive receive error: 10ms doubling, capped at 1s.
fn recv_backoff(failures: u32) -> Duration {
    let shift = failures.saturating_sub(1).min(7);
    Duration::from_millis(10 << shift).min(Duration::from_secs(1))
}

/// Timestamp first, so idleness is measured even when start or write fails.
async fn handle_datagram(
    supervisor: &ProcessSupervisor,
    data: &[u8],
    peer: SocketAddr,
) -> Result<(), SupervisorError> {
    supervisor.touch();
    supervisor.ensure_started(Some(peer)).await?;
    supervisor.forward(data).await
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::signals::ShutdownReason;
    use std::time::Instant;
    use tempfile::tempdir;

    fn sink_command(path: &std::path::Path) -> Vec<String> {
        vec![
            "sh".to_string(),
            "-c".to_string(),
            "exec cat > \"$0\"".to_string(),
            path.display().to_string(),
        ]
    }

    fn loopback() -> SocketAddr {
        "127.0.0.1:0".parse().unwrap()
    }

    fn client() -> std::net::UdpSocket {
        std::net::UdpSocket::bind("127.0.0.1:0").unwrap()
    }

    async fn wait_until<F: Fn() -> bool>(what: &str, check: F) {
        let deadline = Instant::now() + Duration::from_secs(5);
        while !check() {
            assert!(Instant::now() < deadline, "timed out waiting for {what}");
            tokio::time::sleep(Duration::from_millis(10)).await;
        }
    }

    #[test]
    fn test_relay_error_display() {
        let err = RelayError::Bind {
            addr: "127.0.0.1:5004".parse().unwrap(),
            source: std::io::Error::new(std::io::ErrorKind::AddrInUse, "in use"),
        };
        assert!(err.to_string().contains("127.0.0.1:5004"));
        assert!(err.to_string().contains("in use"));
    }

    #[test]
    fn test_recv_backoff_grows_and_caps() {
        assert_eq!(recv_backoff(1), Duration::from_millis(10));
        assert_eq!(recv_backoff(2), Duration::from_millis(20));
        assert_eq!(recv_backoff(4), Duration::from_millis(80));
        assert_eq!(recv_backoff(8), Duration::from_secs(1));
        assert_eq!(recv_backoff(u32::MAX), Duration::from_secs(1));
    }

    #[tokio::test]
    async fn test_resolve_numeric_address() {
        let addr = resolve("127.0.0.1:5004").await.unwrap();
        assert_eq!(addr, "127.0.0.1:5004".parse().unwrap());
    }

    #[tokio::test]
    async fn test_resolve_garbage_fails() {
        let err = resolve("not an address").await.unwrap_err();
        assert!(matches!(err, RelayError::Resolve { .. }));
    }

    #[tokio::test]
    async fn test_bind_reports_local_port() {
        let relay = PacketRelay::bind(loopback(), Some(1024 * 1024)).unwrap();
        assert_ne!(relay.local_addr().unwrap().port(), 0);
    }

    #[tokio::test]
    async fn test_first_datagram_starts_transcoder_and_forwards_in_order() {
        let dir = tempdir().unwrap();
        let out = dir.path().join("out.ts");
        let shutdown = Shutdown::new();
        let supervisor = Arc::new(ProcessSupervisor::new(sink_command(&out), shutdown.clone()));

        let relay = PacketRelay::bind(loopback(), None).unwrap();
        let target = relay.local_addr().unwrap();
        assert!(!supervisor.is_running().await);
        let task = tokio::spawn(relay.run(Arc::clone(&supervisor), shutdown.clone()));

        let sender = client();
        let mut expected = Vec::new();
        for i in 0..20u8 {
            let datagram = vec![i; 100 + i as usize];
            sender.send_to(&datagram, target).unwrap();
            expected.extend_from_slice(&datagram);
            tokio::time::sleep(Duration::from_millis(5)).await;
        }

        let want = expected.len() as u64;
        wait_until("forwarded bytes", || {
            std::fs::metadata(&out).map(|m| m.len()).unwrap_or(0) >= want
        })
        .await;
        assert!(supervisor.is_running().await);
        assert_eq!(std::fs::read(&out).unwrap(), expected);

        shutdown.trigger(ShutdownReason::Signal);
        let result = tokio::time::timeout(Duration::from_secs(5), task)
            .await
            .unwrap()
            .unwrap();
        assert!(result.is_ok());
        let stats = supervisor.stop().await.unwrap();
        assert_eq!(stats.bytes, want);
    }

    #[tokio::test]
    async fn test_datagram_updates_idle_timestamp() {
        let dir = tempdir().unwrap();
        let out = dir.path().join("out.ts");
        let shutdown = Shutdown::new();
        let supervisor = Arc::new(ProcessSupervisor::new(sink_command(&out), shutdown.clone()));
        let relay = PacketRelay::bind(loopback(), None).unwrap();
        let target = relay.local_addr().unwrap();
        let task = tokio::spawn(relay.run(Arc::clone(&supervisor), shutdown.clone()));

        tokio::time::sleep(Duration::from_millis(300)).await;
        assert!(supervisor.idle_for() >= Duration::from_millis(300));

        client().send_to(b"ping", target).unwrap();
        wait_until("timestamp refresh", || {
            supervisor.idle_for() < Duration::from_millis(250)
        })
        .await;

        shutdown.trigger(ShutdownReason::Signal);
        task.await.unwrap().unwrap();
        supervisor.stop().await;
    }

    #[tokio::test]
    async fn test_launch_failure_stops_listener() {
        let shutdown = Shutdown::new();
        let supervisor = Arc::new(ProcessSupervisor::new(
            vec!["nonexistent-transcoder-xyz".to_string()],
            shutdown.clone(),
        ));
        let relay = PacketRelay::bind(loopback(), None).unwrap();
        let target = relay.local_addr().unwrap();
        let task = tokio::spawn(relay.run(Arc::clone(&supervisor), shutdown.clone()));

        client().send_to(b"first", target).unwrap();

        let result = tokio::time::timeout(Duration::from_secs(5), task)
            .await
            .unwrap()
            .unwrap();
        assert!(matches!(result, Err(RelayError::Launch(_))));
        assert_eq!(shutdown.reason(), Some(ShutdownReason::LaunchFailure));
    }

    #[tokio::test]
    async fn test_dead_transcoder_does_not_stop_listener() {
        // `true` exits immediately, so writes race its exit and often fail.
        let shutdown = Shutdown::new();
        let supervisor = Arc::new(ProcessSupervisor::new(
            vec!["true".to_string()],
            shutdown.clone(),
        ));
        let relay = PacketRelay::bind(loopback(), None).unwrap();
        let target = relay.local_addr().unwrap();
        let task = tokio::spawn(relay.run(Arc::clone(&supervisor), shutdown.clone()));

        let sender = client();
        for _ in 0..5 {
            sender.send_to(&[0u8; 512], target).unwrap();
            tokio::time::sleep(Duration::from_millis(100)).await;
        }

        assert!(!task.is_finished());
        assert!(!shutdown.is_triggered());

        shutdown.trigger(ShutdownReason::Signal);
        let result = tokio::time::timeout(Duration::from_secs(5), task)
            .await
            .unwrap()
            .unwrap();
        assert!(result.is_ok());
    }

    #[tokio::test]
    async fn test_shutdown_before_traffic_returns_ok() {
        let shutdown = Shutdown::new();
        let supervisor = Arc::new(ProcessSupervisor::new(
            vec!["cat".to_string()],
            shutdown.clone(),
        ));
        let relay = PacketRelay::bind(loopback(), None).unwrap();
        shutdown.trigger(ShutdownReason::Signal);

        let result = tokio::time::timeout(
            Duration::from_secs(5),
            relay.run(Arc::clone(&supervisor), shutdown),
        )
        .await
        .unwrap();
        assert!(result.is_ok());
        assert!(!supervisor.is_running().await);
    }

    #[tokio::test]
    async fn test_shutdown_interrupts_blocked_forward() {
        // `sleep` never reads stdin, so forwarding stalls once the pipe fills.
        let shutdown = Shutdown::new();
        let supervisor = Arc::new(ProcessSupervisor::new(
            vec!["sleep".to_string(), "30".to_string()],
            shutdown.clone(),
        ));
        let relay = PacketRelay::bind(loopback(), Some(1024 * 1024)).unwrap();
        let target = relay.local_addr().unwrap();
        let task = tokio::spawn(relay.run(Arc::clone(&supervisor), shutdown.clone()));

        let sender = client();
        for _ in 0..4 {
            sender.send_to(&[0u8; 60000], target).unwrap();
            tokio::time::sleep(Duration::from_millis(20)).await;
        }
        tokio::time::sleep(Duration::from_millis(200)).await;
        assert!(supervisor.is_running().await);
        assert!(!task.is_finished());

        shutdown.trigger(ShutdownReason::Signal);
        let result = tokio::time::timeout(Duration::from_secs(3), task)
            .await
            .expect("relay must stop after shutdown while a forward is blocked")
            .unwrap();
        assert!(result.is_ok());

        let stats = tokio::time::timeout(Duration::from_secs(3), supervisor.stop())
            .await
            .unwrap();
        assert!(stats.is_some());
        assert!(!supervisor.is_running().await);
    }
}
