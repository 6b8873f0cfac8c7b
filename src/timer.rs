/// Wall-clock timer for a bounded operation (a transcoder run, a shutdown).
use std::time::{Duration, Instant};

#[derive(Debug, Clone, Copy, Default)]
pub struct ElapsedTimer {
    started_at: Option<Instant>,
    stopped_at: Option<Instant>,
}

impl ElapsedTimer {
    pub fn new() -> Self {
        Self::default()
    }

    /// Create a timer that is already running.
    pub fn started() -> Self {
        let mut timer = Self::new();
        timer.start();
        timer
    }

    /// Record the start instant. Restarting clears any previous stop.
    pub fn start(&mut self) {
        self.started_at = Some(Instant::now());
        self.stopped_at = None;
    }

    /// Record the stop instant and return the elapsed duration.
    pub fn stop(&mut self) -> Option<Duration> {
        self.stopped_at = Some(Instant::now());
        let elapsed = self.elapsed();
        if let Some(elapsed) = elapsed {
            tracing::trace!(elapsed_secs = elapsed.as_secs_f64(), "timer stopped");
        }
        elapsed
    }

    /// Absolute difference between start and stop.
    ///
    /// `None` until both instants have been recorded.
    pub fn elapsed(&self) -> Option<Duration> {
        match (self.started_at, self.stopped_at) {
            (Some(start), Some(stop)) => Some(if stop >= start {
                stop - start
            } else {
                start - stop
            }),
            _ => None,
        }
    }

    #[cfg(test)]
    pub fn is_running(&self) -> bool {
        self.started_at.is_some() && self.stopped_at.is_none()
    }
}
