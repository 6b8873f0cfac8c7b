/// Per-run usage statistics and the human-readable forms used in log lines.
use std::fmt;
use std::time::Duration;

/// Summary of one transcoder run, reported when the run ends.
#[derive(Debug, Clone, Copy, PartialEq)]
pub struct RunStats {
    /// Wall-clock time between launch and reaping.
    pub elapsed: Duration,
    /// Bytes written to the transcoder's stdin during the run.
    pub bytes: u64,
}

impl RunStats {
    /// Average throughput in bytes per second (0 for a zero-length run).
    pub fn rate(&self) -> f64 {
        let secs = self.elapsed.as_secs_f64();
        if secs > 0.0 {
            self.bytes as f64 / secs
        } else {
            0.0
        }
    }
}

impl fmt::Display for RunStats {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(
            f,
            "runtime={:.1}s ({}) data={} rate={}/s",
            self.elapsed.as_secs_f64(),
            natural_duration(self.elapsed),
            binary_size(self.bytes as f64),
            binary_size(self.rate()),
        )
    }
}

const BINARY_UNITS: [&str; 8] = ["KiB", "MiB", "GiB", "TiB", "PiB", "EiB", "ZiB", "YiB"];

/// Format a byte count with binary (1024-based) units, e.g. `1.5 KiB`.
pub fn binary_size(bytes: f64) -> String {
    let base = 1024.0;
    if (bytes - 1.0).abs() < f64::EPSILON {
        return "1 Byte".to_string();
    }
    if bytes.abs() < base {
        return format!("{} Bytes", bytes.trunc() as i64);
    }
    let mut value = bytes / base;
    for unit in BINARY_UNITS.iter() {
        if value.abs() < base {
            return format!("{value:.1} {unit}");
        }
        value /= base;
    }
    format!("{:.1} {}", value * base, BINARY_UNITS[BINARY_UNITS.len() - 1])
}

/// Coarse, spoken-style duration: `a moment`, `11 seconds`, `a minute`, `3 hours`.
pub fn natural_duration(duration: Duration) -> String {
    let secs = duration.as_secs();
    match secs {
        0 => "a moment".to_string(),
        1 => "a second".to_string(),
        2..=59 => format!("{secs} seconds"),
        60..=119 => "a minute".to_string(),
        120..=3599 => format!("{} minutes", secs / 60),
        3600..=7199 => "an hour".to_string(),
        7200..=86399 => format!("{} hours", secs / 3600),
        86400..=172799 => "a day".to_string(),
        _ => format!("{} days", secs / 86400),
    }
}
