/// Status file: writes the relay's state as JSON on every supervisor transition.
///
/// Uses atomic write pattern: write to temp file then rename.
use chrono::{DateTime, Utc};
use serde::Serialize;
use std::path::{Path, PathBuf};

/// Relay states written to the status file.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize)]
#[serde(rename_all = "snake_case")]
pub enum RelayState {
    Stopped,
    Running,
    ShuttingDown,
}

/// The JSON payload written to the status file.
#[derive(Debug, Clone, Serialize)]
pub struct StatusData {
    pub pid: u32,
    pub state: RelayState,
    pub child_pid: Option<u32>,
    pub runs: u64,
    pub run_start: Option<DateTime<Utc>>,
    pub bytes_forwarded: u64,
    pub last_origin: Option<String>,
    pub last_update: DateTime<Utc>,
}

/// Manages the status file lifecycle.
pub struct StatusFile {
    path: PathBuf,
}

impl StatusFile {
    pub fn new(path: PathBuf) -> Self {
        Self { path }
    }

    /// Atomically write status data to the status file.
    ///
    /// Writes to a temporary file in the same directory, then renames
    /// so readers never see a partial write.
    pub fn write(&self, data: &StatusData) -> Result<(), StatusError> {
        let json =
            serde_json::to_string_pretty(data).map_err(|e| StatusError::Serialize { source: e })?;

        let dir = self.path.parent().unwrap_or(Path::new("."));
        let tmp_path = dir.join(format!(".relay.status.tmp.{}", std::process::id()));

        std::fs::write(&tmp_path, json.as_bytes()).map_err(|e| StatusError::Write {
            path: tmp_path.clone(),
            source: e,
        })?;

        std::fs::rename(&tmp_path, &self.path).map_err(|e| StatusError::Rename {
            from: tmp_path,
            to: self.path.clone(),
            source: e,
        })?;

        Ok(())
    }

}

/// Tracks what the supervisor last reported and rewrites the file on change.
pub struct StatusTracker {
    file: StatusFile,
    pid: u32,
    child_pid: Option<u32>,
    runs: u64,
    run_start: Option<DateTime<Utc>>,
    bytes_forwarded: u64,
    last_origin: Option<String>,
}

impl StatusTracker {
    pub fn new(status_path: PathBuf) -> Self {
        Self {
            file: StatusFile::new(status_path),
            pid: std::process::id(),
            child_pid: None,
            runs: 0,
            run_start: None,
            bytes_forwarded: 0,
            last_origin: None,
        }
    }

    /// Record a freshly launched transcoder.
    pub fn run_started(&mut self, child_pid: u32, origin: &str) {
        self.child_pid = Some(child_pid);
        self.runs += 1;
        self.run_start = Some(Utc::now());
        self.bytes_forwarded = 0;
        self.last_origin = Some(origin.to_string());
        self.update(RelayState::Running);
    }

    /// Record the end of a run with its final byte count.
    pub fn run_ended(&mut self, bytes_forwarded: u64) {
        self.child_pid = None;
        self.run_start = None;
        self.bytes_forwarded = bytes_forwarded;
        self.update(RelayState::Stopped);
    }

    /// Write the current snapshot with the given state.
    pub fn update(&self, state: RelayState) {
        let data = StatusData {
            pid: self.pid,
            state,
            child_pid: self.child_pid,
            runs: self.runs,
            run_start: self.run_start,
            bytes_forwarded: self.bytes_forwarded,
            last_origin: self.last_origin.clone(),
            last_update: Utc::now(),
        };

        if let Err(e) = self.file.write(&data) {
            tracing::warn!(error = %e, "failed to write status file");
        }
    }
}

/// Errors from status file operations.
#[derive(Debug)]
pub enum StatusError {
    Serialize {
        source: serde_json::Error,
    },
    Write {
        path: PathBuf,
        source: std::io::Error,
    },
    Rename {
        from: PathBuf,
        to: PathBuf,
        source: std::io::Error,
    },
}

impl std::fmt::Display for StatusError {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        match self {
            StatusError::Serialize { source } => write!(f, "failed to serialize status: {source}"),
            StatusError::Write { path, source } => {
                write!(
                    f,
                    "failed to write temp status file {}: {source}",
                    path.display()
                )
            }
            StatusError::Rename { from, to, source } => {
                write!(
                    f,
                    "failed to rename {} -> {}: {source}",
                    from.display(),
                    to.display()
                )
            }
        }
    }
}

impl std::error::Error for StatusError {
    fn source(&self) -> Option<&(dyn std::error::Error + 'static)> {
        match self {
            StatusError::Serialize { source } => Some(source),
            StatusError::Write { source, .. } => Some(source),
            StatusError::Rename { source, .. } => Some(source),
        }
    }
}
