use crate::command::Profile;
use serde::Deserialize;
use std::path::{Path, PathBuf};
use std::time::Duration;

/// Top-level configuration loaded from relay.toml.
#[derive(Debug, Deserialize, Default)]
#[serde(default)]
pub struct RelayConfig {
    pub listen: ListenConfig,
    pub encoder: EncoderConfig,
    pub watchdog: WatchdogConfig,
    pub status: StatusConfig,
}

#[derive(Debug, Deserialize)]
#[serde(default)]
pub struct ListenConfig {
    pub address: String,
    pub port: u16,
    /// Requested SO_RCVBUF; the kernel may clamp it.
    pub recv_buffer_bytes: Option<usize>,
}

#[derive(Debug, Deserialize)]
#[serde(default)]
pub struct EncoderConfig {
    pub ffmpeg: String,
    pub profile: Profile,
    /// Target bitrate in kbps.
    pub bitrate: u32,
    pub framerate: u32,
    /// Target dimensions as `x:y`.
    pub scale: String,
    pub endpoint: String,
}

#[derive(Debug, Deserialize)]
#[serde(default)]
pub struct WatchdogConfig {
    pub timeout_secs: f64,
}

#[derive(Debug, Deserialize, Default)]
#[serde(default)]
pub struct StatusConfig {
    pub file: Option<PathBuf>,
}

impl Default for ListenConfig {
    fn default() -> Self {
        Self {
            address: "0.0.0.0".to_string(),
            port: 5004,
            recv_buffer_bytes: Some(4 * 1024 * 1024),
        }
    }
}

impl Default for EncoderConfig {
    fn default() -> Self {
        Self {
            ffmpeg: "ffmpeg".to_string(),
            profile: Profile::Twitch,
            bitrate: 5000,
            framerate: 60,
            scale: "1920:1080".to_string(),
            endpoint: "/dev/null".to_string(),
        }
    }
}

impl Default for WatchdogConfig {
    fn default() -> Self {
        Self { timeout_secs: 10.0 }
    }
}

impl WatchdogConfig {
    /// Idle timeout as a `Duration`. Call after `RelayConfig::validate`.
    pub fn timeout(&self) -> Duration {
        Duration::try_from_secs_f64(self.timeout_secs).unwrap_or(Duration::from_secs(10))
    }
}

impl RelayConfig {
    /// Load config from `path`. A missing file yields the defaults.
    pub fn load(path: &Path) -> Result<Self, ConfigError> {
        let contents = match std::fs::read_to_string(path) {
            Ok(c) => c,
            Err(e) if e.kind() == std::io::ErrorKind::NotFound => {
                tracing::debug!(path = %path.display(), "no config file, using defaults");
                return Ok(Self::default());
            }
            Err(e) => {
                return Err(ConfigError::Read {
                    path: path.to_path_buf(),
                    source: e,
                })
            }
        };
        toml::from_str(&contents).map_err(|e| ConfigError::Parse {
            path: path.to_path_buf(),
            source: e,
        })
    }

    /// Reject values the relay cannot run with.
    pub fn validate(&self) -> Result<(), ConfigError> {
        let timeout = self.watchdog.timeout_secs;
        if !timeout.is_finite() || timeout <= 0.0 {
            return Err(ConfigError::Invalid(format!(
                "watchdog timeout must be a positive number of seconds, got {timeout}"
            )));
        }
        if self.listen.port == 0 {
            return Err(ConfigError::Invalid("listen port must not be 0".to_string()));
        }
        if self.encoder.ffmpeg.trim().is_empty() {
            return Err(ConfigError::Invalid(
                "ffmpeg executable must not be empty".to_string(),
            ));
        }
        Ok(())
    }

    /// `address:port` string for the UDP listener.
    pub fn listen_addr(&self) -> String {
        if self.listen.address.contains(':') && !self.listen.address.starts_with('[') {
            format!("[{}]:{}", self.listen.address, self.listen.port)
        } else {
            format!("{}:{}", self.listen.address, self.listen.port)
        }
    }
}

/// Errors from loading or validating configuration.
#[derive(Debug)]
pub enum ConfigError {
    Read {
        path: PathBuf,
        source: std::io::Error,
    },
    Parse {
        path: PathBuf,
        source: toml::de::Error,
    },
    Invalid(String),
}

impl std::fmt::Display for ConfigError {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        match self {
            ConfigError::Read { path, source } => {
                write!(f, "failed to read config {}: {source}", path.display())
            }
            ConfigError::Parse { path, source } => {
                write!(f, "failed to parse config {}: {source}", path.display())
            }
            ConfigError::Invalid(msg) => write!(f, "invalid config: {msg}"),
        }
    }
}

impl std::error::Error for ConfigError {
    fn source(&self) -> Option<&(dyn std::error::Error + 'static)> {
        match self {
            ConfigError::Read { source, .. } => Some(source),
            ConfigError::Parse { source, .. } => Some(source),
            ConfigError::Invalid(_) => None,
        }
    }
}
