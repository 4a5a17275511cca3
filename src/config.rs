use serde::Deserialize;
use std::path::{Path, PathBuf};
use std::time::Duration;

/// Environment variable naming the PID-record directory for `watch` and `reap`.
pub const PIDFILE_DIR_ENV: &str = "X11_WARDEN_PIDFILE_DIR";

/// Top-level configuration loaded from warden.toml.
#[derive(Debug, Deserialize)]
#[serde(default)]
pub struct WardenConfig {
    pub watchdog: WatchdogConfig,
    pub crash_loop: CrashLoopConfig,
    pub paths: PathsConfig,
    pub heartbeat: HeartbeatConfig,
    pub escalation: EscalationConfig,
    /// Targets whose orphans are reaped before any session starts.
    pub reap_targets: Vec<String>,
    pub display: Vec<DisplayConfig>,
}

#[derive(Debug, Clone, Deserialize)]
#[serde(default)]
pub struct WatchdogConfig {
    pub resolve_interval_ms: u64,
    pub resolve_attempts: u32,
    pub poll_interval_ms: u64,
    pub heartbeat_max_misses: u32,
    pub terminate_grace_ms: u64,
}

#[derive(Debug, Clone, Deserialize)]
#[serde(default)]
pub struct CrashLoopConfig {
    pub settle_secs: u64,
    pub backoff_secs: u64,
    pub crash_threshold: u32,
    pub cooldown_secs: u64,
    pub startup_delay_secs: u64,
}

#[derive(Debug, Deserialize)]
#[serde(default)]
pub struct PathsConfig {
    pub data_dir: PathBuf,
    pub xvfb_run: PathBuf,
    /// Prepended to PATH for display sessions.
    pub extra_paths: Vec<PathBuf>,
}

#[derive(Debug, Deserialize)]
#[serde(default)]
pub struct HeartbeatConfig {
    pub enabled: bool,
    pub refresh_secs: u64,
}

#[derive(Debug, Default, Deserialize)]
#[serde(default)]
pub struct EscalationConfig {
    /// Shell command run to ask the outer supervisor for a restart.
    pub restart_command: Option<String>,
}

#[derive(Debug, Clone, Deserialize)]
#[serde(default)]
pub struct DisplayConfig {
    /// X display number; the lowest free number from 99 up when omitted.
    pub display_num: Option<u32>,
    pub dimensions: String,
    /// Program run inside the terminal. Sessions without one are skipped.
    pub exe: String,
    pub args: String,
    pub font: String,
}

// --- Default implementations ---

impl Default for WardenConfig {
    fn default() -> Self {
        Self {
            watchdog: WatchdogConfig::default(),
            crash_loop: CrashLoopConfig::default(),
            paths: PathsConfig::default(),
            heartbeat: HeartbeatConfig::default(),
            escalation: EscalationConfig::default(),
            reap_targets: vec!["Xvfb".to_string()],
            display: Vec::new(),
        }
    }
}

impl Default for WatchdogConfig {
    fn default() -> Self {
        Self {
            resolve_interval_ms: 100,
            resolve_attempts: 100,
            poll_interval_ms: 3000,
            heartbeat_max_misses: 3,
            terminate_grace_ms: 5000,
        }
    }
}

impl Default for CrashLoopConfig {
    fn default() -> Self {
        Self {
            settle_secs: 15,
            backoff_secs: 5,
            crash_threshold: 5,
            cooldown_secs: 3600,
            startup_delay_secs: 3,
        }
    }
}

impl Default for PathsConfig {
    fn default() -> Self {
        Self {
            data_dir: PathBuf::from(".x11-warden"),
            xvfb_run: PathBuf::from("xvfb-run"),
            extra_paths: Vec::new(),
        }
    }
}

impl Default for HeartbeatConfig {
    fn default() -> Self {
        Self {
            enabled: false,
            refresh_secs: 3,
        }
    }
}

impl Default for DisplayConfig {
    fn default() -> Self {
        Self {
            display_num: None,
            dimensions: "1024x720".to_string(),
            exe: String::new(),
            args: String::new(),
            font: "Default".to_string(),
        }
    }
}

impl WatchdogConfig {
    pub fn resolve_interval(&self) -> Duration {
        Duration::from_millis(self.resolve_interval_ms)
    }

    pub fn poll_interval(&self) -> Duration {
        Duration::from_millis(self.poll_interval_ms)
    }

    pub fn terminate_grace(&self) -> Duration {
        Duration::from_millis(self.terminate_grace_ms)
    }
}

impl CrashLoopConfig {
    pub fn settle(&self) -> Duration {
        Duration::from_secs(self.settle_secs)
    }

    pub fn backoff(&self) -> Duration {
        Duration::from_secs(self.backoff_secs)
    }

    pub fn cooldown(&self) -> Duration {
        Duration::from_secs(self.cooldown_secs)
    }
}

/// Errors from loading the config file.
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
}

impl std::fmt::Display for ConfigError {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        match self {
            ConfigError::Read { path, source } => {
                write!(f, "failed to read config {}: {}", path.display(), source)
            }
            ConfigError::Parse { path, source } => {
                write!(f, "invalid config {}: {}", path.display(), source)
            }
        }
    }
}

impl std::error::Error for ConfigError {
    fn source(&self) -> Option<&(dyn std::error::Error + 'static)> {
        match self {
            ConfigError::Read { source, .. } => Some(source),
            ConfigError::Parse { source, .. } => Some(source),
        }
    }
}

/// Load config from `path`. A missing file yields the defaults.
pub fn load_config(path: &Path) -> Result<WardenConfig, ConfigError> {
    match std::fs::read_to_string(path) {
        Ok(contents) => toml::from_str(&contents).map_err(|e| ConfigError::Parse {
            path: path.to_path_buf(),
            source: e,
        }),
        Err(e) if e.kind() == std::io::ErrorKind::NotFound => {
            tracing::debug!(path = %path.display(), "no config file, using defaults");
            Ok(WardenConfig::default())
        }
        Err(e) => Err(ConfigError::Read {
            path: path.to_path_buf(),
            source: e,
        }),
    }
}

/// PID-record directory: `$X11_WARDEN_PIDFILE_DIR` if set, else `fallback`.
pub fn pidfile_dir(fallback: PathBuf) -> PathBuf {
    match std::env::var_os(PIDFILE_DIR_ENV) {
        Some(dir) if !dir.is_empty() => PathBuf::from(dir),
        _ => fallback,
    }
}
