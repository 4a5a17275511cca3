/// Heartbeat token: a file the supervisor keeps rewriting while it is alive.
///
/// The watchdog side never trusts a single observation. A poll counts as a
/// miss when the file is missing or its mtime has not moved since the last
/// poll; shutdown fires only after more than `max_misses` misses in a row.
use chrono::Utc;
use std::path::{Path, PathBuf};
use std::time::{Duration, SystemTime};

/// Watchdog-side staleness tracker for one heartbeat file.
#[derive(Debug)]
pub struct HeartbeatMonitor {
    path: PathBuf,
    max_misses: u32,
    last_refresh: Option<SystemTime>,
    misses: u32,
}

impl HeartbeatMonitor {
    pub fn new(path: impl Into<PathBuf>, max_misses: u32) -> Self {
        Self {
            path: path.into(),
            max_misses,
            last_refresh: None,
            misses: 0,
        }
    }

    /// Check the file once. Returns true when the supervisor should be
    /// considered gone.
    pub fn observe(&mut self) -> bool {
        let modified = std::fs::metadata(&self.path)
            .and_then(|m| m.modified())
            .ok();

        match modified {
            Some(at) if self.last_refresh.map_or(true, |prev| at > prev) => {
                self.last_refresh = Some(at);
                self.misses = 0;
            }
            _ => {
                self.misses += 1;
                tracing::debug!(
                    path = %self.path.display(),
                    misses = self.misses,
                    "heartbeat not refreshed"
                );
            }
        }
        self.misses > self.max_misses
    }

    /// Consecutive polls without a refresh.
    pub fn misses(&self) -> u32 {
        self.misses
    }
}

/// Rewrite the heartbeat token with the current time.
pub fn touch(path: &Path) -> std::io::Result<()> {
    std::fs::write(path, Utc::now().to_rfc3339())
}

/// Keep refreshing `path` every `interval`. Runs until the task is dropped.
pub async fn beat(path: PathBuf, interval: Duration) {
    tracing::info!(path = %path.display(), every_secs = interval.as_secs(), "heartbeat started");
    let mut ticker = tokio::time::interval(interval);
    loop {
        ticker.tick().await;
        if let Err(e) = touch(&path) {
            tracing::warn!(error = %e, path = %path.display(), "failed to refresh heartbeat");
        }
    }
}
