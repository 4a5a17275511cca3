use std::path::{Path, PathBuf};

/// Manages the `.x11-warden/` directory layout.
///
/// All supervisor state lives under a single data directory: PID records,
/// heartbeat tokens and per-display X authority files. This struct provides
/// accessors for each well-known path and handles initialization.
#[derive(Debug, Clone)]
pub struct DataDir {
    root: PathBuf,
}

const HEARTBEAT_PREFIX: &str = "heartbeat.";
const XAUTH_PREFIX: &str = "Xauthority";

impl DataDir {
    /// Create a new DataDir referencing the given root path.
    pub fn new(root: impl Into<PathBuf>) -> Self {
        Self { root: root.into() }
    }

    /// The root directory (e.g. `.x11-warden/`).
    pub fn root(&self) -> &Path {
        &self.root
    }

    /// Directory holding the PID records.
    pub fn pids_dir(&self) -> PathBuf {
        self.root.join("pids")
    }

    /// Heartbeat token refreshed by the supervisor with the given pid.
    pub fn heartbeat_file(&self, supervisor_pid: u32) -> PathBuf {
        self.root.join(format!("{HEARTBEAT_PREFIX}{supervisor_pid}"))
    }

    /// Prefix of the X authority files; the display number is appended.
    pub fn xauth_prefix(&self) -> PathBuf {
        self.root.join(XAUTH_PREFIX)
    }

    /// Initialize the directory structure.
    /// Returns Ok(true) if the root was created, Ok(false) if it already existed.
    pub fn init(&self) -> std::io::Result<bool> {
        let created = !self.root.exists();
        std::fs::create_dir_all(&self.root)?;
        std::fs::create_dir_all(self.pids_dir())?;
        Ok(created)
    }

    /// Remove heartbeat tokens and X authority files left by earlier supervisors.
    /// Returns how many files were removed.
    pub fn clear_stale_files(&self) -> usize {
        let entries = match std::fs::read_dir(&self.root) {
            Ok(e) => e,
            Err(e) => {
                tracing::warn!(error = %e, dir = %self.root.display(), "failed to read data directory");
                return 0;
            }
        };

        let mut removed = 0;
        for entry in entries.flatten() {
            let name = entry.file_name();
            let Some(name) = name.to_str() else {
                continue;
            };
            if !name.starts_with(HEARTBEAT_PREFIX) && !name.starts_with(XAUTH_PREFIX) {
                continue;
            }
            match std::fs::remove_file(entry.path()) {
                Ok(()) => removed += 1,
                Err(e) => {
                    tracing::warn!(error = %e, file = name, "failed to remove stale file");
                }
            }
        }
        removed
    }
}
