/// PID records: `{name}.{session}.pid` files holding a decimal process id.
///
/// Records are the only state shared between a watchdog and a later reaper,
/// so they are written atomically and removed idempotently.
use crate::procs::ProcessTable;
use std::path::{Path, PathBuf};

const TEMP_MARKER: &str = ".tmp.";

/// Identity of a supervised process: target name plus session id.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct RecordKey {
    pub name: String,
    pub session: String,
}

impl RecordKey {
    pub fn new(name: impl Into<String>, session: impl Into<String>) -> Self {
        Self {
            name: name.into(),
            session: session.into(),
        }
    }

    pub fn file_name(&self) -> String {
        format!("{}.{}.pid", self.name, self.session)
    }

    /// Parse `file_name` as a record for `name`; None for any other file.
    pub fn parse(file_name: &str, name: &str) -> Option<Self> {
        let session = file_name
            .strip_prefix(name)?
            .strip_prefix('.')?
            .strip_suffix(".pid")?;
        if session.is_empty() {
            return None;
        }
        Some(Self::new(name, session))
    }
}

/// Errors from reading or writing a PID record.
#[derive(Debug)]
pub enum RecordError {
    Io {
        path: PathBuf,
        source: std::io::Error,
    },
    Parse {
        path: PathBuf,
        content: String,
    },
}

impl std::fmt::Display for RecordError {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        match self {
            RecordError::Io { path, source } => {
                write!(f, "PID record {}: {}", path.display(), source)
            }
            RecordError::Parse { path, content } => {
                write!(
                    f,
                    "PID record {} does not hold a process id: {:?}",
                    path.display(),
                    content
                )
            }
        }
    }
}

impl std::error::Error for RecordError {
    fn source(&self) -> Option<&(dyn std::error::Error + 'static)> {
        match self {
            RecordError::Io { source, .. } => Some(source),
            RecordError::Parse { .. } => None,
        }
    }
}

/// Read the process id stored in a record file.
pub fn read_pid(path: &Path) -> Result<u32, RecordError> {
    let content = std::fs::read_to_string(path).map_err(|e| RecordError::Io {
        path: path.to_path_buf(),
        source: e,
    })?;
    content.trim().parse().map_err(|_| RecordError::Parse {
        path: path.to_path_buf(),
        content,
    })
}

/// Remove a record file. Already-missing files are fine; other failures are logged.
pub fn remove_record(path: &Path) {
    match std::fs::remove_file(path) {
        Ok(()) => {}
        Err(e) if e.kind() == std::io::ErrorKind::NotFound => {}
        Err(e) => {
            tracing::warn!(error = %e, path = %path.display(), "failed to remove PID record");
        }
    }
}

/// A record this process wrote and is responsible for removing.
#[derive(Debug)]
pub struct PidRecord {
    path: PathBuf,
    pid: u32,
}

impl PidRecord {
    pub fn path(&self) -> &Path {
        &self.path
    }

    pub fn pid(&self) -> u32 {
        self.pid
    }

    pub fn remove(self) {
        remove_record(&self.path);
    }
}

/// The directory holding every PID record.
#[derive(Debug, Clone)]
pub struct PidDir {
    root: PathBuf,
}

impl PidDir {
    pub fn new(root: impl Into<PathBuf>) -> Self {
        Self { root: root.into() }
    }

    pub fn root(&self) -> &Path {
        &self.root
    }

    pub fn record_path(&self, key: &RecordKey) -> PathBuf {
        self.root.join(key.file_name())
    }

    /// Create the record for `key` holding `pid`.
    ///
    /// The file appears fully written or not at all. If a record for the key
    /// is already present it belongs to a dead watchdog; its process is
    /// reaped and the record replaced.
    pub fn write(&self, key: &RecordKey, pid: u32) -> Result<PidRecord, RecordError> {
        let io_err = |path: &Path| {
            let path = path.to_path_buf();
            move |e: std::io::Error| RecordError::Io { path, source: e }
        };

        std::fs::create_dir_all(&self.root).map_err(io_err(&self.root))?;

        let path = self.record_path(key);
        let tmp_path = self.root.join(format!(
            ".{}{TEMP_MARKER}{}",
            key.file_name(),
            std::process::id()
        ));
        std::fs::write(&tmp_path, pid.to_string()).map_err(io_err(&tmp_path))?;

        let linked = match std::fs::hard_link(&tmp_path, &path) {
            Err(e) if e.kind() == std::io::ErrorKind::AlreadyExists => {
                tracing::warn!(
                    record = %path.display(),
                    "stale PID record found, reaping it before replacing"
                );
                crate::reaper::reap_record(&path, &key.name);
                std::fs::hard_link(&tmp_path, &path)
            }
            other => other,
        };
        let _ = std::fs::remove_file(&tmp_path);
        linked.map_err(io_err(&path))?;

        tracing::debug!(pid, record = %path.display(), "wrote PID record");
        Ok(PidRecord { path, pid })
    }

    /// Remove temp files for `name` whose writer died before finishing
    /// `write`. Files of writers still running are left alone. Returns how
    /// many were removed.
    pub fn sweep_temp_files(&self, name: &str) -> usize {
        let Ok(entries) = std::fs::read_dir(&self.root) else {
            return 0;
        };

        let mut removed = 0;
        for entry in entries.flatten() {
            let file_name = entry.file_name();
            let Some(writer) = file_name.to_str().and_then(|n| orphan_writer(n, name)) else {
                continue;
            };
            if ProcessTable::of(writer).is_running(writer) {
                continue;
            }
            match std::fs::remove_file(entry.path()) {
                Ok(()) => removed += 1,
                Err(e) => {
                    tracing::warn!(error = %e, path = %entry.path().display(), "failed to remove temp file");
                }
            }
        }
        if removed > 0 {
            tracing::debug!(target_name = name, removed, "removed abandoned temp files");
        }
        removed
    }

    /// Paths of every record whose name component is `name`, sorted.
    ///
    /// An unreadable directory yields no records.
    pub fn list(&self, name: &str) -> Vec<PathBuf> {
        let entries = match std::fs::read_dir(&self.root) {
            Ok(e) => e,
            Err(e) => {
                if e.kind() != std::io::ErrorKind::NotFound {
                    tracing::warn!(
                        error = %e,
                        dir = %self.root.display(),
                        "failed to read PID record directory"
                    );
                }
                return Vec::new();
            }
        };

        let mut records: Vec<PathBuf> = entries
            .flatten()
            .map(|entry| entry.path())
            .filter(|path| {
                path.file_name()
                    .and_then(|n| n.to_str())
                    .is_some_and(|n| RecordKey::parse(n, name).is_some())
            })
            .collect();
        records.sort();
        records
    }
}

/// Writer pid of a `.{record}.tmp.{pid}` file for `name`.
fn orphan_writer(file_name: &str, name: &str) -> Option<u32> {
    let (record, writer) = file_name.strip_prefix('.')?.rsplit_once(TEMP_MARKER)?;
    RecordKey::parse(record, name)?;
    writer.parse().ok()
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_file_name_format() {
        let key = RecordKey::new("Xvfb", "99");
        assert_eq!(key.file_name(), "Xvfb.99.pid");
    }

    #[test]
    fn test_parse_matches_only_the_named_target() {
        assert_eq!(
            RecordKey::parse("Xvfb.99.pid", "Xvfb"),
            Some(RecordKey::new("Xvfb", "99"))
        );
        assert_eq!(
            RecordKey::parse("Xvfb.a.b.pid", "Xvfb"),
            Some(RecordKey::new("Xvfb", "a.b"))
        );
        assert_eq!(RecordKey::parse("Xvfbx.99.pid", "Xvfb"), None);
        assert_eq!(RecordKey::parse("cygserver.1.pid", "Xvfb"), None);
        assert_eq!(RecordKey::parse("Xvfb..pid", "Xvfb"), None);
        assert_eq!(RecordKey::parse("Xvfb.99.pid.tmp", "Xvfb"), None);
        assert_eq!(RecordKey::parse(".Xvfb.99.pid.tmp.12", "Xvfb"), None);
    }

    #[test]
    fn test_write_and_read_back() {
        let dir = tempfile::tempdir().unwrap();
        let pids = PidDir::new(dir.path().join("pids"));
        let key = RecordKey::new("Xvfb", "99");

        let record = pids.write(&key, 4242).unwrap();
        assert_eq!(record.pid(), 4242);
        assert_eq!(record.path(), pids.record_path(&key));
        assert_eq!(std::fs::read_to_string(record.path()).unwrap(), "4242");
        assert_eq!(read_pid(record.path()).unwrap(), 4242);

        record.remove();
        assert!(!pids.record_path(&key).exists());
    }

    #[test]
    fn test_write_leaves_no_temp_files() {
        let dir = tempfile::tempdir().unwrap();
        let pids = PidDir::new(dir.path());
        pids.write(&RecordKey::new("Xvfb", "1"), 10).unwrap();

        let names: Vec<String> = std::fs::read_dir(dir.path())
            .unwrap()
            .flatten()
            .map(|e| e.file_name().to_string_lossy().into_owned())
            .collect();
        assert_eq!(names, vec!["Xvfb.1.pid".to_string()]);
    }

    #[test]
    fn test_write_replaces_stale_record() {
        let dir = tempfile::tempdir().unwrap();
        let pids = PidDir::new(dir.path());
        let key = RecordKey::new("wd-stale-target", "7");

        let dead = crate::test_support::dead_pid();
        std::fs::write(pids.record_path(&key), dead.to_string()).unwrap();

        let record = pids.write(&key, 555).unwrap();
        assert_eq!(read_pid(record.path()).unwrap(), 555);
        assert_eq!(pids.list("wd-stale-target").len(), 1);
    }

    #[test]
    fn test_orphan_writer_parses_temp_names() {
        assert_eq!(orphan_writer(".Xvfb.99.pid.tmp.123", "Xvfb"), Some(123));
        assert_eq!(orphan_writer(".Xvfb.a.tmp.b.pid.tmp.7", "Xvfb"), Some(7));
        assert_eq!(orphan_writer(".cygserver.1.pid.tmp.123", "Xvfb"), None);
        assert_eq!(orphan_writer("Xvfb.99.pid", "Xvfb"), None);
        assert_eq!(orphan_writer(".Xvfb.99.pid.tmp.x", "Xvfb"), None);
    }

    #[test]
    fn test_sweep_removes_only_abandoned_temp_files() {
        let dir = tempfile::tempdir().unwrap();
        let pids = PidDir::new(dir.path());
        let dead = crate::test_support::dead_pid();
        let abandoned = dir.path().join(format!(".Xvfb.99.pid.tmp.{dead}"));
        let in_flight = dir
            .path()
            .join(format!(".Xvfb.100.pid.tmp.{}", std::process::id()));
        let other = dir.path().join(format!(".cygserver.1.pid.tmp.{dead}"));
        for path in [&abandoned, &in_flight, &other] {
            std::fs::write(path, "1").unwrap();
        }
        std::fs::write(dir.path().join("Xvfb.98.pid"), "1").unwrap();

        assert_eq!(pids.sweep_temp_files("Xvfb"), 1);
        assert!(!abandoned.exists());
        assert!(in_flight.exists());
        assert!(other.exists());
        assert!(dir.path().join("Xvfb.98.pid").exists());
        assert_eq!(pids.sweep_temp_files("Xvfb"), 0);
    }

    #[test]
    fn test_list_filters_by_name() {
        let dir = tempfile::tempdir().unwrap();
        let pids = PidDir::new(dir.path());
        for name in ["Xvfb.99.pid", "Xvfb.100.pid", "cygserver.1.pid", "notes.txt"] {
            std::fs::write(dir.path().join(name), "1").unwrap();
        }

        let listed = pids.list("Xvfb");
        assert_eq!(
            listed,
            vec![dir.path().join("Xvfb.100.pid"), dir.path().join("Xvfb.99.pid")]
        );
        assert_eq!(pids.list("cygserver").len(), 1);
        assert!(pids.list("xterm").is_empty());
    }

    #[test]
    fn test_list_missing_directory_is_empty() {
        let dir = tempfile::tempdir().unwrap();
        let pids = PidDir::new(dir.path().join("missing"));
        assert!(pids.list("Xvfb").is_empty());
    }

    #[test]
    fn test_read_pid_rejects_garbage() {
        let dir = tempfile::tempdir().unwrap();
        let path = dir.path().join("Xvfb.1.pid");
        std::fs::write(&path, "not-a-pid").unwrap();
        let err = read_pid(&path).unwrap_err();
        assert!(matches!(err, RecordError::Parse { .. }));
    }

    #[test]
    fn test_remove_record_is_idempotent() {
        let dir = tempfile::tempdir().unwrap();
        let path = dir.path().join("Xvfb.1.pid");
        std::fs::write(&path, "1").unwrap();
        remove_record(&path);
        remove_record(&path);
        assert!(!path.exists());
    }
}
