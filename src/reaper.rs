/// Orphan reaper: kills whatever a previous supervisor generation left behind.
///
/// Every PID record for a target is handled in turn. Nothing in here can
/// fail outward: lookup and kill failures are logged, the record is removed
/// regardless, and the next record is processed.
use crate::pidfile::{self, PidDir};
use crate::procs::{self, name_matches, ProcessTable};
use std::io::Write;
use std::path::Path;

/// What one reaping pass did.
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq)]
pub struct ReapReport {
    /// Records found (and removed) for the target.
    pub records: usize,
    /// Records whose process was still alive and got killed.
    pub killed: usize,
}

/// Reap every record for `name`, printing `"{name} stopped"` to stdout per record.
pub fn reap(pids: &PidDir, name: &str) -> ReapReport {
    reap_with_output(pids, name, &mut std::io::stdout())
}

/// Like `reap`, writing the per-record lines to `out`. Write failures are ignored.
pub fn reap_with_output(pids: &PidDir, name: &str, out: &mut impl Write) -> ReapReport {
    let mut report = ReapReport::default();
    pids.sweep_temp_files(name);
    for path in pids.list(name) {
        report.records += 1;
        if reap_record(&path, name) {
            report.killed += 1;
        }
        let _ = writeln!(out, "{name} stopped");
        let _ = out.flush();
    }

    tracing::info!(
        target_name = name,
        records = report.records,
        killed = report.killed,
        dir = %pids.root().display(),
        "reap complete"
    );
    report
}

/// Kill the process recorded at `path` and its `name`d descendants, then
/// remove the record. Returns true if a live process was killed.
pub(crate) fn reap_record(path: &Path, name: &str) -> bool {
    let killed = match pidfile::read_pid(path) {
        Ok(pid) => kill_recorded(pid, name),
        Err(e) => {
            tracing::warn!(error = %e, "unreadable PID record, discarding");
            false
        }
    };
    pidfile::remove_record(path);
    killed
}

fn kill_recorded(pid: u32, name: &str) -> bool {
    let table = ProcessTable::snapshot();
    match table.name_of(pid) {
        Some(current) if name_matches(&current, name) => {
            let descendants = procs::kill_matching_descendants(pid, name);
            let killed = procs::kill_pid(pid);
            tracing::info!(pid, target_name = name, descendants, "killed orphaned process");
            killed
        }
        Some(current) => {
            // the pid was recycled by an unrelated process
            tracing::warn!(
                pid,
                target_name = name,
                running = %current,
                "recorded pid now belongs to another process, not killing"
            );
            false
        }
        None => {
            tracing::debug!(pid, target_name = name, "recorded process is no longer running");
            false
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::pidfile::RecordKey;
    use crate::test_support::{
        copy_program, dead_pid, script, sleeper, wait_until_gone, wait_until_named,
    };
    use std::process::Command;
    use std::time::Duration;

    #[test]
    fn test_reap_empty_directory_is_noop() {
        let dir = tempfile::tempdir().unwrap();
        let pids = PidDir::new(dir.path());
        let mut out = Vec::new();

        assert_eq!(reap_with_output(&pids, "Xvfb", &mut out), ReapReport::default());
        assert_eq!(reap_with_output(&pids, "Xvfb", &mut out), ReapReport::default());
        assert!(out.is_empty());
    }

    #[test]
    fn test_reap_missing_directory_is_noop() {
        let dir = tempfile::tempdir().unwrap();
        let pids = PidDir::new(dir.path().join("never-created"));
        let mut out = Vec::new();
        assert_eq!(reap_with_output(&pids, "Xvfb", &mut out).records, 0);
        assert!(out.is_empty());
    }

    #[test]
    fn test_reap_removes_live_and_stale_records() {
        let dir = tempfile::tempdir().unwrap();
        let pids = PidDir::new(dir.path().join("pids"));
        let target = sleeper(dir.path(), "wd-reap-live");

        let mut live = Command::new(&target).arg("30").spawn().unwrap();
        wait_until_named(live.id(), "wd-reap-live");

        pids.write(&RecordKey::new("wd-reap-live", "1"), live.id()).unwrap();
        pids.write(&RecordKey::new("wd-reap-live", "2"), dead_pid()).unwrap();
        std::fs::write(pids.record_path(&RecordKey::new("wd-reap-live", "3")), "garbage")
            .unwrap();
        pids.write(&RecordKey::new("other", "1"), live.id()).unwrap();

        let mut out = Vec::new();
        let report = reap_with_output(&pids, "wd-reap-live", &mut out);

        assert_eq!(report, ReapReport { records: 3, killed: 1 });
        assert!(pids.list("wd-reap-live").is_empty());
        assert_eq!(pids.list("other").len(), 1);
        assert_eq!(
            String::from_utf8(out).unwrap(),
            "wd-reap-live stopped\n".repeat(3)
        );

        let status = live.wait().unwrap();
        assert!(!status.success());
    }

    #[test]
    fn test_reap_kills_target_with_long_name() {
        let dir = tempfile::tempdir().unwrap();
        let pids = PidDir::new(dir.path().join("pids"));
        let target = copy_program(dir.path(), "sleep", "reaped-long-target-name");

        let mut live = Command::new(&target).arg("30").spawn().unwrap();
        wait_until_named(live.id(), "reaped-long-target-name");
        pids.write(&RecordKey::new("reaped-long-target-name", "1"), live.id())
            .unwrap();

        let report = reap_with_output(&pids, "reaped-long-target-name", &mut Vec::new());
        assert_eq!(report, ReapReport { records: 1, killed: 1 });
        assert!(!live.wait().unwrap().success());
    }

    #[test]
    fn test_reap_sweeps_abandoned_temp_files() {
        let dir = tempfile::tempdir().unwrap();
        let pids = PidDir::new(dir.path());
        let temp = dir.path().join(format!(".Xvfb.99.pid.tmp.{}", dead_pid()));
        std::fs::write(&temp, "1").unwrap();

        let mut out = Vec::new();
        assert_eq!(reap_with_output(&pids, "Xvfb", &mut out), ReapReport::default());
        assert!(!temp.exists());
        assert!(out.is_empty());
    }

    #[test]
    fn test_reap_does_not_kill_recycled_pid() {
        let dir = tempfile::tempdir().unwrap();
        let pids = PidDir::new(dir.path());

        // record claims the target, but the pid belongs to a plain `sleep`
        let mut bystander = Command::new("sleep").arg("30").spawn().unwrap();
        pids.write(&RecordKey::new("wd-reap-recycled", "1"), bystander.id())
            .unwrap();

        let report = reap_with_output(&pids, "wd-reap-recycled", &mut Vec::new());
        assert_eq!(report, ReapReport { records: 1, killed: 0 });
        assert!(pids.list("wd-reap-recycled").is_empty());
        assert!(bystander.try_wait().unwrap().is_none());

        bystander.kill().unwrap();
        bystander.wait().unwrap();
    }

    #[test]
    fn test_reap_kills_matching_descendants() {
        let dir = tempfile::tempdir().unwrap();
        let pids = PidDir::new(dir.path());
        // the top-level instance re-launches itself once as a nested child
        let target = script(
            dir.path(),
            "wd-reap-tree",
            "if [ \"$2\" != nested ]; then \"$0\" \"$1\" nested & fi\nsleep \"$1\"",
        );

        let mut top = Command::new(&target).arg("30").spawn().unwrap();
        wait_until_named(top.id(), "wd-reap-tree");

        let mut nested = None;
        for _ in 0..100 {
            nested = ProcessTable::snapshot()
                .matching_descendants(top.id(), "wd-reap-tree")
                .first()
                .copied();
            if nested.is_some() {
                break;
            }
            std::thread::sleep(Duration::from_millis(20));
        }
        let nested = nested.expect("nested instance never started");

        pids.write(&RecordKey::new("wd-reap-tree", "1"), top.id())
            .unwrap();
        let report = reap_with_output(&pids, "wd-reap-tree", &mut Vec::new());
        assert_eq!(report, ReapReport { records: 1, killed: 1 });
        assert!(!top.wait().unwrap().success());
        assert!(wait_until_gone(nested));
    }
}
