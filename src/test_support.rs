/// Helpers for tests that need real, recognisably-named processes.
use crate::procs::ProcessTable;
use std::os::unix::fs::PermissionsExt;
use std::path::{Path, PathBuf};
use std::time::Duration;

/// Write an executable shell script called `name`. Processes started from it
/// report `name` as their process name.
pub fn script(dir: &Path, name: &str, body: &str) -> PathBuf {
    let path = dir.join(name);
    std::fs::write(&path, format!("#!/bin/sh\n{body}\n")).unwrap();
    std::fs::set_permissions(&path, std::fs::Permissions::from_mode(0o755)).unwrap();
    path
}

/// Copy `program` from PATH into `dir` as `name`, so it runs under that
/// process name without a shell in between.
pub fn copy_program(dir: &Path, program: &str, name: &str) -> PathBuf {
    let path = std::env::var_os("PATH").unwrap_or_default();
    let source = std::env::split_paths(&path)
        .map(|d| d.join(program))
        .find(|candidate| candidate.is_file())
        .unwrap_or_else(|| panic!("{program} not found on PATH"));
    let dest = dir.join(name);
    std::fs::copy(&source, &dest).unwrap();
    std::fs::set_permissions(&dest, std::fs::Permissions::from_mode(0o755)).unwrap();
    dest
}

/// A script called `name` that sleeps for `$1` seconds.
pub fn sleeper(dir: &Path, name: &str) -> PathBuf {
    script(dir, name, "sleep \"$1\"")
}

/// Spin until `pid` reports process name `name`.
pub fn wait_until_named(pid: u32, name: &str) {
    for _ in 0..250 {
        if ProcessTable::of(pid).name_of(pid).as_deref() == Some(name) {
            return;
        }
        std::thread::sleep(Duration::from_millis(20));
    }
    panic!("process {pid} never showed up as {name}");
}

/// Spin until `pid` is gone. Returns false if it outlived the wait.
pub fn wait_until_gone(pid: u32) -> bool {
    for _ in 0..250 {
        if !ProcessTable::of(pid).is_running(pid) {
            return true;
        }
        std::thread::sleep(Duration::from_millis(20));
    }
    false
}

/// Pid of a process that has already exited and been reaped.
pub fn dead_pid() -> u32 {
    let mut child = std::process::Command::new("true").spawn().unwrap();
    let pid = child.id();
    child.wait().unwrap();
    pid
}
