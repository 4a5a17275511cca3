/// Process-table queries and signalling.
///
/// Discovery works on a `sysinfo` snapshot (parent/child links and names);
/// signals are delivered with `nix`. Zombies count as gone everywhere, since
/// a zombie has already released everything a caller cares about.
use nix::errno::Errno;
use nix::sys::signal::{kill, killpg, Signal};
use nix::unistd::Pid as NixPid;
use std::collections::{HashMap, HashSet, VecDeque};
use std::path::Path;
use std::time::Duration;
use sysinfo::{
    Pid, Process, ProcessRefreshKind, ProcessStatus, ProcessesToUpdate, System, UpdateKind,
};
use tokio::time::Instant;

/// Executable suffix some platforms report as part of the process name.
pub const EXE_SUFFIX: &str = ".exe";

/// Linux keeps at most this many bytes of a process name (`comm`).
const COMM_LEN: usize = 15;

/// How often `terminate` re-checks whether the process has exited.
const EXIT_POLL: Duration = Duration::from_millis(50);

/// True if a process called `name` is an instance of `target`.
pub fn name_matches(name: &str, target: &str) -> bool {
    name == target || name.strip_suffix(EXE_SUFFIX) == Some(target)
}

/// A point-in-time view of the process table.
pub struct ProcessTable {
    system: System,
}

impl ProcessTable {
    /// Snapshot every process on the system.
    pub fn snapshot() -> Self {
        Self::refreshed(ProcessesToUpdate::All)
    }

    /// Snapshot a single process.
    pub fn of(pid: u32) -> Self {
        Self::refreshed(ProcessesToUpdate::Some(&[Pid::from_u32(pid)]))
    }

    fn refreshed(which: ProcessesToUpdate<'_>) -> Self {
        let mut system = System::new();
        let kind = ProcessRefreshKind::new()
            .with_cmd(UpdateKind::OnlyIfNotSet)
            .with_exe(UpdateKind::OnlyIfNotSet);
        system.refresh_processes_specifics(which, true, kind);
        Self { system }
    }

    fn live(&self, pid: u32) -> Option<&Process> {
        self.system
            .process(Pid::from_u32(pid))
            .filter(|p| p.status() != ProcessStatus::Zombie)
    }

    pub fn is_running(&self, pid: u32) -> bool {
        self.live(pid).is_some()
    }

    pub fn name_of(&self, pid: u32) -> Option<String> {
        self.live(pid).map(full_name)
    }

    pub fn start_time_of(&self, pid: u32) -> Option<u64> {
        self.live(pid).map(Process::start_time)
    }

    /// Pin `pid` to the process currently holding it in this snapshot.
    pub fn identity(&self, pid: u32) -> ProcessIdentity {
        ProcessIdentity {
            pid,
            start_time: self.start_time_of(pid),
        }
    }

    /// `root` followed by all of its live descendants, breadth-first.
    ///
    /// Empty if `root` itself is not running.
    pub fn descendants(&self, root: u32) -> Vec<u32> {
        if !self.is_running(root) {
            return Vec::new();
        }

        let mut children: HashMap<u32, Vec<u32>> = HashMap::new();
        for (pid, process) in self.system.processes() {
            if process.status() == ProcessStatus::Zombie {
                continue;
            }
            if let Some(parent) = process.parent() {
                children
                    .entry(parent.as_u32())
                    .or_default()
                    .push(pid.as_u32());
            }
        }

        let mut ordered = Vec::new();
        let mut seen = HashSet::new();
        let mut queue = VecDeque::from([root]);
        while let Some(pid) = queue.pop_front() {
            if !seen.insert(pid) {
                continue;
            }
            ordered.push(pid);
            if let Some(kids) = children.get(&pid) {
                let mut kids = kids.clone();
                kids.sort_unstable();
                queue.extend(kids);
            }
        }
        ordered
    }

    /// First process in `root`'s tree (root included) named `target`.
    pub fn find_in_tree(&self, root: u32, target: &str) -> Option<u32> {
        self.descendants(root)
            .into_iter()
            .find(|&pid| self.name_of(pid).is_some_and(|n| name_matches(&n, target)))
    }

    /// Descendants of `root` (root excluded) named `target`.
    pub fn matching_descendants(&self, root: u32, target: &str) -> Vec<u32> {
        self.descendants(root)
            .into_iter()
            .skip(1)
            .filter(|&pid| self.name_of(pid).is_some_and(|n| name_matches(&n, target)))
            .collect()
    }
}

/// Process name with the kernel's `comm` truncation undone.
///
/// A name cut at `COMM_LEN` bytes is replaced by the basename of argv[0] or
/// of the executable, whichever extends it.
fn full_name(process: &Process) -> String {
    let comm = process.name().to_string_lossy().into_owned();
    if comm.len() < COMM_LEN {
        return comm;
    }
    let argv0 = process.cmd().first().map(|arg| Path::new(arg));
    argv0
        .into_iter()
        .chain(process.exe())
        .filter_map(|path| path.file_name())
        .map(|base| base.to_string_lossy().into_owned())
        .find(|base| base.len() > comm.len() && base.starts_with(&comm))
        .unwrap_or(comm)
}

/// A process pinned by pid and start time, so a recycled pid is not
/// mistaken for the original process.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct ProcessIdentity {
    pid: u32,
    start_time: Option<u64>,
}

impl ProcessIdentity {
    pub fn of(pid: u32) -> Self {
        ProcessTable::of(pid).identity(pid)
    }

    /// Identity of whoever spawned the current process.
    pub fn parent_of_current() -> Self {
        Self::of(std::os::unix::process::parent_id())
    }

    pub fn pid(&self) -> u32 {
        self.pid
    }

    pub fn is_running(&self) -> bool {
        let Some(expected) = self.start_time else {
            return false;
        };
        ProcessTable::of(self.pid).start_time_of(self.pid) == Some(expected)
    }

    /// Send `signal` unless the pid no longer belongs to this process.
    pub fn signal(&self, signal: Signal) -> bool {
        if !self.is_running() {
            tracing::debug!(pid = self.pid, ?signal, "process is gone, not signalling its pid");
            return false;
        }
        send_signal(self.pid, signal)
    }
}

fn to_nix(pid: u32) -> Option<NixPid> {
    // pid 0 and negative pids address process groups, never a single process
    i32::try_from(pid).ok().filter(|&p| p > 0).map(NixPid::from_raw)
}

/// Send `signal` to one process. Returns false if it was already gone.
pub fn send_signal(pid: u32, signal: Signal) -> bool {
    let Some(target) = to_nix(pid) else {
        return false;
    };
    match kill(target, signal) {
        Ok(()) => true,
        Err(Errno::ESRCH) => false,
        Err(e) => {
            tracing::debug!(pid, ?signal, error = %e, "failed to signal process");
            false
        }
    }
}

/// Send `signal` to every member of a process group.
pub fn signal_group(pgid: u32, signal: Signal) -> bool {
    let Some(group) = to_nix(pgid) else {
        return false;
    };
    match killpg(group, signal) {
        Ok(()) => true,
        Err(Errno::ESRCH) | Err(Errno::EPERM) => false,
        Err(e) => {
            tracing::debug!(pgid, ?signal, error = %e, "failed to signal process group");
            false
        }
    }
}

pub fn kill_pid(pid: u32) -> bool {
    send_signal(pid, Signal::SIGKILL)
}

/// SIGKILL every descendant of `root` named `target`. Returns how many were signalled.
pub fn kill_matching_descendants(root: u32, target: &str) -> usize {
    let table = ProcessTable::snapshot();
    table
        .matching_descendants(root, target)
        .into_iter()
        .filter(|&pid| {
            let killed = kill_pid(pid);
            if killed {
                tracing::debug!(pid, target, "killed matching descendant");
            }
            killed
        })
        .count()
}

/// Block until `target` is gone or `timeout` passes. Returns true if it exited.
pub async fn wait_for_exit(target: &ProcessIdentity, timeout: Duration) -> bool {
    let deadline = Instant::now() + timeout;
    loop {
        if !target.is_running() {
            return true;
        }
        if Instant::now() >= deadline {
            return false;
        }
        tokio::time::sleep(EXIT_POLL).await;
    }
}

/// SIGTERM `target` and wait for it to exit, escalating to SIGKILL after
/// `grace`. A recycled pid is never signalled.
pub async fn terminate(target: &ProcessIdentity, grace: Duration) {
    if !target.signal(Signal::SIGTERM) {
        return;
    }
    if wait_for_exit(target, grace).await {
        return;
    }
    tracing::warn!(pid = target.pid(), "process ignored SIGTERM, sending SIGKILL");
    target.signal(Signal::SIGKILL);
    wait_for_exit(target, grace).await;
}
