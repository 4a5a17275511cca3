/// Dead-man switch for one launched command.
///
/// Launches the command in its own process group, finds the real target
/// among the shell's descendants by name, records its pid, then polls until
/// the command exits, the supervisor that spawned us disappears, or the
/// supervisor's heartbeat goes stale. Whatever the reason, the target tree
/// is torn down and the PID record removed before returning.
use crate::config::WatchdogConfig;
use crate::heartbeat::HeartbeatMonitor;
use crate::pidfile::{PidDir, PidRecord};
use crate::procs::{self, ProcessIdentity, ProcessTable};
use crate::request::SupervisionRequest;
use crate::signals::say;
use nix::sys::signal::Signal;
use std::process::Stdio;
use tokio::process::Command;
use tokio::task::JoinHandle;
use tokio::time::MissedTickBehavior;

/// Why the monitoring loop ended.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum ExitReason {
    /// The launched command finished on its own.
    TargetExited,
    /// The process that spawned the watchdog is gone.
    ParentGone,
    /// The heartbeat token stopped being refreshed.
    HeartbeatStale,
}

/// Result of one watchdog run.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum WatchdogOutcome {
    /// The shell could not be started.
    SpawnFailed,
    /// The target never appeared; no record was written.
    Unresolved,
    /// The target was located, supervised and torn down.
    Finished { pid: u32, reason: ExitReason },
}

pub struct Watchdog {
    config: WatchdogConfig,
    pids: PidDir,
    parent: ProcessIdentity,
}

impl Watchdog {
    /// Watchdog whose liveness is tied to the process that spawned this one.
    pub fn new(config: WatchdogConfig, pids: PidDir) -> Self {
        Self {
            config,
            pids,
            parent: ProcessIdentity::parent_of_current(),
        }
    }

    /// Tie liveness to `parent` instead of the spawning process.
    #[cfg(test)]
    pub fn with_parent(mut self, parent: ProcessIdentity) -> Self {
        self.parent = parent;
        self
    }

    pub async fn run(&self, request: &SupervisionRequest) -> WatchdogOutcome {
        let name = request.target_name().to_string();
        tracing::info!(command = %request.command, target_name = %name, "running");
        say(format!("{name} starting"));

        let mut child = match spawn_detached(request) {
            Ok(child) => child,
            Err(e) => {
                tracing::error!(error = %e, command = %request.command, "failed to launch command");
                return WatchdogOutcome::SpawnFailed;
            }
        };
        let Some(root) = child.id() else {
            tracing::error!("launched command exited before its pid was read");
            return WatchdogOutcome::SpawnFailed;
        };

        let runner = tokio::spawn(async move {
            match child.wait().await {
                Ok(status) => tracing::info!(pid = root, ?status, "launched command exited"),
                Err(e) => tracing::warn!(pid = root, error = %e, "failed to wait on launched command"),
            }
        });

        let Some(target) = self.locate(root, &name, &runner).await else {
            procs::signal_group(root, Signal::SIGTERM);
            let _ = tokio::time::timeout(self.config.terminate_grace(), runner).await;
            return WatchdogOutcome::Unresolved;
        };
        let located = target.pid();
        tracing::info!(pid = located, target_name = %name, "located target process");

        let key = request.record_key();
        let record = match self.pids.write(&key, located) {
            Ok(record) => Some(record),
            Err(e) => {
                tracing::warn!(error = %e, "failed to write PID record, supervising anyway");
                None
            }
        };

        let heartbeat = request
            .heartbeat
            .as_ref()
            .map(|path| HeartbeatMonitor::new(path, self.config.heartbeat_max_misses));
        let reason = self.monitor(&runner, heartbeat).await;

        match reason {
            ExitReason::TargetExited => say(format!("{name} exited by itself")),
            ExitReason::ParentGone => tracing::warn!("supervisor is gone"),
            ExitReason::HeartbeatStale => tracing::warn!("supervisor heartbeat went stale"),
        }

        self.teardown(request, target, root, runner, record).await;
        WatchdogOutcome::Finished {
            pid: located,
            reason,
        }
    }

    /// Poll the launched tree for the named target.
    async fn locate(
        &self,
        root: u32,
        name: &str,
        runner: &JoinHandle<()>,
    ) -> Option<ProcessIdentity> {
        for _ in 0..self.config.resolve_attempts {
            if runner.is_finished() {
                tracing::warn!(target_name = name, "command finished before its target appeared");
                return None;
            }
            let table = ProcessTable::snapshot();
            if let Some(pid) = table.find_in_tree(root, name) {
                return Some(table.identity(pid));
            }
            tokio::time::sleep(self.config.resolve_interval()).await;
        }
        tracing::warn!(
            target_name = name,
            attempts = self.config.resolve_attempts,
            "target process never appeared"
        );
        None
    }

    /// Block until the first exit condition holds, checking once per poll tick.
    async fn monitor(
        &self,
        runner: &JoinHandle<()>,
        mut heartbeat: Option<HeartbeatMonitor>,
    ) -> ExitReason {
        let mut ticker = tokio::time::interval(self.config.poll_interval());
        ticker.set_missed_tick_behavior(MissedTickBehavior::Delay);
        loop {
            ticker.tick().await;
            if runner.is_finished() {
                return ExitReason::TargetExited;
            }
            if !self.parent.is_running() {
                return ExitReason::ParentGone;
            }
            if let Some(heartbeat) = heartbeat.as_mut() {
                if heartbeat.observe() {
                    tracing::debug!(misses = heartbeat.misses(), "heartbeat miss limit exceeded");
                    return ExitReason::HeartbeatStale;
                }
            }
        }
    }

    /// Kill the target tree, then drop the record. Never fails.
    async fn teardown(
        &self,
        request: &SupervisionRequest,
        target: ProcessIdentity,
        root: u32,
        mut runner: JoinHandle<()>,
        record: Option<PidRecord>,
    ) {
        let name = request.target_name();
        say(format!("{name} exiting"));
        let grace = self.config.terminate_grace();

        // the pid may have been recycled since the target exited
        if target.is_running() {
            if let Some(kill_target) = &request.kill_target {
                let killed = procs::kill_matching_descendants(target.pid(), kill_target);
                target.signal(Signal::SIGKILL);
                tracing::debug!(pid = target.pid(), descendants = killed, "killed target tree");
            }
            procs::terminate(&target, grace).await;
        } else {
            tracing::debug!(pid = target.pid(), "target already gone");
        }

        procs::signal_group(root, Signal::SIGTERM);
        if tokio::time::timeout(grace, &mut runner).await.is_err() {
            tracing::warn!(pgid = root, "launched command ignored SIGTERM, killing its group");
            procs::signal_group(root, Signal::SIGKILL);
            let _ = tokio::time::timeout(grace, runner).await;
        }

        if let Some(record) = record {
            tracing::debug!(pid = record.pid(), record = %record.path().display(), "removing PID record");
            record.remove();
        }
        say(format!("{name} exited"));
    }
}

/// Start `request.command` under `sh -c` as the leader of a new process group.
fn spawn_detached(request: &SupervisionRequest) -> std::io::Result<tokio::process::Child> {
    Command::new("sh")
        .arg("-c")
        .arg(&request.command)
        .envs(&request.env)
        .stdin(Stdio::null())
        .process_group(0)
        .spawn()
}
