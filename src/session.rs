/// Subprocesses of the supervisor: re-invocations of this binary for `watch`
/// and `reap`, each in its own process group with output forwarded to the log.
use crate::config::PIDFILE_DIR_ENV;
use crate::crash_loop::{Launcher, RestartRequester};
use crate::request::SupervisionRequest;
use std::ffi::OsStr;
use std::path::{Path, PathBuf};
use std::process::Stdio;
use tokio::io::{AsyncBufReadExt, AsyncRead, BufReader};
use tokio::process::Command;

/// Environment variable carrying the escalation reason to the restart command.
pub const RESTART_REASON_ENV: &str = "X11_WARDEN_RESTART_REASON";

/// Errors that can occur while running a subprocess.
#[derive(Debug)]
pub enum LaunchError {
    /// Failed to spawn the subprocess.
    Spawn {
        program: String,
        source: std::io::Error,
    },
    /// Failed while waiting for the subprocess to exit.
    Wait { source: std::io::Error },
}

impl std::fmt::Display for LaunchError {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        match self {
            LaunchError::Spawn { program, source } => {
                write!(f, "failed to spawn {}: {}", program, source)
            }
            LaunchError::Wait { source } => {
                write!(f, "failed to wait for subprocess: {}", source)
            }
        }
    }
}

impl std::error::Error for LaunchError {
    fn source(&self) -> Option<&(dyn std::error::Error + 'static)> {
        match self {
            LaunchError::Spawn { source, .. } => Some(source),
            LaunchError::Wait { source } => Some(source),
        }
    }
}

/// How to re-invoke this binary for one of its subcommands.
#[derive(Debug, Clone)]
pub struct SelfCommand {
    exe: PathBuf,
    config_path: PathBuf,
    pid_dir: PathBuf,
}

impl SelfCommand {
    pub fn new(exe: impl Into<PathBuf>, config_path: impl Into<PathBuf>, pid_dir: impl Into<PathBuf>) -> Self {
        Self {
            exe: exe.into(),
            config_path: config_path.into(),
            pid_dir: pid_dir.into(),
        }
    }

    /// The running executable.
    pub fn current(config_path: &Path, pid_dir: &Path) -> std::io::Result<Self> {
        Ok(Self::new(std::env::current_exe()?, config_path, pid_dir))
    }

    /// Build `{exe} --config {path} {args..}`.
    ///
    /// The child gets its own process group so that terminal signals aimed at
    /// the supervisor do not reach it; it notices the supervisor's death on
    /// its own.
    pub fn command<S: AsRef<OsStr>>(&self, args: &[S]) -> Command {
        let mut cmd = Command::new(&self.exe);
        cmd.arg("--config")
            .arg(&self.config_path)
            .args(args)
            .env(PIDFILE_DIR_ENV, &self.pid_dir)
            .stdin(Stdio::null())
            .stdout(Stdio::piped())
            .stderr(Stdio::piped())
            .process_group(0);
        cmd
    }

    fn program(&self) -> String {
        self.exe.display().to_string()
    }
}

async fn forward_lines<R: AsyncRead + Unpin>(reader: R, label: String, stream: &'static str) {
    let mut lines = BufReader::new(reader).lines();
    loop {
        match lines.next_line().await {
            Ok(Some(line)) => tracing::info!(session = %label, stream, "{line}"),
            Ok(None) => break,
            Err(e) => {
                tracing::debug!(session = %label, stream, error = %e, "output stream failed");
                break;
            }
        }
    }
}

/// Spawn `cmd`, forward its stdout and stderr to the log line by line, and
/// wait for it. Returns the exit code (None if killed by a signal).
pub async fn run_to_completion(
    mut cmd: Command,
    program: &str,
    label: &str,
) -> Result<Option<i32>, LaunchError> {
    let mut child = cmd.spawn().map_err(|e| LaunchError::Spawn {
        program: program.to_string(),
        source: e,
    })?;
    let pid = child.id().unwrap_or(0);
    tracing::debug!(session = %label, pid, "subprocess started");

    let mut forwarders = Vec::with_capacity(2);
    if let Some(out) = child.stdout.take() {
        forwarders.push(tokio::spawn(forward_lines(out, label.to_string(), "stdout")));
    }
    if let Some(err) = child.stderr.take() {
        forwarders.push(tokio::spawn(forward_lines(err, label.to_string(), "stderr")));
    }

    let status = child
        .wait()
        .await
        .map_err(|e| LaunchError::Wait { source: e })?;
    for forwarder in forwarders {
        let _ = forwarder.await;
    }

    tracing::debug!(session = %label, pid, exit_code = ?status.code(), "subprocess exited");
    Ok(status.code())
}

/// Runs `reap NAME` for each name, one after another.
pub async fn reap_orphans(program: &SelfCommand, names: &[String]) {
    for name in names {
        let cmd = program.command(&["reap", name.as_str()]);
        let label = format!("reap {name}");
        if let Err(e) = run_to_completion(cmd, &program.program(), &label).await {
            tracing::warn!(target_name = %name, error = %e, "orphan reaper did not run");
        }
    }
}

/// Launches one watchdog per run for a supervised session.
pub struct WatchdogLauncher {
    program: SelfCommand,
    request: SupervisionRequest,
    label: String,
}

impl WatchdogLauncher {
    pub fn new(program: SelfCommand, request: SupervisionRequest, label: impl Into<String>) -> Self {
        Self {
            program,
            request,
            label: label.into(),
        }
    }

    /// Arguments of the `watch` invocation.
    pub fn args(&self) -> Vec<String> {
        let mut args = vec!["watch".to_string()];
        args.extend(self.request.to_args());
        args
    }
}

impl Launcher for WatchdogLauncher {
    async fn launch(&mut self) -> Result<(), LaunchError> {
        let cmd = self.program.command(&self.args());
        tracing::info!(session = %self.label, command = %self.request.command, "launching watchdog");
        let code = run_to_completion(cmd, &self.program.program(), &self.label).await?;
        tracing::info!(session = %self.label, exit_code = ?code, "watchdog exited");
        Ok(())
    }
}

/// Requests a restart by running a shell command, if one is configured.
#[derive(Debug, Clone, Default)]
pub struct CommandRestart {
    command: Option<String>,
}

impl CommandRestart {
    pub fn new(command: Option<String>) -> Self {
        Self { command }
    }
}

impl RestartRequester for CommandRestart {
    async fn request_restart(&mut self, reason: &str) {
        let Some(command) = &self.command else {
            tracing::error!(reason, "no restart command configured, restart the supervisor manually");
            return;
        };

        tracing::warn!(reason, command = %command, "requesting restart");
        let status = Command::new("sh")
            .arg("-c")
            .arg(command)
            .env(RESTART_REASON_ENV, reason)
            .stdin(Stdio::null())
            .status()
            .await;
        match status {
            Ok(s) if s.success() => tracing::info!("restart command completed"),
            Ok(s) => tracing::error!(exit_code = ?s.code(), "restart command failed"),
            Err(e) => tracing::error!(error = %e, "failed to run restart command"),
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::test_support::script;
    use std::collections::BTreeMap;

    fn request() -> SupervisionRequest {
        SupervisionRequest {
            command: "xvfb-run -n 99 xterm".to_string(),
            env: BTreeMap::from([("LANG".to_string(), "en_US.UTF-8".to_string())]),
            kill_target: Some("Xvfb".to_string()),
            session_id: Some("99".to_string()),
            heartbeat: None,
        }
    }

    #[test]
    fn test_watchdog_args_wrap_the_request() {
        let launcher = WatchdogLauncher::new(
            SelfCommand::new("/bin/x11-warden", "warden.toml", "/tmp/pids"),
            request(),
            "Xvfb 99",
        );
        assert_eq!(
            launcher.args(),
            vec![
                "watch",
                "xvfb-run -n 99 xterm",
                r#"{"LANG":"en_US.UTF-8"}"#,
                "Xvfb",
                "99",
                "None",
            ]
        );
    }

    #[tokio::test]
    async fn test_self_command_passes_config_args_and_pid_dir() {
        let dir = tempfile::tempdir().unwrap();
        let log = dir.path().join("invocation");
        let exe = script(
            dir.path(),
            "fake-warden",
            &format!(
                "echo \"$@\" > {log}\necho \"${PIDFILE_DIR_ENV}\" >> {log}\necho to-stderr >&2\nexit 3",
                log = log.display()
            ),
        );
        let program = SelfCommand::new(&exe, "warden.toml", "/tmp/pids");

        let code = run_to_completion(program.command(&["reap", "Xvfb"]), "fake-warden", "test")
            .await
            .unwrap();
        assert_eq!(code, Some(3));

        let invocation = std::fs::read_to_string(&log).unwrap();
        let mut lines = invocation.lines();
        assert_eq!(lines.next(), Some("--config warden.toml reap Xvfb"));
        assert_eq!(lines.next(), Some("/tmp/pids"));
    }

    #[tokio::test]
    async fn test_launch_runs_watch_subcommand() {
        let dir = tempfile::tempdir().unwrap();
        let log = dir.path().join("invocation");
        let exe = script(
            dir.path(),
            "fake-warden",
            &format!("echo \"$3 $7\" > {}", log.display()),
        );
        let mut launcher = WatchdogLauncher::new(
            SelfCommand::new(&exe, "warden.toml", dir.path()),
            request(),
            "Xvfb 99",
        );

        launcher.launch().await.unwrap();
        assert_eq!(std::fs::read_to_string(&log).unwrap().trim(), "watch 99");
    }

    #[tokio::test]
    async fn test_launch_spawn_failure() {
        let mut launcher = WatchdogLauncher::new(
            SelfCommand::new("/nonexistent/x11-warden", "warden.toml", "/tmp/pids"),
            request(),
            "Xvfb 99",
        );
        let err = launcher.launch().await.unwrap_err();
        assert!(matches!(err, LaunchError::Spawn { .. }));
        assert!(err.to_string().contains("failed to spawn"));
    }

    #[tokio::test]
    async fn test_reap_orphans_runs_once_per_name() {
        let dir = tempfile::tempdir().unwrap();
        let log = dir.path().join("reaped");
        let exe = script(
            dir.path(),
            "fake-warden",
            &format!("echo \"$4\" >> {}", log.display()),
        );
        let program = SelfCommand::new(&exe, "warden.toml", dir.path());

        reap_orphans(&program, &["Xvfb".to_string(), "cygserver".to_string()]).await;
        assert_eq!(std::fs::read_to_string(&log).unwrap(), "Xvfb\ncygserver\n");
    }

    #[tokio::test]
    async fn test_restart_command_receives_reason() {
        let dir = tempfile::tempdir().unwrap();
        let out = dir.path().join("reason");
        let mut restart = CommandRestart::new(Some(format!(
            "printf '%s' \"${RESTART_REASON_ENV}\" > {}",
            out.display()
        )));

        restart.request_restart("Xvfb 99 failed 6 times in a row").await;
        assert_eq!(
            std::fs::read_to_string(&out).unwrap(),
            "Xvfb 99 failed 6 times in a row"
        );
    }

    #[tokio::test]
    async fn test_restart_without_command_only_logs() {
        let mut restart = CommandRestart::default();
        restart.request_restart("nothing to run").await;
    }
}
