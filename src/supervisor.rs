/// The long-lived `run` command: reap what earlier supervisors left behind,
/// keep the heartbeat fresh, and drive one crash-loop controller per display.
///
/// Nothing is cleaned up on shutdown. Every watchdog notices that its parent
/// (or the heartbeat) is gone and tears its own session down.
use crate::config::{pidfile_dir, WardenConfig};
use crate::crash_loop::CrashLoop;
use crate::data_dir::DataDir;
use crate::display::{resolve_sessions, DisplaySession};
use crate::heartbeat;
use crate::request::SupervisionRequest;
use crate::session::{reap_orphans, CommandRestart, SelfCommand, WatchdogLauncher};
use crate::signals::say;
use std::future::Future;
use std::path::PathBuf;
use std::time::Duration;
use tokio::task::JoinHandle;

#[derive(Debug)]
pub enum SupervisorError {
    DataDir {
        path: PathBuf,
        source: std::io::Error,
    },
    CurrentExe { source: std::io::Error },
}

impl std::fmt::Display for SupervisorError {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        match self {
            SupervisorError::DataDir { path, source } => {
                write!(f, "failed to create data directory {}: {}", path.display(), source)
            }
            SupervisorError::CurrentExe { source } => {
                write!(f, "cannot locate own executable: {}", source)
            }
        }
    }
}

impl std::error::Error for SupervisorError {
    fn source(&self) -> Option<&(dyn std::error::Error + 'static)> {
        match self {
            SupervisorError::DataDir { source, .. } => Some(source),
            SupervisorError::CurrentExe { source } => Some(source),
        }
    }
}

pub struct Supervisor {
    config: WardenConfig,
    config_path: PathBuf,
    data_dir: DataDir,
}

impl Supervisor {
    pub fn new(config: WardenConfig, config_path: impl Into<PathBuf>) -> Self {
        let data_dir = DataDir::new(&config.paths.data_dir);
        Self {
            config,
            config_path: config_path.into(),
            data_dir,
        }
    }

    /// Heartbeat token for this supervisor, if heartbeats are enabled.
    pub fn heartbeat_path(&self) -> Option<PathBuf> {
        self.config
            .heartbeat
            .enabled
            .then(|| self.data_dir.heartbeat_file(std::process::id()))
    }

    /// Each configured display with the request its watchdog will run.
    pub fn plan(&self) -> Vec<(DisplaySession, SupervisionRequest)> {
        let heartbeat = self.heartbeat_path();
        resolve_sessions(&self.config.display)
            .into_iter()
            .map(|session| {
                let request = session.request(&self.config.paths, &self.data_dir, heartbeat.clone());
                (session, request)
            })
            .collect()
    }

    /// Print the plan without starting anything.
    pub fn dry_run(&self) {
        let plan = self.plan();
        if plan.is_empty() {
            say("no display sessions configured");
        }
        for (session, request) in plan {
            say(format!("{}: {}", session.label(), request.command));
        }
    }

    /// Supervise until `shutdown` resolves.
    pub async fn run(self, shutdown: impl Future<Output = ()>) -> Result<(), SupervisorError> {
        let root = self.data_dir.root().to_path_buf();
        self.data_dir
            .init()
            .map_err(|e| SupervisorError::DataDir { path: root, source: e })?;
        let cleared = self.data_dir.clear_stale_files();
        tracing::info!(data_dir = %self.data_dir.root().display(), cleared, "data directory ready");

        let pid_dir = pidfile_dir(self.data_dir.pids_dir());
        let program = SelfCommand::current(&self.config_path, &pid_dir)
            .map_err(|e| SupervisorError::CurrentExe { source: e })?;

        reap_orphans(&program, &self.config.reap_targets).await;

        let mut tasks: Vec<JoinHandle<()>> = Vec::new();
        if let Some(path) = self.heartbeat_path() {
            if let Err(e) = heartbeat::touch(&path) {
                tracing::warn!(error = %e, path = %path.display(), "failed to write heartbeat");
            }
            let every = Duration::from_secs(self.config.heartbeat.refresh_secs.max(1));
            tasks.push(tokio::spawn(heartbeat::beat(path, every)));
        }

        let plan = self.plan();
        if plan.is_empty() {
            tracing::warn!("no display sessions configured");
        }
        let startup_delay = Duration::from_secs(self.config.crash_loop.startup_delay_secs);
        for (session, request) in plan {
            let label = session.label();
            let launcher = WatchdogLauncher::new(program.clone(), request, label.clone());
            let restarter = CommandRestart::new(self.config.escalation.restart_command.clone());
            let controller = CrashLoop::new(label, self.config.crash_loop.clone(), launcher, restarter);
            tasks.push(tokio::spawn(async move {
                tokio::time::sleep(startup_delay).await;
                controller.run().await;
            }));
        }

        tracing::info!(sessions = tasks.len(), "supervisor running");
        shutdown.await;
        tracing::info!("shutting down, watchdogs will clean up their sessions");
        for task in &tasks {
            task.abort();
        }
        Ok(())
    }
}
