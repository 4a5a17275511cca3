mod config;
mod crash_loop;
mod data_dir;
mod display;
mod heartbeat;
mod pidfile;
mod procs;
mod reaper;
mod request;
mod session;
mod signals;
mod supervisor;
#[cfg(test)]
mod test_support;
mod watchdog;

use clap::{Parser, Subcommand};
use std::path::PathBuf;

/// Crash-safe supervision of virtual display sessions: a dead-man-switch
/// watchdog per session, an orphan reaper, and crash-loop restarts.
#[derive(Parser, Debug)]
#[command(name = "x11-warden", version, about)]
pub struct Cli {
    /// Config file path
    #[arg(short, long, global = true, default_value = "warden.toml")]
    config: PathBuf,

    /// Debug logging (resolution attempts, heartbeat misses, signals)
    #[arg(short, long, global = true)]
    verbose: bool,

    #[command(subcommand)]
    command: Commands,
}

#[derive(Subcommand, Debug)]
enum Commands {
    /// Launch a command and tear it down when it exits, the caller dies, or
    /// the heartbeat goes stale
    Watch {
        /// Shell command line to launch
        #[arg(allow_hyphen_values = true)]
        command: String,
        /// JSON object of extra environment variables
        env: String,
        /// Process name to locate and kill, or None
        kill_target: String,
        /// Session identifier for the PID record, or None
        session_id: String,
        /// Heartbeat file refreshed by the caller, or None
        heartbeat: String,
    },
    /// Kill processes recorded for NAME by earlier watchdogs and remove their records
    Reap {
        name: String,
    },
    /// Supervise every configured display session until interrupted
    Run {
        /// Print each session's command line and exit
        #[arg(long)]
        dry_run: bool,
    },
}

fn init_tracing(verbose: bool) {
    let default = if verbose {
        "x11_warden=debug"
    } else {
        "x11_warden=info"
    };
    tracing_subscriber::fmt()
        .with_env_filter(
            tracing_subscriber::EnvFilter::try_from_default_env()
                .unwrap_or_else(|_| tracing_subscriber::EnvFilter::new(default)),
        )
        .with_writer(std::io::stderr)
        .with_target(false)
        .init();
}

/// Config for `watch` and `reap`, which must always run to completion.
fn config_or_defaults(path: &std::path::Path) -> config::WardenConfig {
    config::load_config(path).unwrap_or_else(|e| {
        tracing::warn!(error = %e, "using default config");
        config::WardenConfig::default()
    })
}

#[tokio::main]
async fn main() {
    let cli = Cli::parse();
    init_tracing(cli.verbose);
    tracing::debug!(?cli, "parsed CLI arguments");

    match cli.command {
        Commands::Watch {
            command,
            env,
            kill_target,
            session_id,
            heartbeat,
        } => {
            if let Err(e) = signals::absorb_termination_signals() {
                tracing::warn!(error = %e, "failed to install signal handlers");
            }
            let cfg = config_or_defaults(&cli.config);
            let request = match request::SupervisionRequest::from_args(
                &command,
                &env,
                &kill_target,
                &session_id,
                &heartbeat,
            ) {
                Ok(r) => r,
                Err(e) => {
                    tracing::error!(error = %e, "invalid watch arguments");
                    return;
                }
            };
            let pids = pidfile::PidDir::new(config::pidfile_dir(
                data_dir::DataDir::new(&cfg.paths.data_dir).pids_dir(),
            ));
            let outcome = watchdog::Watchdog::new(cfg.watchdog, pids)
                .run(&request)
                .await;
            tracing::debug!(?outcome, "watchdog finished");
        }
        Commands::Reap { name } => {
            let cfg = config_or_defaults(&cli.config);
            let pids = pidfile::PidDir::new(config::pidfile_dir(
                data_dir::DataDir::new(&cfg.paths.data_dir).pids_dir(),
            ));
            let report = reaper::reap(&pids, &name);
            tracing::debug!(records = report.records, killed = report.killed, "reap finished");
        }
        Commands::Run { dry_run } => {
            let cfg = match config::load_config(&cli.config) {
                Ok(c) => c,
                Err(e) => {
                    tracing::error!(error = %e, "cannot start supervisor");
                    std::process::exit(1);
                }
            };
            let sup = supervisor::Supervisor::new(cfg, &cli.config);
            if dry_run {
                sup.dry_run();
                return;
            }
            let shutdown = async {
                if let Err(e) = tokio::signal::ctrl_c().await {
                    tracing::error!(error = %e, "failed to listen for Ctrl-C");
                    std::future::pending::<()>().await;
                }
            };
            if let Err(e) = sup.run(shutdown).await {
                tracing::error!(error = %e, "supervisor failed");
                std::process::exit(1);
            }
        }
    }
}
