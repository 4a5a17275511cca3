use crate::config::CrashLoopConfig;
use crate::session::LaunchError;
use std::future::Future;
use tokio::time::{sleep, Instant};

/// Decision returned by the crash-loop policy after a run ends.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum CrashDecision {
    /// Wait out the backoff and launch again.
    Backoff { crash_count: u32 },
    /// Too many rapid failures: ask for a full restart, then cool down.
    Escalate { crash_count: u32 },
}

/// Where a session's controller currently is.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum Phase {
    Starting,
    Running,
    Settled,
    CrashLooping,
    Escalated,
}

/// Consecutive rapid-failure counter.
///
/// A run that survives the settle duration resets the count; every run that
/// ends counts as a crash. The threshold is checked after incrementing, so
/// with threshold N the (N+1)th consecutive crash escalates.
pub struct CrashLoopPolicy {
    threshold: u32,
    crash_count: u32,
}

impl CrashLoopPolicy {
    pub fn new(threshold: u32) -> Self {
        Self {
            threshold,
            crash_count: 0,
        }
    }

    /// The current run outlived the settle duration.
    pub fn settled(&mut self) {
        self.crash_count = 0;
    }

    /// Record the end of a run and decide what to do next.
    pub fn record_crash(&mut self) -> CrashDecision {
        self.crash_count += 1;
        if self.crash_count > self.threshold {
            CrashDecision::Escalate {
                crash_count: self.crash_count,
            }
        } else {
            CrashDecision::Backoff {
                crash_count: self.crash_count,
            }
        }
    }

    pub fn crash_count(&self) -> u32 {
        self.crash_count
    }
}

/// Starts one supervised run and resolves when it is over.
pub trait Launcher {
    fn launch(&mut self) -> impl Future<Output = Result<(), LaunchError>> + Send;
}

/// Asks whatever supervises this process for a full restart.
pub trait RestartRequester {
    fn request_restart(&mut self, reason: &str) -> impl Future<Output = ()> + Send;
}

/// Drives one session: launch, race the settle timer against the run,
/// count the crash, back off, repeat.
pub struct CrashLoop<L, R> {
    label: String,
    config: CrashLoopConfig,
    policy: CrashLoopPolicy,
    phase: Phase,
    run_started: Option<Instant>,
    launcher: L,
    restarter: R,
}

impl<L: Launcher, R: RestartRequester> CrashLoop<L, R> {
    pub fn new(label: impl Into<String>, config: CrashLoopConfig, launcher: L, restarter: R) -> Self {
        Self {
            label: label.into(),
            policy: CrashLoopPolicy::new(config.crash_threshold),
            config,
            phase: Phase::Starting,
            run_started: None,
            launcher,
            restarter,
        }
    }

    #[cfg(test)]
    pub fn phase(&self) -> Phase {
        self.phase
    }

    #[cfg(test)]
    pub fn crash_count(&self) -> u32 {
        self.policy.crash_count()
    }

    /// When the most recent run was launched.
    #[cfg(test)]
    pub fn run_started(&self) -> Option<Instant> {
        self.run_started
    }

    /// Run one launch-to-relaunch cycle, including backoff (and cooldown
    /// when escalating).
    pub async fn step(&mut self) -> CrashDecision {
        let launch = self.launcher.launch();
        tokio::pin!(launch);
        self.phase = Phase::Running;
        self.run_started = Some(Instant::now());

        let result = tokio::select! {
            result = &mut launch => result,
            _ = sleep(self.config.settle()) => {
                tracing::info!(session = %self.label, "appears to be running");
                self.phase = Phase::Settled;
                self.policy.settled();
                launch.await
            }
        };
        if let Err(e) = result {
            tracing::warn!(session = %self.label, error = %e, "launch failed");
        }
        let uptime_secs = self.run_started.map_or(0, |at| at.elapsed().as_secs());

        let decision = self.policy.record_crash();
        if let CrashDecision::Escalate { crash_count } = decision {
            self.phase = Phase::Escalated;
            tracing::error!(
                session = %self.label,
                crash_count,
                "could not start {crash_count} times, requesting full restart"
            );
            let reason = format!("{} failed {crash_count} times in a row", self.label);
            self.restarter.request_restart(&reason).await;
            sleep(self.config.cooldown()).await;
        }

        self.phase = Phase::CrashLooping;
        tracing::warn!(
            session = %self.label,
            crash_count = self.policy.crash_count(),
            uptime_secs,
            backoff_secs = self.config.backoff_secs,
            "crashed, restarting after backoff"
        );
        sleep(self.config.backoff()).await;
        decision
    }

    /// Cycle forever.
    pub async fn run(mut self) {
        loop {
            self.step().await;
        }
    }
}
