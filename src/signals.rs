/// Signal handling for the watchdog.
///
/// SIGINT and SIGTERM are caught and dropped: the watchdog only stops when
/// its liveness checks say so. Catching (rather than ignoring) keeps the
/// launched command on default dispositions, since handlers reset on exec.
use tokio::signal::unix::{signal, SignalKind};

/// Install handlers that log and discard SIGINT and SIGTERM.
pub fn absorb_termination_signals() -> std::io::Result<()> {
    for (kind, name) in [
        (SignalKind::interrupt(), "SIGINT"),
        (SignalKind::terminate(), "SIGTERM"),
    ] {
        let mut stream = signal(kind)?;
        tokio::spawn(async move {
            while stream.recv().await.is_some() {
                tracing::debug!(signal = name, "ignoring signal, shutdown is liveness-driven");
            }
        });
    }
    Ok(())
}

/// Print a status line on stdout. The reader may already be gone during
/// shutdown, so write failures are dropped.
pub fn say(line: impl std::fmt::Display) {
    use std::io::Write;
    let mut out = std::io::stdout().lock();
    let _ = writeln!(out, "{line}");
    let _ = out.flush();
}

#[cfg(test)]
mod tests {
    use super::*;
    use nix::sys::signal::{raise, Signal};
    use std::time::Duration;

    #[tokio::test]
    async fn test_absorbed_sigterm_does_not_kill_process() {
        absorb_termination_signals().unwrap();
        raise(Signal::SIGTERM).unwrap();
        raise(Signal::SIGINT).unwrap();
        tokio::time::sleep(Duration::from_millis(50)).await;
        // still here
    }
}
