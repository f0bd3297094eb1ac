//! Run-duration watchdog with staged termination.
//!
//! The timer starts when [`Watchdog::watch`] is entered (right after spawn).
//! On expiry the process group gets SIGTERM; if it is still alive after the
//! grace period it gets SIGKILL. Both steps leave a `[WATCHDOG]` marker in
//! the run log. Once the child exits every pending timer is dropped with the
//! `select!`, so no signal is sent after exit.

use std::process::ExitStatus;
use std::time::Duration;

use tokio::process::Child;
use tracing::{debug, warn};

use crate::config::RunnerConfig;
use crate::logs::LogWriter;

/// Marker prefix for watchdog lines in the run log.
pub const WATCHDOG_MARKER: &str = "[WATCHDOG]";

/// Result of watching a child until it is gone.
#[derive(Debug)]
pub enum Watched {
    /// The child exited before the deadline.
    Exited(std::io::Result<ExitStatus>),
    /// The watchdog had to terminate the child.
    Terminated(std::io::Result<ExitStatus>),
}

/// Render a limit as it appears in the run log and the run's error, e.g.
/// `180s` or `300ms`.
pub fn describe_limit(limit: Duration) -> String {
    format!("{limit:?}")
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct Watchdog {
    pub limit: Duration,
    pub grace: Duration,
}

impl Watchdog {
    pub fn new(limit: Duration, grace: Duration) -> Self {
        Self { limit, grace }
    }

    pub fn from_config(runner: &RunnerConfig) -> Self {
        Self::new(runner.max_run_duration(), runner.grace_period())
    }

    /// Wait for `child`, enforcing the run-duration limit.
    pub async fn watch(&self, child: &mut Child, log: &LogWriter) -> Watched {
        let deadline = tokio::time::sleep(self.limit);
        tokio::pin!(deadline);

        tokio::select! {
            status = child.wait() => return Watched::Exited(status),
            _ = &mut deadline => {}
        }

        let limit = describe_limit(self.limit);
        warn!(pid = child.id(), %limit, "watchdog fired, sending SIGTERM");
        log.append_line(&format!("\n{WATCHDOG_MARKER} Exceeded {limit}. Sending SIGTERM"))
            .await;
        terminate(child);

        let grace = tokio::time::sleep(self.grace);
        tokio::pin!(grace);

        tokio::select! {
            status = child.wait() => return Watched::Terminated(status),
            _ = &mut grace => {}
        }

        warn!(pid = child.id(), "child still alive after grace period, sending SIGKILL");
        log.append_line(&format!("{WATCHDOG_MARKER} Forcing SIGKILL")).await;
        kill(child);
        if let Err(e) = child.kill().await {
            debug!(error = %e, "direct SIGKILL of child failed");
        }

        Watched::Terminated(child.wait().await)
    }
}

/// Ask the child's process group to stop.
#[cfg(unix)]
fn terminate(child: &Child) {
    signal_group(child, libc::SIGTERM);
}

#[cfg(not(unix))]
fn terminate(child: &mut Child) {
    if let Err(e) = child.start_kill() {
        warn!(error = %e, "failed to terminate child");
    }
}

#[cfg(unix)]
fn kill(child: &Child) {
    signal_group(child, libc::SIGKILL);
}

#[cfg(not(unix))]
fn kill(_child: &Child) {}

/// Signal the process group led by `child`, falling back to the child alone.
#[cfg(unix)]
fn signal_group(child: &Child, signal: libc::c_int) {
    let Some(pid) = child.id() else {
        return;
    };
    let pid = pid as libc::pid_t;
    // A negative pid addresses the whole group; the child leads its own.
    let rc = unsafe { libc::kill(-pid, signal) };
    if rc != 0 {
        let rc = unsafe { libc::kill(pid, signal) };
        if rc != 0 {
            warn!(pid, signal, error = %std::io::Error::last_os_error(), "failed to signal child");
        }
    }
}
