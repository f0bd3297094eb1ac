//! Owns one spawned test process from spawn to terminal record.

use std::process::{ExitStatus, Stdio};
use std::sync::Arc;
use std::time::Duration;

use chrono::Utc;
use tokio::io::{AsyncRead, AsyncReadExt};
use tokio::process::Command;
use tokio::task::JoinHandle;
use tracing::{debug, error, info, warn};

use super::watchdog::{Watchdog, Watched};
use super::{LaunchPlan, RunOutcome};
use crate::logs::LogWriter;
use crate::storage::{RunPatch, RunRecord, RunStore, StoreError};

/// How long to wait for the output pumps once the child is gone.
const PUMP_DRAIN_TIMEOUT: Duration = Duration::from_secs(2);

const PUMP_BUF_SIZE: usize = 8 * 1024;

/// Process supervisor. One `run` call per run; it is the only writer of that
/// run's status after creation.
#[derive(Clone)]
pub struct Supervisor {
    runs: RunStore,
    watchdog: Watchdog,
}

impl Supervisor {
    pub fn new(runs: RunStore, watchdog: Watchdog) -> Self {
        Self { runs, watchdog }
    }

    /// Spawn the planned process, supervise it to completion and persist the
    /// terminal state. Returns the terminal record.
    pub async fn run(&self, plan: LaunchPlan, log: Arc<LogWriter>) -> Result<RunRecord, StoreError> {
        let run_id = plan.run_id.as_str();

        let mut cmd = Command::new(&plan.program);
        cmd.args(&plan.args)
            .envs(&plan.env)
            .current_dir(&plan.working_dir)
            .stdin(Stdio::null())
            .stdout(Stdio::piped())
            .stderr(Stdio::piped())
            .kill_on_drop(true);
        #[cfg(unix)]
        cmd.process_group(0);

        let mut child = match cmd.spawn() {
            Ok(child) => child,
            Err(e) => {
                let msg = format!("failed to spawn '{}': {}", plan.program, e);
                error!(run_id, error = %e, program = %plan.program, "spawn failed");
                log.append_line(&format!("\n[ERROR] {msg}")).await;
                return self.finish(run_id, RunOutcome::SpawnFailed(msg)).await;
            }
        };

        let pid = child.id();
        let id = run_id.to_string();
        let started = RunPatch::running(Utc::now());
        if let Err(e) = self.runs.blocking(move |runs| runs.update(&id, started)).await {
            warn!(run_id, error = %e, "failed to mark run as running");
        }
        info!(run_id, pid, command = %plan.command_line(), "test process started");

        let mut pumps = Vec::with_capacity(2);
        if let Some(stdout) = child.stdout.take() {
            pumps.push(spawn_pump(stdout, log.clone()));
        }
        if let Some(stderr) = child.stderr.take() {
            pumps.push(spawn_pump(stderr, log.clone()));
        }

        let outcome = match self.watchdog.watch(&mut child, &log).await {
            Watched::Exited(Ok(status)) => outcome_from_status(status),
            Watched::Exited(Err(e)) => RunOutcome::WaitFailed(format!("failed to wait for process: {e}")),
            Watched::Terminated(_) => RunOutcome::WatchdogKilled {
                limit: self.watchdog.limit,
            },
        };

        drain(pumps).await;

        let code = outcome
            .exit_code()
            .map_or_else(|| "null".to_string(), |c| c.to_string());
        log.append(format!("\nProcess exited with code {code}\n").as_bytes())
            .await;
        info!(run_id, pid, exit_code = ?outcome.exit_code(), status = %outcome.status(), "test process finished");

        self.finish(run_id, outcome).await
    }

    async fn finish(&self, run_id: &str, outcome: RunOutcome) -> Result<RunRecord, StoreError> {
        let patch = RunPatch::finished(outcome.status(), outcome.exit_code(), outcome.error());
        let id = run_id.to_string();
        self.runs
            .blocking(move |runs| runs.update(&id, patch))
            .await
            .map_err(|e| {
                error!(run_id, error = %e, "failed to persist terminal run state");
                e
            })
    }
}

fn outcome_from_status(status: ExitStatus) -> RunOutcome {
    if let Some(code) = status.code() {
        return RunOutcome::Exited(code);
    }

    #[cfg(unix)]
    {
        use std::os::unix::process::ExitStatusExt;
        RunOutcome::Signalled(status.signal())
    }
    #[cfg(not(unix))]
    {
        RunOutcome::Signalled(None)
    }
}

/// Copy a child stream into the run log chunk by chunk.
fn spawn_pump<R>(mut reader: R, log: Arc<LogWriter>) -> JoinHandle<()>
where
    R: AsyncRead + Unpin + Send + 'static,
{
    tokio::spawn(async move {
        let mut buf = vec![0u8; PUMP_BUF_SIZE];
        loop {
            match reader.read(&mut buf).await {
                Ok(0) => break,
                Ok(n) => log.append(&buf[..n]).await,
                Err(e) => {
                    debug!(error = %e, "output pump stopped");
                    break;
                }
            }
        }
    })
}

/// Wait for the pumps to hit EOF. Grandchildren that kept the pipes open are
/// not waited on past the drain timeout.
async fn drain(pumps: Vec<JoinHandle<()>>) {
    for mut pump in pumps {
        if tokio::time::timeout(PUMP_DRAIN_TIMEOUT, &mut pump).await.is_err() {
            warn!("output pump still open after process exit, abandoning it");
            pump.abort();
        }
    }
}
