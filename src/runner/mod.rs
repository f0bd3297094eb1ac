//! Launching and supervising test processes.
//!
//! The [`Launcher`] validates a request, prepares the run's artifact
//! directory and record, and hands a [`LaunchPlan`] to a [`Supervisor`]
//! running on its own task. The supervisor owns the child process and is the
//! only writer of the run's status from then on.

pub mod launcher;
pub mod supervisor;
pub mod watchdog;

use std::collections::BTreeMap;
use std::path::{Path, PathBuf};
use std::time::Duration;

use serde::{Deserialize, Serialize};
use thiserror::Error;

use crate::config::RunnerConfig;
use crate::storage::{RunStatus, StoreError, TestCase};

pub use self::launcher::Launcher;
pub use self::supervisor::Supervisor;
pub use self::watchdog::Watchdog;

/// Variable carrying a case's action list to the child.
pub const ACTIONS_ENV: &str = "QA_ACTIONS";

/// Variable carrying the configured base URL to the child.
pub const BASE_URL_ENV: &str = "BASE_URL";

#[derive(Debug, Error)]
pub enum LaunchError {
    #[error("test case '{0}' not found")]
    CaseNotFound(String),

    #[error("failed to prepare artifacts at {}: {source}", path.display())]
    Artifacts {
        path: PathBuf,
        #[source]
        source: std::io::Error,
    },

    #[error(transparent)]
    Store(#[from] StoreError),
}

/// Per-request options for [`Launcher::start_run`].
#[derive(Debug, Clone, Default, Serialize, Deserialize)]
#[serde(default)]
pub struct RunOptions {
    /// Run with a visible browser (appends the configured headed flag).
    pub headed: bool,
    /// Overrides merged over the case's own environment.
    pub env: BTreeMap<String, String>,
}

/// What the caller gets back from a started run.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct RunTicket {
    pub run_id: String,
    pub artifacts_dir: PathBuf,
    pub artifacts_url: String,
    pub stream_url: String,
}

impl RunTicket {
    pub fn new(run_id: impl Into<String>, artifacts_dir: PathBuf) -> Self {
        let run_id = run_id.into();
        Self {
            artifacts_url: format!("/artifacts/{run_id}"),
            stream_url: format!("/api/v1/runs/{run_id}/stream"),
            run_id,
            artifacts_dir,
        }
    }
}

/// Everything the supervisor needs, snapshotted at launch time.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct LaunchPlan {
    pub run_id: String,
    pub program: String,
    pub args: Vec<String>,
    /// Variables layered over the orchestrator's own environment.
    pub env: BTreeMap<String, String>,
    pub working_dir: PathBuf,
}

impl LaunchPlan {
    /// Resolve the command line and environment of a run.
    ///
    /// Environment precedence, lowest first: the orchestrator's environment
    /// (inherited), configured ambient values, the case's declarations, the
    /// run's overrides. The artifact directory variable is always set last.
    pub fn build(
        run_id: &str,
        case: &TestCase,
        options: &RunOptions,
        runner: &RunnerConfig,
        artifacts_dir: &Path,
    ) -> Self {
        let command = &case.command;
        let mut args = command.args.clone();
        args.push(command.spec.clone());
        if let Some(filter) = command.filter.as_ref().filter(|f| !f.is_empty()) {
            args.push(runner.filter_flag.clone());
            args.push(filter.clone());
        }
        if options.headed {
            args.push(runner.headed_flag.clone());
        }

        let mut env = BTreeMap::new();
        if let Some(url) = &runner.base_url {
            env.insert(BASE_URL_ENV.to_string(), url.clone());
        }
        env.extend(runner.env.clone());
        if !case.actions.is_empty() {
            env.insert(ACTIONS_ENV.to_string(), case.actions.join(","));
        }
        env.extend(case.env.clone());
        env.extend(options.env.clone());
        env.insert(
            runner.artifacts_env_var.clone(),
            artifacts_dir.to_string_lossy().into_owned(),
        );

        Self {
            run_id: run_id.to_string(),
            program: command.program.clone(),
            args,
            env,
            working_dir: runner.working_dir.clone(),
        }
    }

    /// Human-readable command line for the run log.
    pub fn command_line(&self) -> String {
        std::iter::once(self.program.as_str())
            .chain(self.args.iter().map(String::as_str))
            .collect::<Vec<_>>()
            .join(" ")
    }
}

/// How a supervised run ended.
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum RunOutcome {
    /// The process exited on its own with this code.
    Exited(i32),
    /// The process died from a signal the watchdog did not send.
    Signalled(Option<i32>),
    /// The watchdog terminated the process after `limit`.
    WatchdogKilled { limit: Duration },
    /// The process could not be started.
    SpawnFailed(String),
    /// Waiting on the process failed.
    WaitFailed(String),
}

impl RunOutcome {
    pub fn status(&self) -> RunStatus {
        match self {
            RunOutcome::Exited(0) => RunStatus::Passed,
            RunOutcome::Exited(_) => RunStatus::Failed,
            _ => RunStatus::Error,
        }
    }

    pub fn exit_code(&self) -> Option<i32> {
        match self {
            RunOutcome::Exited(code) => Some(*code),
            _ => None,
        }
    }

    pub fn error(&self) -> Option<String> {
        match self {
            RunOutcome::Exited(_) => None,
            RunOutcome::Signalled(Some(sig)) => Some(format!("terminated by signal {sig}")),
            RunOutcome::Signalled(None) => Some("terminated without an exit code".to_string()),
            RunOutcome::WatchdogKilled { limit } => {
                Some(format!("killed by watchdog after {}", watchdog::describe_limit(*limit)))
            }
            RunOutcome::SpawnFailed(msg) => Some(msg.clone()),
            RunOutcome::WaitFailed(msg) => Some(msg.clone()),
        }
    }
}
