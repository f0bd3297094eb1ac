//! Glue for a "start run" request.

use std::path::PathBuf;
use std::sync::Arc;

use tokio::task::JoinHandle;
use tracing::info;
use uuid::Uuid;

use super::{LaunchError, LaunchPlan, RunOptions, RunTicket, Supervisor, Watchdog};
use crate::config::RunnerConfig;
use crate::logs::{LogWriter, LOG_FILE_NAME};
use crate::storage::{CaseStore, RunRecord, RunStore, StoreError};

/// Completion of a run's supervisor task.
pub type RunCompletion = JoinHandle<Result<RunRecord, StoreError>>;

#[derive(Clone)]
pub struct Launcher {
    cases: CaseStore,
    runs: RunStore,
    runner: Arc<RunnerConfig>,
    artifacts_root: PathBuf,
}

impl Launcher {
    pub fn new(
        cases: CaseStore,
        runs: RunStore,
        runner: RunnerConfig,
        artifacts_root: impl Into<PathBuf>,
    ) -> Self {
        Self {
            cases,
            runs,
            runner: Arc::new(runner),
            artifacts_root: artifacts_root.into(),
        }
    }

    /// Start a run of `case_id`.
    ///
    /// Returns once the run is recorded as `queued`; the process is spawned
    /// and supervised on a separate task whose handle is returned alongside
    /// the ticket. Every call creates an independent run.
    pub async fn start_run(
        &self,
        case_id: &str,
        options: RunOptions,
    ) -> Result<(RunTicket, RunCompletion), LaunchError> {
        let id = case_id.to_string();
        let case = self
            .cases
            .blocking(move |cases| cases.get(&id))
            .await?
            .ok_or_else(|| LaunchError::CaseNotFound(case_id.to_string()))?;

        let run_id = Uuid::new_v4().to_string();
        let run_dir = self.artifacts_root.join(&run_id);
        tokio::fs::create_dir_all(&run_dir)
            .await
            .map_err(|source| LaunchError::Artifacts {
                path: run_dir.clone(),
                source,
            })?;

        let log_path = run_dir.join(LOG_FILE_NAME);
        let log = LogWriter::open(&log_path)
            .await
            .map_err(|source| LaunchError::Artifacts {
                path: log_path.clone(),
                source,
            })?;

        let record = RunRecord::queued(&run_id, &case.id, run_dir.clone(), log_path);
        self.runs.blocking(move |runs| runs.create(&record)).await?;

        let plan = LaunchPlan::build(&run_id, &case, &options, &self.runner, &run_dir);
        log.append(
            format!(
                "Starting run {run_id} for case \"{}\"\n> {}\n",
                case.name,
                plan.command_line()
            )
            .as_bytes(),
        )
        .await;

        info!(run_id = %run_id, case_id = %case.id, headed = options.headed, "run queued");

        let supervisor = Supervisor::new(self.runs.clone(), Watchdog::from_config(&self.runner));
        let log = Arc::new(log);
        let completion = tokio::spawn(async move { supervisor.run(plan, log).await });

        Ok((RunTicket::new(run_id, run_dir), completion))
    }
}
