use std::path::PathBuf;

use crate::config::OrchestratorConfig;
use crate::runner::Launcher;
use crate::storage::{CaseStore, Pool, RunStore};
use crate::stream::Publisher;

#[derive(Clone)]
pub struct AppState {
    pub cases: CaseStore,
    pub runs: RunStore,
    pub launcher: Launcher,
    pub publisher: Publisher,
    pub artifacts_root: PathBuf,
    pub ui_dir: PathBuf,
}

impl AppState {
    /// Wire every component onto one database pool.
    pub fn new(pool: Pool, config: &OrchestratorConfig) -> Self {
        let cases = CaseStore::new(pool.clone());
        let runs = RunStore::new(pool);
        let artifacts_root = config.storage.artifacts_root.clone();
        let launcher = Launcher::new(
            cases.clone(),
            runs.clone(),
            config.runner.clone(),
            artifacts_root.clone(),
        );
        let publisher = Publisher::new(runs.clone(), config.stream.poll_interval());

        Self {
            cases,
            runs,
            launcher,
            publisher,
            artifacts_root,
            ui_dir: config.server.ui_dir.clone(),
        }
    }
}
