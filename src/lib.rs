//! qa-orchestrator -- launch, supervise and live-stream external test runs.
//!
//! This crate provides the case and run stores, the process supervisor with
//! its watchdog, per-run append-only logs, the live stream publisher and the
//! HTTP surface that ties them together.

pub mod api;
pub mod config;
pub mod logs;
pub mod runner;
pub mod storage;
pub mod stream;

use anyhow::{Context, Result};

use crate::config::OrchestratorConfig;

/// Start the orchestrator daemon: stores, launcher, live streams and API.
pub async fn serve(config: OrchestratorConfig) -> Result<()> {
    // 1. Initialize Storage
    let db_path = &config.storage.database_path;
    tracing::info!(db_path = %db_path.display(), "Initializing database");
    let pool = storage::open_pool(db_path)?;

    let artifacts_root = &config.storage.artifacts_root;
    std::fs::create_dir_all(artifacts_root).with_context(|| {
        format!("failed to create artifacts root: {}", artifacts_root.display())
    })?;

    // 2. Wire components
    let state = api::state::AppState::new(pool, &config);
    let app = api::router(state);

    // 3. Start API Server
    let addr: std::net::SocketAddr = config
        .server
        .listen_address
        .parse()
        .with_context(|| format!("invalid listen address: {}", config.server.listen_address))?;

    tracing::info!(
        %addr,
        artifacts_root = %artifacts_root.display(),
        max_run_seconds = config.runner.max_run_seconds,
        "qa-orchestrator listening"
    );
    let listener = tokio::net::TcpListener::bind(addr).await?;
    axum::serve(listener, app).await?;

    Ok(())
}
