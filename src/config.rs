//! TOML configuration for the orchestrator.
//!
//! Layered model: compiled-in defaults, an optional TOML file, then a small
//! set of environment variable overrides.

use std::collections::BTreeMap;
use std::path::{Path, PathBuf};
use std::time::Duration;

use anyhow::{Context, Result};
use serde::{Deserialize, Serialize};
use tracing::{debug, info, warn};

/// Environment variable naming the config file.
pub const CONFIG_ENV: &str = "QA_ORCHESTRATOR_CONFIG";

/// Config file looked up in the working directory.
pub const LOCAL_CONFIG: &str = "qa-orchestrator.toml";

// ---------------------------------------------------------------------------
// Top-level config
// ---------------------------------------------------------------------------

/// Root configuration for the orchestrator process.
#[derive(Debug, Clone, Default, Serialize, Deserialize)]
pub struct OrchestratorConfig {
    #[serde(default)]
    pub server: ServerConfig,
    #[serde(default)]
    pub storage: StorageConfig,
    #[serde(default)]
    pub runner: RunnerConfig,
    #[serde(default)]
    pub stream: StreamConfig,
    #[serde(default)]
    pub logging: LoggingConfig,
}

impl OrchestratorConfig {
    /// Load configuration from a TOML file at `path`.
    pub fn load(path: &Path) -> Result<Self> {
        let content = std::fs::read_to_string(path)
            .with_context(|| format!("failed to read config file: {}", path.display()))?;
        let config: Self = toml::from_str(&content)
            .with_context(|| format!("failed to parse config file: {}", path.display()))?;
        info!(path = %path.display(), "loaded orchestrator configuration");
        Ok(config)
    }

    /// Resolve the configuration for this process.
    ///
    /// An explicit `path` must load. Otherwise, in order:
    /// 1. The path in `QA_ORCHESTRATOR_CONFIG`.
    /// 2. `./qa-orchestrator.toml`.
    /// 3. Compiled-in defaults.
    ///
    /// Environment overrides are applied on top in every case.
    pub fn resolve(path: Option<&Path>) -> Result<Self> {
        let mut config = match path {
            Some(path) => Self::load(path)?,
            None => Self::load_or_default(),
        };
        config.apply_env(|key| std::env::var(key).ok());
        config.validate()?;
        Ok(config)
    }

    /// Reject settings no run could succeed under.
    pub fn validate(&self) -> Result<()> {
        anyhow::ensure!(
            self.runner.max_run_seconds > 0,
            "runner.max_run_seconds must be greater than zero"
        );
        Ok(())
    }

    fn load_or_default() -> Self {
        if let Ok(env_path) = std::env::var(CONFIG_ENV) {
            let path = Path::new(&env_path);
            match Self::load(path) {
                Ok(cfg) => return cfg,
                Err(e) => {
                    warn!(
                        path = %path.display(),
                        error = %e,
                        "QA_ORCHESTRATOR_CONFIG set but file could not be loaded, trying fallback"
                    );
                }
            }
        }

        let local = Path::new(LOCAL_CONFIG);
        if local.exists() {
            match Self::load(local) {
                Ok(cfg) => return cfg,
                Err(e) => {
                    warn!(
                        path = %local.display(),
                        error = %e,
                        "local config file exists but could not be loaded, using defaults"
                    );
                }
            }
        }

        debug!("no config file found, using compiled-in defaults");
        Self::default()
    }

    /// Apply `PORT`, `MAX_RUN_SECONDS`, `BASE_URL` and `ARTIFACTS_ROOT`.
    ///
    /// Values that do not parse are ignored with a warning.
    pub fn apply_env(&mut self, lookup: impl Fn(&str) -> Option<String>) {
        if let Some(port) = lookup("PORT") {
            match port.parse::<u16>() {
                Ok(port) => self.server.set_port(port),
                Err(_) => warn!(value = %port, "ignoring unparsable PORT"),
            }
        }
        if let Some(secs) = lookup("MAX_RUN_SECONDS") {
            match secs.parse::<u64>() {
                Ok(secs) if secs > 0 => self.runner.max_run_seconds = secs,
                _ => warn!(value = %secs, "ignoring invalid MAX_RUN_SECONDS"),
            }
        }
        if let Some(url) = lookup("BASE_URL").filter(|u| !u.is_empty()) {
            self.runner.base_url = Some(url);
        }
        if let Some(root) = lookup("ARTIFACTS_ROOT").filter(|r| !r.is_empty()) {
            self.storage.artifacts_root = PathBuf::from(root);
        }
    }
}

// ---------------------------------------------------------------------------
// Server
// ---------------------------------------------------------------------------

#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(default)]
pub struct ServerConfig {
    /// Address and port for the HTTP listener.
    pub listen_address: String,
    /// Static UI served under `/qa-ui`; its `index.html` is also served at `/`.
    pub ui_dir: PathBuf,
}

impl ServerConfig {
    fn set_port(&mut self, port: u16) {
        let host = self
            .listen_address
            .rsplit_once(':')
            .map(|(host, _)| host)
            .unwrap_or("0.0.0.0");
        self.listen_address = format!("{host}:{port}");
    }
}

impl Default for ServerConfig {
    fn default() -> Self {
        Self {
            listen_address: "0.0.0.0:5173".to_string(),
            ui_dir: PathBuf::from("qa-ui"),
        }
    }
}

// ---------------------------------------------------------------------------
// Storage
// ---------------------------------------------------------------------------

#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(default)]
pub struct StorageConfig {
    /// SQLite database holding cases and runs.
    pub database_path: PathBuf,
    /// Parent directory of every run's artifact directory.
    pub artifacts_root: PathBuf,
}

impl Default for StorageConfig {
    fn default() -> Self {
        Self {
            database_path: PathBuf::from("server_data/orchestrator.db"),
            artifacts_root: PathBuf::from("artifacts"),
        }
    }
}

// ---------------------------------------------------------------------------
// Runner
// ---------------------------------------------------------------------------

/// How test processes are launched and supervised.
#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(default)]
pub struct RunnerConfig {
    /// Working directory of spawned test processes.
    pub working_dir: PathBuf,
    /// Watchdog budget per run, in seconds.
    pub max_run_seconds: u64,
    /// Time between SIGTERM and SIGKILL once the watchdog fires.
    pub grace_seconds: u64,
    /// Flag placed before a case's filter string.
    pub filter_flag: String,
    /// Flag appended for headed runs.
    pub headed_flag: String,
    /// Variable through which the artifact directory is handed to the child.
    pub artifacts_env_var: String,
    /// Injected as `BASE_URL` when set.
    pub base_url: Option<String>,
    /// Ambient variables for every run (lowest precedence after the
    /// orchestrator's own environment).
    pub env: BTreeMap<String, String>,
}

impl RunnerConfig {
    pub fn max_run_duration(&self) -> Duration {
        Duration::from_secs(self.max_run_seconds)
    }

    pub fn grace_period(&self) -> Duration {
        Duration::from_secs(self.grace_seconds)
    }
}

impl Default for RunnerConfig {
    fn default() -> Self {
        Self {
            working_dir: PathBuf::from("."),
            max_run_seconds: 180,
            grace_seconds: 10,
            filter_flag: "--grep".to_string(),
            headed_flag: "--headed".to_string(),
            artifacts_env_var: "ARTIFACTS_RUN_DIR".to_string(),
            base_url: None,
            env: BTreeMap::new(),
        }
    }
}

// ---------------------------------------------------------------------------
// Stream
// ---------------------------------------------------------------------------

#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(default)]
pub struct StreamConfig {
    /// Live stream poll period in milliseconds.
    pub poll_interval_ms: u64,
}

impl StreamConfig {
    pub fn poll_interval(&self) -> Duration {
        Duration::from_millis(self.poll_interval_ms.max(1))
    }
}

impl Default for StreamConfig {
    fn default() -> Self {
        Self {
            poll_interval_ms: 1000,
        }
    }
}

// ---------------------------------------------------------------------------
// Logging
// ---------------------------------------------------------------------------

#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(default)]
pub struct LoggingConfig {
    /// Default filter when `RUST_LOG` is unset.
    pub level: String,
    /// Emit JSON lines instead of the human-readable format.
    pub json: bool,
}

impl Default for LoggingConfig {
    fn default() -> Self {
        Self {
            level: "info".to_string(),
            json: false,
        }
    }
}

// ---------------------------------------------------------------------------
// Tests
// ---------------------------------------------------------------------------
