use std::collections::BTreeMap;
use std::path::PathBuf;

use anyhow::{Context, Result};
use clap::{Parser, Subcommand};

use qa_orchestrator::api::state::AppState;
use qa_orchestrator::config::{LoggingConfig, OrchestratorConfig};
use qa_orchestrator::runner::RunOptions;
use qa_orchestrator::storage::{self, CaseStore, CommandSpec, NewTestCase, RunStatus, RunStore};
use qa_orchestrator::stream::StreamEvent;

#[derive(Parser)]
#[command(
    name = "qa-orchestrator",
    about = "Test-run orchestration: launch, supervise and live-stream test processes",
    version,
    long_about = None
)]
struct Cli {
    /// Path to a TOML configuration file
    #[arg(long, global = true)]
    config: Option<PathBuf>,

    #[command(subcommand)]
    command: Commands,
}

#[derive(Subcommand)]
enum Commands {
    /// Start the daemon (API server + run supervision + live streams)
    Serve {
        /// Bind address (overrides the configured listen address)
        #[arg(long)]
        bind: Option<String>,
    },

    /// Manage test cases
    Case {
        #[command(subcommand)]
        action: CaseAction,
    },

    /// Inspect recorded runs
    Runs {
        #[command(subcommand)]
        action: RunsAction,
    },

    /// Start a run and follow its live log until it finishes
    Run {
        /// Test case ID
        #[arg(long)]
        case: String,

        /// Run with a visible browser
        #[arg(long)]
        headed: bool,

        /// Environment override (KEY=VALUE, repeatable)
        #[arg(long = "env", value_parser = parse_key_val)]
        env: Vec<(String, String)>,
    },
}

#[derive(Subcommand)]
enum CaseAction {
    /// List all test cases
    List,

    /// Add a new test case
    Add {
        /// Display name
        #[arg(long)]
        name: String,

        /// Spec reference handed to the test program
        #[arg(long)]
        spec: String,

        /// Program to execute (defaults to npx)
        #[arg(long)]
        program: Option<String>,

        /// Leading program argument (repeatable; defaults to `playwright test`)
        #[arg(long = "arg", allow_hyphen_values = true)]
        args: Vec<String>,

        /// Filter/selector string
        #[arg(long)]
        filter: Option<String>,

        /// Environment variable (KEY=VALUE, repeatable)
        #[arg(long = "env", value_parser = parse_key_val)]
        env: Vec<(String, String)>,

        /// High-level action name (repeatable, ordered)
        #[arg(long = "action")]
        actions: Vec<String>,
    },

    /// Remove a test case
    Remove {
        /// Test case ID
        #[arg(long)]
        id: String,
    },
}

#[derive(Subcommand)]
enum RunsAction {
    /// List runs, newest first
    List,

    /// Show one run record as JSON
    Show {
        /// Run ID
        #[arg(long)]
        id: String,
    },
}

fn parse_key_val(s: &str) -> Result<(String, String), String> {
    match s.split_once('=') {
        Some((k, v)) if !k.is_empty() => Ok((k.to_string(), v.to_string())),
        _ => Err(format!("expected KEY=VALUE, got '{s}'")),
    }
}

fn init_tracing(logging: &LoggingConfig) {
    let filter = tracing_subscriber::EnvFilter::try_from_default_env()
        .unwrap_or_else(|_| tracing_subscriber::EnvFilter::new(&logging.level));
    let builder = tracing_subscriber::fmt()
        .with_env_filter(filter)
        .with_writer(std::io::stderr);
    if logging.json {
        builder.json().init();
    } else {
        builder.init();
    }
}

#[tokio::main]
async fn main() -> Result<()> {
    let cli = Cli::parse();
    let mut config = OrchestratorConfig::resolve(cli.config.as_deref())?;
    init_tracing(&config.logging);

    match cli.command {
        Commands::Serve { bind } => {
            if let Some(bind) = bind {
                config.server.listen_address = bind;
            }
            tracing::info!(bind = %config.server.listen_address, "Starting qa-orchestrator daemon");
            qa_orchestrator::serve(config).await?;
        }
        Commands::Case { action } => {
            let pool = storage::open_pool(&config.storage.database_path)?;
            let cases = CaseStore::new(pool);

            match action {
                CaseAction::List => {
                    let list = cases.list()?;
                    if list.is_empty() {
                        println!("No test cases found.");
                    } else {
                        println!("{:<36} | {:<30} | Spec", "ID", "Name");
                        println!("{:-<36}-|-{:-<30}-|-{:-<30}", "", "", "");
                        for case in list {
                            println!("{:<36} | {:<30} | {}", case.id, case.name, case.command.spec);
                        }
                    }
                }
                CaseAction::Add {
                    name,
                    spec,
                    program,
                    args,
                    filter,
                    env,
                    actions,
                } => {
                    let mut command = CommandSpec::new(spec);
                    if let Some(program) = program {
                        command.program = program;
                    }
                    if !args.is_empty() {
                        command.args = args;
                    }
                    command.filter = filter;

                    let case = cases.create(NewTestCase {
                        name,
                        command,
                        env: env.into_iter().collect(),
                        actions,
                    })?;
                    println!("Test case '{}' added with id {}.", case.name, case.id);
                }
                CaseAction::Remove { id } => {
                    cases.delete(&id)?;
                    println!("Test case '{}' removed.", id);
                }
            }
        }
        Commands::Runs { action } => {
            let pool = storage::open_pool(&config.storage.database_path)?;
            let runs = RunStore::new(pool);

            match action {
                RunsAction::List => {
                    let list = runs.list()?;
                    if list.is_empty() {
                        println!("No runs found.");
                    } else {
                        println!("{:<36} | {:<8} | {:<9} | Created", "Run", "Status", "Exit code");
                        println!("{:-<36}-|-{:-<8}-|-{:-<9}-|-{:-<25}", "", "", "", "");
                        for run in list {
                            let code = run
                                .exit_code
                                .map_or_else(|| "-".to_string(), |c| c.to_string());
                            println!(
                                "{:<36} | {:<8} | {:<9} | {}",
                                run.run_id,
                                run.status,
                                code,
                                run.created_at.to_rfc3339()
                            );
                        }
                    }
                }
                RunsAction::Show { id } => {
                    let run = runs
                        .get(&id)?
                        .with_context(|| format!("run '{id}' not found"))?;
                    println!("{}", serde_json::to_string_pretty(&run)?);
                }
            }
        }
        Commands::Run { case, headed, env } => {
            let pool = storage::open_pool(&config.storage.database_path)?;
            std::fs::create_dir_all(&config.storage.artifacts_root)?;
            let state = AppState::new(pool, &config);

            let options = RunOptions {
                headed,
                env: env.into_iter().collect::<BTreeMap<_, _>>(),
            };
            let (ticket, completion) = state.launcher.start_run(&case, options).await?;
            tracing::info!(run_id = %ticket.run_id, artifacts = %ticket.artifacts_dir.display(), "run started");

            let mut events = state.publisher.subscribe(ticket.run_id.clone());
            let mut final_status = None;
            while let Some(event) = events.recv().await {
                match event {
                    StreamEvent::Line { line } => println!("{line}"),
                    StreamEvent::Status { status, .. } => {
                        tracing::debug!(run_id = %ticket.run_id, %status, "heartbeat");
                    }
                    StreamEvent::Done { run } => final_status = Some(run.status),
                    StreamEvent::Error { error } => anyhow::bail!("stream failed: {error}"),
                }
            }

            if let Err(e) = completion.await {
                tracing::warn!(error = %e, "supervisor task did not complete cleanly");
            }

            match final_status {
                Some(RunStatus::Passed) => println!("\nRun {} passed.", ticket.run_id),
                Some(status) => anyhow::bail!("run {} finished with status {}", ticket.run_id, status),
                None => anyhow::bail!("run {} stream ended without a result", ticket.run_id),
            }
        }
    }

    Ok(())
}
