//! Autopatch command-line entry point.
//!
//! ```bash
//! # Run the full workflow against a repository under the project root
//! autopatch run --repo services/api --goal "Add a /health endpoint"
//!
//! # Check a diff without touching the tree
//! autopatch validate --repo services/api --diff change.patch
//!
//! # Apply a step that was parked for approval
//! autopatch apply --run-id run-1234 --step 2 --kind implement --token <token>
//! ```
//!
//! Configuration comes from `--config` (TOML) and `AUTOPATCH_*` variables.
//! Set `AUTOPATCH_TOKEN_SECRET` when approving in a different process than the
//! one that minted the token.

use std::io::Read;
use std::path::{Path, PathBuf};
use std::sync::Arc;

use anyhow::{bail, Context, Result};
use autopatch::{
    JsonRunStore, OpenAiCompatibleBackend, StepKind, WorkflowConfig, WorkflowCoordinator,
    WorkflowRequest,
};
use clap::{Parser, Subcommand};
use patchgate::CommandTestRunner;
use tracing::{info, warn};

#[derive(Parser, Debug)]
#[command(author, version, about, long_about = None)]
struct Args {
    /// TOML configuration file
    #[arg(long, global = true)]
    config: Option<PathBuf>,

    #[command(subcommand)]
    command: Command,
}

#[derive(Subcommand, Debug)]
enum Command {
    /// Plan, implement, test and fix until the goal is met
    Run {
        /// Repository path, relative to the project root or absolute inside it
        #[arg(long)]
        repo: PathBuf,
        #[arg(long)]
        goal: String,
        /// Reuse a specific run id instead of generating one
        #[arg(long)]
        run_id: Option<String>,
        #[arg(long, default_value_t = false)]
        skip_tests: bool,
    },
    /// Validate a diff file ("-" for stdin) against a repository
    Validate {
        #[arg(long)]
        repo: PathBuf,
        #[arg(long)]
        diff: PathBuf,
    },
    /// Apply a stored implement or fix step, with a token if it is dangerous
    Apply {
        #[arg(long)]
        run_id: String,
        #[arg(long)]
        step: u32,
        #[arg(long)]
        kind: StepKind,
        #[arg(long)]
        token: Option<String>,
    },
    /// Restore a backup and delete it
    Revert {
        #[arg(long)]
        backup_id: String,
    },
    /// Show a stored run and its steps
    Status {
        #[arg(long)]
        run_id: String,
    },
}

#[tokio::main]
async fn main() -> Result<()> {
    tracing_subscriber::fmt()
        .with_env_filter(
            tracing_subscriber::EnvFilter::try_from_default_env()
                .unwrap_or_else(|_| "info".into()),
        )
        .init();

    let args = Args::parse();
    let config = WorkflowConfig::load(args.config.as_deref()).context("loading configuration")?;
    info!(
        model = %config.model.name,
        endpoint = %config.model.url,
        project_root = %config.project_root.display(),
        test_command = %config.test_command,
        "Autopatch starting"
    );

    let coordinator = Arc::new(build_coordinator(config)?);

    match args.command {
        Command::Run {
            repo,
            goal,
            run_id,
            skip_tests,
        } => {
            let mut req = WorkflowRequest::new(goal, repo);
            if let Some(id) = run_id {
                req.run_id = id;
            }
            req.skip_tests = skip_tests;

            let mut events = coordinator.events().subscribe();
            let printer = tokio::spawn(async move {
                while let Ok(event) = events.recv().await {
                    info!(event = event.event_type(), run_id = event.run_id(), "{event:?}");
                }
            });

            let run = coordinator.run_auto_workflow(req).await?;
            printer.abort();
            print_json(&run)?;
        }
        Command::Validate { repo, diff } => {
            let text = read_diff(&diff)?;
            let result = coordinator.validate_diff(&text, &repo, None)?;
            print_json(&result)?;
            if !result.valid {
                std::process::exit(1);
            }
        }
        Command::Apply {
            run_id,
            step,
            kind,
            token,
        } => {
            if token.is_some() && coordinator.config().token_secret.is_none() {
                warn!("No AUTOPATCH_TOKEN_SECRET set; tokens from other processes will not verify");
            }
            let outcome = coordinator
                .apply_diff_with_backup(&run_id, step, kind, token.as_deref())
                .await?;
            print_json(&outcome)?;
            if !outcome.success {
                std::process::exit(1);
            }
        }
        Command::Revert { backup_id } => {
            let outcome = coordinator.revert_diff(&backup_id).await;
            print_json(&outcome)?;
            if !outcome.success {
                std::process::exit(1);
            }
        }
        Command::Status { run_id } => {
            let Some(run) = coordinator.get_run(&run_id).await? else {
                bail!("run {run_id} not found");
            };
            let steps = coordinator.steps(&run_id).await?;
            print_json(&serde_json::json!({ "run": run, "steps": steps }))?;
        }
    }

    Ok(())
}

fn build_coordinator(config: WorkflowConfig) -> Result<WorkflowCoordinator> {
    let model = OpenAiCompatibleBackend::new(
        &config.model.url,
        &config.model.name,
        config.model.api_key.clone(),
        config.model_timeout(),
    )
    .context("building model client")?
    .with_sampling(config.model.max_tokens, config.model.temperature);

    let store = JsonRunStore::new(&config.runs_dir)
        .with_context(|| format!("opening run store at {}", config.runs_dir.display()))?;

    let runner = CommandTestRunner::from_command_line(&config.test_command, config.test_timeout())
        .context("parsing test command")?
        .with_max_output_chars(config.max_test_output_chars);

    Ok(WorkflowCoordinator::new(
        config,
        Arc::new(model),
        Arc::new(store),
        Arc::new(runner),
    ))
}

fn read_diff(path: &Path) -> Result<String> {
    if path.as_os_str() == "-" {
        let mut text = String::new();
        std::io::stdin()
            .read_to_string(&mut text)
            .context("reading diff from stdin")?;
        return Ok(text);
    }
    std::fs::read_to_string(path).with_context(|| format!("reading {}", path.display()))
}

fn print_json<T: serde::Serialize>(value: &T) -> Result<()> {
    println!("{}", serde_json::to_string_pretty(value)?);
    Ok(())
}
