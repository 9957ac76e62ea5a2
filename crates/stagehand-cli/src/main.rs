//! Stagehand CLI - staged, quality-gated code changes
//!
//! Usage:
//!   stagehand init                Write the default config
//!   stagehand config              Print the resolved config
//!   stagehand run <task>          Run the pipeline on a task
//!   stagehand prune               Remove workspaces left by a previous process

use anyhow::{Context, Result};
use clap::{Parser, Subcommand, ValueEnum};
use stagehand_agent::AnthropicCritic;
use stagehand_core::{PipelineConfig, WorkflowRun};
use stagehand_gate::{GatePolicy, QualityGate};
use stagehand_orchestrator::{CommandExecutor, PipelineEngine, WorkspacePool};
use stagehand_vcs::{Checkout, GitWorktree, JjWorkspace};
use std::path::{Path, PathBuf};
use std::sync::Arc;
use std::time::Duration;
use tracing::{info, warn};
use tracing_subscriber::{EnvFilter, FmtSubscriber};

#[derive(Parser)]
#[command(name = "stagehand")]
#[command(author, version, about = "Staged, quality-gated code changes")]
struct Cli {
    /// Enable verbose logging
    #[arg(short, long)]
    verbose: bool,

    #[command(subcommand)]
    command: Commands,
}

#[derive(Subcommand)]
enum Commands {
    /// Write the default configuration
    Init {
        /// Repository path (defaults to current directory)
        #[arg(default_value = ".")]
        path: PathBuf,
    },

    /// Print the resolved configuration as TOML
    Config {
        #[arg(long, default_value = ".")]
        repo: PathBuf,
    },

    /// Run the pipeline on a task
    Run {
        /// Task description
        task: String,

        #[arg(long, default_value = ".")]
        repo: PathBuf,

        #[arg(long, value_enum, default_value = "git")]
        vcs: Vcs,

        /// Skip quality gate evaluation
        #[arg(long)]
        no_gates: bool,

        /// Print the finished run as JSON
        #[arg(long)]
        json: bool,
    },

    /// Remove workspaces left behind by a previous process
    Prune {
        #[arg(long, default_value = ".")]
        repo: PathBuf,

        #[arg(long, value_enum, default_value = "git")]
        vcs: Vcs,

        /// Also remove workspaces younger than `workspace.max_age_secs`
        #[arg(long)]
        all: bool,
    },
}

#[derive(Debug, Clone, Copy, ValueEnum)]
enum Vcs {
    Git,
    Jj,
}

#[tokio::main]
async fn main() -> Result<()> {
    let cli = Cli::parse();

    let default_level = if cli.verbose { "debug" } else { "info" };
    let filter =
        EnvFilter::try_from_default_env().unwrap_or_else(|_| EnvFilter::new(default_level));
    let subscriber = FmtSubscriber::builder()
        .with_env_filter(filter)
        .with_target(false)
        .finish();
    tracing::subscriber::set_global_default(subscriber)?;

    match cli.command {
        Commands::Init { path } => cmd_init(path),
        Commands::Config { repo } => cmd_config(repo),
        Commands::Run {
            task,
            repo,
            vcs,
            no_gates,
            json,
        } => {
            let run = match vcs {
                Vcs::Git => {
                    let checkout = GitWorktree::detect(&repo)
                        .await
                        .context("Not in a git repository")?;
                    cmd_run(checkout, task, no_gates).await?
                }
                Vcs::Jj => {
                    let checkout = JjWorkspace::detect(&repo)
                        .await
                        .context("Not in a jj repository")?;
                    cmd_run(checkout, task, no_gates).await?
                }
            };
            report_run(&run, json)?;
            match run.error() {
                Some(e) => Err(e).context(format!("Run {} failed", run.id)),
                None => Ok(()),
            }
        }
        Commands::Prune { repo, vcs, all } => match vcs {
            Vcs::Git => {
                let checkout = GitWorktree::detect(&repo)
                    .await
                    .context("Not in a git repository")?;
                cmd_prune(checkout, all).await
            }
            Vcs::Jj => {
                let checkout = JjWorkspace::detect(&repo)
                    .await
                    .context("Not in a jj repository")?;
                cmd_prune(checkout, all).await
            }
        },
    }
}

fn cmd_init(path: PathBuf) -> Result<()> {
    info!("Initializing Stagehand in {:?}", path);

    let config_path =
        PipelineConfig::write_default(&path).context("Failed to write default config")?;

    println!("Initialized Stagehand in {:?}", path);
    println!("Created:");
    println!("  {}", config_path.display());
    println!("\nNext steps:");
    println!("  1. Add the commands each stage should run under [stages.<name>]");
    println!("  2. Export ANTHROPIC_API_KEY for the quality gates");
    println!("  3. Run 'stagehand run \"<task>\"'");

    Ok(())
}

fn load_config(repo: &Path) -> Result<PipelineConfig> {
    PipelineConfig::load_or_default(repo)
        .with_context(|| format!("Failed to load config from {}", repo.display()))
}

fn cmd_config(repo: PathBuf) -> Result<()> {
    let config = load_config(&repo)?;
    print!("{}", config.to_toml()?);
    Ok(())
}

async fn cmd_run<C: Checkout>(checkout: C, task: String, no_gates: bool) -> Result<WorkflowRun> {
    let repo_root = checkout.repo_root().to_path_buf();
    let mut config = load_config(&repo_root)?;
    if no_gates {
        config.quality_gates.enabled = false;
    }

    let critic = AnthropicCritic::from_config(&config.critic).context("Invalid critic config")?;
    let gate = QualityGate::new(critic).with_policy(GatePolicy::from(&config.quality_gates));
    let executor = CommandExecutor::new(config.stages.clone());
    let pool = WorkspacePool::new(checkout, config.workspace.clone());

    let mut engine = PipelineEngine::new(task, config, pool.clone(), Arc::new(gate))
        .with_default_executor(Arc::new(executor))
        .with_activity_logging(repo_root.join(".stagehand"));

    info!("Run {}", engine.run_id());
    let run = engine.execute().await;
    pool.shutdown();

    Ok(run)
}

fn report_run(run: &WorkflowRun, json: bool) -> Result<()> {
    if json {
        println!("{}", serde_json::to_string_pretty(run)?);
        return Ok(());
    }

    println!("Run {}: {}", run.id, run.status);
    println!("==========");
    for (stage, record) in &run.stages {
        let decision = record
            .decision
            .as_ref()
            .map(|d| format!(" [{} {}]", d.decision, d.score))
            .unwrap_or_default();
        let retries = if record.retry_count > 0 {
            format!(" ({} revisions)", record.retry_count)
        } else {
            String::new()
        };
        println!("  {:<10} {}{}{}", stage.as_str(), record.status, decision, retries);
    }
    println!("\nWorkspaces used: {}", run.workspaces.len());

    if let Some(failure) = &run.failure {
        println!("\nFailure:\n  {}", failure);
    }
    if !run.cleanup_errors.is_empty() {
        println!("\nCleanup errors:");
        for error in &run.cleanup_errors {
            println!("  - {}", error);
        }
    }

    Ok(())
}

async fn cmd_prune<C: Checkout>(checkout: C, all: bool) -> Result<()> {
    let config = load_config(checkout.repo_root())?;
    let min_age = if all {
        Duration::ZERO
    } else {
        config.workspace.max_age()
    };
    let pool = WorkspacePool::new(checkout, config.workspace);

    let report = pool
        .recover_orphans(min_age)
        .await
        .context("Failed to scan workspace directory")?;

    println!("Removed {} workspace(s)", report.released.len());
    for id in &report.released {
        println!("  {}", id);
    }
    if !report.is_clean() {
        println!("\nFailed:");
        for (id, e) in &report.failures {
            warn!(workspace_id = %id, "Removal failed: {}", e);
            println!("  {}: {}", id, e);
        }
        anyhow::bail!("{} workspace(s) could not be removed", report.failures.len());
    }

    Ok(())
}
