//! Task graph runner.
//!
//! Decomposes a task into subtasks, runs them in dependency order against a
//! reasoning engine command and writes every run under `<logs-dir>/<run-id>/`.

use std::fs;
use std::path::{Path, PathBuf};

use anyhow::{Context, Result, bail};
use clap::{Parser, Subcommand};
use taskgraph::agents::planner::PlanningError;
use taskgraph::exit_codes;
use taskgraph::io::config::{RunConfig, load_config};
use taskgraph::io::engine::CommandEngine;
use taskgraph::logging;
use taskgraph::run::{RunOutcome, TaskRunner, load_subtasks_file, preview_plan};

#[derive(Parser)]
#[command(
    name = "taskgraph",
    version,
    about = "Decompose a task into a subtask graph and execute it against a reasoning engine"
)]
struct Cli {
    #[command(subcommand)]
    command: Command,
}

#[derive(Subcommand)]
enum Command {
    /// Start a new run.
    Run {
        /// Task description.
        #[arg(conflicts_with = "file")]
        task: Option<String>,
        /// Read the task description from a file.
        #[arg(long)]
        file: Option<PathBuf>,
        /// Execute these subtasks (JSON) instead of decomposing the task.
        #[arg(long, conflicts_with = "sequential")]
        subtasks: Option<PathBuf>,
        /// Execute one subtask at a time in plan order.
        #[arg(long)]
        sequential: bool,
        #[command(flatten)]
        common: CommonArgs,
    },
    /// Continue an interrupted run.
    Resume {
        run_id: String,
        #[command(flatten)]
        common: CommonArgs,
    },
    /// Print batches, diagnostics and the critical path of a subtask file.
    Plan {
        #[arg(long)]
        subtasks: PathBuf,
    },
}

#[derive(clap::Args)]
struct CommonArgs {
    /// Directory holding one subdirectory per run.
    #[arg(long, default_value = "logs")]
    logs_dir: PathBuf,
    /// Config file (defaults to `<logs-dir>/config.toml`).
    #[arg(long)]
    config: Option<PathBuf>,
}

fn main() {
    logging::init();
    let code = match run() {
        Ok(()) => exit_codes::OK,
        Err(err) => {
            eprintln!("{err:#}");
            if err.downcast_ref::<PlanningError>().is_some() {
                exit_codes::PLANNING_FAILED
            } else {
                exit_codes::INVALID
            }
        }
    };
    std::process::exit(code);
}

fn run() -> Result<()> {
    let cli = Cli::parse();
    match cli.command {
        Command::Run {
            task,
            file,
            subtasks,
            sequential,
            common,
        } => cmd_run(task, file, subtasks, sequential, &common),
        Command::Resume { run_id, common } => {
            let runner = runner(&common)?;
            report(&runner.resume(&run_id)?)
        }
        Command::Plan { subtasks } => cmd_plan(&subtasks),
    }
}

fn cmd_run(
    task: Option<String>,
    file: Option<PathBuf>,
    subtasks: Option<PathBuf>,
    sequential: bool,
    common: &CommonArgs,
) -> Result<()> {
    let description = match (task, file) {
        (Some(task), _) => Some(task),
        (None, Some(path)) => Some(
            fs::read_to_string(&path).with_context(|| format!("read task {}", path.display()))?,
        ),
        (None, None) => None,
    };
    let runner = runner(common)?;

    let outcome = match (subtasks, description) {
        (Some(path), description) => {
            let raw = load_subtasks_file(&path)?;
            let description = description
                .unwrap_or_else(|| format!("Execute the subtasks defined in {}", path.display()));
            runner.execute_predefined(description.trim(), &raw)?
        }
        (None, Some(description)) if sequential => runner.execute_sequential(description.trim())?,
        (None, Some(description)) => runner.execute_task(description.trim())?,
        (None, None) => bail!("provide a task description, --file or --subtasks"),
    };
    report(&outcome)
}

fn cmd_plan(path: &Path) -> Result<()> {
    let preview = preview_plan(&load_subtasks_file(path)?);
    println!(
        "{}",
        serde_json::to_string_pretty(&preview).context("serialize plan preview")?
    );
    Ok(())
}

fn runner(common: &CommonArgs) -> Result<TaskRunner<CommandEngine>> {
    let config_path = common
        .config
        .clone()
        .unwrap_or_else(|| common.logs_dir.join("config.toml"));
    let config: RunConfig = load_config(&config_path)?;
    let workdir = std::env::current_dir().context("resolve working directory")?;
    let engine = CommandEngine::new(
        config.engine.command.clone(),
        workdir,
        config.executor.output_limit_bytes,
    );
    Ok(TaskRunner::new(engine, &common.logs_dir, config))
}

fn report(outcome: &RunOutcome) -> Result<()> {
    println!(
        "{}",
        serde_json::to_string_pretty(&outcome.final_result).context("serialize final result")?
    );
    let counts = &outcome.summary.subtask_counts;
    println!(
        "\nrun {}: {} ({} of {} subtasks succeeded, {:.1}s)\nresults in {}",
        outcome.run_id,
        if outcome.final_result.success { "success" } else { "failed" },
        counts.succeeded,
        counts.total,
        outcome.summary.duration_secs,
        outcome.run_root.display()
    );
    Ok(())
}
