//! Command-line interface for jobscout.
//!
//! Provides commands for running and resuming pipelines, inspecting
//! checkpoints and trace journals, and showing the resolved configuration.

use std::path::PathBuf;
use std::process::ExitCode;
use std::sync::Arc;

use anyhow::{Context, Result};
use clap::{Parser, Subcommand};
use uuid::Uuid;

use crate::config::{self, ResolvedConfig};
use crate::core::{CheckpointStore, JournalTracer, Orchestrator, Pipeline};
use crate::domain::{BudgetLimits, RunOutcome, RunStatus};

/// jobscout - Resumable, budget-governed job-search pipeline orchestrator
#[derive(Parser, Debug)]
#[command(name = "jobscout")]
#[command(author, version, about, long_about = None)]
pub struct Cli {
    #[command(subcommand)]
    pub command: Commands,
}

#[derive(Subcommand, Debug)]
pub enum Commands {
    /// Run a pipeline (resumes automatically if the run id has checkpoints)
    Run {
        /// Pipeline file, or name to look up as pipelines/<name>.yaml
        pipeline: String,

        /// Run ID (a fresh UUID if not provided)
        #[arg(long, env = "JOBSCOUT_RUN_ID")]
        run_id: Option<String>,

        /// Input parameter handed to every step (repeatable)
        #[arg(short, long = "input", value_name = "KEY=VALUE", value_parser = parse_key_val)]
        inputs: Vec<(String, String)>,

        /// Hard budget ceiling in USD (warning at 80%)
        #[arg(long)]
        budget: Option<f64>,
    },

    /// Resume a run from its latest checkpoint
    Resume {
        /// Pipeline file, or name to look up as pipelines/<name>.yaml
        pipeline: String,

        /// Run ID to resume
        run_id: String,
    },

    /// Show the latest checkpointed state of a run
    Status {
        /// Run ID
        run_id: String,
    },

    /// List the checkpoints of a run
    Checkpoints {
        /// Run ID
        run_id: String,
    },

    /// Delete every checkpoint of a run
    Clear {
        /// Run ID
        run_id: String,
    },

    /// Print the span journal of a run
    Trace {
        /// Run ID
        run_id: String,
    },

    /// Show resolved configuration (debug)
    Config,
}

impl Cli {
    /// Execute the CLI command
    pub async fn execute(self) -> Result<ExitCode> {
        match self.command {
            Commands::Run {
                pipeline,
                run_id,
                inputs,
                budget,
            } => run_pipeline(&pipeline, run_id, inputs, budget).await,
            Commands::Resume { pipeline, run_id } => resume_run(&pipeline, &run_id).await,
            Commands::Status { run_id } => show_status(&run_id).await,
            Commands::Checkpoints { run_id } => list_checkpoints(&run_id).await,
            Commands::Clear { run_id } => clear_checkpoints(&run_id).await,
            Commands::Trace { run_id } => show_trace(&run_id).await,
            Commands::Config => show_config(),
        }
    }
}

/// Parse a `KEY=VALUE` pair
fn parse_key_val(s: &str) -> Result<(String, String), String> {
    match s.split_once('=') {
        Some((key, value)) if !key.is_empty() => Ok((key.to_string(), value.to_string())),
        _ => Err(format!("invalid KEY=VALUE: no `=` found in `{}`", s)),
    }
}

/// Run a pipeline
async fn run_pipeline(
    pipeline_ref: &str,
    run_id: Option<String>,
    inputs: Vec<(String, String)>,
    budget: Option<f64>,
) -> Result<ExitCode> {
    let cfg = config::config()?;
    let pipeline = load_pipeline(pipeline_ref)?;

    let run_id = run_id.unwrap_or_else(|| Uuid::new_v4().to_string());
    let mut run_config = cfg.run_config(&run_id).with_pipeline(&pipeline.name);
    for (key, value) in inputs {
        run_config = run_config.with_input(key, value);
    }
    if let Some(ceiling) = budget {
        run_config = run_config.with_budget(BudgetLimits::with_ceiling(ceiling));
    }
    config::validate_settings(&run_config.budget, &run_config.limits)?;

    let orchestrator = build_orchestrator(cfg, &pipeline)?;
    let outcome = orchestrator.run(run_config).await?;

    Ok(report(&outcome, "completed"))
}

/// Resume a halted or interrupted run
async fn resume_run(pipeline_ref: &str, run_id: &str) -> Result<ExitCode> {
    let cfg = config::config()?;
    let pipeline = load_pipeline(pipeline_ref)?;
    let orchestrator = build_orchestrator(cfg, &pipeline)?;

    if orchestrator.checkpoint_store().is_none() {
        anyhow::bail!("Checkpointing is disabled; nothing to resume");
    }

    match orchestrator.resume(run_id).await? {
        Some(outcome) => Ok(report(&outcome, "resumed and completed")),
        None => anyhow::bail!("No checkpoint found for run {}", run_id),
    }
}

/// Show the status of a run from its latest checkpoint
async fn show_status(run_id: &str) -> Result<ExitCode> {
    let store = open_store()?;
    let Some(checkpoint) = store.load_latest(run_id).await? else {
        anyhow::bail!("No checkpoint found for run {}", run_id);
    };
    let state = checkpoint.restore()?;

    println!("Run ID: {}", state.run_id());
    println!(
        "Pipeline: {}",
        state.config.pipeline.as_deref().unwrap_or("(unknown)")
    );
    println!("Last completed step: {}", checkpoint.step_name);
    println!("Checkpointed at: {}", checkpoint.saved_at);
    println!(
        "Cost: ${:.4} of ${:.2} ({} units)",
        state.total_cost, state.config.budget.hard_limit_usd, state.total_units
    );
    println!(
        "Fan-out units: {}/{} succeeded",
        state.units_succeeded, state.units_attempted
    );
    if let Some(result) = &state.result {
        println!("Result: {}", result.status);
    }

    println!("\nOutputs:");
    for step in state.outputs.keys() {
        println!("  {}", step);
    }

    if !state.failures.is_empty() {
        println!("\nFailures:");
        for failure in &state.failures {
            println!(
                "  [{}] {}{}: {}",
                failure.kind,
                failure.origin,
                failure
                    .target
                    .as_deref()
                    .map(|t| format!(" ({})", t))
                    .unwrap_or_default(),
                failure.message
            );
        }
    }

    Ok(ExitCode::SUCCESS)
}

/// List the checkpoints of a run
async fn list_checkpoints(run_id: &str) -> Result<ExitCode> {
    let store = open_store()?;
    let checkpoints = store.list(run_id).await?;

    if checkpoints.is_empty() {
        println!("No checkpoints found");
        return Ok(ExitCode::SUCCESS);
    }

    println!("{:<24} {:<32} {}", "STEP", "SAVED AT", "LOCATION");
    println!("{}", "-".repeat(90));

    for info in checkpoints {
        println!(
            "{:<24} {:<32} {}",
            info.step_name,
            info.saved_at.to_rfc3339(),
            info.location
        );
    }

    Ok(ExitCode::SUCCESS)
}

/// Delete every checkpoint of a run
async fn clear_checkpoints(run_id: &str) -> Result<ExitCode> {
    let store = open_store()?;
    let removed = store.clear(run_id).await?;

    println!("Removed {} checkpoint(s) for run {}", removed, run_id);
    Ok(ExitCode::SUCCESS)
}

/// Print the span journal of a run
async fn show_trace(run_id: &str) -> Result<ExitCode> {
    let tracer = JournalTracer::default_location()?;
    let spans = tracer.replay(run_id).await?;

    if spans.is_empty() {
        println!("No trace recorded for run {}", run_id);
        return Ok(ExitCode::SUCCESS);
    }

    for span in spans {
        println!(
            "{} {:<5} {:<24} {:<16} ${:.4} {}",
            span.timestamp.format("%H:%M:%S%.3f"),
            format!("{:?}", span.kind).to_lowercase(),
            span.name,
            format!("{:?}", span.status),
            span.total_cost,
            span.error.unwrap_or_default()
        );
    }

    Ok(ExitCode::SUCCESS)
}

/// Show the resolved configuration (for debugging)
fn show_config() -> Result<ExitCode> {
    let cfg = config::config()?;

    println!("jobscout configuration");
    println!();
    println!(
        "Config file: {}",
        cfg.config_file
            .as_ref()
            .map(|p| p.display().to_string())
            .unwrap_or_else(|| "(none - using defaults)".to_string())
    );
    println!();
    println!("Paths:");
    println!("  Home:        {}", cfg.home.display());
    println!("  Runs:        {}", cfg.runs_dir().display());
    println!(
        "  Checkpoints: {} ({:?}{})",
        cfg.checkpoint.location.display(),
        cfg.checkpoint.backend,
        if cfg.checkpoint.enabled { "" } else { ", disabled" }
    );
    println!();
    println!("Budget:");
    println!("  Hard limit: ${:.2}", cfg.budget.hard_limit_usd);
    println!("  Warn limit: ${:.2}", cfg.budget.warn_limit_usd);
    println!();
    println!("Limits:");
    println!("  Step timeout: {}s", cfg.limits.step_timeout_seconds);
    println!("  Unit timeout: {}s", cfg.limits.unit_timeout_seconds);
    println!("  Concurrency:  {}", cfg.limits.concurrency);
    println!();
    println!("Prices: {} kinds", cfg.prices.len());

    Ok(ExitCode::SUCCESS)
}

/// Wire a pipeline into an orchestrator with the configured stores
fn build_orchestrator(cfg: &ResolvedConfig, pipeline: &Pipeline) -> Result<Orchestrator> {
    let registry = pipeline.to_registry(Arc::new(cfg.governor()))?;

    let mut orchestrator =
        Orchestrator::new(registry)?.with_tracer(Arc::new(JournalTracer::new(cfg.runs_dir())));

    if let Some(store) = cfg.open_checkpoint_store()? {
        orchestrator = orchestrator.with_checkpoints(store);
    }

    Ok(orchestrator)
}

/// Open the configured checkpoint store, failing if checkpointing is off
fn open_store() -> Result<Arc<dyn CheckpointStore>> {
    config::config()?
        .open_checkpoint_store()?
        .context("Checkpointing is disabled in the configuration")
}

/// Print a run outcome and map it to an exit code
fn report(outcome: &RunOutcome, verb: &str) -> ExitCode {
    match serde_json::to_string_pretty(outcome) {
        Ok(json) => println!("{}", json),
        Err(e) => eprintln!("Failed to serialize outcome: {}", e),
    }

    match outcome.status {
        RunStatus::Success => {
            eprintln!("\n[Run {} {} successfully]", outcome.run_id, verb)
        }
        RunStatus::Partial => eprintln!(
            "\n[Run {} stopped at '{}': budget exhausted (${:.4})]",
            outcome.run_id,
            outcome.halted_at.as_deref().unwrap_or("-"),
            outcome.total_cost
        ),
        RunStatus::Failed => eprintln!(
            "\n[Run {} failed at '{}': {}]",
            outcome.run_id,
            outcome.halted_at.as_deref().unwrap_or("-"),
            outcome
                .fatal_failures()
                .last()
                .map(|f| f.message.as_str())
                .unwrap_or("unknown error")
        ),
    }

    ExitCode::from(outcome.status.exit_code() as u8)
}

/// Load a pipeline by path or name
fn load_pipeline(reference: &str) -> Result<Pipeline> {
    let direct = PathBuf::from(reference);
    let named = PathBuf::from("pipelines").join(format!("{}.yaml", reference));
    let local = PathBuf::from(format!("{}.yaml", reference));

    let path = [&direct, &named, &local]
        .into_iter()
        .find(|p| p.is_file())
        .with_context(|| {
            format!(
                "Pipeline '{}' not found. Looked for:\n  - {}\n  - {}\n  - {}",
                reference,
                direct.display(),
                named.display(),
                local.display()
            )
        })?;

    let pipeline = Pipeline::from_file(path)?;
    pipeline.validate()?;
    Ok(pipeline)
}
