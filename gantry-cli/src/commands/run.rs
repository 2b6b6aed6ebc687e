//! Run command handlers
//!
//! Listing, inspecting and cancelling pipeline runs.

use anyhow::{Context, Result};
use clap::Subcommand;
use colored::*;
use gantry_client::OrchestratorClient;
use gantry_core::domain::log::{LogEntry, LogLevel};
use gantry_core::domain::run::{Run, RunId, RunState, StageRecord, StageStatus};
use gantry_core::dto::run::RunSummary;

use crate::config::Config;

/// Run subcommands
#[derive(Subcommand)]
pub enum RunCommands {
    /// List recent runs, newest first
    List {
        /// Maximum number of runs to show
        #[arg(short, long)]
        limit: Option<i64>,
    },
    /// Show a run with its stages
    Get {
        id: RunId,

        /// Include stage logs
        #[arg(long)]
        logs: bool,
    },
    /// Cancel a run
    Cancel { id: RunId },
}

pub async fn handle_run_command(command: RunCommands, config: &Config) -> Result<()> {
    let client = OrchestratorClient::new(&config.orchestrator_url);

    match command {
        RunCommands::List { limit } => list_runs(&client, limit).await,
        RunCommands::Get { id, logs } => get_run(&client, id, logs).await,
        RunCommands::Cancel { id } => cancel_run(&client, id).await,
    }
}

async fn list_runs(client: &OrchestratorClient, limit: Option<i64>) -> Result<()> {
    let runs = client
        .list_runs(limit)
        .await
        .context("Failed to list runs")?;

    if runs.is_empty() {
        println!("{}", "No runs found.".yellow());
    } else {
        println!("{}", format!("Found {} run(s):", runs.len()).bold());
        println!();
        for run in runs {
            print_run_summary(&run);
        }
    }

    Ok(())
}

async fn get_run(client: &OrchestratorClient, id: RunId, logs: bool) -> Result<()> {
    let run = client
        .get_run(id)
        .await
        .with_context(|| format!("Failed to get run {}", id))?;

    print_run_details(&run, logs);

    Ok(())
}

async fn cancel_run(client: &OrchestratorClient, id: RunId) -> Result<()> {
    let run = client
        .cancel_run(id)
        .await
        .with_context(|| format!("Failed to cancel run {}", id))?;

    println!(
        "{} Cancellation requested for run {} (was {})",
        "✓".green(),
        run.id.to_string().cyan(),
        colorize_state(run.state)
    );

    Ok(())
}

fn print_run_summary(run: &RunSummary) {
    println!("  {} Run {}", "▸".cyan(), run.id.to_string().bold());
    println!("    Pipeline: {}", run.pipeline.dimmed());
    println!("    Entry:    {:?}", run.entry);
    println!("    Ref:      {}", run.git_ref);
    println!("    State:    {}", colorize_state(run.state));
    println!(
        "    Started:  {}",
        run.started_at
            .format("%Y-%m-%d %H:%M:%S")
            .to_string()
            .dimmed()
    );
    if let Some(failure) = &run.failure {
        println!("    Failure:  {}", failure.detail.red());
    }
    println!();
}

fn print_run_details(run: &Run, logs: bool) {
    println!("{}", "Run Details:".bold());
    println!("  ID:        {}", run.id.to_string().cyan());
    println!("  Pipeline:  {}", run.pipeline);
    println!("  Entry:     {:?}", run.entry);
    println!("  State:     {}", colorize_state(run.state));
    println!(
        "  Trigger:   {} on {} (filter {})",
        run.trigger.event_type.as_str(),
        run.trigger.git_ref,
        run.trigger.filter.dimmed()
    );
    if let Some(commit) = &run.trigger.commit {
        println!("  Commit:    {}", commit.dimmed());
    }
    println!(
        "  Started:   {}",
        run.started_at.format("%Y-%m-%d %H:%M:%S")
    );
    if let Some(finished) = run.finished_at {
        println!("  Finished:  {}", finished.format("%Y-%m-%d %H:%M:%S"));
        let seconds = finished.signed_duration_since(run.started_at).num_seconds();
        println!("  Duration:  {}s", seconds);
    }

    if let Some(failure) = &run.failure {
        println!("\n{}", "Failure:".bold());
        println!("  Kind:      {:?}", failure.kind);
        if let Some(stage) = &failure.stage {
            println!("  Stage:     {}", stage);
        }
        if let Some(action) = &failure.action {
            println!("  Action:    {}", action);
        }
        println!("  {}", failure.detail.red());
    }

    println!("\n{}", "Stages:".bold());
    for stage in &run.stages {
        print_stage(stage, logs);
    }
}

fn print_stage(stage: &StageRecord, logs: bool) {
    println!(
        "  {} {} [{}]",
        "▸".cyan(),
        stage.name.bold(),
        colorize_stage_status(stage.status)
    );
    for input in &stage.inputs {
        println!(
            "    in:  {} v{} {}",
            input.name,
            input.version,
            input.digest.dimmed()
        );
    }
    for output in &stage.outputs {
        println!(
            "    out: {} v{} {}",
            output.name,
            output.version,
            output.digest.dimmed()
        );
    }

    if logs && !stage.logs.is_empty() {
        println!("    {}", "─".repeat(76).dimmed());
        for entry in &stage.logs {
            print_log_entry(entry);
        }
        println!("    {}", "─".repeat(76).dimmed());
    }
}

fn print_log_entry(log: &LogEntry) {
    let level_str = log.level.to_string();
    let level_colored = match log.level {
        LogLevel::Debug => level_str.dimmed(),
        LogLevel::Info => level_str.cyan(),
        LogLevel::Warning => level_str.yellow(),
        LogLevel::Error => level_str.red(),
    };

    println!(
        "    {} [{}] {}",
        log.timestamp.format("%H:%M:%S").to_string().dimmed(),
        level_colored,
        log.message
    );
}

fn colorize_state(state: RunState) -> ColoredString {
    let s = state.as_str();
    match state {
        RunState::Pending => s.yellow(),
        RunState::Succeeded => s.green(),
        RunState::Failed => s.red(),
        RunState::Cancelled => s.dimmed(),
        _ => s.cyan(),
    }
}

fn colorize_stage_status(status: StageStatus) -> ColoredString {
    let s = format!("{:?}", status);
    match status {
        StageStatus::Pending => s.dimmed(),
        StageStatus::InProgress => s.cyan(),
        StageStatus::Succeeded => s.green(),
        StageStatus::Failed => s.red(),
        StageStatus::Cancelled => s.yellow(),
    }
}
