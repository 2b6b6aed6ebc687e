//! Pipeline command handlers
//!
//! `show` and `roles` ask the orchestrator; `check` works offline on a
//! definition file.

use anyhow::{Context, Result};
use clap::Subcommand;
use colored::*;
use gantry_client::OrchestratorClient;
use gantry_core::domain::pipeline::PipelineDefinition;
use gantry_core::domain::policy::{Principal, Role, RoleSet};
use gantry_core::domain::trigger::{EventType, PullRequestAction, WebhookEvent};
use gantry_core::dto::pipeline::PipelineSummary;
use gantry_core::{RoleBinder, TriggerDecision, TriggerMatcher};
use std::path::{Path, PathBuf};

use crate::commands::event::parse_action;
use crate::config::Config;

/// Pipeline subcommands
#[derive(Subcommand)]
pub enum PipelineCommands {
    /// Show the pipeline the orchestrator serves
    Show,
    /// Show the execution role of each stage
    Roles,
    /// Validate a definition file and preview its roles and triggers
    Check {
        /// Path to the pipeline definition
        file: PathBuf,

        /// Dry-run the triggers against an event with this ref
        #[arg(long = "ref")]
        git_ref: Option<String>,

        /// Event type of the dry-run event
        #[arg(long, default_value = "push", value_parser = ["push", "pull_request"])]
        event: String,

        /// Target ref of a pull_request dry-run event
        #[arg(long)]
        base: Option<String>,

        /// Action of a pull_request dry-run event
        #[arg(long, default_value = "created", value_parser = parse_action)]
        action: PullRequestAction,
    },
}

pub async fn handle_pipeline_command(command: PipelineCommands, config: &Config) -> Result<()> {
    match command {
        PipelineCommands::Show => {
            let client = OrchestratorClient::new(&config.orchestrator_url);
            let summary = client
                .get_pipeline()
                .await
                .context("Failed to get pipeline")?;
            print_summary(&summary);
            Ok(())
        }
        PipelineCommands::Roles => {
            let client = OrchestratorClient::new(&config.orchestrator_url);
            let roles = client.get_roles().await.context("Failed to get roles")?;
            print_roles(&roles);
            Ok(())
        }
        PipelineCommands::Check {
            file,
            git_ref,
            event,
            base,
            action,
        } => {
            let dry_run = git_ref.map(|git_ref| dry_run_event(&event, git_ref, base, action));
            check_definition(&file, dry_run)
        }
    }
}

fn dry_run_event(
    event: &str,
    git_ref: String,
    base: Option<String>,
    action: PullRequestAction,
) -> WebhookEvent {
    if event == EventType::PullRequest.as_str() {
        let mut event = WebhookEvent::pull_request(action, git_ref, String::new());
        event.base_ref = base;
        event
    } else {
        WebhookEvent::push(git_ref)
    }
}

fn check_definition(file: &Path, dry_run: Option<WebhookEvent>) -> Result<()> {
    let definition = PipelineDefinition::load(file)
        .with_context(|| format!("{} is not a valid pipeline definition", file.display()))?;
    let matcher = TriggerMatcher::for_definition(&definition)
        .context("Trigger filters are invalid")?;
    let roles = RoleBinder::bind(&definition);

    println!(
        "{} {} is valid",
        "✓".green(),
        file.display().to_string().bold()
    );
    println!();
    print_summary(&PipelineSummary::new(
        &definition,
        matcher.filter_names().into_iter().map(String::from).collect(),
    ));
    println!();
    print_roles(&roles);

    if let Some(event) = dry_run {
        println!();
        println!("{}", "Trigger dry-run:".bold());
        match matcher.evaluate(&event) {
            TriggerDecision::Matched { filter, entry } => println!(
                "  {} matches {} and would start a {:?} run",
                "✓".green(),
                filter.cyan(),
                entry
            ),
            TriggerDecision::NoMatch => {
                println!("  {}", "No trigger filter matches this event.".yellow())
            }
        }
    }

    Ok(())
}

fn print_summary(summary: &PipelineSummary) {
    println!("{}", "Pipeline:".bold());
    println!("  Name:       {}", summary.name.cyan());
    println!("  Repository: {}", summary.repository);
    println!("  Branch:     {}", summary.branch);
    println!("  Stack:      {}", summary.stack_name);
    println!(
        "  Webhook credential: {}",
        if summary.create_webhook_credential {
            "managed by this pipeline".normal()
        } else {
            "external".dimmed()
        }
    );

    println!("\n{}", "Stages:".bold());
    for stage in &summary.stages {
        let timeout = stage
            .timeout_seconds
            .map(|s| format!(" timeout {}s", s))
            .unwrap_or_default();
        println!(
            "  {} {} ({}){}",
            "▸".cyan(),
            stage.name.bold(),
            stage.kind,
            timeout.dimmed()
        );
        for action in &stage.actions {
            println!(
                "    {}. {} [{}]",
                action.run_order,
                action.name,
                action.provider.to_string().dimmed()
            );
        }
        if !stage.input_artifacts.is_empty() {
            println!("    in:  {}", stage.input_artifacts.join(", "));
        }
        if !stage.output_artifacts.is_empty() {
            println!("    out: {}", stage.output_artifacts.join(", "));
        }
    }

    println!("\n{}", "Triggers:".bold());
    for name in &summary.triggers {
        println!("  {} {}", "▸".cyan(), name);
    }
}

fn print_roles(roles: &RoleSet) {
    println!("{}", "Roles:".bold());
    for role in roles.iter() {
        print_role(role);
    }
}

fn print_role(role: &Role) {
    let Principal::Service(principal) = &role.principal;
    println!(
        "  {} {} ({}, assumed by {})",
        "▸".cyan(),
        role.name.bold(),
        role.stage,
        principal.dimmed()
    );
    for statement in &role.statements {
        println!(
            "    {:?} {} on {}",
            statement.effect,
            statement.actions.join(", "),
            statement.resource.dimmed()
        );
    }
    let violations = role.scope_violations();
    if !violations.is_empty() {
        println!(
            "    {}",
            format!("⚠ {} statement(s) use a wildcard resource", violations.len()).yellow()
        );
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_dry_run_event_shapes() {
        let push = dry_run_event("push", "refs/heads/master".into(), None, PullRequestAction::Created);
        assert_eq!(push.event_type, EventType::Push);
        assert!(push.base_ref.is_none());

        let pr = dry_run_event(
            "pull_request",
            "refs/heads/feature".into(),
            Some("refs/heads/master".into()),
            PullRequestAction::Updated,
        );
        assert_eq!(pr.event_type, EventType::PullRequest);
        assert_eq!(pr.base_ref.as_deref(), Some("refs/heads/master"));
        assert_eq!(pr.action, Some(PullRequestAction::Updated));
    }

    #[test]
    fn test_check_rejects_missing_file() {
        let result = check_definition(Path::new("/nonexistent/pipeline.yaml"), None);
        assert!(result.is_err());
    }
}
