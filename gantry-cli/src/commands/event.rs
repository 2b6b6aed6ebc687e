//! Event command handlers
//!
//! Sends signed webhook events to the orchestrator, the same way the source
//! host delivers them.

use anyhow::{Context, Result};
use clap::Subcommand;
use colored::*;
use gantry_client::OrchestratorClient;
use gantry_core::domain::trigger::{PullRequestAction, WebhookEvent};
use gantry_core::dto::webhook::{AckStatus, WebhookAck};

use crate::config::Config;

/// Event subcommands
#[derive(Subcommand)]
pub enum EventCommands {
    /// Send a push event
    Push {
        /// Ref that was pushed
        #[arg(long, default_value = "refs/heads/master")]
        git_ref: String,

        #[arg(long)]
        commit: Option<String>,
    },
    /// Send a pull-request event
    PullRequest {
        /// Source ref of the pull request
        #[arg(long)]
        head: String,

        /// Target ref of the pull request
        #[arg(long)]
        base: String,

        /// created, updated, reopened or closed (opened and synchronize are accepted too)
        #[arg(long, default_value = "created", value_parser = parse_action)]
        action: PullRequestAction,

        #[arg(long)]
        commit: Option<String>,
    },
}

pub async fn handle_event_command(command: EventCommands, config: &Config) -> Result<()> {
    let event = build_event(command);
    let secret = config.webhook_secret()?;
    let client = OrchestratorClient::new(&config.orchestrator_url);

    let ack = client
        .send_event(&event, secret)
        .await
        .context("Failed to send event")?;

    print_ack(&ack);
    Ok(())
}

fn build_event(command: EventCommands) -> WebhookEvent {
    let (event, commit) = match command {
        EventCommands::Push { git_ref, commit } => (WebhookEvent::push(git_ref), commit),
        EventCommands::PullRequest {
            head,
            base,
            action,
            commit,
        } => (WebhookEvent::pull_request(action, head, base), commit),
    };

    match commit {
        Some(commit) => event.with_commit(commit),
        None => event,
    }
}

/// Parses an action using the same spellings webhook payloads accept
pub fn parse_action(value: &str) -> Result<PullRequestAction, String> {
    let action: PullRequestAction = serde_json::from_value(serde_json::Value::String(
        value.to_string(),
    ))
    .map_err(|e| e.to_string())?;

    match action {
        PullRequestAction::Other => Err(format!("unknown pull-request action '{}'", value)),
        action => Ok(action),
    }
}

fn print_ack(ack: &WebhookAck) {
    match ack.status {
        AckStatus::Accepted => {
            println!("{} Event accepted", "✓".green());
            if let Some(run_id) = ack.run_id {
                println!("  Run:    {}", run_id.to_string().cyan());
            }
            if let Some(entry) = ack.entry {
                println!("  Entry:  {:?}", entry);
            }
            if let Some(filter) = &ack.filter {
                println!("  Filter: {}", filter.dimmed());
            }
        }
        AckStatus::Ignored => {
            println!("{}", "Event ignored: no trigger filter matched.".yellow());
        }
    }
}
