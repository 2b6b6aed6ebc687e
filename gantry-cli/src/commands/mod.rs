//! Commands module
//!
//! Defines all CLI commands and their handlers.

mod event;
mod pipeline;
mod run;

pub use event::EventCommands;
pub use pipeline::PipelineCommands;
pub use run::RunCommands;

use anyhow::Result;
use clap::Subcommand;

use crate::config::Config;

/// Top-level CLI commands
#[derive(Subcommand)]
pub enum Commands {
    /// Pipeline runs
    Run {
        #[command(subcommand)]
        command: RunCommands,
    },
    /// Pipeline definition and roles
    Pipeline {
        #[command(subcommand)]
        command: PipelineCommands,
    },
    /// Send signed webhook events
    Event {
        #[command(subcommand)]
        command: EventCommands,
    },
}

/// Routes the command to the appropriate handler module.
pub async fn handle_command(command: Commands, config: &Config) -> Result<()> {
    match command {
        Commands::Run { command } => run::handle_run_command(command, config).await,
        Commands::Pipeline { command } => pipeline::handle_pipeline_command(command, config).await,
        Commands::Event { command } => event::handle_event_command(command, config).await,
    }
}
