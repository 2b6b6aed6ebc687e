//! Validation environment
//!
//! Runs an action's commands in isolation against a checked-out artifact.
//! Exit code 0 is a pass; anything else fails validation.

use async_trait::async_trait;
use gantry_core::domain::pipeline::Action;
use std::path::PathBuf;

use crate::error::StageError;

/// What to run and where
#[derive(Debug, Clone)]
pub struct ValidationRequest {
    /// Unique label for the isolated environment
    pub label: String,
    pub image: String,
    pub commands: Vec<String>,
    /// Directory holding the checked-out artifact
    pub workdir: PathBuf,
}

impl ValidationRequest {
    /// Builds a request from an action's `image` and `commands` settings
    ///
    /// `commands` holds one command per line.
    pub fn from_action(
        action: &Action,
        label: String,
        default_image: &str,
        workdir: PathBuf,
    ) -> Result<Self, StageError> {
        let commands: Vec<String> = action
            .configuration
            .get("commands")
            .map(|c| {
                c.lines()
                    .map(str::trim)
                    .filter(|l| !l.is_empty())
                    .map(String::from)
                    .collect()
            })
            .unwrap_or_default();

        if commands.is_empty() {
            return Err(StageError::Environment(format!(
                "action '{}' declares no commands",
                action.name
            )));
        }

        let image = action
            .configuration
            .get("image")
            .cloned()
            .unwrap_or_else(|| default_image.to_string());

        Ok(Self {
            label,
            image,
            commands,
            workdir,
        })
    }

    /// Shell script that stops at the first failing command
    pub fn script(&self) -> String {
        let mut script = String::from("set -e\n");
        for command in &self.commands {
            script.push_str(command);
            script.push('\n');
        }
        script
    }
}

#[derive(Debug, Clone)]
pub struct ValidationReport {
    pub exit_code: Option<i32>,
    pub stdout: String,
    pub stderr: String,
}

impl ValidationReport {
    pub fn passed(&self) -> bool {
        self.exit_code == Some(0)
    }
}

#[async_trait]
pub trait ValidationEnvironment: Send + Sync {
    async fn run(&self, request: &ValidationRequest) -> Result<ValidationReport, StageError>;
}
