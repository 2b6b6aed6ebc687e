//! Deployment engine
//!
//! Applies a template to a named stack under a given role identity.
//! Re-applying an already converged template succeeds with `NoChanges`.

use async_trait::async_trait;
use serde::Deserialize;
use std::collections::BTreeMap;
use std::path::PathBuf;
use tracing::{debug, info};

use crate::error::EngineError;
use crate::process;

#[derive(Debug, Clone)]
pub struct DeployRequest {
    pub stack_name: String,
    pub template: PathBuf,
    /// Identity the engine assumes while changing the stack
    pub role_arn: String,
    pub region: String,
    pub parameters: BTreeMap<String, String>,
    pub capabilities: Vec<String>,
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum DeployStatus {
    Created,
    Updated,
    NoChanges,
}

impl std::fmt::Display for DeployStatus {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        match self {
            DeployStatus::Created => write!(f, "created"),
            DeployStatus::Updated => write!(f, "updated"),
            DeployStatus::NoChanges => write!(f, "no changes"),
        }
    }
}

#[derive(Debug, Clone)]
pub struct DeployResult {
    pub status: DeployStatus,
    pub outputs: BTreeMap<String, String>,
}

#[async_trait]
pub trait DeploymentEngine: Send + Sync {
    async fn apply(&self, request: &DeployRequest) -> Result<DeployResult, EngineError>;
}

/// CloudFormation through the `aws` CLI
pub struct CloudFormationCliEngine {
    cli: String,
}

impl CloudFormationCliEngine {
    pub fn new(cli: impl Into<String>) -> Self {
        Self { cli: cli.into() }
    }

    async fn aws(&self, args: &[String]) -> Result<process::CommandOutput, EngineError> {
        debug!("{} {:?}", self.cli, args.get(..2));
        process::run(process::command(&self.cli).args(args))
            .await
            .map_err(|e| EngineError::Unavailable(format!("failed to run {}: {}", self.cli, e)))
    }

    /// Whether the stack exists; a missing stack is reported on stderr
    async fn stack_exists(&self, request: &DeployRequest) -> Result<bool, EngineError> {
        let output = self
            .aws(&strings(&[
                "cloudformation",
                "describe-stacks",
                "--stack-name",
                request.stack_name.as_str(),
                "--region",
                request.region.as_str(),
            ]))
            .await?;

        if output.success() {
            Ok(true)
        } else if output.stderr.contains("does not exist") {
            Ok(false)
        } else {
            Err(EngineError::Rejected(output.diagnostic()))
        }
    }

    async fn outputs(&self, request: &DeployRequest) -> Result<BTreeMap<String, String>, EngineError> {
        let output = self
            .aws(&strings(&[
                "cloudformation",
                "describe-stacks",
                "--stack-name",
                request.stack_name.as_str(),
                "--region",
                request.region.as_str(),
                "--query",
                "Stacks[0].Outputs",
                "--output",
                "json",
            ]))
            .await?;

        if !output.success() {
            return Err(EngineError::Rejected(output.diagnostic()));
        }
        parse_outputs(&output.stdout)
    }
}

#[async_trait]
impl DeploymentEngine for CloudFormationCliEngine {
    async fn apply(&self, request: &DeployRequest) -> Result<DeployResult, EngineError> {
        let existed = self.stack_exists(request).await?;
        let output = self.aws(&deploy_args(request)).await?;

        if !output.success() {
            return Err(EngineError::Rejected(output.diagnostic()));
        }

        let status = if is_no_change(&output.stdout) {
            DeployStatus::NoChanges
        } else if existed {
            DeployStatus::Updated
        } else {
            DeployStatus::Created
        };

        let outputs = self.outputs(request).await?;
        info!(
            "Stack {} {} with {} output(s)",
            request.stack_name,
            status,
            outputs.len()
        );

        Ok(DeployResult { status, outputs })
    }
}

fn strings(args: &[&str]) -> Vec<String> {
    args.iter().map(|a| a.to_string()).collect()
}

fn deploy_args(request: &DeployRequest) -> Vec<String> {
    let template = request.template.to_string_lossy().to_string();
    let mut args = strings(&[
        "cloudformation",
        "deploy",
        "--stack-name",
        request.stack_name.as_str(),
        "--template-file",
        template.as_str(),
        "--role-arn",
        request.role_arn.as_str(),
        "--region",
        request.region.as_str(),
        "--no-fail-on-empty-changeset",
    ]);

    if !request.capabilities.is_empty() {
        args.push("--capabilities".to_string());
        args.extend(request.capabilities.iter().cloned());
    }

    if !request.parameters.is_empty() {
        args.push("--parameter-overrides".to_string());
        args.extend(
            request
                .parameters
                .iter()
                .map(|(key, value)| format!("{}={}", key, value)),
        );
    }

    args
}

fn is_no_change(stdout: &str) -> bool {
    stdout.contains("No changes to deploy")
}

#[derive(Deserialize)]
struct StackOutput {
    #[serde(rename = "OutputKey")]
    key: String,
    #[serde(rename = "OutputValue")]
    value: String,
}

fn parse_outputs(stdout: &str) -> Result<BTreeMap<String, String>, EngineError> {
    let trimmed = stdout.trim();
    if trimmed.is_empty() || trimmed == "null" {
        return Ok(BTreeMap::new());
    }

    let outputs: Vec<StackOutput> = serde_json::from_str(trimmed)
        .map_err(|e| EngineError::Rejected(format!("unreadable stack outputs: {}", e)))?;
    Ok(outputs.into_iter().map(|o| (o.key, o.value)).collect())
}
