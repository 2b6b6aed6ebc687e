//! Stage executor
//!
//! Runs the actions of one stage, in run order, in the stage's working tree:
//! - Inputs are checked out before the first action (the first input at the
//!   root of the tree, further inputs in a subdirectory named after them)
//! - Each action is dispatched to the collaborator serving its provider
//! - After the last action the tree is published as the stage's outputs
//!
//! The executor never changes run state; it reports an outcome and the
//! controller decides what happens to the run.

use async_trait::async_trait;
use gantry_core::domain::artifact::ArtifactRef;
use gantry_core::domain::log::LogLevel;
use gantry_core::domain::pipeline::{Action, PipelineSettings, Provider, Stage};
use gantry_core::domain::policy::Role;
use gantry_core::domain::run::{EntryPoint, RunId};
use std::collections::BTreeMap;
use std::path::{Path, PathBuf};
use std::sync::Arc;
use tracing::{debug, info, warn};

use crate::artifact::ArtifactStore;
use crate::config::ExecutorConfig;
use crate::context::StageContext;
use crate::deploy::{DeployRequest, DeploymentEngine};
use crate::error::StageError;
use crate::github::{CommitState, GitHubError, StatusReporter};
use crate::redact;
use crate::source::SourceFetcher;
use crate::validation::{ValidationEnvironment, ValidationRequest};

const DEFAULT_TEMPLATE: &str = "template.yml";

/// Result of a stage that ran to completion
#[derive(Debug, Clone, PartialEq)]
pub enum StageOutcome {
    Succeeded {
        outputs: Vec<ArtifactRef>,
    },
    /// An action reported failure, e.g. a validation command exited non-zero
    Failed {
        action: String,
        reason: String,
        exit_code: Option<i32>,
    },
}

impl StageOutcome {
    pub fn is_success(&self) -> bool {
        matches!(self, StageOutcome::Succeeded { .. })
    }
}

/// Service trait for executing one stage of a run
#[async_trait]
pub trait StageExecutor: Send + Sync {
    /// Executes a stage
    ///
    /// # Arguments
    /// * `ctx` - Run identity, working tree and log buffer
    /// * `stage` - The stage definition
    /// * `inputs` - Resolved artifact versions for `stage.input_artifacts`
    /// * `role` - Execution identity bound to this stage
    async fn execute(
        &self,
        ctx: &StageContext,
        stage: &Stage,
        inputs: &[ArtifactRef],
        role: &Role,
    ) -> Result<StageOutcome, StageError>;
}

/// Standard implementation of StageExecutor
pub struct StandardStageExecutor {
    settings: PipelineSettings,
    config: ExecutorConfig,
    artifacts: Arc<dyn ArtifactStore>,
    source: Arc<dyn SourceFetcher>,
    validation: Arc<dyn ValidationEnvironment>,
    deployer: Arc<dyn DeploymentEngine>,
    status: Option<Arc<dyn StatusReporter>>,
}

impl StandardStageExecutor {
    pub fn new(
        settings: PipelineSettings,
        config: ExecutorConfig,
        artifacts: Arc<dyn ArtifactStore>,
        source: Arc<dyn SourceFetcher>,
        validation: Arc<dyn ValidationEnvironment>,
        deployer: Arc<dyn DeploymentEngine>,
    ) -> Self {
        Self {
            settings,
            config,
            artifacts,
            source,
            validation,
            deployer,
            status: None,
        }
    }

    /// Reports pull-request validation results as commit statuses
    pub fn with_status_reporter(mut self, reporter: Arc<dyn StatusReporter>) -> Self {
        self.status = Some(reporter);
        self
    }

    async fn prepare_workspace(
        &self,
        ctx: &StageContext,
        stage: &Stage,
        inputs: &[ArtifactRef],
    ) -> Result<(), StageError> {
        let workspace = ctx.workspace();
        if tokio::fs::try_exists(workspace).await? {
            tokio::fs::remove_dir_all(workspace).await?;
        }
        tokio::fs::create_dir_all(workspace).await?;

        for (index, name) in stage.input_artifacts.iter().enumerate() {
            let artifact = inputs
                .iter()
                .find(|a| &a.name == name)
                .ok_or_else(|| StageError::MissingInput(name.clone()))?;

            let dest = if index == 0 {
                workspace.to_path_buf()
            } else {
                workspace.join(name)
            };

            self.artifacts.checkout(artifact, &dest).await?;
            ctx.log_info(format!("Checked out input {}", artifact));
        }

        Ok(())
    }

    async fn run_action(
        &self,
        ctx: &StageContext,
        action: &Action,
        role: &Role,
    ) -> Result<Option<StageOutcome>, StageError> {
        match action.provider {
            Provider::GitHub => self.fetch_source(ctx).await.map(|_| None),
            Provider::ContainerBuild => self.validate(ctx, action).await,
            Provider::CloudFormation => self.deploy(ctx, action, role).await.map(|_| None),
        }
    }

    async fn fetch_source(&self, ctx: &StageContext) -> Result<(), StageError> {
        let repository = self.settings.repository();
        ctx.log_info(format!(
            "Fetching {} from {}",
            ctx.trigger.git_ref, repository
        ));

        let fetched = self
            .source
            .fetch(
                &repository,
                &ctx.trigger.git_ref,
                &self.settings.source_credential,
                ctx.workspace(),
            )
            .await?;

        if let Some(expected) = &ctx.trigger.commit
            && expected != &fetched.commit
        {
            ctx.log_warning(format!(
                "Fetched commit {} differs from event commit {}; the ref moved",
                fetched.commit, expected
            ));
        }

        ctx.log_info(format!("Fetched commit {}", fetched.commit));
        Ok(())
    }

    async fn validate(
        &self,
        ctx: &StageContext,
        action: &Action,
    ) -> Result<Option<StageOutcome>, StageError> {
        let request = ValidationRequest::from_action(
            action,
            ctx.environment_label(&action.name),
            &self.config.default_container_image,
            ctx.workspace().to_path_buf(),
        )?;

        self.report(ctx, CommitState::Pending, "Validation running")
            .await;
        ctx.log_info(format!(
            "Running {} command(s) in {}",
            request.commands.len(),
            request.image
        ));

        let report = self.validation.run(&request).await?;

        ctx.log_output(LogLevel::Info, &report.stdout);
        ctx.log_output(LogLevel::Warning, &report.stderr);

        if report.passed() {
            self.report(ctx, CommitState::Success, "Validation passed")
                .await;
            return Ok(None);
        }

        self.report(ctx, CommitState::Failure, "Validation failed")
            .await;
        let reason = match report.exit_code {
            Some(code) => format!("validation commands exited with code {}", code),
            None => "validation commands were terminated".to_string(),
        };
        ctx.log_error(&reason);

        Ok(Some(StageOutcome::Failed {
            action: action.name.clone(),
            reason,
            exit_code: report.exit_code,
        }))
    }

    async fn deploy(&self, ctx: &StageContext, action: &Action, role: &Role) -> Result<(), StageError> {
        let stack = self.settings.stack_name.clone();
        let template_path = action
            .configuration
            .get("template_path")
            .map(String::as_str)
            .unwrap_or(DEFAULT_TEMPLATE);
        let template = ctx.workspace().join(template_path);

        if !tokio::fs::try_exists(&template).await? {
            return Err(StageError::Deployment {
                stack,
                detail: format!("template '{}' not found in the input artifact", template_path),
            });
        }

        let request = DeployRequest {
            stack_name: stack.clone(),
            template,
            role_arn: role.arn(&self.settings.partition, &self.settings.account_id),
            region: self.settings.region.clone(),
            parameters: parse_parameters(action.configuration.get("parameters")),
            capabilities: parse_list(action.configuration.get("capabilities")),
        };

        ctx.log_info(format!(
            "Applying {} to stack {} as {}",
            template_path, stack, request.role_arn
        ));

        let result = self
            .deployer
            .apply(&request)
            .await
            .map_err(|e| StageError::Deployment {
                stack: stack.clone(),
                detail: e.to_string(),
            })?;

        ctx.log_info(format!("Stack {} {}", stack, result.status));
        for (key, value) in &result.outputs {
            ctx.log_info(format!("Output {} = {}", key, value));
        }
        Ok(())
    }

    /// Where commit statuses for this stage go; only pull-request runs with a commit report
    fn status_target(&self, ctx: &StageContext) -> Option<StatusTarget> {
        let reporter = self.status.as_ref()?;
        if ctx.entry != EntryPoint::PullRequestValidation {
            return None;
        }
        let Some(commit) = &ctx.trigger.commit else {
            debug!("Run {} has no commit to report status on", ctx.run_id);
            return None;
        };
        Some(StatusTarget {
            reporter: reporter.clone(),
            repository: self.settings.repository(),
            commit: commit.clone(),
            run_id: ctx.run_id,
        })
    }

    async fn report(&self, ctx: &StageContext, state: CommitState, description: &str) {
        if let Some(target) = self.status_target(ctx)
            && let Err(e) = target.send(state, description).await
        {
            ctx.log_warning(format!("Commit status not reported: {}", e));
        }
    }

    async fn publish(
        &self,
        ctx: &StageContext,
        stage: &Stage,
    ) -> Result<Vec<ArtifactRef>, StageError> {
        let mut outputs = Vec::with_capacity(stage.output_artifacts.len());
        for name in &stage.output_artifacts {
            let artifact = self
                .artifacts
                .put(name, &stage.name, ctx.run_id, ctx.workspace())
                .await?;
            ctx.log_info(format!("Published {}", artifact));
            outputs.push(artifact);
        }
        Ok(outputs)
    }

    async fn cleanup(&self, workspace: &Path) {
        if self.config.keep_workspaces {
            debug!("Keeping workspace {}", workspace.display());
            return;
        }
        if let Err(e) = tokio::fs::remove_dir_all(workspace).await
            && e.kind() != std::io::ErrorKind::NotFound
        {
            warn!("Failed to remove workspace {}: {}", workspace.display(), e);
        }
        // The run directory goes with its last stage workspace
        if let Some(run_dir) = workspace.parent() {
            let _ = tokio::fs::remove_dir(run_dir).await;
        }
    }
}

/// Commit a pull-request run reports its status on
struct StatusTarget {
    reporter: Arc<dyn StatusReporter>,
    repository: String,
    commit: String,
    run_id: RunId,
}

impl StatusTarget {
    /// Commit statuses are best effort; a reporting failure never fails the stage
    async fn send(&self, state: CommitState, description: &str) -> Result<(), GitHubError> {
        let result = self
            .reporter
            .report(&self.repository, &self.commit, state, description)
            .await;
        if let Err(e) = &result {
            warn!("Failed to report commit status for run {}: {}", self.run_id, e);
        }
        result
    }
}

/// Settles a stage whose `execute` future is dropped before it returns
///
/// Cancellation and stage timeouts drop the future mid-flight. The workspace
/// is removed and a pull-request commit is left with a final `error` status
/// instead of `pending`.
struct AbandonedStage {
    workspace: Option<PathBuf>,
    status: Option<StatusTarget>,
    armed: bool,
}

impl AbandonedStage {
    fn disarm(&mut self) {
        self.armed = false;
    }
}

impl Drop for AbandonedStage {
    fn drop(&mut self) {
        if !self.armed {
            return;
        }

        if let Some(workspace) = &self.workspace {
            if let Err(e) = std::fs::remove_dir_all(workspace)
                && e.kind() != std::io::ErrorKind::NotFound
            {
                warn!("Failed to remove workspace {}: {}", workspace.display(), e);
            }
            if let Some(run_dir) = workspace.parent() {
                let _ = std::fs::remove_dir(run_dir);
            }
        }

        if let Some(target) = self.status.take() {
            match tokio::runtime::Handle::try_current() {
                Ok(runtime) => {
                    runtime.spawn(async move {
                        let _ = target
                            .send(CommitState::Error, "Stage was cancelled or timed out")
                            .await;
                    });
                }
                Err(_) => warn!(
                    "Run {} left commit {} without a final status",
                    target.run_id, target.commit
                ),
            }
        }
    }
}

#[async_trait]
impl StageExecutor for StandardStageExecutor {
    async fn execute(
        &self,
        ctx: &StageContext,
        stage: &Stage,
        inputs: &[ArtifactRef],
        role: &Role,
    ) -> Result<StageOutcome, StageError> {
        info!(
            "Run {}: executing stage '{}' as {}",
            ctx.run_id, stage.name, role.name
        );
        ctx.log_info(format!("Starting stage: {}", stage.name));

        let mut abandoned = AbandonedStage {
            workspace: (!self.config.keep_workspaces).then(|| ctx.workspace().to_path_buf()),
            status: self.status_target(ctx),
            armed: true,
        };
        let result = self.execute_in_workspace(ctx, stage, inputs, role).await;
        abandoned.disarm();
        self.cleanup(ctx.workspace()).await;

        if result.is_err() {
            self.report(ctx, CommitState::Error, "Stage could not complete")
                .await;
        }

        match &result {
            Ok(StageOutcome::Succeeded { outputs }) => {
                ctx.log_info(format!(
                    "Stage '{}' succeeded with {} output(s)",
                    stage.name,
                    outputs.len()
                ));
            }
            Ok(StageOutcome::Failed { action, .. }) => {
                ctx.log_error(format!("Stage '{}' failed in action '{}'", stage.name, action));
            }
            Err(e) => ctx.log_error(format!("Stage '{}' failed: {}", stage.name, e)),
        }

        result
    }
}

impl StandardStageExecutor {
    async fn execute_in_workspace(
        &self,
        ctx: &StageContext,
        stage: &Stage,
        inputs: &[ArtifactRef],
        role: &Role,
    ) -> Result<StageOutcome, StageError> {
        self.prepare_workspace(ctx, stage, inputs).await?;

        for action in stage.ordered_actions() {
            ctx.log_info(format!(
                "Action {} ({}): {}",
                action.name,
                action.provider,
                redact::describe(&action.configuration)
            ));

            if let Some(failed) = self.run_action(ctx, action, role).await? {
                return Ok(failed);
            }
        }

        let outputs = self.publish(ctx, stage).await?;
        Ok(StageOutcome::Succeeded { outputs })
    }
}

/// `KEY=VALUE` pairs, one per line
fn parse_parameters(raw: Option<&String>) -> BTreeMap<String, String> {
    raw.map(|raw| {
        raw.lines()
            .filter_map(|line| line.trim().split_once('='))
            .map(|(k, v)| (k.trim().to_string(), v.trim().to_string()))
            .filter(|(k, _)| !k.is_empty())
            .collect()
    })
    .unwrap_or_default()
}

/// Comma or whitespace separated values
fn parse_list(raw: Option<&String>) -> Vec<String> {
    raw.map(|raw| {
        raw.split(|c: char| c == ',' || c.is_whitespace())
            .filter(|s| !s.is_empty())
            .map(String::from)
            .collect()
    })
    .unwrap_or_default()
}
