//! Pipeline Controller
//!
//! Owns the run state machine:
//!
//! `Pending → SourceRunning → SourceDone → TestRunning → TestDone → DeployRunning → Succeeded`
//!
//! Any running state may end in `Failed`, any non-terminal state in
//! `Cancelled`. Pull-request validation runs end after `TestDone`. Every
//! transition is persisted before the next one starts. Nothing is retried
//! and nothing is rolled back.

use gantry_core::domain::pipeline::{PipelineDefinition, StageKind};
use gantry_core::domain::policy::RoleSet;
use gantry_core::domain::run::{
    EntryPoint, NewRun, Run, RunFailure, RunId, RunState, StageStatus, TriggerContext,
};
use gantry_core::domain::singleton::SingletonKey;
use gantry_core::domain::trigger::WebhookEvent;
use gantry_core::{DefinitionError, PipelineError, RoleBinder, TriggerDecision, TriggerMatcher};
use gantry_runner::{StageContext, StageExecutor, StageOutcome};
use std::collections::{HashMap, HashSet};
use std::path::PathBuf;
use std::sync::{Arc, Mutex};
use std::time::Duration;
use thiserror::Error;
use tokio_util::sync::CancellationToken;
use tracing::{debug, error, info, warn};

use crate::repository::{RepositoryError, RunRepository};
use crate::service::guard::{Acquisition, SingletonGuard};

pub const DEFAULT_LIST_LIMIT: i64 = 20;
pub const MAX_LIST_LIMIT: i64 = 100;
const CANCEL_SETTLE_TIMEOUT: Duration = Duration::from_secs(5);

#[derive(Debug, Error)]
pub enum ControllerError {
    #[error("run {0} not found")]
    NotFound(RunId),

    #[error("{0}")]
    InvalidState(String),

    #[error(transparent)]
    Repository(#[from] RepositoryError),
}

pub struct PipelineController {
    definition: Arc<PipelineDefinition>,
    matcher: TriggerMatcher,
    roles: RoleSet,
    runs: Arc<dyn RunRepository>,
    executor: Arc<dyn StageExecutor>,
    guard: Arc<SingletonGuard>,
    workspace_base: PathBuf,
    /// Cancellation tokens of runs driven by this process
    active: Mutex<HashMap<RunId, CancellationToken>>,
    /// Runs currently in their Deploy stage, per stack name
    deploying: Mutex<HashMap<String, HashSet<RunId>>>,
}

impl PipelineController {
    /// Compiles trigger filters and binds stage roles for the definition
    pub fn new(
        definition: Arc<PipelineDefinition>,
        runs: Arc<dyn RunRepository>,
        executor: Arc<dyn StageExecutor>,
        guard: Arc<SingletonGuard>,
        workspace_base: PathBuf,
    ) -> Result<Self, DefinitionError> {
        let matcher = TriggerMatcher::for_definition(&definition)?;
        let roles = RoleBinder::bind(&definition);

        Ok(Self {
            definition,
            matcher,
            roles,
            runs,
            executor,
            guard,
            workspace_base,
            active: Mutex::new(HashMap::new()),
            deploying: Mutex::new(HashMap::new()),
        })
    }

    pub fn definition(&self) -> &PipelineDefinition {
        &self.definition
    }

    pub fn roles(&self) -> &RoleSet {
        &self.roles
    }

    pub fn trigger_names(&self) -> Vec<String> {
        self.matcher
            .filter_names()
            .into_iter()
            .map(String::from)
            .collect()
    }

    /// Starts a run if the event matches a trigger filter
    ///
    /// Returns `None` for events no filter matches; no run is created then.
    pub async fn handle_event(
        self: &Arc<Self>,
        event: &WebhookEvent,
    ) -> Result<Option<Run>, ControllerError> {
        let (filter, entry) = match self.matcher.evaluate(event) {
            TriggerDecision::Matched { filter, entry } => (filter, entry),
            TriggerDecision::NoMatch => {
                debug!(
                    "Ignoring {} event for {:?}: no trigger filter matched",
                    event.event_type.as_str(),
                    event.git_ref
                );
                return Ok(None);
            }
        };

        let git_ref = event
            .git_ref
            .clone()
            .filter(|r| !r.trim().is_empty())
            .unwrap_or_else(|| self.definition.settings.integration_ref());

        let trigger = TriggerContext {
            event_type: event.event_type,
            git_ref,
            commit: event.commit.clone(),
            base_ref: event.base_ref.clone(),
            filter,
        };

        self.start_run(entry, trigger).await.map(Some)
    }

    /// Persists a new run and drives it on its own task
    pub async fn start_run(
        self: &Arc<Self>,
        entry: EntryPoint,
        trigger: TriggerContext,
    ) -> Result<Run, ControllerError> {
        let run = self
            .runs
            .create(NewRun::for_definition(&self.definition, entry, trigger))
            .await?;

        info!(
            "Run {} created for {} via filter '{}' ({})",
            run.id, run.trigger.git_ref, run.trigger.filter, run.entry
        );

        self.lock_active()
            .insert(run.id, CancellationToken::new());

        let controller = Arc::clone(self);
        let run_id = run.id;
        tokio::spawn(async move {
            controller.drive(run_id).await;
        });

        Ok(run)
    }

    async fn drive(self: Arc<Self>, run_id: RunId) {
        loop {
            match self.advance(run_id).await {
                Ok(state) if state.is_terminal() => {
                    info!("Run {} finished: {}", run_id, state);
                    break;
                }
                Ok(state) => debug!("Run {} is {}", run_id, state),
                Err(e) => {
                    error!("Run {} aborted: {}", run_id, e);
                    self.fail_aborted(run_id, e).await;
                    break;
                }
            }
        }

        self.lock_active().remove(&run_id);
    }

    /// Performs the next transition of a run and returns the resulting state
    ///
    /// A whole stage executes within one call. Terminal runs are left
    /// untouched and their state is returned as is.
    pub async fn advance(&self, run_id: RunId) -> Result<RunState, ControllerError> {
        let mut run = self.get_run(run_id).await?;
        if run.state.is_terminal() {
            return Ok(run.state);
        }

        let cancel = self.cancel_token(run_id);
        if cancel.is_cancelled() {
            self.mark_cancelled(&mut run).await?;
            return Ok(run.state);
        }

        if let Some(kind) = run.state.running_stage() {
            return Err(ControllerError::InvalidState(format!(
                "run {} is already executing its {} stage",
                run_id, kind
            )));
        }

        if run.state == RunState::Pending && !self.ensure_singletons(&mut run).await? {
            return Ok(run.state);
        }

        match run.state.next_stage(run.entry) {
            Some(kind) => self.run_stage(&mut run, kind, &cancel).await?,
            None => {
                run.finish(RunState::Succeeded, None);
                self.runs.save(&run).await?;
            }
        }

        Ok(run.state)
    }

    /// Cancels a non-terminal run and returns it as it stands afterwards
    ///
    /// A run driven by this process settles on its own task once the running
    /// stage is interrupted; this waits up to `CANCEL_SETTLE_TIMEOUT` for that
    /// and otherwise returns the run still finishing its cancellation.
    pub async fn cancel(&self, run_id: RunId) -> Result<Run, ControllerError> {
        let mut run = self.get_run(run_id).await?;
        if run.state.is_terminal() {
            return Err(ControllerError::InvalidState(format!(
                "run {} already finished as {}",
                run_id, run.state
            )));
        }

        let token = self.lock_active().get(&run_id).cloned();
        match token {
            Some(token) => {
                info!("Cancelling run {}", run_id);
                token.cancel();
                return self.wait_settled(run_id).await;
            }
            // Not driven by this process; settle it directly
            None => self.mark_cancelled(&mut run).await?,
        }

        Ok(run)
    }

    async fn wait_settled(&self, run_id: RunId) -> Result<Run, ControllerError> {
        let deadline = tokio::time::Instant::now() + CANCEL_SETTLE_TIMEOUT;
        loop {
            let run = self.get_run(run_id).await?;
            if run.state.is_terminal() || tokio::time::Instant::now() >= deadline {
                return Ok(run);
            }
            tokio::time::sleep(Duration::from_millis(20)).await;
        }
    }

    pub async fn get_run(&self, run_id: RunId) -> Result<Run, ControllerError> {
        self.runs
            .find_by_id(run_id)
            .await?
            .ok_or(ControllerError::NotFound(run_id))
    }

    pub async fn list_runs(&self, limit: Option<i64>) -> Result<Vec<Run>, ControllerError> {
        let limit = limit.unwrap_or(DEFAULT_LIST_LIMIT).clamp(1, MAX_LIST_LIMIT);
        Ok(self.runs.list_recent(limit).await?)
    }

    /// Non-terminal runs this process is not driving, e.g. left by a previous process
    pub async fn abandoned_runs(&self) -> Result<Vec<Run>, ControllerError> {
        let unfinished = self.runs.find_unfinished().await?;
        let active = self.lock_active();
        Ok(unfinished
            .into_iter()
            .filter(|run| !active.contains_key(&run.id))
            .collect())
    }

    /// Acquires the webhook credential if this pipeline owns it; false if the run failed
    async fn ensure_singletons(&self, run: &mut Run) -> Result<bool, ControllerError> {
        let settings = &self.definition.settings;
        if !settings.create_webhook_credential {
            return Ok(true);
        }

        let key = SingletonKey::webhook_credential(&settings.account_id, &settings.region);
        match self.guard.acquire(&key).await {
            Ok(Acquisition::Created(resource)) => {
                info!("Run {} provisioned {} ({})", run.id, key, resource.handle);
                Ok(true)
            }
            Ok(Acquisition::Existing(_)) => Ok(true),
            Err(e) => {
                let err = PipelineError::from(e);
                warn!("Run {} cannot start: {}", run.id, err);
                run.finish(RunState::Failed, Some(run_failure(&err, None, None)));
                self.runs.save(run).await?;
                Ok(false)
            }
        }
    }

    async fn run_stage(
        &self,
        run: &mut Run,
        kind: StageKind,
        cancel: &CancellationToken,
    ) -> Result<(), ControllerError> {
        let stage = self
            .definition
            .stage(kind)
            .ok_or_else(|| {
                ControllerError::InvalidState(format!("pipeline has no {} stage", kind))
            })?
            .clone();
        let inputs = run.resolve_artifacts(&stage.input_artifacts);

        run.state = RunState::running(kind);
        if let Some(record) = run.stage_mut(kind) {
            record.status = StageStatus::InProgress;
            record.started_at = Some(chrono::Utc::now());
            record.inputs = inputs.clone();
        }
        self.runs.save(run).await?;
        info!("Run {}: {}", run.id, run.state);

        let ctx = StageContext::new(
            run.id,
            run.entry,
            run.trigger.clone(),
            &stage.name,
            &self.workspace_base,
            cancel.clone(),
        );

        let _deploy = (kind == StageKind::Deploy).then(|| self.track_deploy(run.id, &ctx));
        let result = self
            .execute_stage(&ctx, &stage, &inputs, kind, cancel)
            .await;

        let (status, next, failure) = match result {
            Ok(StageOutcome::Succeeded { outputs }) => {
                if let Some(record) = run.stage_mut(kind) {
                    record.outputs = outputs;
                }
                (StageStatus::Succeeded, RunState::completed(kind), None)
            }
            Ok(StageOutcome::Failed {
                action,
                reason,
                exit_code,
            }) => {
                let err = PipelineError::ValidationFailed {
                    action: action.clone(),
                    exit_code,
                    detail: reason,
                };
                let failure = run_failure(&err, Some(&stage.name), Some(&action));
                (StageStatus::Failed, RunState::Failed, Some(failure))
            }
            Err(PipelineError::Cancelled) => {
                let failure = run_failure(&PipelineError::Cancelled, Some(&stage.name), None);
                (StageStatus::Cancelled, RunState::Cancelled, Some(failure))
            }
            Err(err) => {
                warn!("Run {} stage '{}' failed: {}", run.id, stage.name, err);
                let failure = run_failure(&err, Some(&stage.name), None);
                (StageStatus::Failed, RunState::Failed, Some(failure))
            }
        };

        if let Some(record) = run.stage_mut(kind) {
            record.status = status;
            record.finished_at = Some(chrono::Utc::now());
            record.logs.extend(ctx.drain_logs());
        }

        if next.is_terminal() {
            run.finish(next, failure);
        } else {
            run.state = next;
        }

        self.runs.save(run).await?;
        Ok(())
    }

    /// Races the executor against cancellation and the stage's timeout
    async fn execute_stage(
        &self,
        ctx: &StageContext,
        stage: &gantry_core::domain::pipeline::Stage,
        inputs: &[gantry_core::domain::artifact::ArtifactRef],
        kind: StageKind,
        cancel: &CancellationToken,
    ) -> Result<StageOutcome, PipelineError> {
        let role = self.roles.for_stage(kind);
        let execution = self.executor.execute(ctx, stage, inputs, role);

        let bounded = async {
            match stage.timeout_seconds {
                Some(seconds) => {
                    match tokio::time::timeout(Duration::from_secs(seconds), execution).await {
                        Ok(result) => result.map_err(PipelineError::from),
                        Err(_) => Err(PipelineError::StageTimedOut {
                            stage: stage.name.clone(),
                            seconds,
                        }),
                    }
                }
                None => execution.await.map_err(PipelineError::from),
            }
        };

        tokio::select! {
            _ = cancel.cancelled() => {
                ctx.log_warning("Stage cancelled by operator");
                Err(PipelineError::Cancelled)
            }
            result = bounded => result,
        }
    }

    async fn mark_cancelled(&self, run: &mut Run) -> Result<(), ControllerError> {
        if let Some(kind) = run.state.running_stage()
            && let Some(record) = run.stage_mut(kind)
        {
            record.status = StageStatus::Cancelled;
            record.finished_at = Some(chrono::Utc::now());
        }

        let stage = run
            .state
            .running_stage()
            .and_then(|kind| run.stage(kind))
            .map(|record| record.name.clone());
        run.finish(
            RunState::Cancelled,
            Some(run_failure(&PipelineError::Cancelled, stage.as_deref(), None)),
        );
        self.runs.save(run).await?;
        info!("Run {} cancelled", run.id);
        Ok(())
    }

    /// Marks a run whose driver hit an infrastructure error as failed
    async fn fail_aborted(&self, run_id: RunId, cause: ControllerError) {
        let mut run = match self.get_run(run_id).await {
            Ok(run) if !run.state.is_terminal() => run,
            Ok(_) => return,
            Err(e) => {
                error!("Run {} could not be reloaded: {}", run_id, e);
                return;
            }
        };

        let err = PipelineError::Internal(cause.to_string());
        run.finish(RunState::Failed, Some(run_failure(&err, None, None)));
        if let Err(e) = self.runs.save(&run).await {
            error!("Run {} could not be marked failed: {}", run_id, e);
        }
    }

    fn track_deploy(&self, run_id: RunId, ctx: &StageContext) -> DeployTracking<'_> {
        let stack = self.definition.settings.stack_name.clone();
        let mut deploying = self.lock_deploying();
        let runs = deploying.entry(stack.clone()).or_default();

        if !runs.is_empty() {
            warn!(
                "Run {} deploys to stack {} while run(s) {:?} are still deploying to it",
                run_id, stack, runs
            );
            ctx.log_warning(format!(
                "Another run is deploying to stack {}; the engine serializes stack updates",
                stack
            ));
        }
        runs.insert(run_id);

        DeployTracking {
            controller: self,
            stack,
            run_id,
        }
    }

    fn cancel_token(&self, run_id: RunId) -> CancellationToken {
        self.lock_active()
            .get(&run_id)
            .cloned()
            .unwrap_or_default()
    }

    fn lock_active(&self) -> std::sync::MutexGuard<'_, HashMap<RunId, CancellationToken>> {
        self.active.lock().unwrap_or_else(|e| e.into_inner())
    }

    fn lock_deploying(&self) -> std::sync::MutexGuard<'_, HashMap<String, HashSet<RunId>>> {
        self.deploying.lock().unwrap_or_else(|e| e.into_inner())
    }
}

/// Removes a run from the in-flight deployment set when its Deploy stage ends
struct DeployTracking<'a> {
    controller: &'a PipelineController,
    stack: String,
    run_id: RunId,
}

impl Drop for DeployTracking<'_> {
    fn drop(&mut self) {
        let mut deploying = self.controller.lock_deploying();
        if let Some(runs) = deploying.get_mut(&self.stack) {
            runs.remove(&self.run_id);
            if runs.is_empty() {
                deploying.remove(&self.stack);
            }
        }
    }
}

fn run_failure(err: &PipelineError, stage: Option<&str>, action: Option<&str>) -> RunFailure {
    RunFailure {
        kind: err.failure_kind(),
        stage: stage.map(String::from),
        action: action.map(String::from),
        detail: err.to_string(),
    }
}

#[cfg(test)]
pub(crate) mod tests {
    use super::*;
    use crate::repository::{InMemoryRunRepository, InMemorySingletonStore};
    use crate::service::guard::tests::CountingProvisioner;
    use async_trait::async_trait;
    use gantry_core::FailureKind;
    use gantry_core::domain::artifact::ArtifactRef;
    use gantry_core::domain::pipeline::Stage;
    use gantry_core::domain::policy::Role;
    use gantry_core::domain::trigger::{EventType, PullRequestAction};
    use gantry_runner::StageError;
    use gantry_runner::artifact::{ArtifactStore, FsArtifactStore};
    use std::sync::atomic::{AtomicUsize, Ordering};

    pub(crate) const DEFINITION: &str = r#"
name: infra-pipeline
settings:
  repository_owner: acme
  repository_name: infra-templates
  branch: master
  source_credential: ghp_test_token
  stack_name: infra-prod
  account_id: "123456789012"
  region: us-east-1
  artifact_bucket: acme-artifacts
  build_project: infra-validate
stages:
  - name: Source
    kind: source
    output_artifacts: [SourceOutput]
    actions:
      - name: FetchSource
        category: source
        provider: github
        output_artifacts: [SourceOutput]
  - name: Test
    kind: test
    input_artifacts: [SourceOutput]
    actions:
      - name: ValidateTemplate
        category: test
        provider: container-build
        input_artifacts: [SourceOutput]
        configuration:
          commands: cfn-lint template.yml
  - name: Deploy
    kind: deploy
    input_artifacts: [SourceOutput]
    actions:
      - name: ApplyTemplate
        category: deploy
        provider: cloudformation
        input_artifacts: [SourceOutput]
"#;

    /// Executor that stores a real artifact for Source and scripts the other stages
    pub(crate) struct FakeExecutor {
        pub(crate) artifacts: FsArtifactStore,
        pub(crate) test_exit_code: i32,
        pub(crate) deploy_calls: AtomicUsize,
        pub(crate) test_delay: Option<Duration>,
        pub(crate) roles_seen: Mutex<Vec<String>>,
        _dirs: tempfile::TempDir,
    }

    impl FakeExecutor {
        pub(crate) fn new(test_exit_code: i32) -> Self {
            let dirs = tempfile::tempdir().unwrap();
            Self {
                artifacts: FsArtifactStore::new(dirs.path().join("artifacts")),
                test_exit_code,
                deploy_calls: AtomicUsize::new(0),
                test_delay: None,
                roles_seen: Mutex::new(Vec::new()),
                _dirs: dirs,
            }
        }
    }

    #[async_trait]
    impl StageExecutor for FakeExecutor {
        async fn execute(
            &self,
            ctx: &StageContext,
            stage: &Stage,
            inputs: &[ArtifactRef],
            role: &Role,
        ) -> Result<StageOutcome, StageError> {
            self.roles_seen.lock().unwrap().push(role.name.clone());
            ctx.log_info(format!("fake {}", stage.name));

            match stage.kind {
                StageKind::Source => {
                    let tree = tempfile::tempdir()?;
                    std::fs::write(tree.path().join("template.yml"), "Resources: {}")?;
                    let artifact = self
                        .artifacts
                        .put("SourceOutput", &stage.name, ctx.run_id, tree.path())
                        .await?;
                    Ok(StageOutcome::Succeeded {
                        outputs: vec![artifact],
                    })
                }
                StageKind::Test => {
                    assert_eq!(inputs.len(), 1);
                    if let Some(delay) = self.test_delay {
                        tokio::time::sleep(delay).await;
                    }
                    if self.test_exit_code == 0 {
                        Ok(StageOutcome::Succeeded { outputs: vec![] })
                    } else {
                        Ok(StageOutcome::Failed {
                            action: "ValidateTemplate".to_string(),
                            reason: format!(
                                "validation commands exited with code {}",
                                self.test_exit_code
                            ),
                            exit_code: Some(self.test_exit_code),
                        })
                    }
                }
                StageKind::Deploy => {
                    self.deploy_calls.fetch_add(1, Ordering::SeqCst);
                    Ok(StageOutcome::Succeeded { outputs: vec![] })
                }
            }
        }
    }

    pub(crate) struct Fixture {
        pub(crate) controller: Arc<PipelineController>,
        pub(crate) executor: Arc<FakeExecutor>,
        pub(crate) runs: Arc<InMemoryRunRepository>,
        pub(crate) provisioner: Arc<CountingProvisioner>,
    }

    pub(crate) fn fixture_with(executor: FakeExecutor, definition: &str) -> Fixture {
        fixture_with_provisioner(executor, definition, CountingProvisioner::default())
    }

    pub(crate) fn fixture_with_provisioner(
        executor: FakeExecutor,
        definition: &str,
        provisioner: CountingProvisioner,
    ) -> Fixture {
        let definition = Arc::new(PipelineDefinition::from_yaml_str(definition).unwrap());
        let executor = Arc::new(executor);
        let runs = Arc::new(InMemoryRunRepository::new());
        let provisioner = Arc::new(provisioner);
        let guard = Arc::new(SingletonGuard::new(
            Arc::new(InMemorySingletonStore::new()),
            provisioner.clone(),
        ));

        let controller = PipelineController::new(
            definition,
            runs.clone(),
            executor.clone(),
            guard,
            std::env::temp_dir().join("gantry-controller-tests"),
        )
        .unwrap();

        Fixture {
            controller: Arc::new(controller),
            executor,
            runs,
            provisioner,
        }
    }

    pub(crate) fn fixture(test_exit_code: i32) -> Fixture {
        fixture_with(FakeExecutor::new(test_exit_code), DEFINITION)
    }

    pub(crate) async fn wait_for_terminal(controller: &PipelineController, run_id: RunId) -> Run {
        tokio::time::timeout(Duration::from_secs(10), async {
            loop {
                let run = controller.get_run(run_id).await.unwrap();
                if run.state.is_terminal() {
                    return run;
                }
                tokio::time::sleep(Duration::from_millis(10)).await;
            }
        })
        .await
        .expect("run did not finish in time")
    }

    fn push() -> WebhookEvent {
        WebhookEvent::push("refs/heads/master").with_commit("abc123")
    }

    #[tokio::test]
    async fn test_scenario_push_runs_all_stages() {
        let f = fixture(0);
        let run = f.controller.handle_event(&push()).await.unwrap().unwrap();
        assert_eq!(run.state, RunState::Pending);
        assert_eq!(run.entry, EntryPoint::Source);

        let run = wait_for_terminal(&f.controller, run.id).await;
        assert_eq!(run.state, RunState::Succeeded);
        assert!(run.failure.is_none());
        assert!(run.stages.iter().all(|s| s.status == StageStatus::Succeeded));

        let source = run.stage(StageKind::Source).unwrap();
        assert_eq!(source.outputs.len(), 1);
        assert_eq!(source.outputs[0].version, 1);
        assert!(!source.logs.is_empty());

        let test = run.stage(StageKind::Test).unwrap();
        assert_eq!(test.inputs, source.outputs);

        let latest = f.executor.artifacts.latest("SourceOutput").await.unwrap().unwrap();
        assert_eq!(latest.version, 1);
        assert_eq!(f.executor.deploy_calls.load(Ordering::SeqCst), 1);

        assert_eq!(
            *f.executor.roles_seen.lock().unwrap(),
            vec![
                "infra-pipeline-source-role",
                "infra-pipeline-test-role",
                "infra-pipeline-deploy-role"
            ]
        );
    }

    #[tokio::test]
    async fn test_scenario_failed_validation_never_deploys() {
        let f = fixture(1);
        let run = f.controller.handle_event(&push()).await.unwrap().unwrap();
        let run = wait_for_terminal(&f.controller, run.id).await;

        assert_eq!(run.state, RunState::Failed);
        assert_eq!(f.executor.deploy_calls.load(Ordering::SeqCst), 0);

        let failure = run.failure.as_ref().unwrap();
        assert_eq!(failure.kind, FailureKind::ValidationFailed);
        assert_eq!(failure.stage.as_deref(), Some("Test"));
        assert_eq!(failure.action.as_deref(), Some("ValidateTemplate"));

        assert_eq!(run.stage(StageKind::Test).unwrap().status, StageStatus::Failed);
        assert_eq!(run.stage(StageKind::Deploy).unwrap().status, StageStatus::Pending);
    }

    #[tokio::test]
    async fn test_scenario_pull_request_against_other_branch_is_ignored() {
        let f = fixture(0);
        let event = WebhookEvent::pull_request(
            PullRequestAction::Created,
            "refs/pull/4/head",
            "refs/heads/develop",
        );

        assert!(f.controller.handle_event(&event).await.unwrap().is_none());
        assert!(f.runs.list_recent(10).await.unwrap().is_empty());
    }

    #[tokio::test]
    async fn test_pull_request_run_stops_after_test() {
        let f = fixture(0);
        let event = WebhookEvent::pull_request(
            PullRequestAction::Updated,
            "refs/pull/4/head",
            "refs/heads/master",
        )
        .with_commit("abc123");

        let run = f.controller.handle_event(&event).await.unwrap().unwrap();
        assert_eq!(run.entry, EntryPoint::PullRequestValidation);
        assert_eq!(run.trigger.git_ref, "refs/pull/4/head");
        assert_eq!(run.trigger.event_type, EventType::PullRequest);

        let run = wait_for_terminal(&f.controller, run.id).await;
        assert_eq!(run.state, RunState::Succeeded);
        assert!(run.stage(StageKind::Deploy).is_none());
        assert_eq!(f.executor.deploy_calls.load(Ordering::SeqCst), 0);
    }

    #[tokio::test]
    async fn test_advance_on_terminal_run_is_noop() {
        let f = fixture(1);
        let run = f.controller.handle_event(&push()).await.unwrap().unwrap();
        let finished = wait_for_terminal(&f.controller, run.id).await;

        for _ in 0..3 {
            let state = f.controller.advance(run.id).await.unwrap();
            assert_eq!(state, RunState::Failed);
        }

        let after = f.controller.get_run(run.id).await.unwrap();
        assert_eq!(after.finished_at, finished.finished_at);
        assert_eq!(f.executor.deploy_calls.load(Ordering::SeqCst), 0);
    }

    #[tokio::test]
    async fn test_cancel_running_stage() {
        let mut executor = FakeExecutor::new(0);
        executor.test_delay = Some(Duration::from_secs(30));
        let f = fixture_with(executor, DEFINITION);

        let run = f.controller.handle_event(&push()).await.unwrap().unwrap();
        tokio::time::timeout(Duration::from_secs(10), async {
            while f.controller.get_run(run.id).await.unwrap().state != RunState::TestRunning {
                tokio::time::sleep(Duration::from_millis(10)).await;
            }
        })
        .await
        .unwrap();

        let cancelled = f.controller.cancel(run.id).await.unwrap();
        assert_eq!(cancelled.state, RunState::Cancelled);
        let run = wait_for_terminal(&f.controller, run.id).await;

        assert_eq!(run.state, RunState::Cancelled);
        assert_eq!(run.stage(StageKind::Test).unwrap().status, StageStatus::Cancelled);
        assert_eq!(run.failure.as_ref().unwrap().kind, FailureKind::Cancelled);
        assert_eq!(f.executor.deploy_calls.load(Ordering::SeqCst), 0);

        assert!(matches!(
            f.controller.cancel(run.id).await,
            Err(ControllerError::InvalidState(_))
        ));
    }

    #[tokio::test]
    async fn test_stage_timeout_fails_run() {
        let mut executor = FakeExecutor::new(0);
        executor.test_delay = Some(Duration::from_secs(30));
        let definition = DEFINITION.replace(
            "    kind: test\n",
            "    kind: test\n    timeout_seconds: 1\n",
        );
        let f = fixture_with(executor, &definition);

        let run = f.controller.handle_event(&push()).await.unwrap().unwrap();
        let run = wait_for_terminal(&f.controller, run.id).await;

        assert_eq!(run.state, RunState::Failed);
        let failure = run.failure.unwrap();
        assert_eq!(failure.kind, FailureKind::TimedOut);
        assert_eq!(failure.stage.as_deref(), Some("Test"));
    }

    #[tokio::test]
    async fn test_webhook_credential_provisioned_once_across_runs() {
        let f = fixture(0);
        let first = f.controller.handle_event(&push()).await.unwrap().unwrap();
        let second = f.controller.handle_event(&push()).await.unwrap().unwrap();
        wait_for_terminal(&f.controller, first.id).await;
        wait_for_terminal(&f.controller, second.id).await;

        assert_eq!(f.provisioner.calls.load(Ordering::SeqCst), 1);
    }

    #[tokio::test]
    async fn test_webhook_credential_conflict_is_not_retried_by_later_runs() {
        let f = fixture_with_provisioner(
            FakeExecutor::new(0),
            DEFINITION,
            CountingProvisioner {
                conflict: true,
                ..Default::default()
            },
        );

        for _ in 0..3 {
            let run = f.controller.handle_event(&push()).await.unwrap().unwrap();
            let run = wait_for_terminal(&f.controller, run.id).await;
            assert_eq!(run.state, RunState::Failed);
            assert_eq!(
                run.failure.as_ref().unwrap().kind,
                FailureKind::SingletonConflict
            );
            assert!(run.stages.iter().all(|s| s.status == StageStatus::Pending));
        }

        assert_eq!(f.provisioner.calls.load(Ordering::SeqCst), 1);
        assert_eq!(f.executor.deploy_calls.load(Ordering::SeqCst), 0);
    }

    #[tokio::test]
    async fn test_webhook_credential_skipped_when_disabled() {
        let definition = DEFINITION.replace(
            "  build_project: infra-validate\n",
            "  build_project: infra-validate\n  create_webhook_credential: false\n",
        );
        let f = fixture_with(FakeExecutor::new(0), &definition);

        let run = f.controller.handle_event(&push()).await.unwrap().unwrap();
        let run = wait_for_terminal(&f.controller, run.id).await;

        assert_eq!(run.state, RunState::Succeeded);
        assert_eq!(f.provisioner.calls.load(Ordering::SeqCst), 0);
    }

    #[tokio::test]
    async fn test_abandoned_runs_are_reported_and_cancellable() {
        let f = fixture(0);
        let definition = f.controller.definition().clone();
        let mut stale = f
            .runs
            .create(NewRun::for_definition(
                &definition,
                EntryPoint::Source,
                TriggerContext {
                    event_type: EventType::Push,
                    git_ref: "refs/heads/master".to_string(),
                    commit: None,
                    base_ref: None,
                    filter: "push-to-integration-branch".to_string(),
                },
            ))
            .await
            .unwrap();
        stale.state = RunState::TestRunning;
        f.runs.save(&stale).await.unwrap();

        let abandoned = f.controller.abandoned_runs().await.unwrap();
        assert_eq!(abandoned.len(), 1);
        assert_eq!(abandoned[0].id, stale.id);

        assert!(matches!(
            f.controller.advance(stale.id).await,
            Err(ControllerError::InvalidState(_))
        ));

        let cancelled = f.controller.cancel(stale.id).await.unwrap();
        assert_eq!(cancelled.state, RunState::Cancelled);
        assert_eq!(
            cancelled.failure.as_ref().unwrap().stage.as_deref(),
            Some("Test")
        );
        let run = f.controller.get_run(stale.id).await.unwrap();
        assert_eq!(run.state, RunState::Cancelled);
        assert!(f.controller.abandoned_runs().await.unwrap().is_empty());
    }

    #[tokio::test]
    async fn test_list_runs_limit() {
        let f = fixture(0);
        for _ in 0..3 {
            let run = f.controller.handle_event(&push()).await.unwrap().unwrap();
            wait_for_terminal(&f.controller, run.id).await;
        }

        assert_eq!(f.controller.list_runs(Some(2)).await.unwrap().len(), 2);
        assert_eq!(f.controller.list_runs(Some(0)).await.unwrap().len(), 1);
        assert_eq!(f.controller.list_runs(None).await.unwrap().len(), 3);
        assert!(matches!(
            f.controller.get_run(999).await,
            Err(ControllerError::NotFound(999))
        ));
    }
}
