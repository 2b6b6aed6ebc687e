//! Run domain types
//!
//! A run is one execution of a pipeline definition. Its state machine is
//! strictly forward: a stage starts only after the previous one succeeded,
//! and the three terminal states never change again.

use serde::{Deserialize, Serialize};

use crate::domain::artifact::ArtifactRef;
use crate::domain::log::LogEntry;
use crate::domain::pipeline::{PipelineDefinition, StageKind};
use crate::domain::trigger::EventType;
use crate::error::FailureKind;

/// Monotonically increasing run identifier
pub type RunId = i64;

/// Run execution record
///
/// Structure shared between the orchestrator (persists) and the API/CLI (renders).
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct Run {
    pub id: RunId,
    pub pipeline: String,
    pub entry: EntryPoint,
    pub trigger: TriggerContext,
    pub state: RunState,
    pub stages: Vec<StageRecord>,
    pub started_at: chrono::DateTime<chrono::Utc>,
    pub finished_at: Option<chrono::DateTime<chrono::Utc>>,
    pub failure: Option<RunFailure>,
}

/// Data needed to create a run; the repository assigns the identifier
#[derive(Debug, Clone)]
pub struct NewRun {
    pub pipeline: String,
    pub entry: EntryPoint,
    pub trigger: TriggerContext,
    pub stages: Vec<StageRecord>,
}

impl NewRun {
    /// Builds a pending run covering the stages of the given entry point
    pub fn for_definition(
        definition: &PipelineDefinition,
        entry: EntryPoint,
        trigger: TriggerContext,
    ) -> Self {
        let stages = definition
            .stages
            .iter()
            .filter(|stage| entry.includes(stage.kind))
            .map(|stage| StageRecord::pending(&stage.name, stage.kind))
            .collect();

        Self {
            pipeline: definition.name.clone(),
            entry,
            trigger,
            stages,
        }
    }

    pub fn into_run(self, id: RunId) -> Run {
        Run {
            id,
            pipeline: self.pipeline,
            entry: self.entry,
            trigger: self.trigger,
            state: RunState::Pending,
            stages: self.stages,
            started_at: chrono::Utc::now(),
            finished_at: None,
            failure: None,
        }
    }
}

impl Run {
    pub fn stage(&self, kind: StageKind) -> Option<&StageRecord> {
        self.stages.iter().find(|s| s.kind == kind)
    }

    pub fn stage_mut(&mut self, kind: StageKind) -> Option<&mut StageRecord> {
        self.stages.iter_mut().find(|s| s.kind == kind)
    }

    /// Latest versions of the named artifacts produced by earlier stages of this run
    pub fn resolve_artifacts(&self, names: &[String]) -> Vec<ArtifactRef> {
        names
            .iter()
            .filter_map(|name| {
                self.stages
                    .iter()
                    .flat_map(|s| s.outputs.iter())
                    .filter(|a| &a.name == name)
                    .max_by_key(|a| a.version)
                    .cloned()
            })
            .collect()
    }

    /// Moves the run into a terminal state
    pub fn finish(&mut self, state: RunState, failure: Option<RunFailure>) {
        debug_assert!(state.is_terminal());
        self.state = state;
        self.failure = failure;
        self.finished_at = Some(chrono::Utc::now());
    }
}

/// Which trigger path started a run
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum EntryPoint {
    /// Push to the integration branch: Source, Test, Deploy
    Source,
    /// Pull-request validation: Source and Test, with commit status reporting
    PullRequestValidation,
}

impl EntryPoint {
    pub fn includes(&self, kind: StageKind) -> bool {
        match self {
            EntryPoint::Source => true,
            EntryPoint::PullRequestValidation => kind != StageKind::Deploy,
        }
    }

    pub fn as_str(&self) -> &'static str {
        match self {
            EntryPoint::Source => "source",
            EntryPoint::PullRequestValidation => "pull_request_validation",
        }
    }

    pub fn parse(s: &str) -> Option<Self> {
        match s {
            "source" => Some(EntryPoint::Source),
            "pull_request_validation" => Some(EntryPoint::PullRequestValidation),
            _ => None,
        }
    }
}

impl std::fmt::Display for EntryPoint {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.write_str(self.as_str())
    }
}

/// Run state machine
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
pub enum RunState {
    Pending,
    SourceRunning,
    SourceDone,
    TestRunning,
    TestDone,
    DeployRunning,
    Succeeded,
    Failed,
    Cancelled,
}

impl RunState {
    pub fn is_terminal(&self) -> bool {
        matches!(
            self,
            RunState::Succeeded | RunState::Failed | RunState::Cancelled
        )
    }

    /// State while a stage of the given kind executes
    pub fn running(kind: StageKind) -> RunState {
        match kind {
            StageKind::Source => RunState::SourceRunning,
            StageKind::Test => RunState::TestRunning,
            StageKind::Deploy => RunState::DeployRunning,
        }
    }

    /// State after a stage of the given kind succeeded
    pub fn completed(kind: StageKind) -> RunState {
        match kind {
            StageKind::Source => RunState::SourceDone,
            StageKind::Test => RunState::TestDone,
            StageKind::Deploy => RunState::Succeeded,
        }
    }

    pub fn running_stage(&self) -> Option<StageKind> {
        match self {
            RunState::SourceRunning => Some(StageKind::Source),
            RunState::TestRunning => Some(StageKind::Test),
            RunState::DeployRunning => Some(StageKind::Deploy),
            _ => None,
        }
    }

    /// Next stage to execute from a settled state, if any remains for this entry point
    pub fn next_stage(&self, entry: EntryPoint) -> Option<StageKind> {
        let next = match self {
            RunState::Pending => StageKind::Source,
            RunState::SourceDone => StageKind::Test,
            RunState::TestDone => StageKind::Deploy,
            _ => return None,
        };
        entry.includes(next).then_some(next)
    }

    pub fn as_str(&self) -> &'static str {
        match self {
            RunState::Pending => "Pending",
            RunState::SourceRunning => "SourceRunning",
            RunState::SourceDone => "SourceDone",
            RunState::TestRunning => "TestRunning",
            RunState::TestDone => "TestDone",
            RunState::DeployRunning => "DeployRunning",
            RunState::Succeeded => "Succeeded",
            RunState::Failed => "Failed",
            RunState::Cancelled => "Cancelled",
        }
    }

    pub fn parse(s: &str) -> Option<Self> {
        let state = match s {
            "Pending" => RunState::Pending,
            "SourceRunning" => RunState::SourceRunning,
            "SourceDone" => RunState::SourceDone,
            "TestRunning" => RunState::TestRunning,
            "TestDone" => RunState::TestDone,
            "DeployRunning" => RunState::DeployRunning,
            "Succeeded" => RunState::Succeeded,
            "Failed" => RunState::Failed,
            "Cancelled" => RunState::Cancelled,
            _ => return None,
        };
        Some(state)
    }
}

impl std::fmt::Display for RunState {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.write_str(self.as_str())
    }
}

/// Per-stage execution status
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
pub enum StageStatus {
    Pending,
    InProgress,
    Succeeded,
    Failed,
    Cancelled,
}

/// Execution record of one stage within a run
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct StageRecord {
    pub name: String,
    pub kind: StageKind,
    pub status: StageStatus,
    pub started_at: Option<chrono::DateTime<chrono::Utc>>,
    pub finished_at: Option<chrono::DateTime<chrono::Utc>>,
    #[serde(default)]
    pub inputs: Vec<ArtifactRef>,
    #[serde(default)]
    pub outputs: Vec<ArtifactRef>,
    #[serde(default)]
    pub logs: Vec<LogEntry>,
}

impl StageRecord {
    pub fn pending(name: &str, kind: StageKind) -> Self {
        Self {
            name: name.to_string(),
            kind,
            status: StageStatus::Pending,
            started_at: None,
            finished_at: None,
            inputs: Vec::new(),
            outputs: Vec::new(),
            logs: Vec::new(),
        }
    }
}

/// What started a run
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct TriggerContext {
    pub event_type: EventType,
    /// Ref the Source stage fetches
    pub git_ref: String,
    pub commit: Option<String>,
    pub base_ref: Option<String>,
    /// Name of the trigger filter that matched
    pub filter: String,
}

/// Failure detail of a run that ended in `Failed`
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct RunFailure {
    pub kind: FailureKind,
    pub stage: Option<String>,
    pub action: Option<String>,
    pub detail: String,
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::domain::pipeline::tests::sample_definition;

    fn push_trigger() -> TriggerContext {
        TriggerContext {
            event_type: EventType::Push,
            git_ref: "refs/heads/master".to_string(),
            commit: None,
            base_ref: None,
            filter: "push-to-integration-branch".to_string(),
        }
    }

    #[test]
    fn test_source_entry_walks_all_stages() {
        let entry = EntryPoint::Source;
        let mut state = RunState::Pending;
        let mut visited = Vec::new();

        while let Some(kind) = state.next_stage(entry) {
            visited.push(kind);
            assert_eq!(RunState::running(kind).running_stage(), Some(kind));
            state = RunState::completed(kind);
        }

        assert_eq!(visited, StageKind::ORDER.to_vec());
        assert_eq!(state, RunState::Succeeded);
    }

    #[test]
    fn test_pull_request_entry_stops_after_test() {
        let entry = EntryPoint::PullRequestValidation;
        assert_eq!(RunState::Pending.next_stage(entry), Some(StageKind::Source));
        assert_eq!(RunState::SourceDone.next_stage(entry), Some(StageKind::Test));
        assert_eq!(RunState::TestDone.next_stage(entry), None);
    }

    #[test]
    fn test_terminal_states_have_no_next_stage() {
        for state in [RunState::Succeeded, RunState::Failed, RunState::Cancelled] {
            assert!(state.is_terminal());
            assert_eq!(state.next_stage(EntryPoint::Source), None);
        }
        assert!(!RunState::TestDone.is_terminal());
    }

    #[test]
    fn test_state_string_round_trip() {
        for state in [
            RunState::Pending,
            RunState::SourceRunning,
            RunState::DeployRunning,
            RunState::Cancelled,
        ] {
            assert_eq!(RunState::parse(state.as_str()), Some(state));
        }
        assert_eq!(RunState::parse("Exploded"), None);
    }

    #[test]
    fn test_new_run_for_pull_request_skips_deploy() {
        let definition = sample_definition();
        let new_run =
            NewRun::for_definition(&definition, EntryPoint::PullRequestValidation, push_trigger());
        let kinds: Vec<StageKind> = new_run.stages.iter().map(|s| s.kind).collect();
        assert_eq!(kinds, vec![StageKind::Source, StageKind::Test]);

        let run = new_run.into_run(7);
        assert_eq!(run.id, 7);
        assert_eq!(run.state, RunState::Pending);
        assert!(run.stages.iter().all(|s| s.status == StageStatus::Pending));
    }

    #[test]
    fn test_resolve_artifacts_picks_latest_version() {
        let definition = sample_definition();
        let mut run =
            NewRun::for_definition(&definition, EntryPoint::Source, push_trigger()).into_run(1);

        let artifact = |version| ArtifactRef {
            name: "SourceOutput".to_string(),
            version,
            digest: "ab".repeat(32),
            producer: "Source".to_string(),
            run_id: 1,
            location: format!("objects/{}", version),
            created_at: chrono::Utc::now(),
        };

        let source = run.stage_mut(StageKind::Source).unwrap();
        source.outputs.push(artifact(1));
        source.outputs.push(artifact(2));

        let resolved = run.resolve_artifacts(&["SourceOutput".to_string(), "Missing".to_string()]);
        assert_eq!(resolved.len(), 1);
        assert_eq!(resolved[0].version, 2);
    }
}
