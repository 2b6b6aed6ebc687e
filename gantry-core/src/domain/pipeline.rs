//! Pipeline definition types
//!
//! A pipeline definition is loaded once from YAML when the orchestrator
//! starts and is immutable afterwards. Validation happens at load time so a
//! bad provider or a broken artifact hand-off never reaches a run.

use serde::{Deserialize, Serialize};
use std::collections::{BTreeMap, BTreeSet, HashSet};
use std::path::Path;

use crate::domain::trigger::TriggerFilter;
use crate::error::DefinitionError;

/// Pipeline definition
///
/// Ordered Source, Test and Deploy stages plus the deployment-time settings
/// the stages are bound to.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct PipelineDefinition {
    pub name: String,
    pub settings: PipelineSettings,
    pub stages: Vec<Stage>,
    /// Extra trigger filters, evaluated after the ones derived from settings
    #[serde(default)]
    pub triggers: Vec<TriggerFilter>,
}

/// Deployment-time configuration surface of a pipeline
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct PipelineSettings {
    pub repository_owner: String,
    pub repository_name: String,
    /// Integration branch name, without the `refs/heads/` prefix
    pub branch: String,
    pub source_credential: Secret,
    pub stack_name: String,
    /// Whether the singleton webhook credential is provisioned by this pipeline
    #[serde(default = "default_true")]
    pub create_webhook_credential: bool,
    pub account_id: String,
    pub region: String,
    #[serde(default = "default_partition")]
    pub partition: String,
    pub artifact_bucket: String,
    pub build_project: String,
}

fn default_true() -> bool {
    true
}

fn default_partition() -> String {
    "aws".to_string()
}

impl PipelineSettings {
    /// Fully qualified ref of the integration branch
    pub fn integration_ref(&self) -> String {
        format!("refs/heads/{}", self.branch)
    }

    /// `owner/name` of the source repository
    pub fn repository(&self) -> String {
        format!("{}/{}", self.repository_owner, self.repository_name)
    }
}

/// A secret value that never appears in logs or API responses
///
/// In definition files a value of the form `env:NAME` is replaced by the
/// content of the environment variable `NAME` at load time.
#[derive(Clone, Default, Deserialize, PartialEq, Eq)]
#[serde(transparent)]
pub struct Secret(String);

impl Secret {
    pub fn new(value: impl Into<String>) -> Self {
        Self(value.into())
    }

    pub fn expose(&self) -> &str {
        &self.0
    }

    pub fn is_empty(&self) -> bool {
        self.0.is_empty()
    }

    fn resolve_env(&mut self) -> Result<(), DefinitionError> {
        if let Some(var) = self.0.strip_prefix("env:") {
            let var = var.to_string();
            self.0 = std::env::var(&var).map_err(|_| DefinitionError::MissingSecret(var))?;
        }
        Ok(())
    }
}

impl std::fmt::Debug for Secret {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        write!(f, "Secret(****)")
    }
}

impl Serialize for Secret {
    fn serialize<S: serde::Serializer>(&self, serializer: S) -> Result<S::Ok, S::Error> {
        serializer.serialize_str("****")
    }
}

/// Stage definition
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct Stage {
    pub name: String,
    pub kind: StageKind,
    pub actions: Vec<Action>,
    #[serde(default)]
    pub input_artifacts: Vec<String>,
    #[serde(default)]
    pub output_artifacts: Vec<String>,
    /// Explicit stage timeout; stages without one may run indefinitely
    #[serde(default)]
    pub timeout_seconds: Option<u64>,
}

impl Stage {
    /// Actions sorted by their run order
    pub fn ordered_actions(&self) -> Vec<&Action> {
        let mut actions: Vec<&Action> = self.actions.iter().collect();
        actions.sort_by_key(|a| a.run_order);
        actions
    }
}

/// Stage kinds, in pipeline order
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, PartialOrd, Ord, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum StageKind {
    Source,
    Test,
    Deploy,
}

impl StageKind {
    pub const ORDER: [StageKind; 3] = [StageKind::Source, StageKind::Test, StageKind::Deploy];

    /// Action category every action of a stage of this kind must have
    pub fn action_category(&self) -> ActionCategory {
        match self {
            StageKind::Source => ActionCategory::Source,
            StageKind::Test => ActionCategory::Test,
            StageKind::Deploy => ActionCategory::Deploy,
        }
    }
}

impl std::fmt::Display for StageKind {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        match self {
            StageKind::Source => write!(f, "source"),
            StageKind::Test => write!(f, "test"),
            StageKind::Deploy => write!(f, "deploy"),
        }
    }
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum ActionCategory {
    Source,
    Test,
    Deploy,
}

/// Supported action providers
///
/// The set is closed: an unknown identifier is rejected while the
/// definition is deserialized.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
pub enum Provider {
    #[serde(rename = "github")]
    GitHub,
    #[serde(rename = "container-build")]
    ContainerBuild,
    #[serde(rename = "cloudformation")]
    CloudFormation,
}

impl Provider {
    pub fn category(&self) -> ActionCategory {
        match self {
            Provider::GitHub => ActionCategory::Source,
            Provider::ContainerBuild => ActionCategory::Test,
            Provider::CloudFormation => ActionCategory::Deploy,
        }
    }
}

impl std::fmt::Display for Provider {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        match self {
            Provider::GitHub => write!(f, "github"),
            Provider::ContainerBuild => write!(f, "container-build"),
            Provider::CloudFormation => write!(f, "cloudformation"),
        }
    }
}

/// A single unit of work within a stage, bound to one provider
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct Action {
    pub name: String,
    pub category: ActionCategory,
    pub provider: Provider,
    #[serde(default = "default_run_order")]
    pub run_order: u32,
    /// Provider-specific settings, opaque to the orchestrator
    #[serde(default)]
    pub configuration: BTreeMap<String, String>,
    #[serde(default)]
    pub input_artifacts: Vec<String>,
    #[serde(default)]
    pub output_artifacts: Vec<String>,
}

fn default_run_order() -> u32 {
    1
}

impl PipelineDefinition {
    /// Load, resolve secrets and validate a definition file
    pub fn load(path: impl AsRef<Path>) -> Result<Self, DefinitionError> {
        let path = path.as_ref();
        let content = std::fs::read_to_string(path).map_err(|source| DefinitionError::Io {
            path: path.display().to_string(),
            source,
        })?;
        Self::from_yaml_str(&content)
    }

    /// Parse, resolve secrets and validate a definition from YAML
    pub fn from_yaml_str(content: &str) -> Result<Self, DefinitionError> {
        let mut definition: PipelineDefinition = serde_yaml::from_str(content)?;
        definition.settings.source_credential.resolve_env()?;
        definition.validate()?;
        Ok(definition)
    }

    /// Get the stage of the given kind
    pub fn stage(&self, kind: StageKind) -> Option<&Stage> {
        self.stages.iter().find(|s| s.kind == kind)
    }

    /// Validates structural invariants of the definition
    pub fn validate(&self) -> Result<(), DefinitionError> {
        if self.name.trim().is_empty() {
            return Err(invalid("Pipeline name cannot be empty"));
        }
        if !is_pipeline_name(&self.name) {
            return Err(invalid(format!(
                "Pipeline name '{}' may only contain letters, digits, '_' or '-'",
                self.name
            )));
        }

        validate_settings(&self.settings)?;

        let kinds: Vec<StageKind> = self.stages.iter().map(|s| s.kind).collect();
        if kinds != StageKind::ORDER {
            return Err(invalid(format!(
                "Pipeline must declare exactly the stages source, test, deploy in order (found {:?})",
                kinds
            )));
        }

        let mut stage_names = HashSet::new();
        let mut produced: BTreeSet<&str> = BTreeSet::new();

        for stage in &self.stages {
            if !stage_names.insert(stage.name.as_str()) {
                return Err(invalid(format!("Duplicate stage name '{}'", stage.name)));
            }

            validate_stage(stage)?;

            for input in &stage.input_artifacts {
                if !produced.contains(input.as_str()) {
                    return Err(invalid(format!(
                        "Stage '{}' consumes artifact '{}' which no earlier stage produces",
                        stage.name, input
                    )));
                }
            }

            for output in &stage.output_artifacts {
                if !produced.insert(output.as_str()) {
                    return Err(invalid(format!(
                        "Artifact '{}' is produced by more than one stage",
                        output
                    )));
                }
            }
        }

        let source = &self.stages[0];
        if !source.input_artifacts.is_empty() || source.output_artifacts.len() != 1 {
            return Err(invalid(
                "Source stage must have no inputs and exactly one output artifact",
            ));
        }

        for stage in &self.stages[1..] {
            if stage.input_artifacts.is_empty() {
                return Err(invalid(format!(
                    "Stage '{}' must consume at least one artifact",
                    stage.name
                )));
            }
        }

        Ok(())
    }
}

fn validate_settings(settings: &PipelineSettings) -> Result<(), DefinitionError> {
    let required = [
        ("repository_owner", &settings.repository_owner),
        ("repository_name", &settings.repository_name),
        ("branch", &settings.branch),
        ("stack_name", &settings.stack_name),
        ("account_id", &settings.account_id),
        ("region", &settings.region),
        ("artifact_bucket", &settings.artifact_bucket),
        ("build_project", &settings.build_project),
    ];

    for (field, value) in required {
        if value.trim().is_empty() {
            return Err(invalid(format!("Setting '{}' cannot be empty", field)));
        }
    }

    if settings.branch.chars().any(char::is_whitespace) || settings.branch.starts_with("refs/") {
        return Err(invalid(
            "Setting 'branch' must be a bare branch name such as 'master'",
        ));
    }

    if settings.source_credential.is_empty() {
        return Err(invalid("Setting 'source_credential' cannot be empty"));
    }

    // These values end up inside role resource identifiers
    const SEGMENT: &str = "letters, digits, '.', '_' or '-'";
    let identifiers: [(&str, &str, fn(&str) -> bool, &str); 7] = [
        ("repository_owner", settings.repository_owner.as_str(), is_repository_segment, SEGMENT),
        ("repository_name", settings.repository_name.as_str(), is_repository_segment, SEGMENT),
        (
            "stack_name",
            settings.stack_name.as_str(),
            is_stack_name,
            "a letter followed by up to 127 letters, digits or '-'",
        ),
        ("account_id", settings.account_id.as_str(), is_account_id, "12 digits"),
        (
            "region",
            settings.region.as_str(),
            is_lower_label,
            "lowercase letters, digits or '-'",
        ),
        (
            "artifact_bucket",
            settings.artifact_bucket.as_str(),
            is_bucket_name,
            "3-63 lowercase letters, digits, '.' or '-'",
        ),
        (
            "build_project",
            settings.build_project.as_str(),
            is_project_name,
            "letters, digits, '_' or '-'",
        ),
    ];
    for (field, value, check, expected) in identifiers {
        if !check(value) {
            return Err(invalid(format!(
                "Setting '{}' must be {} (got '{}')",
                field, expected, value
            )));
        }
    }

    if !is_lower_label(&settings.partition) {
        return Err(invalid(format!(
            "Setting 'partition' must be lowercase letters or '-' (got '{}')",
            settings.partition
        )));
    }

    Ok(())
}

fn is_stack_name(value: &str) -> bool {
    let mut chars = value.chars();
    matches!(chars.next(), Some(c) if c.is_ascii_alphabetic())
        && value.len() <= 128
        && chars.all(|c| c.is_ascii_alphanumeric() || c == '-')
}

fn is_account_id(value: &str) -> bool {
    value.len() == 12 && value.chars().all(|c| c.is_ascii_digit())
}

fn is_lower_label(value: &str) -> bool {
    !value.is_empty()
        && !value.starts_with('-')
        && value
            .chars()
            .all(|c| c.is_ascii_lowercase() || c.is_ascii_digit() || c == '-')
}

fn is_bucket_name(value: &str) -> bool {
    (3..=63).contains(&value.len())
        && value
            .chars()
            .all(|c| c.is_ascii_lowercase() || c.is_ascii_digit() || c == '.' || c == '-')
        && value.starts_with(|c: char| c.is_ascii_alphanumeric())
        && value.ends_with(|c: char| c.is_ascii_alphanumeric())
}

fn is_project_name(value: &str) -> bool {
    (2..=255).contains(&value.len())
        && value.starts_with(|c: char| c.is_ascii_alphanumeric())
        && value
            .chars()
            .all(|c| c.is_ascii_alphanumeric() || c == '_' || c == '-')
}

fn is_repository_segment(value: &str) -> bool {
    !value.is_empty()
        && value != "."
        && value != ".."
        && value
            .chars()
            .all(|c| c.is_ascii_alphanumeric() || matches!(c, '.' | '_' | '-'))
}

/// Pipeline names are used in role names and artifact prefixes
fn is_pipeline_name(value: &str) -> bool {
    value.len() <= 64
        && value.starts_with(|c: char| c.is_ascii_alphanumeric())
        && value
            .chars()
            .all(|c| c.is_ascii_alphanumeric() || c == '_' || c == '-')
}

fn validate_stage(stage: &Stage) -> Result<(), DefinitionError> {
    if stage.actions.is_empty() {
        return Err(invalid(format!(
            "Stage '{}' must declare at least one action",
            stage.name
        )));
    }

    let expected = stage.kind.action_category();
    let mut run_orders = HashSet::new();

    for action in &stage.actions {
        if action.category != expected {
            return Err(invalid(format!(
                "Action '{}' has category {:?} but stage '{}' is a {} stage",
                action.name, action.category, stage.name, stage.kind
            )));
        }

        if action.provider.category() != action.category {
            return Err(invalid(format!(
                "Provider '{}' cannot serve {:?} action '{}'",
                action.provider, action.category, action.name
            )));
        }

        if !run_orders.insert(action.run_order) {
            return Err(invalid(format!(
                "Stage '{}' has more than one action with run_order {}",
                stage.name, action.run_order
            )));
        }

        if action.input_artifacts != stage.input_artifacts
            || action.output_artifacts != stage.output_artifacts
        {
            return Err(invalid(format!(
                "Action '{}' must declare the same input/output artifacts as stage '{}'",
                action.name, stage.name
            )));
        }
    }

    Ok(())
}

fn invalid(msg: impl Into<String>) -> DefinitionError {
    DefinitionError::Invalid(msg.into())
}

#[cfg(test)]
pub(crate) mod tests {
    use super::*;

    pub(crate) const SAMPLE: &str = r#"
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

    pub(crate) fn sample_definition() -> PipelineDefinition {
        PipelineDefinition::from_yaml_str(SAMPLE).unwrap()
    }

    #[test]
    fn test_load_sample_definition() {
        let definition = sample_definition();
        assert_eq!(definition.name, "infra-pipeline");
        assert_eq!(definition.stages.len(), 3);
        assert!(definition.settings.create_webhook_credential);
        assert_eq!(definition.settings.partition, "aws");
        assert_eq!(definition.settings.integration_ref(), "refs/heads/master");
    }

    #[test]
    fn test_unknown_provider_fails_at_load() {
        let yaml = SAMPLE.replace("provider: cloudformation", "provider: terraform");
        let result = PipelineDefinition::from_yaml_str(&yaml);
        assert!(matches!(result, Err(DefinitionError::Parse(_))));
    }

    #[test]
    fn test_provider_category_mismatch() {
        let yaml = SAMPLE.replace("provider: container-build", "provider: cloudformation");
        let result = PipelineDefinition::from_yaml_str(&yaml);
        assert!(matches!(result, Err(DefinitionError::Invalid(_))));
    }

    #[test]
    fn test_duplicate_run_order_rejected() {
        let mut definition = sample_definition();
        let extra = definition.stages[1].actions[0].clone();
        definition.stages[1].actions.push(extra);
        assert!(definition.validate().is_err());

        definition.stages[1].actions[1].run_order = 2;
        definition.stages[1].actions[1].name = "Lint".to_string();
        assert!(definition.validate().is_ok());
    }

    #[test]
    fn test_action_artifacts_must_match_stage() {
        let mut definition = sample_definition();
        definition.stages[2].actions[0].input_artifacts = vec![];
        assert!(definition.validate().is_err());
    }

    #[test]
    fn test_stage_order_enforced() {
        let mut definition = sample_definition();
        definition.stages.swap(1, 2);
        assert!(definition.validate().is_err());
    }

    #[test]
    fn test_unknown_input_artifact_rejected() {
        let mut definition = sample_definition();
        definition.stages[2].input_artifacts = vec!["BuildOutput".to_string()];
        definition.stages[2].actions[0].input_artifacts = vec!["BuildOutput".to_string()];
        assert!(definition.validate().is_err());
    }

    #[test]
    fn test_branch_must_be_bare_name() {
        let yaml = SAMPLE.replace("branch: master", "branch: refs/heads/master");
        assert!(PipelineDefinition::from_yaml_str(&yaml).is_err());
    }

    #[test]
    fn test_resource_identifiers_cannot_widen_roles() {
        for (from, to) in [
            ("stack_name: infra-prod", "stack_name: \"*\""),
            ("stack_name: infra-prod", "stack_name: infra/prod"),
            ("stack_name: infra-prod", "stack_name: 1infra"),
            ("artifact_bucket: acme-artifacts", "artifact_bucket: \"acme-*\""),
            ("artifact_bucket: acme-artifacts", "artifact_bucket: acme/artifacts"),
            ("build_project: infra-validate", "build_project: \"*\""),
            ("account_id: \"123456789012\"", "account_id: \"*\""),
            ("region: us-east-1", "region: \"*\""),
            ("name: infra-pipeline", "name: \"*\""),
            ("name: infra-pipeline", "name: infra/pipeline"),
        ] {
            let yaml = SAMPLE.replacen(from, to, 1);
            assert!(
                matches!(
                    PipelineDefinition::from_yaml_str(&yaml),
                    Err(DefinitionError::Invalid(_))
                ),
                "{} was accepted",
                to
            );
        }
    }

    #[test]
    fn test_missing_env_secret() {
        let yaml = SAMPLE.replace(
            "source_credential: ghp_test_token",
            "source_credential: env:GANTRY_TEST_SECRET_THAT_IS_NOT_SET",
        );
        let result = PipelineDefinition::from_yaml_str(&yaml);
        assert!(matches!(result, Err(DefinitionError::MissingSecret(_))));
    }

    #[test]
    fn test_secret_is_redacted() {
        let definition = sample_definition();
        let debug = format!("{:?}", definition.settings);
        assert!(!debug.contains("ghp_test_token"));

        let json = serde_json::to_string(&definition.settings).unwrap();
        assert!(!json.contains("ghp_test_token"));
        assert_eq!(definition.settings.source_credential.expose(), "ghp_test_token");
    }

    #[test]
    fn test_ordered_actions() {
        let mut definition = sample_definition();
        let mut second = definition.stages[1].actions[0].clone();
        second.name = "First".to_string();
        second.run_order = 0;
        definition.stages[1].actions.push(second);

        let ordered = definition.stages[1].ordered_actions();
        assert_eq!(ordered[0].name, "First");
        assert_eq!(ordered[1].name, "ValidateTemplate");
    }
}
