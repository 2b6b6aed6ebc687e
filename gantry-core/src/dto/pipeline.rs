//! Pipeline DTOs

use serde::{Deserialize, Serialize};

use crate::domain::pipeline::{PipelineDefinition, Provider, StageKind};

/// Read-only view of the loaded pipeline definition
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct PipelineSummary {
    pub name: String,
    pub repository: String,
    pub branch: String,
    pub stack_name: String,
    pub create_webhook_credential: bool,
    pub stages: Vec<StageSummary>,
    /// Trigger filter names in evaluation order
    pub triggers: Vec<String>,
}

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct StageSummary {
    pub name: String,
    pub kind: StageKind,
    pub actions: Vec<ActionSummary>,
    pub input_artifacts: Vec<String>,
    pub output_artifacts: Vec<String>,
    pub timeout_seconds: Option<u64>,
}

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct ActionSummary {
    pub name: String,
    pub provider: Provider,
    pub run_order: u32,
}

impl PipelineSummary {
    pub fn new(definition: &PipelineDefinition, triggers: Vec<String>) -> Self {
        let settings = &definition.settings;
        PipelineSummary {
            name: definition.name.clone(),
            repository: settings.repository(),
            branch: settings.branch.clone(),
            stack_name: settings.stack_name.clone(),
            create_webhook_credential: settings.create_webhook_credential,
            stages: definition
                .stages
                .iter()
                .map(|stage| StageSummary {
                    name: stage.name.clone(),
                    kind: stage.kind,
                    actions: stage
                        .ordered_actions()
                        .into_iter()
                        .map(|a| ActionSummary {
                            name: a.name.clone(),
                            provider: a.provider,
                            run_order: a.run_order,
                        })
                        .collect(),
                    input_artifacts: stage.input_artifacts.clone(),
                    output_artifacts: stage.output_artifacts.clone(),
                    timeout_seconds: stage.timeout_seconds,
                })
                .collect(),
            triggers,
        }
    }
}
