//! Pipeline-related API endpoints

use crate::OrchestratorClient;
use crate::error::Result;
use gantry_core::domain::policy::RoleSet;
use gantry_core::dto::pipeline::PipelineSummary;

impl OrchestratorClient {
    /// Summary of the pipeline definition the orchestrator serves
    pub async fn get_pipeline(&self) -> Result<PipelineSummary> {
        let url = format!("{}/pipeline", self.base_url);
        let response = self.client.get(&url).send().await?;

        self.handle_response(response).await
    }

    /// Execution roles bound to each stage
    pub async fn get_roles(&self) -> Result<RoleSet> {
        let url = format!("{}/pipeline/roles", self.base_url);
        let response = self.client.get(&url).send().await?;

        self.handle_response(response).await
    }
}
