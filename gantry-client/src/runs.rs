//! Run-related API endpoints

use crate::OrchestratorClient;
use crate::error::Result;
use gantry_core::domain::run::{Run, RunId};
use gantry_core::dto::run::RunSummary;

impl OrchestratorClient {
    /// List the most recent runs, newest first
    ///
    /// The orchestrator applies its own default when `limit` is `None`.
    pub async fn list_runs(&self, limit: Option<i64>) -> Result<Vec<RunSummary>> {
        let url = format!("{}/runs", self.base_url);
        let mut request = self.client.get(&url);
        if let Some(limit) = limit {
            request = request.query(&[("limit", limit)]);
        }
        let response = request.send().await?;

        self.handle_response(response).await
    }

    /// Get a run with its stage records and logs
    pub async fn get_run(&self, run_id: RunId) -> Result<Run> {
        let url = format!("{}/runs/{}", self.base_url, run_id);
        let response = self.client.get(&url).send().await?;

        self.handle_response(response).await
    }

    /// Request cancellation of a run
    ///
    /// Returns the run as it was when the request was accepted; the run
    /// reaches `Cancelled` once its current stage stops.
    pub async fn cancel_run(&self, run_id: RunId) -> Result<Run> {
        let url = format!("{}/runs/{}/cancel", self.base_url, run_id);
        let response = self.client.post(&url).send().await?;

        self.handle_response(response).await
    }
}
