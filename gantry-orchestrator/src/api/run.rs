//! Run API Handlers

use axum::{
    Json,
    extract::{Path, Query, State},
    http::StatusCode,
};
use gantry_core::domain::run::{Run, RunId};
use gantry_core::dto::run::{ListRuns, RunSummary};

use crate::api::AppState;
use crate::api::error::ApiResult;

/// GET /runs?limit=
/// Most recent runs first
pub async fn list_runs(
    State(state): State<AppState>,
    Query(query): Query<ListRuns>,
) -> ApiResult<Json<Vec<RunSummary>>> {
    let runs = state.controller.list_runs(query.limit).await?;
    Ok(Json(runs.into_iter().map(RunSummary::from).collect()))
}

/// GET /runs/{id}
/// Full run record including stage logs and artifact references
pub async fn get_run(State(state): State<AppState>, Path(id): Path<RunId>) -> ApiResult<Json<Run>> {
    tracing::debug!("Getting run: {}", id);
    let run = state.controller.get_run(id).await?;
    Ok(Json(run))
}

/// POST /runs/{id}/cancel
/// The run settles as Cancelled once its current stage stops
pub async fn cancel_run(
    State(state): State<AppState>,
    Path(id): Path<RunId>,
) -> ApiResult<(StatusCode, Json<Run>)> {
    tracing::info!("Cancel requested for run {}", id);
    let run = state.controller.cancel(id).await?;
    Ok((StatusCode::ACCEPTED, Json(run)))
}
