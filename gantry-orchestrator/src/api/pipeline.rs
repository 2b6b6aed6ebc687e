//! Pipeline API Handlers
//!
//! Read-only views of the loaded definition.

use axum::{Json, extract::State};
use gantry_core::domain::policy::RoleSet;
use gantry_core::dto::pipeline::PipelineSummary;

use crate::api::AppState;

/// GET /pipeline
pub async fn get_pipeline(State(state): State<AppState>) -> Json<PipelineSummary> {
    let controller = &state.controller;
    Json(PipelineSummary::new(
        controller.definition(),
        controller.trigger_names(),
    ))
}

/// GET /pipeline/roles
pub async fn get_roles(State(state): State<AppState>) -> Json<RoleSet> {
    Json(state.controller.roles().clone())
}
