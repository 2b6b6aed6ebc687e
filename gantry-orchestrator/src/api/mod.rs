//! API Module
//!
//! HTTP API layer for the orchestrator.
//! Each submodule handles endpoints for a specific domain.

pub mod error;
pub mod health;
pub mod pipeline;
pub mod run;
pub mod webhook;

use axum::{
    Router,
    routing::{get, post},
};
use gantry_core::domain::pipeline::Secret;
use std::sync::Arc;
use tower_http::trace::TraceLayer;

use crate::service::PipelineController;

/// Shared handler state
#[derive(Clone)]
pub struct AppState {
    pub controller: Arc<PipelineController>,
    pub webhook_secret: Secret,
}

/// Create the main API router with all endpoints
pub fn create_router(state: AppState) -> Router {
    Router::new()
        // Health check
        .route("/health", get(health::health_check))
        // Inbound events
        .route("/webhook", post(webhook::receive_webhook))
        // Run endpoints
        .route("/runs", get(run::list_runs))
        .route("/runs/{id}", get(run::get_run))
        .route("/runs/{id}/cancel", post(run::cancel_run))
        // Pipeline endpoints
        .route("/pipeline", get(pipeline::get_pipeline))
        .route("/pipeline/roles", get(pipeline::get_roles))
        // Add state and middleware
        .with_state(state)
        .layer(TraceLayer::new_for_http())
}
