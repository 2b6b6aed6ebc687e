//! Webhook API Handler
//!
//! The signature is checked against the raw body before anything is parsed
//! or matched.

use axum::{
    Json,
    body::Bytes,
    extract::State,
    http::{HeaderMap, StatusCode},
};
use gantry_core::RejectReason;
use gantry_core::domain::trigger::WebhookEvent;
use gantry_core::dto::webhook::WebhookAck;
use gantry_core::signature::{self, SIGNATURE_HEADER};

use crate::api::AppState;
use crate::api::error::{ApiError, ApiResult};

/// POST /webhook
pub async fn receive_webhook(
    State(state): State<AppState>,
    headers: HeaderMap,
    body: Bytes,
) -> ApiResult<(StatusCode, Json<WebhookAck>)> {
    let header = headers
        .get(SIGNATURE_HEADER)
        .and_then(|value| value.to_str().ok());

    signature::verify(state.webhook_secret.expose(), &body, header).map_err(|reason| {
        tracing::warn!("Rejected webhook: {}", reason);
        ApiError::from(reason)
    })?;

    let event: WebhookEvent = serde_json::from_slice(&body).map_err(|e| {
        ApiError::BadRequest(format!("{}: {}", RejectReason::MalformedPayload, e))
    })?;

    tracing::debug!(
        "Received {} event for {:?}",
        event.event_type.as_str(),
        event.git_ref
    );

    match state.controller.handle_event(&event).await? {
        Some(run) => Ok((
            StatusCode::ACCEPTED,
            Json(WebhookAck::accepted(run.id, run.entry, run.trigger.filter)),
        )),
        None => Ok((StatusCode::OK, Json(WebhookAck::ignored()))),
    }
}
