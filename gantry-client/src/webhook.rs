//! Webhook delivery
//!
//! Sends events the way the source host does: JSON body signed with the
//! shared secret.

use crate::OrchestratorClient;
use crate::error::{ClientError, Result};
use gantry_core::domain::trigger::WebhookEvent;
use gantry_core::dto::webhook::WebhookAck;
use gantry_core::signature::{self, SIGNATURE_HEADER};

/// Serializes an event and computes its signature header value
pub fn signed_body(event: &WebhookEvent, secret: &str) -> Result<(Vec<u8>, String)> {
    let body = serde_json::to_vec(event)
        .map_err(|e| ClientError::InvalidRequest(format!("Failed to encode event: {}", e)))?;
    let signature = signature::sign(secret, &body);
    Ok((body, signature))
}

impl OrchestratorClient {
    /// Deliver a signed event to `POST /webhook`
    pub async fn send_event(&self, event: &WebhookEvent, secret: &str) -> Result<WebhookAck> {
        let (body, signature) = signed_body(event, secret)?;
        tracing::debug!("Sending {} event", event.event_type.as_str());

        let url = format!("{}/webhook", self.base_url);
        let response = self
            .client
            .post(&url)
            .header("content-type", "application/json")
            .header(SIGNATURE_HEADER, signature)
            .body(body)
            .send()
            .await?;

        self.handle_response(response).await
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_signed_body_verifies() {
        let event = WebhookEvent::push("refs/heads/master").with_commit("abc123");
        let (body, header) = signed_body(&event, "hook-secret").unwrap();

        assert!(signature::verify("hook-secret", &body, Some(&header)).is_ok());
        assert!(signature::verify("other", &body, Some(&header)).is_err());

        let decoded: WebhookEvent = serde_json::from_slice(&body).unwrap();
        assert_eq!(decoded, event);
    }
}
