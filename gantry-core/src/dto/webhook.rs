//! Webhook acknowledgement DTO

use serde::{Deserialize, Serialize};

use crate::domain::run::{EntryPoint, RunId};

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum AckStatus {
    Accepted,
    Ignored,
}

/// Response body of `POST /webhook`
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct WebhookAck {
    pub status: AckStatus,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub run_id: Option<RunId>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub entry: Option<EntryPoint>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub filter: Option<String>,
}

impl WebhookAck {
    pub fn accepted(run_id: RunId, entry: EntryPoint, filter: impl Into<String>) -> Self {
        Self {
            status: AckStatus::Accepted,
            run_id: Some(run_id),
            entry: Some(entry),
            filter: Some(filter.into()),
        }
    }

    pub fn ignored() -> Self {
        Self {
            status: AckStatus::Ignored,
            run_id: None,
            entry: None,
            filter: None,
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_wire_format() {
        let json = serde_json::to_value(WebhookAck::accepted(3, EntryPoint::Source, "push")).unwrap();
        assert_eq!(json["status"], "accepted");
        assert_eq!(json["run_id"], 3);

        let json = serde_json::to_value(WebhookAck::ignored()).unwrap();
        assert_eq!(json, serde_json::json!({"status": "ignored"}));
    }
}
