//! Singleton resource domain types

use serde::{Deserialize, Serialize};

/// Kind of the source-host webhook credential registration
pub const WEBHOOK_CREDENTIAL_KIND: &str = "webhook-cred";

/// Identity of a resource that may exist at most once per scope
#[derive(Debug, Clone, PartialEq, Eq, Hash, Serialize, Deserialize)]
pub struct SingletonKey {
    pub kind: String,
    pub scope: String,
}

impl SingletonKey {
    pub fn new(kind: impl Into<String>, scope: impl Into<String>) -> Self {
        Self {
            kind: kind.into(),
            scope: scope.into(),
        }
    }

    /// One webhook credential per account and region
    pub fn webhook_credential(account_id: &str, region: &str) -> Self {
        Self::new(WEBHOOK_CREDENTIAL_KIND, format!("{}/{}", account_id, region))
    }
}

impl std::fmt::Display for SingletonKey {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        write!(f, "{}@{}", self.kind, self.scope)
    }
}

/// A live singleton resource
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct SingletonResource {
    pub key: SingletonKey,
    /// Provider-side identifier of the created resource
    pub handle: String,
    pub created_at: chrono::DateTime<chrono::Utc>,
}

/// Where a singleton key stands in its provisioning lifecycle
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
#[serde(tag = "state", rename_all = "snake_case")]
pub enum SingletonState {
    /// An orchestrator holds the key and is provisioning the resource
    Claimed { owner: String },
    Ready { handle: String },
    /// The provider already held a registration; cleared only by an operator
    Conflict { detail: String },
}

/// Stored record of a singleton key
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct SingletonRecord {
    pub key: SingletonKey,
    pub state: SingletonState,
    pub updated_at: chrono::DateTime<chrono::Utc>,
}

impl SingletonRecord {
    pub fn new(key: SingletonKey, state: SingletonState) -> Self {
        Self {
            key,
            state,
            updated_at: chrono::Utc::now(),
        }
    }

    /// The live resource, once provisioning has finished
    pub fn resource(&self) -> Option<SingletonResource> {
        match &self.state {
            SingletonState::Ready { handle } => Some(SingletonResource {
                key: self.key.clone(),
                handle: handle.clone(),
                created_at: self.updated_at,
            }),
            _ => None,
        }
    }

    pub fn is_claimed_by(&self, owner: &str) -> bool {
        matches!(&self.state, SingletonState::Claimed { owner: held } if held == owner)
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_only_ready_records_expose_a_resource() {
        let key = SingletonKey::webhook_credential("123456789012", "us-east-1");
        let claimed = SingletonRecord::new(
            key.clone(),
            SingletonState::Claimed {
                owner: "orchestrator-a".to_string(),
            },
        );
        assert!(claimed.resource().is_none());
        assert!(claimed.is_claimed_by("orchestrator-a"));
        assert!(!claimed.is_claimed_by("orchestrator-b"));

        let ready = SingletonRecord::new(
            key.clone(),
            SingletonState::Ready {
                handle: "hooks/7".to_string(),
            },
        );
        assert_eq!(ready.resource().unwrap().handle, "hooks/7");
        assert!(!ready.is_claimed_by("orchestrator-a"));

        let json = serde_json::to_value(&ready.state).unwrap();
        assert_eq!(json, serde_json::json!({"state": "ready", "handle": "hooks/7"}));
    }
}
