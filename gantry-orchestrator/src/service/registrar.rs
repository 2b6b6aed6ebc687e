//! Webhook credential provisioner
//!
//! Registers the orchestrator's webhook, signed with the shared secret, on
//! the pipeline's source repository.

use async_trait::async_trait;
use gantry_core::domain::pipeline::Secret;
use gantry_core::domain::singleton::SingletonKey;
use gantry_runner::GitHubClient;
use gantry_runner::github::GitHubError;
use tracing::info;

use crate::service::guard::{ProvisionError, SingletonProvisioner};

pub struct GitHubWebhookRegistrar {
    client: GitHubClient,
    repository: String,
    webhook_url: String,
    secret: Secret,
}

impl GitHubWebhookRegistrar {
    pub fn new(
        client: GitHubClient,
        repository: impl Into<String>,
        webhook_url: impl Into<String>,
        secret: Secret,
    ) -> Self {
        Self {
            client,
            repository: repository.into(),
            webhook_url: webhook_url.into(),
            secret,
        }
    }
}

#[async_trait]
impl SingletonProvisioner for GitHubWebhookRegistrar {
    async fn provision(&self, key: &SingletonKey) -> Result<String, ProvisionError> {
        info!(
            "Registering webhook {} on {} for {}",
            self.webhook_url, self.repository, key
        );

        let id = self
            .client
            .create_webhook(&self.repository, &self.webhook_url, self.secret.expose())
            .await
            .map_err(|e| match e {
                GitHubError::AlreadyRegistered(repo) => ProvisionError::AlreadyExists(format!(
                    "{} already has a webhook for {}",
                    repo, self.webhook_url
                )),
                other => ProvisionError::Failed(other.to_string()),
            })?;

        Ok(format!("{}/hooks/{}", self.repository, id))
    }
}

/// Provisioner for pipelines whose webhook credential is created elsewhere
pub struct ExternallyManaged;

#[async_trait]
impl SingletonProvisioner for ExternallyManaged {
    async fn provision(&self, key: &SingletonKey) -> Result<String, ProvisionError> {
        Err(ProvisionError::Failed(format!(
            "{} is managed outside this pipeline",
            key
        )))
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[tokio::test]
    async fn test_unreachable_host_is_provisioning_failure() {
        let registrar = GitHubWebhookRegistrar::new(
            GitHubClient::new("http://127.0.0.1:9", Secret::new("token")),
            "acme/infra-templates",
            "https://ci.example.com/webhook",
            Secret::new("hook-secret"),
        );

        let result = registrar
            .provision(&SingletonKey::webhook_credential("123456789012", "us-east-1"))
            .await;
        assert!(matches!(result, Err(ProvisionError::Failed(_))));
    }

    #[tokio::test]
    async fn test_externally_managed_never_provisions() {
        let key = SingletonKey::webhook_credential("123456789012", "us-east-1");
        let result = ExternallyManaged.provision(&key).await;
        assert!(matches!(result, Err(ProvisionError::Failed(detail)) if detail.contains("outside")));
    }
}
