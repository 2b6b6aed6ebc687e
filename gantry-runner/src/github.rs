//! Source host API
//!
//! Commit status reporting for pull-request validation runs and webhook
//! registration for the orchestrator's singleton webhook credential.

use async_trait::async_trait;
use gantry_core::domain::pipeline::Secret;
use reqwest::{Client, StatusCode};
use serde::{Deserialize, Serialize};
use thiserror::Error;
use tracing::{debug, info};

/// Status context shown next to the commit on the source host
pub const STATUS_CONTEXT: &str = "gantry/validation";

#[derive(Debug, Error)]
pub enum GitHubError {
    #[error("HTTP request failed: {0}")]
    RequestFailed(#[from] reqwest::Error),

    #[error("API error (status {status}): {message}")]
    Api { status: u16, message: String },

    /// The repository already has a webhook for this URL
    #[error("webhook already registered: {0}")]
    AlreadyRegistered(String),
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum CommitState {
    Pending,
    Success,
    Failure,
    Error,
}

#[derive(Debug, Serialize)]
struct StatusBody<'a> {
    state: CommitState,
    description: &'a str,
    context: &'a str,
}

#[derive(Debug, Serialize)]
struct HookBody<'a> {
    name: &'a str,
    active: bool,
    events: [&'a str; 2],
    config: HookConfig<'a>,
}

#[derive(Debug, Serialize)]
struct HookConfig<'a> {
    url: &'a str,
    content_type: &'a str,
    secret: &'a str,
    insecure_ssl: &'a str,
}

#[derive(Debug, Deserialize)]
struct HookResponse {
    id: u64,
}

/// Minimal REST client for the source host
#[derive(Clone)]
pub struct GitHubClient {
    api_url: String,
    token: Secret,
    client: Client,
}

impl GitHubClient {
    pub fn new(api_url: impl Into<String>, token: Secret) -> Self {
        Self {
            api_url: api_url.into().trim_end_matches('/').to_string(),
            token,
            client: Client::new(),
        }
    }

    fn post(&self, path: &str) -> reqwest::RequestBuilder {
        self.client
            .post(format!("{}{}", self.api_url, path))
            .bearer_auth(self.token.expose())
            .header("Accept", "application/vnd.github+json")
            .header("User-Agent", "gantry")
    }

    /// POST /repos/{owner}/{repo}/statuses/{sha}
    pub async fn create_status(
        &self,
        repository: &str,
        commit: &str,
        state: CommitState,
        description: &str,
    ) -> Result<(), GitHubError> {
        let response = self
            .post(&format!("/repos/{}/statuses/{}", repository, commit))
            .json(&StatusBody {
                state,
                description,
                context: STATUS_CONTEXT,
            })
            .send()
            .await?;

        check(response).await?;
        debug!("Reported {:?} for {}@{}", state, repository, commit);
        Ok(())
    }

    /// POST /repos/{owner}/{repo}/hooks; returns the hook id
    pub async fn create_webhook(
        &self,
        repository: &str,
        url: &str,
        secret: &str,
    ) -> Result<u64, GitHubError> {
        let response = self
            .post(&format!("/repos/{}/hooks", repository))
            .json(&HookBody {
                name: "web",
                active: true,
                events: ["push", "pull_request"],
                config: HookConfig {
                    url,
                    content_type: "json",
                    secret,
                    insecure_ssl: "0",
                },
            })
            .send()
            .await?;

        if response.status() == StatusCode::UNPROCESSABLE_ENTITY {
            let message = response.text().await.unwrap_or_default();
            if message.contains("already exists") {
                return Err(GitHubError::AlreadyRegistered(repository.to_string()));
            }
            return Err(GitHubError::Api {
                status: StatusCode::UNPROCESSABLE_ENTITY.as_u16(),
                message,
            });
        }

        let hook: HookResponse = check(response).await?.json().await?;
        info!("Registered webhook {} on {}", hook.id, repository);
        Ok(hook.id)
    }
}

async fn check(response: reqwest::Response) -> Result<reqwest::Response, GitHubError> {
    let status = response.status();
    if status.is_success() {
        return Ok(response);
    }
    let message = response
        .text()
        .await
        .unwrap_or_else(|_| "Unknown error".to_string());
    Err(GitHubError::Api {
        status: status.as_u16(),
        message,
    })
}

/// Reports validation progress back to the source host
#[async_trait]
pub trait StatusReporter: Send + Sync {
    async fn report(
        &self,
        repository: &str,
        commit: &str,
        state: CommitState,
        description: &str,
    ) -> Result<(), GitHubError>;
}

pub struct GitHubStatusReporter {
    client: GitHubClient,
}

impl GitHubStatusReporter {
    pub fn new(client: GitHubClient) -> Self {
        Self { client }
    }
}

#[async_trait]
impl StatusReporter for GitHubStatusReporter {
    async fn report(
        &self,
        repository: &str,
        commit: &str,
        state: CommitState,
        description: &str,
    ) -> Result<(), GitHubError> {
        self.client
            .create_status(repository, commit, state, description)
            .await
    }
}
