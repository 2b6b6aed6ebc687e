//! Orchestrator configuration

use anyhow::Context;
use gantry_core::domain::pipeline::Secret;
use gantry_runner::ExecutorConfig;
use std::path::PathBuf;

#[derive(Debug, Clone)]
pub struct OrchestratorConfig {
    /// Path of the pipeline definition file
    pub pipeline_definition: PathBuf,

    /// Shared secret inbound webhook payloads are signed with
    pub webhook_secret: Secret,

    /// Postgres connection string; runs are kept in memory when absent
    pub database_url: Option<String>,

    pub bind_addr: String,

    /// Externally reachable URL of `POST /webhook`, registered on the source host
    pub public_webhook_url: Option<String>,

    pub executor: ExecutorConfig,
}

impl OrchestratorConfig {
    /// Creates configuration from environment variables
    ///
    /// Expected environment variables:
    /// - PIPELINE_DEFINITION (required)
    /// - WEBHOOK_SECRET (required)
    /// - DATABASE_URL (optional)
    /// - ORCHESTRATOR_BIND_ADDR (default: 0.0.0.0:8080)
    /// - PUBLIC_WEBHOOK_URL (optional)
    /// - executor variables, see [`ExecutorConfig::from_env`]
    pub fn from_env() -> anyhow::Result<Self> {
        let pipeline_definition = std::env::var("PIPELINE_DEFINITION")
            .map(PathBuf::from)
            .context("PIPELINE_DEFINITION must point at the pipeline definition file")?;

        let webhook_secret = std::env::var("WEBHOOK_SECRET")
            .map(Secret::new)
            .context("WEBHOOK_SECRET must be set")?;

        let config = Self {
            pipeline_definition,
            webhook_secret,
            database_url: std::env::var("DATABASE_URL").ok(),
            bind_addr: std::env::var("ORCHESTRATOR_BIND_ADDR")
                .unwrap_or_else(|_| "0.0.0.0:8080".to_string()),
            public_webhook_url: std::env::var("PUBLIC_WEBHOOK_URL").ok(),
            executor: ExecutorConfig::from_env()?,
        };

        config.validate()?;
        Ok(config)
    }

    pub fn validate(&self) -> anyhow::Result<()> {
        if self.webhook_secret.is_empty() {
            anyhow::bail!("WEBHOOK_SECRET cannot be empty");
        }

        if self.bind_addr.parse::<std::net::SocketAddr>().is_err() {
            anyhow::bail!("ORCHESTRATOR_BIND_ADDR '{}' is not a socket address", self.bind_addr);
        }

        if let Some(url) = &self.public_webhook_url
            && !url.starts_with("https://")
            && !url.starts_with("http://")
        {
            anyhow::bail!("PUBLIC_WEBHOOK_URL must be an http(s) URL");
        }

        self.executor.validate()
    }
}
