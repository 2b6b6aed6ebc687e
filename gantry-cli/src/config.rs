//! Configuration module
//!
//! Handles CLI configuration including orchestrator URL and webhook secret.

/// CLI configuration
#[derive(Debug, Clone)]
pub struct Config {
    /// URL of the orchestrator service
    pub orchestrator_url: String,

    /// Shared secret used to sign events sent with `gantry event`
    pub webhook_secret: Option<String>,
}

impl Config {
    pub fn webhook_secret(&self) -> anyhow::Result<&str> {
        self.webhook_secret
            .as_deref()
            .filter(|s| !s.is_empty())
            .ok_or_else(|| {
                anyhow::anyhow!("A webhook secret is required (--webhook-secret or GANTRY_WEBHOOK_SECRET)")
            })
    }
}
