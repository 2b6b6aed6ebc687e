//! Executor configuration
//!
//! Defines where stages work on disk, where artifacts live and which
//! external tools and endpoints the production collaborators talk to.

use std::path::PathBuf;

/// Executor configuration
#[derive(Debug, Clone)]
pub struct ExecutorConfig {
    /// Base directory for per-run stage workspaces
    pub workspace_base: PathBuf,

    /// Root directory of the filesystem artifact store
    pub artifact_root: PathBuf,

    /// Image used by validation actions that do not name one
    pub default_container_image: String,

    /// Base URL git fetches from (e.g., "https://github.com")
    pub git_host: String,

    /// Source host REST API base URL
    pub github_api_url: String,

    /// Deployment CLI binary
    pub deploy_cli: String,

    /// Leave stage workspaces on disk after the stage ends
    pub keep_workspaces: bool,
}

impl ExecutorConfig {
    /// Creates a configuration rooted at the given directory
    pub fn new(root: impl Into<PathBuf>) -> Self {
        let root = root.into();
        Self {
            workspace_base: root.join("workspaces"),
            artifact_root: root.join("artifacts"),
            default_container_image: "docker.io/library/alpine:3".to_string(),
            git_host: "https://github.com".to_string(),
            github_api_url: "https://api.github.com".to_string(),
            deploy_cli: "aws".to_string(),
            keep_workspaces: false,
        }
    }

    /// Creates configuration from environment variables
    ///
    /// Expected environment variables (all optional):
    /// - WORKSPACE_BASE (default: <tmp>/gantry/workspaces)
    /// - ARTIFACT_ROOT (default: <tmp>/gantry/artifacts)
    /// - DEFAULT_CONTAINER_IMAGE
    /// - GIT_HOST
    /// - GITHUB_API_URL
    /// - DEPLOY_CLI (default: aws)
    /// - KEEP_WORKSPACES (true/false, default: false)
    pub fn from_env() -> anyhow::Result<Self> {
        let mut config = Self::default();

        if let Ok(dir) = std::env::var("WORKSPACE_BASE") {
            config.workspace_base = PathBuf::from(dir);
        }
        if let Ok(dir) = std::env::var("ARTIFACT_ROOT") {
            config.artifact_root = PathBuf::from(dir);
        }
        if let Ok(image) = std::env::var("DEFAULT_CONTAINER_IMAGE") {
            config.default_container_image = image;
        }
        if let Ok(host) = std::env::var("GIT_HOST") {
            config.git_host = host.trim_end_matches('/').to_string();
        }
        if let Ok(url) = std::env::var("GITHUB_API_URL") {
            config.github_api_url = url.trim_end_matches('/').to_string();
        }
        if let Ok(cli) = std::env::var("DEPLOY_CLI") {
            config.deploy_cli = cli;
        }
        if let Ok(keep) = std::env::var("KEEP_WORKSPACES") {
            config.keep_workspaces = keep
                .parse::<bool>()
                .map_err(|_| anyhow::anyhow!("KEEP_WORKSPACES must be true or false"))?;
        }

        Ok(config)
    }

    /// Validates the configuration
    pub fn validate(&self) -> anyhow::Result<()> {
        if self.workspace_base == self.artifact_root {
            anyhow::bail!("workspace_base and artifact_root must be different directories");
        }

        if self.default_container_image.trim().is_empty() {
            anyhow::bail!("default_container_image cannot be empty");
        }

        for (name, url) in [
            ("git_host", &self.git_host),
            ("github_api_url", &self.github_api_url),
        ] {
            if !url.starts_with("http://") && !url.starts_with("https://") {
                anyhow::bail!("{} must start with http:// or https://", name);
            }
        }

        if self.deploy_cli.trim().is_empty() {
            anyhow::bail!("deploy_cli cannot be empty");
        }

        Ok(())
    }
}

impl Default for ExecutorConfig {
    fn default() -> Self {
        Self::new(std::env::temp_dir().join("gantry"))
    }
}
