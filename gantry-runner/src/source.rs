//! Source fetching
//!
//! Retrieves the trigger's ref from the source host into a stage workspace.

use async_trait::async_trait;
use gantry_core::domain::pipeline::Secret;
use std::path::Path;
use tracing::{debug, info};

use crate::error::{SourceFetchReason, StageError};
use crate::process::{self, CommandOutput};

/// Result of a successful fetch
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct FetchedSource {
    pub commit: String,
}

#[async_trait]
pub trait SourceFetcher: Send + Sync {
    /// Fetches `git_ref` of `repository` (`owner/name`) into `dest`
    async fn fetch(
        &self,
        repository: &str,
        git_ref: &str,
        credential: &Secret,
        dest: &Path,
    ) -> Result<FetchedSource, StageError>;
}

/// Fetches with the `git` CLI over HTTPS
pub struct GitSourceFetcher {
    host: String,
}

impl GitSourceFetcher {
    /// # Arguments
    /// * `host` - Base URL of the source host (e.g., "https://github.com")
    pub fn new(host: impl Into<String>) -> Self {
        Self {
            host: host.into().trim_end_matches('/').to_string(),
        }
    }

    fn remote_url(&self, repository: &str, credential: &Secret) -> String {
        match self.host.split_once("://") {
            Some((scheme, rest)) if !credential.is_empty() => format!(
                "{}://x-access-token:{}@{}/{}.git",
                scheme,
                credential.expose(),
                rest,
                repository
            ),
            _ => format!("{}/{}.git", self.host, repository),
        }
    }

    async fn git(&self, dest: &Path, args: &[&str]) -> Result<CommandOutput, std::io::Error> {
        debug!("git {:?}", args.first());
        process::run(
            process::command("git")
                .current_dir(dest)
                .env("GIT_TERMINAL_PROMPT", "0")
                .args(args),
        )
        .await
    }
}

#[async_trait]
impl SourceFetcher for GitSourceFetcher {
    async fn fetch(
        &self,
        repository: &str,
        git_ref: &str,
        credential: &Secret,
        dest: &Path,
    ) -> Result<FetchedSource, StageError> {
        tokio::fs::create_dir_all(dest).await?;

        let fail = |reason, output: &CommandOutput| StageError::SourceFetch {
            git_ref: git_ref.to_string(),
            reason,
            detail: scrub(&output.diagnostic(), credential),
        };
        let unavailable = |e: std::io::Error| StageError::SourceFetch {
            git_ref: git_ref.to_string(),
            reason: SourceFetchReason::Other,
            detail: format!("failed to run git: {}", e),
        };

        let init = self.git(dest, &["init", "--quiet"]).await.map_err(unavailable)?;
        if !init.success() {
            return Err(fail(SourceFetchReason::Other, &init));
        }

        let url = self.remote_url(repository, credential);
        let fetch = self
            .git(dest, &["fetch", "--quiet", "--depth", "1", &url, git_ref])
            .await
            .map_err(unavailable)?;
        if !fetch.success() {
            return Err(fail(classify_fetch_failure(&fetch.stderr), &fetch));
        }

        let checkout = self
            .git(dest, &["checkout", "--quiet", "--detach", "FETCH_HEAD"])
            .await
            .map_err(unavailable)?;
        if !checkout.success() {
            return Err(fail(SourceFetchReason::Other, &checkout));
        }

        let head = self
            .git(dest, &["rev-parse", "HEAD"])
            .await
            .map_err(unavailable)?;
        if !head.success() {
            return Err(fail(SourceFetchReason::Other, &head));
        }

        let commit = head.stdout.trim().to_string();
        info!("Fetched {} of {} at {}", git_ref, repository, commit);
        Ok(FetchedSource { commit })
    }
}

/// Maps git's stderr to a fetch failure reason
pub(crate) fn classify_fetch_failure(stderr: &str) -> SourceFetchReason {
    let stderr = stderr.to_lowercase();

    let auth = [
        "authentication failed",
        "could not read username",
        "invalid username or password",
        "permission denied",
        "403",
    ];
    let missing = [
        "couldn't find remote ref",
        "not our ref",
        "repository not found",
        "does not appear to be a git repository",
    ];
    let unavailable = [
        "could not resolve host",
        "connection refused",
        "connection timed out",
        "operation timed out",
        "failed to connect",
        "502",
        "503",
    ];

    if auth.iter().any(|p| stderr.contains(p)) {
        SourceFetchReason::Authentication
    } else if missing.iter().any(|p| stderr.contains(p)) {
        SourceFetchReason::RefNotFound
    } else if unavailable.iter().any(|p| stderr.contains(p)) {
        SourceFetchReason::HostUnavailable
    } else {
        SourceFetchReason::Other
    }
}

/// Removes the credential from anything that may reach logs
fn scrub(text: &str, credential: &Secret) -> String {
    if credential.is_empty() {
        text.to_string()
    } else {
        text.replace(credential.expose(), "****")
    }
}
