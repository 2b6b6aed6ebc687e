//! Error types for stage execution

use gantry_core::PipelineError;
use thiserror::Error;

/// Why a source fetch failed
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum SourceFetchReason {
    Authentication,
    RefNotFound,
    HostUnavailable,
    Other,
}

impl std::fmt::Display for SourceFetchReason {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        match self {
            SourceFetchReason::Authentication => write!(f, "authentication failed"),
            SourceFetchReason::RefNotFound => write!(f, "ref not found"),
            SourceFetchReason::HostUnavailable => write!(f, "source host unavailable"),
            SourceFetchReason::Other => write!(f, "fetch failed"),
        }
    }
}

/// Errors that abort a stage
///
/// A validation command exiting non-zero is not an error; it is reported as
/// a failed [`crate::executor::StageOutcome`].
#[derive(Debug, Error)]
pub enum StageError {
    #[error("source fetch of {git_ref} failed ({reason}): {detail}")]
    SourceFetch {
        git_ref: String,
        reason: SourceFetchReason,
        detail: String,
    },

    #[error("deployment of stack '{stack}' failed: {detail}")]
    Deployment { stack: String, detail: String },

    #[error("stage consumes artifact '{0}' which has not been produced in this run")]
    MissingInput(String),

    #[error("execution environment unavailable: {0}")]
    Environment(String),

    #[error(transparent)]
    Artifact(#[from] ArtifactError),

    #[error("workspace I/O failed: {0}")]
    Io(#[from] std::io::Error),
}

impl From<StageError> for PipelineError {
    fn from(err: StageError) -> Self {
        match err {
            StageError::SourceFetch {
                git_ref,
                reason,
                detail,
            } => PipelineError::SourceFetch {
                git_ref,
                detail: format!("{}: {}", reason, detail),
            },
            StageError::Deployment { stack, detail } => PipelineError::Deployment { stack, detail },
            other => PipelineError::Internal(other.to_string()),
        }
    }
}

/// Artifact store errors
#[derive(Debug, Error)]
pub enum ArtifactError {
    #[error("artifact {name} v{version} not found")]
    NotFound { name: String, version: u64 },

    #[error("artifact content for digest {digest} does not match its digest")]
    Corrupt { digest: String },

    #[error("invalid artifact name '{0}'")]
    InvalidName(String),

    #[error("artifact store I/O failed: {0}")]
    Io(#[from] std::io::Error),

    #[error("artifact metadata is unreadable: {0}")]
    Metadata(#[from] serde_json::Error),

    #[error("artifact task failed: {0}")]
    Task(String),
}

/// Deployment engine errors
#[derive(Debug, Error)]
pub enum EngineError {
    /// The engine rejected or failed the change; carries its diagnostic
    #[error("{0}")]
    Rejected(String),

    #[error("deployment engine unavailable: {0}")]
    Unavailable(String),
}
