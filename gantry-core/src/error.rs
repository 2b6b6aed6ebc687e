//! Error taxonomy for pipeline runs and definitions

use serde::{Deserialize, Serialize};
use thiserror::Error;

/// Errors raised while loading a pipeline definition
#[derive(Debug, Error)]
pub enum DefinitionError {
    #[error("failed to read pipeline definition {path}: {source}")]
    Io {
        path: String,
        #[source]
        source: std::io::Error,
    },

    #[error("failed to parse pipeline definition: {0}")]
    Parse(#[from] serde_yaml::Error),

    #[error("invalid pipeline definition: {0}")]
    Invalid(String),

    #[error("secret environment variable {0} is not set")]
    MissingSecret(String),

    #[error("invalid pattern in trigger filter '{filter}': {detail}")]
    Pattern { filter: String, detail: String },
}

/// Why an inbound event did not start a run
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum RejectReason {
    MissingSignature,
    InvalidSignature,
    MalformedPayload,
    NoMatchingFilter,
}

impl std::fmt::Display for RejectReason {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        match self {
            RejectReason::MissingSignature => write!(f, "missing signature"),
            RejectReason::InvalidSignature => write!(f, "invalid signature"),
            RejectReason::MalformedPayload => write!(f, "malformed payload"),
            RejectReason::NoMatchingFilter => write!(f, "no trigger filter matched"),
        }
    }
}

/// Pipeline error taxonomy
///
/// Every variant except `TriggerRejected` ends the affected run; none is
/// retried automatically.
#[derive(Debug, Clone, Error)]
pub enum PipelineError {
    #[error("trigger rejected: {0}")]
    TriggerRejected(RejectReason),

    #[error("source fetch of {git_ref} failed: {detail}")]
    SourceFetch { git_ref: String, detail: String },

    #[error("validation failed in action '{action}': {detail}")]
    ValidationFailed {
        action: String,
        exit_code: Option<i32>,
        detail: String,
    },

    #[error("deployment of stack '{stack}' failed: {detail}")]
    Deployment { stack: String, detail: String },

    #[error("singleton resource {key} already registered outside this pipeline")]
    SingletonConflict { key: String },

    #[error("stage '{stage}' timed out after {seconds}s")]
    StageTimedOut { stage: String, seconds: u64 },

    #[error("run cancelled by operator")]
    Cancelled,

    #[error("internal error: {0}")]
    Internal(String),
}

impl PipelineError {
    pub fn failure_kind(&self) -> FailureKind {
        match self {
            PipelineError::TriggerRejected(_) => FailureKind::TriggerRejected,
            PipelineError::SourceFetch { .. } => FailureKind::SourceFetch,
            PipelineError::ValidationFailed { .. } => FailureKind::ValidationFailed,
            PipelineError::Deployment { .. } => FailureKind::Deployment,
            PipelineError::SingletonConflict { .. } => FailureKind::SingletonConflict,
            PipelineError::StageTimedOut { .. } => FailureKind::TimedOut,
            PipelineError::Cancelled => FailureKind::Cancelled,
            PipelineError::Internal(_) => FailureKind::Internal,
        }
    }
}

/// Failure category recorded on a run
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum FailureKind {
    TriggerRejected,
    SourceFetch,
    ValidationFailed,
    Deployment,
    SingletonConflict,
    TimedOut,
    Cancelled,
    Internal,
}

impl std::fmt::Display for FailureKind {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        let s = match self {
            FailureKind::TriggerRejected => "TriggerRejected",
            FailureKind::SourceFetch => "SourceFetchError",
            FailureKind::ValidationFailed => "ValidationFailed",
            FailureKind::Deployment => "DeploymentError",
            FailureKind::SingletonConflict => "SingletonConflict",
            FailureKind::TimedOut => "StageTimedOut",
            FailureKind::Cancelled => "Cancelled",
            FailureKind::Internal => "InternalError",
        };
        f.write_str(s)
    }
}
