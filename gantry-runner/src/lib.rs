//! Gantry Runner
//!
//! Stage execution for the Gantry deployment pipeline.
//!
//! Architecture:
//! - Configuration: executor settings from environment or defaults
//! - Context: per-stage workspace, log buffer and cancellation token
//! - Artifact store: immutable, versioned hand-off between stages
//! - Collaborators: source fetcher, validation environment, deployment
//!   engine and commit status reporter, each behind a trait
//! - Executor: runs one stage's actions in order against those collaborators
//!
//! The orchestrator links this crate and drives one executor call per stage.

pub mod artifact;
pub mod config;
pub mod context;
pub mod deploy;
pub mod error;
pub mod executor;
pub mod github;
pub mod podman;
pub mod process;
pub mod redact;
pub mod source;
pub mod validation;

pub use artifact::{ArtifactStore, FsArtifactStore};
pub use config::ExecutorConfig;
pub use context::StageContext;
pub use deploy::{CloudFormationCliEngine, DeploymentEngine};
pub use error::{ArtifactError, EngineError, SourceFetchReason, StageError};
pub use executor::{StageExecutor, StageOutcome, StandardStageExecutor};
pub use github::{GitHubClient, GitHubStatusReporter, StatusReporter};
pub use podman::PodmanValidationEnvironment;
pub use source::{GitSourceFetcher, SourceFetcher};
pub use validation::ValidationEnvironment;
