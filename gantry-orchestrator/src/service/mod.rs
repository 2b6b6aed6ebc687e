//! Service Module
//!
//! Business logic layer for the orchestrator.
//! The controller drives runs; the guard and registrar handle the
//! account-level webhook credential.

pub mod controller;
pub mod guard;
pub mod registrar;

pub use controller::{ControllerError, PipelineController};
pub use guard::{Acquisition, GuardError, SingletonGuard, SingletonProvisioner};
pub use registrar::{ExternallyManaged, GitHubWebhookRegistrar};
