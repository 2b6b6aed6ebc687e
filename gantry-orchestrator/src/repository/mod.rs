//! Repository Module
//!
//! Data access layer for the orchestrator.
//! Each repository is a trait with a Postgres implementation and an
//! in-memory one used by tests and database-less deployments.

pub mod run;
pub mod singleton;

use gantry_core::domain::run::RunId;
use thiserror::Error;

pub use run::{InMemoryRunRepository, PgRunRepository, RunRepository};
pub use singleton::{InMemorySingletonStore, PgSingletonStore, SingletonStore};

#[derive(Debug, Error)]
pub enum RepositoryError {
    #[error("database error: {0}")]
    Database(#[from] sqlx::Error),

    #[error("run {0} not found")]
    NotFound(RunId),

    #[error("stored record is unreadable: {0}")]
    Corrupt(String),
}
