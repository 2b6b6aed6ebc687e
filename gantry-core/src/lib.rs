//! Gantry Core
//!
//! Core types and pure logic for the Gantry deployment pipeline.
//!
//! This crate contains:
//! - Domain types: pipeline definitions, runs, artifacts, triggers, roles
//! - DTOs: Data transfer objects for the orchestrator HTTP API
//! - Trigger matching and role binding, shared by the orchestrator and the CLI
//! - Webhook signature helpers and the pipeline error taxonomy

pub mod binder;
pub mod domain;
pub mod dto;
pub mod error;
pub mod signature;
pub mod trigger;

pub use binder::RoleBinder;
pub use error::{DefinitionError, FailureKind, PipelineError, RejectReason};
pub use trigger::{TriggerDecision, TriggerMatcher};
