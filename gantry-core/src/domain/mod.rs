//! Core domain types
//!
//! This module contains the domain structures used across Gantry crates.
//! The orchestrator persists them, the runner executes against them and the
//! CLI renders them.

pub mod artifact;
pub mod log;
pub mod pipeline;
pub mod policy;
pub mod run;
pub mod singleton;
pub mod trigger;
