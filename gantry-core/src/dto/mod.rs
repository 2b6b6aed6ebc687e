//! Data Transfer Objects for the orchestrator HTTP API
//!
//! Shared by the orchestrator handlers and the typed client so both sides
//! agree on the wire format.

pub mod pipeline;
pub mod run;
pub mod webhook;
