//! agentfleet - orchestrates fleets of long-lived interactive AI coding
//! CLI agents running inside PTYs, on top of the `fleet-runtime` crate's
//! session/PTY/output primitives.

pub mod app;
pub mod cli;
pub mod collaborators;
pub mod config;
pub mod context_monitor;
pub mod errors;
pub mod exit_monitor;
pub mod gateway;
pub mod queue;
pub mod registration;
pub mod runtime_types;
pub mod utils;
