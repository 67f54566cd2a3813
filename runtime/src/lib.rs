//! PTY-backed session runtime: spawns long-lived interactive CLI agents
//! inside pseudo-terminals, fans out their output, and turns the noisy
//! byte stream into structured markers.
//!
//! This crate owns the Session Backend and Terminal Output Processor; the
//! monitors, restart coordinator, chat router and gateway that consume it
//! live in the `agentfleet` binary crate.

pub mod backend;
pub mod core;
pub mod markers;
pub mod output;

pub use backend::{CreateSessionOptions, DataSubscription, SessionBackend};
pub use core::{RuntimeType, Session, SessionError, SessionInfo, SessionName, SessionResult, SessionSize};
pub use markers::{Marker, MarkerPayload, NotifyBody};
pub use output::{strip_ansi, OutputProcessor, MAX_BUFFER_SIZE};
