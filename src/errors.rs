//! Error taxonomy for the orchestration layer (§7). Mirrors the kinds the
//! design calls out: validation, not-found, spawn, transient I/O,
//! protocol, timeout, and cooldown-rejection, each with the propagation
//! policy described there baked into how callers are expected to use them.

use thiserror::Error;

/// The two verbatim user-visible strings called out in §7, kept as
/// constants so tests assert on them directly rather than on formatted
/// `Display` output drifting out of sync.
pub const ORCHESTRATOR_NOT_RUNNING: &str =
    "Orchestrator is not running. Please start the orchestrator first.";
pub const ORCHESTRATOR_SLOW: &str =
    "The orchestrator is taking longer than expected. Please try again.";

#[derive(Debug, Error)]
pub enum RuntimeError {
    #[error("validation error: {0}")]
    Validation(String),

    #[error("not found: {0}")]
    NotFound(String),

    #[error("spawn error: {0}")]
    Spawn(String),

    #[error("transient i/o error: {0}")]
    TransientIo(String),

    #[error("protocol error: {0}")]
    Protocol(String),

    #[error("{0}")]
    Timeout(String),

    #[error("cooldown rejection: {0}")]
    CooldownRejection(String),

    #[error("orchestrator not running")]
    OrchestratorNotRunning,

    #[error(transparent)]
    Session(#[from] fleet_runtime::SessionError),

    #[error(transparent)]
    Other(#[from] anyhow::Error),
}

impl RuntimeError {
    /// True for kinds the propagation policy says should never bubble up
    /// as a hard failure to a caller that isn't explicitly waiting on this
    /// operation — the monitor/dispatcher "log and continue" classes.
    pub fn is_swallowable(&self) -> bool {
        matches!(
            self,
            RuntimeError::TransientIo(_) | RuntimeError::Protocol(_) | RuntimeError::CooldownRejection(_)
        )
    }
}

pub type RuntimeResult<T> = Result<T, RuntimeError>;
