//! Shared session types: identifiers, errors, and the PTY/process primitives
//! that [`crate::backend::SessionBackend`] is built on.

pub mod headless;
pub mod lifecycle;
pub mod process;
pub mod pty;
pub mod terminal;

use std::fmt;

use serde::{Deserialize, Serialize};
use thiserror::Error;

/// Errors produced by the session core.
///
/// Mirrors the propagation policy in the error-handling design: callers of
/// the backend see these synchronously for create/write/kill; every other
/// component treats them as a signal to log and continue rather than crash.
#[derive(Debug, Error)]
pub enum SessionError {
    #[error("session '{0}' already exists")]
    AlreadyExists(String),

    #[error("session '{0}' not found")]
    NotFound(String),

    #[error("failed to spawn session: {0}")]
    Spawn(String),

    #[error("pty error: {0}")]
    Pty(String),

    #[error("process error: {0}")]
    Process(String),

    #[error("invalid session name '{0}': must match ^[A-Za-z0-9_-]{{1,100}}$")]
    InvalidName(String),

    #[error(transparent)]
    Io(#[from] std::io::Error),

    #[error(transparent)]
    Other(#[from] anyhow::Error),
}

pub type SessionResult<T> = Result<T, SessionError>;

/// A session's process-wide unique name. Validated against
/// `^[A-Za-z0-9_-]{1,100}$` at construction (§6 of the runtime spec).
#[derive(Debug, Clone, PartialEq, Eq, Hash, PartialOrd, Ord, Serialize, Deserialize)]
pub struct SessionName(String);

impl SessionName {
    pub fn new(name: impl Into<String>) -> SessionResult<Self> {
        let name = name.into();
        let valid = !name.is_empty()
            && name.len() <= 100
            && name
                .chars()
                .all(|c| c.is_ascii_alphanumeric() || c == '_' || c == '-');
        if !valid {
            return Err(SessionError::InvalidName(name));
        }
        Ok(Self(name))
    }

    pub fn as_str(&self) -> &str {
        &self.0
    }
}

impl fmt::Display for SessionName {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "{}", self.0)
    }
}

/// The CLI family a session wraps. Each variant has a corresponding
/// launch/compact/ready/exit profile supplied by the orchestration layer
/// (see `agentfleet::runtime_types::RuntimeProfile`).
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "kebab-case")]
pub enum RuntimeType {
    ClaudeCode,
    GeminiCli,
    CodexCli,
}

impl fmt::Display for RuntimeType {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        let s = match self {
            RuntimeType::ClaudeCode => "claude-code",
            RuntimeType::GeminiCli => "gemini-cli",
            RuntimeType::CodexCli => "codex-cli",
        };
        write!(f, "{s}")
    }
}

/// Default PTY geometry used by `createSession` (§4.1).
#[derive(Debug, Clone, Copy)]
pub struct SessionSize {
    pub cols: u16,
    pub rows: u16,
}

impl Default for SessionSize {
    fn default() -> Self {
        Self { cols: 120, rows: 40 }
    }
}

/// The `Session` data model from §3: attributes of one PTY-wrapped CLI
/// process. Owned exclusively by the backend; every other component holds
/// only the `SessionName` plus a subscription handle.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct Session {
    pub name: SessionName,
    pub working_directory: std::path::PathBuf,
    pub runtime_type: RuntimeType,
    pub role: String,
    pub team_id: Option<String>,
    pub member_id: Option<String>,
    pub created_at: chrono::DateTime<chrono::Utc>,
    #[serde(skip)]
    pub cumulative_output_bytes: std::sync::Arc<std::sync::atomic::AtomicU64>,
}

impl Session {
    pub fn new(
        name: SessionName,
        working_directory: std::path::PathBuf,
        runtime_type: RuntimeType,
        role: impl Into<String>,
        team_id: Option<String>,
        member_id: Option<String>,
    ) -> Self {
        Self {
            name,
            working_directory,
            runtime_type,
            role: role.into(),
            team_id,
            member_id,
            created_at: chrono::Utc::now(),
            cumulative_output_bytes: std::sync::Arc::new(std::sync::atomic::AtomicU64::new(0)),
        }
    }

    pub fn cumulative_output_bytes(&self) -> u64 {
        self.cumulative_output_bytes
            .load(std::sync::atomic::Ordering::Relaxed)
    }

    pub fn add_output_bytes(&self, n: u64) {
        self.cumulative_output_bytes
            .fetch_add(n, std::sync::atomic::Ordering::Relaxed);
    }

    pub fn reset_output_bytes(&self) {
        self.cumulative_output_bytes
            .store(0, std::sync::atomic::Ordering::Relaxed);
    }
}

/// Summary returned by `listSessions`.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct SessionInfo {
    pub name: String,
    pub runtime_type: RuntimeType,
    pub role: String,
    pub created_at: chrono::DateTime<chrono::Utc>,
    pub cumulative_output_bytes: u64,
}

impl From<&Session> for SessionInfo {
    fn from(s: &Session) -> Self {
        Self {
            name: s.name.to_string(),
            runtime_type: s.runtime_type,
            role: s.role.clone(),
            created_at: s.created_at,
            cumulative_output_bytes: s.cumulative_output_bytes(),
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn accepts_valid_names() {
        assert!(SessionName::new("agentmux-orc").is_ok());
        assert!(SessionName::new("dev_1-2").is_ok());
    }

    #[test]
    fn rejects_invalid_names() {
        assert!(SessionName::new("").is_err());
        assert!(SessionName::new("has space").is_err());
        assert!(SessionName::new("slash/name").is_err());
        assert!(SessionName::new(&"x".repeat(101)).is_err());
    }

    #[test]
    fn output_bytes_accumulate_and_reset() {
        let s = Session::new(
            SessionName::new("s1").unwrap(),
            "/tmp".into(),
            RuntimeType::ClaudeCode,
            "developer",
            None,
            None,
        );
        s.add_output_bytes(10);
        s.add_output_bytes(5);
        assert_eq!(s.cumulative_output_bytes(), 15);
        s.reset_output_bytes();
        assert_eq!(s.cumulative_output_bytes(), 0);
    }
}
