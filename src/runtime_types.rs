//! Per-runtime-type launch/behavior profiles (§6 "runtime abstraction").
//! Grounded on the teacher's Claude CLI spawn helpers (`--session-id` to
//! start resumable, `--resume` to resume) and generalized to the three
//! runtime families the orchestrator targets.

use once_cell::sync::Lazy;
use regex::Regex;

use fleet_runtime::RuntimeType;

/// `Enter = \r`, `Escape = \x1b`, `Ctrl-C = \x03` (§6).
pub struct SendKeyEncoding;

impl SendKeyEncoding {
    pub const ENTER: &'static [u8] = b"\r";
    pub const ESCAPE: &'static [u8] = b"\x1b";
    pub const CTRL_C: &'static [u8] = b"\x03";
}

pub struct RuntimeProfile {
    pub runtime_type: RuntimeType,
    pub launch_command: &'static str,
    pub launch_args: fn(session_name: &str, resume_id: Option<&str>) -> Vec<String>,
    pub compact_command: Option<&'static [u8]>,
    pub ready_patterns: &'static [&'static Lazy<Regex>],
    pub exit_patterns: &'static [&'static Lazy<Regex>],
    /// Whether this runtime honors a pre-seeded resume identifier across a
    /// restart. Runtimes that don't must never have resume-implying UX
    /// text surfaced for them (§9 Open Question 3).
    pub resume_capable: bool,
}

static CLAUDE_READY: Lazy<Regex> = Lazy::new(|| Regex::new(r"(?i)Welcome to Claude Code").unwrap());
static CLAUDE_PROMPT: Lazy<Regex> = Lazy::new(|| Regex::new(r"\n>\s*$").unwrap());
static CLAUDE_EXIT: Lazy<Regex> =
    Lazy::new(|| Regex::new(r"(?i)(claude code session ended|goodbye)").unwrap());

static GEMINI_READY: Lazy<Regex> = Lazy::new(|| Regex::new(r"(?i)Gemini CLI ready").unwrap());
static GEMINI_EXIT: Lazy<Regex> = Lazy::new(|| Regex::new(r"(?i)session closed").unwrap());

static CODEX_READY: Lazy<Regex> = Lazy::new(|| Regex::new(r"(?i)codex>").unwrap());
static CODEX_EXIT: Lazy<Regex> = Lazy::new(|| Regex::new(r"(?i)(exiting codex|session terminated)").unwrap());

static CLAUDE_READY_PATTERNS: [&Lazy<Regex>; 2] = [&CLAUDE_READY, &CLAUDE_PROMPT];
static CLAUDE_EXIT_PATTERNS: [&Lazy<Regex>; 1] = [&CLAUDE_EXIT];
static GEMINI_READY_PATTERNS: [&Lazy<Regex>; 1] = [&GEMINI_READY];
static GEMINI_EXIT_PATTERNS: [&Lazy<Regex>; 1] = [&GEMINI_EXIT];
static CODEX_READY_PATTERNS: [&Lazy<Regex>; 1] = [&CODEX_READY];
static CODEX_EXIT_PATTERNS: [&Lazy<Regex>; 1] = [&CODEX_EXIT];

/// Common shell-prompt regexes used by the Exit Monitor's confirmation
/// check (§4.3): after an exit pattern matches, the pane must also show a
/// bare shell prompt before exit is confirmed.
pub static SHELL_PROMPTS: Lazy<[Regex; 3]> = Lazy::new(|| {
    [
        Regex::new(r"\$\s*$").unwrap(),
        Regex::new(r"%\s*$").unwrap(),
        Regex::new(r"#\s*$").unwrap(),
    ]
});

fn claude_launch_args(session_name: &str, resume_id: Option<&str>) -> Vec<String> {
    match resume_id {
        Some(id) => vec!["--resume".to_string(), id.to_string()],
        None => vec!["--session-id".to_string(), session_name.to_string()],
    }
}

fn gemini_launch_args(_session_name: &str, _resume_id: Option<&str>) -> Vec<String> {
    Vec::new()
}

fn codex_launch_args(_session_name: &str, _resume_id: Option<&str>) -> Vec<String> {
    Vec::new()
}

pub fn profile_for(runtime_type: RuntimeType) -> RuntimeProfile {
    match runtime_type {
        RuntimeType::ClaudeCode => RuntimeProfile {
            runtime_type,
            launch_command: "claude",
            launch_args: claude_launch_args,
            compact_command: Some(b"/compact"),
            ready_patterns: &CLAUDE_READY_PATTERNS,
            exit_patterns: &CLAUDE_EXIT_PATTERNS,
            resume_capable: true,
        },
        RuntimeType::GeminiCli => RuntimeProfile {
            runtime_type,
            launch_command: "gemini",
            launch_args: gemini_launch_args,
            compact_command: Some(b"/compress"),
            ready_patterns: &GEMINI_READY_PATTERNS,
            exit_patterns: &GEMINI_EXIT_PATTERNS,
            resume_capable: false,
        },
        RuntimeType::CodexCli => RuntimeProfile {
            runtime_type,
            launch_command: "codex",
            launch_args: codex_launch_args,
            compact_command: None,
            ready_patterns: &CODEX_READY_PATTERNS,
            exit_patterns: &CODEX_EXIT_PATTERNS,
            resume_capable: false,
        },
    }
}

pub fn matches_any(patterns: &[&Lazy<Regex>], text: &str) -> bool {
    patterns.iter().any(|p| p.is_match(text))
}

pub fn shell_prompt_visible(text: &str) -> bool {
    SHELL_PROMPTS.iter().any(|p| p.is_match(text))
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn claude_resumes_with_resume_flag_when_identifier_present() {
        let args = claude_launch_args("s1", Some("conv-123"));
        assert_eq!(args, vec!["--resume".to_string(), "conv-123".to_string()]);
    }

    #[test]
    fn claude_starts_resumable_without_prior_identifier() {
        let args = claude_launch_args("s1", None);
        assert_eq!(args, vec!["--session-id".to_string(), "s1".to_string()]);
    }

    #[test]
    fn non_resume_capable_runtimes_ignore_resume_id() {
        let profile = profile_for(RuntimeType::GeminiCli);
        assert!(!profile.resume_capable);
        let args = (profile.launch_args)("s1", Some("whatever"));
        assert!(args.is_empty());
    }
}
