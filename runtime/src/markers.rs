//! Structured markers extracted from cleaned terminal output: the
//! `[CHAT_RESPONSE]`, `[NOTIFY]`, `[SLACK_NOTIFY]` and context-usage tokens
//! the runtime abstraction and chat router key off of.

use serde::{Deserialize, Serialize};
use serde_json::Value;

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(tag = "kind", rename_all = "snake_case")]
pub enum MarkerPayload {
    ChatResponse {
        content: String,
    },
    /// `[NOTIFY]` accepts either a JSON body or a `key: value` header block
    /// followed by `---` and a markdown body (§4.2, §6).
    Notify(NotifyBody),
    SlackNotify {
        json: Value,
    },
    ContextUsage {
        percent: u8,
    },
    /// A runtime-specific textual pattern indicating the CLI process has
    /// exited (§4.3); the pattern set itself lives in the runtime profile.
    RuntimeExit,
}

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(untagged)]
pub enum NotifyBody {
    Json(Value),
    Header {
        fields: std::collections::BTreeMap<String, String>,
        body: String,
    },
}

/// One extracted marker, tagged with the session it came from and the
/// conversation id parsed from the marker tag itself (when present).
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct Marker {
    pub session_name: String,
    pub conversation_id: Option<String>,
    pub payload: MarkerPayload,
}

pub(crate) mod patterns {
    use once_cell::sync::Lazy;
    use regex::Regex;

    pub static CHAT_RESPONSE: Lazy<Regex> = Lazy::new(|| {
        Regex::new(r"(?s)\[CHAT_RESPONSE(?::(?P<conv>[^\]]+))?\](?P<content>.*?)\[/CHAT_RESPONSE\]")
            .unwrap()
    });

    pub static NOTIFY: Lazy<Regex> =
        Lazy::new(|| Regex::new(r"(?s)\[NOTIFY\](?P<body>.*?)\[/NOTIFY\]").unwrap());

    pub static SLACK_NOTIFY: Lazy<Regex> =
        Lazy::new(|| Regex::new(r"(?s)\[SLACK_NOTIFY\](?P<json>.*?)\[/SLACK_NOTIFY\]").unwrap());

    /// `<n>% context`, `context: <n>%`, `<n>% ctx` — case-insensitive.
    pub static CONTEXT_USAGE: Lazy<Regex> = Lazy::new(|| {
        Regex::new(r"(?i)(?:(?P<pct1>\d{1,3})\s*%\s*(?:of\s+)?context|context[:\s]+(?P<pct2>\d{1,3})\s*%|(?P<pct3>\d{1,3})\s*%\s*ctx)")
            .unwrap()
    });

    /// Cursor-forward: `ESC[<n>C` with at least one digit, so that literal
    /// tokens like `[CHAT_RESPONSE]` are never mistaken for one (§4.2).
    pub static CURSOR_FORWARD: Lazy<Regex> =
        Lazy::new(|| Regex::new(r"\x1b\[(\d+)C").unwrap());

    /// Orphaned CSI fragments left behind when an ESC byte lands at a
    /// chunk boundary: `[<digits>C`, `[<digits>;<digits>m`, etc. Requires
    /// at least one digit for the same reason as `CURSOR_FORWARD`.
    pub static ORPHAN_CSI: Lazy<Regex> =
        Lazy::new(|| Regex::new(r"\[\d+(?:;\d+)*[A-Za-z]").unwrap());

    pub static CSI: Lazy<Regex> = Lazy::new(|| Regex::new(r"\x1b\[[0-9;?]*[A-Za-z]").unwrap());
    pub static OSC: Lazy<Regex> = Lazy::new(|| Regex::new(r"\x1b\][^\x07\x1b]*(?:\x07|\x1b\\)").unwrap());
    pub static DCS: Lazy<Regex> = Lazy::new(|| Regex::new(r"\x1bP.*?\x1b\\").unwrap());

    /// Collapses line-wrap artifacts (runs of whitespace containing a
    /// newline) inserted mid-string by the terminal, so JSON payloads in
    /// `[NOTIFY]`/`[SLACK_NOTIFY]` survive wrapping (§4.2 step 5).
    pub static WRAP_ARTIFACT: Lazy<Regex> = Lazy::new(|| Regex::new(r"\s{2,}\n\s*").unwrap());
}

/// Scans for the *latest* context-percent occurrence in `text`, not the
/// leftmost: `text` is an ever-growing rolling buffer, so the first match
/// found by `captures()` only ever reflects the oldest reading still in
/// the window, and the monitor would never observe a later transition.
pub fn parse_context_percent(text: &str) -> Option<u8> {
    let caps = patterns::CONTEXT_USAGE.captures_iter(text).last()?;
    let raw = caps
        .name("pct1")
        .or_else(|| caps.name("pct2"))
        .or_else(|| caps.name("pct3"))?
        .as_str();
    raw.parse::<u32>().ok().map(|p| p.min(100) as u8)
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn parses_all_context_percent_forms() {
        assert_eq!(parse_context_percent("72% context"), Some(72));
        assert_eq!(parse_context_percent("context: 88%"), Some(88));
        assert_eq!(parse_context_percent("95% ctx used"), Some(95));
        assert_eq!(parse_context_percent("Context: 10%"), Some(10));
    }

    #[test]
    fn cursor_forward_requires_a_digit() {
        assert!(patterns::CURSOR_FORWARD.is_match("\x1b[5C"));
        assert!(!patterns::CURSOR_FORWARD.is_match("\x1b[C"));
    }
}
