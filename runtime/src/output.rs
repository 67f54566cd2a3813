//! Terminal Output Processor (§4.2): turns noisy PTY bytes into cleaned
//! text plus a deduplicated stream of structured [`Marker`]s.

use std::collections::{BTreeMap, VecDeque};
use std::hash::{Hash, Hasher};

use dashmap::DashMap;
use serde_json::Value;

use crate::markers::{patterns, Marker, MarkerPayload, NotifyBody};

/// Bounded per-session rolling buffer cap (§3 `MonitoredSession`).
pub const MAX_BUFFER_SIZE: usize = 64 * 1024;

/// How many recent `(conversationId, normalized-prefix)` hashes are
/// remembered to suppress duplicate marker delivery caused by re-renders.
const DEDUP_WINDOW: usize = 20;

struct SessionState {
    buffer: String,
    recent_hashes: VecDeque<u64>,
}

impl SessionState {
    fn new() -> Self {
        Self {
            buffer: String::new(),
            recent_hashes: VecDeque::with_capacity(DEDUP_WINDOW),
        }
    }

    fn remember(&mut self, hash: u64) -> bool {
        if self.recent_hashes.contains(&hash) {
            return false;
        }
        if self.recent_hashes.len() >= DEDUP_WINDOW {
            self.recent_hashes.pop_front();
        }
        self.recent_hashes.push_back(hash);
        true
    }
}

#[derive(Default)]
pub struct OutputProcessor {
    sessions: DashMap<String, SessionState>,
}

impl OutputProcessor {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn drop_session(&self, session_name: &str) {
        self.sessions.remove(session_name);
    }

    /// Cleans `chunk`, appends it to the session's rolling buffer, and
    /// returns every newly-seen marker. Re-framing invariant: calling this
    /// with `[a, b]` split across two chunks produces the same markers as
    /// calling it once with `a + b` concatenated, because extraction always
    /// re-scans the accumulated buffer rather than the chunk in isolation.
    pub fn process_chunk(&self, session_name: &str, chunk: &[u8]) -> (String, Vec<Marker>) {
        let text = String::from_utf8_lossy(chunk);
        let cleaned = strip_ansi(&text);

        let mut state = self
            .sessions
            .entry(session_name.to_string())
            .or_insert_with(SessionState::new);

        state.buffer.push_str(&cleaned);
        if state.buffer.len() > MAX_BUFFER_SIZE {
            let excess = state.buffer.len() - MAX_BUFFER_SIZE;
            let cut = next_char_boundary(&state.buffer, excess);
            state.buffer.drain(..cut);
        }

        let markers = extract_markers(session_name, &mut state);
        (cleaned, markers)
    }
}

fn next_char_boundary(s: &str, at_least: usize) -> usize {
    let mut idx = at_least.min(s.len());
    while idx < s.len() && !s.is_char_boundary(idx) {
        idx += 1;
    }
    idx
}

/// ANSI/control-character stripping (§4.2 step 1). Cursor-forward escapes
/// and their orphaned literal fragments become a single space so wrapped
/// words don't collide; everything else disappears. Requires at least one
/// digit in CSI-fragment patterns so literal tokens like `[CHAT_RESPONSE]`
/// survive untouched.
pub fn strip_ansi(input: &str) -> String {
    let s = patterns::CURSOR_FORWARD.replace_all(input, " ");
    let s = patterns::OSC.replace_all(&s, "");
    let s = patterns::DCS.replace_all(&s, "");
    let s = patterns::CSI.replace_all(&s, "");
    let s = patterns::ORPHAN_CSI.replace_all(&s, |caps: &regex::Captures| {
        if caps.get(1).map(|m| m.as_str()) == Some("C") {
            " ".to_string()
        } else {
            String::new()
        }
    });

    let s = s.replace("\r\n", "\n").replace('\r', "\n");
    s.chars()
        .filter(|c| *c == '\t' || *c == '\n' || !c.is_control())
        .collect()
}

fn hash_of(parts: (&str, &str)) -> u64 {
    let mut hasher = std::collections::hash_map::DefaultHasher::new();
    parts.0.hash(&mut hasher);
    normalize_whitespace(parts.1).hash(&mut hasher);
    hasher.finish()
}

fn normalize_whitespace(s: &str) -> String {
    s.split_whitespace().collect::<Vec<_>>().join(" ")
}

/// Collapses line-wrap artifacts before parsing JSON payloads so a
/// terminal inserting `\n` mid-string doesn't break the parse (§4.2 step 5).
fn repair_wrapped_json(raw: &str) -> String {
    patterns::WRAP_ARTIFACT.replace_all(raw.trim(), " ").into_owned()
}

fn extract_markers(session_name: &str, state: &mut SessionState) -> Vec<Marker> {
    let mut markers = Vec::new();
    let buffer = state.buffer.clone();

    for caps in patterns::CHAT_RESPONSE.captures_iter(&buffer) {
        let conv = caps.name("conv").map(|m| m.as_str().to_string());
        let content = caps["content"].trim().to_string();
        let dedup_key = conv.clone().unwrap_or_default();
        if state.remember(hash_of((&format!("chat:{dedup_key}"), &content))) {
            markers.push(Marker {
                session_name: session_name.to_string(),
                conversation_id: conv,
                payload: MarkerPayload::ChatResponse { content },
            });
        }
    }

    for caps in patterns::NOTIFY.captures_iter(&buffer) {
        let raw_body = caps["body"].to_string();
        if let Some((conv, body)) = parse_notify_body(&raw_body) {
            if state.remember(hash_of(("notify", &raw_body))) {
                markers.push(Marker {
                    session_name: session_name.to_string(),
                    conversation_id: conv,
                    payload: MarkerPayload::Notify(body),
                });
            }
        }
    }

    for caps in patterns::SLACK_NOTIFY.captures_iter(&buffer) {
        let raw_json = repair_wrapped_json(&caps["json"]);
        if let Ok(json) = serde_json::from_str::<Value>(&raw_json) {
            if state.remember(hash_of(("slack", &raw_json))) {
                markers.push(Marker {
                    session_name: session_name.to_string(),
                    conversation_id: None,
                    payload: MarkerPayload::SlackNotify { json },
                });
            }
        }
    }

    if let Some(percent) = crate::markers::parse_context_percent(&buffer) {
        if state.remember(hash_of(("ctx", &percent.to_string()))) {
            markers.push(Marker {
                session_name: session_name.to_string(),
                conversation_id: None,
                payload: MarkerPayload::ContextUsage { percent },
            });
        }
    }

    markers
}

/// Parses a `[NOTIFY]` body as either JSON or a header-block + markdown
/// body (§4.2, §6), returning the conversation id when present so the
/// caller can route it without re-parsing.
fn parse_notify_body(raw: &str) -> Option<(Option<String>, NotifyBody)> {
    let repaired = repair_wrapped_json(raw);
    if let Ok(json) = serde_json::from_str::<Value>(&repaired) {
        let conv = json
            .get("conversationId")
            .and_then(Value::as_str)
            .map(str::to_string);
        return Some((conv, NotifyBody::Json(json)));
    }

    let trimmed = raw.trim_start_matches('\n');
    let (header_part, body_part) = trimmed.split_once("\n---\n").or_else(|| trimmed.split_once("\r\n---\r\n"))?;

    let mut fields = BTreeMap::new();
    for line in header_part.lines() {
        if let Some((k, v)) = line.split_once(':') {
            fields.insert(k.trim().to_string(), v.trim().to_string());
        }
    }
    let conv = fields.get("conversationId").cloned();
    Some((
        conv,
        NotifyBody::Header {
            fields,
            body: body_part.trim().to_string(),
        },
    ))
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn strips_ansi_and_preserves_marker_tokens() {
        let input = "\x1b[2K\x1b[1G[CHAT_RESPONSE:abc]Hello\x1b[0m[/CHAT_RESPONSE]";
        let cleaned = strip_ansi(input);
        assert!(cleaned.contains("[CHAT_RESPONSE:abc]Hello[/CHAT_RESPONSE]"));
    }

    #[test]
    fn orphan_cursor_forward_becomes_space() {
        let input = "about[1Cyour [CHAT_RESPONSE]m[/CHAT_RESPONSE]";
        let cleaned = strip_ansi(input);
        assert!(cleaned.contains("about your"));
    }

    #[test]
    fn ansi_only_input_cleans_to_empty_or_whitespace() {
        let input = "\x1b[2K\x1b[1G\x1b[0m\x1b[?25l";
        let cleaned = strip_ansi(input);
        assert!(cleaned.trim().is_empty());
    }

    #[test]
    fn extracts_chat_response_marker_from_ansi_noisy_chunk() {
        let processor = OutputProcessor::new();
        let input = b"\x1b[2K\x1b[1G[CHAT_RESPONSE:abc]Hello\x1b[0m[/CHAT_RESPONSE]";
        let (_, markers) = processor.process_chunk("s1", input);
        assert_eq!(markers.len(), 1);
        match &markers[0].payload {
            MarkerPayload::ChatResponse { content } => assert_eq!(content, "Hello"),
            _ => panic!("expected chat response marker"),
        }
        assert_eq!(markers[0].conversation_id.as_deref(), Some("abc"));
    }

    #[test]
    fn extraction_is_reframing_invariant() {
        let whole = b"[CHAT_RESPONSE:c1]one[/CHAT_RESPONSE][CHAT_RESPONSE:c2]two[/CHAT_RESPONSE]";

        let single = OutputProcessor::new();
        let (_, m1) = single.process_chunk("s1", whole);

        let split = OutputProcessor::new();
        let (part_a, part_b) = whole.split_at(30);
        let (_, mut m2) = split.process_chunk("s2", part_a);
        let (_, more) = split.process_chunk("s2", part_b);
        m2.extend(more);

        let contents = |ms: &[Marker]| -> Vec<String> {
            ms.iter()
                .filter_map(|m| match &m.payload {
                    MarkerPayload::ChatResponse { content } => Some(content.clone()),
                    _ => None,
                })
                .collect()
        };
        assert_eq!(contents(&m1), contents(&m2));
    }

    #[test]
    fn dedups_repeated_marker_from_rescan() {
        let processor = OutputProcessor::new();
        let input = b"[CHAT_RESPONSE]hi[/CHAT_RESPONSE]";
        let (_, first) = processor.process_chunk("s1", input);
        let (_, second) = processor.process_chunk("s1", b" ");
        assert_eq!(first.len(), 1);
        assert!(second.is_empty());
    }

    #[test]
    fn notify_header_block_routes_conversation_id() {
        let raw = "\nconversationId: c-1\nchannelId: C7\n---\n## Hi\n";
        let (conv, body) = parse_notify_body(raw).unwrap();
        assert_eq!(conv.as_deref(), Some("c-1"));
        match body {
            NotifyBody::Header { fields, body } => {
                assert_eq!(fields.get("channelId").map(String::as_str), Some("C7"));
                assert_eq!(body, "## Hi");
            }
            _ => panic!("expected header body"),
        }
    }

    #[test]
    fn context_percent_extracted_from_all_accepted_forms() {
        let processor = OutputProcessor::new();
        let (_, m) = processor.process_chunk("s1", b"agent is at 72% context now");
        assert_eq!(m.len(), 1);
        assert!(matches!(
            m[0].payload,
            MarkerPayload::ContextUsage { percent: 72 }
        ));
    }

    #[test]
    fn wrapped_json_slack_notify_parses() {
        let processor = OutputProcessor::new();
        let input = b"[SLACK_NOTIFY]{\"type\":  \n  \"info\", \"message\": \"hi\"}[/SLACK_NOTIFY]";
        let (_, markers) = processor.process_chunk("s1", input);
        assert_eq!(markers.len(), 1);
        assert!(matches!(markers[0].payload, MarkerPayload::SlackNotify { .. }));
    }
}
