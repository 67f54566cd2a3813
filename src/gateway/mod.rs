//! Terminal Gateway (§4.7): exposes each session's stream and status to
//! subscribed WebSocket clients, and carries the chat/notification
//! broadcasts the Message Queue produces.

use std::collections::HashMap;
use std::sync::Arc;

use axum::extract::ws::{Message, WebSocket, WebSocketUpgrade};
use axum::extract::State;
use axum::response::IntoResponse;
use axum::routing::get;
use axum::Router;
use futures_util::{SinkExt, StreamExt};
use serde::{Deserialize, Serialize};
use tokio::sync::{broadcast, Mutex};
use tower_http::cors::CorsLayer;

use fleet_runtime::{OutputProcessor, SessionBackend};

use crate::config::GatewayConfig;
use crate::queue::{ChatBroadcast, EnqueueRequest, MessageQueue};
use crate::registration::{AgentRegistration, RegistrationEvent};

/// Status broadcasts published to the global namespace (§4.7 Behavior).
#[derive(Debug, Clone, Serialize)]
#[serde(tag = "type", rename_all = "snake_case")]
pub enum StatusEvent {
    OrchestratorStatusChanged { running: bool },
    TeamMemberStatusChanged { session_name: String, status: String },
    TeamActivityUpdated { session_name: String },
    ContextWindowStatus { session_name: String, level: String, percent: u8 },
}

/// Client -> server commands (§4.7 Client commands).
#[derive(Debug, Deserialize)]
#[serde(tag = "command", rename_all = "snake_case")]
enum ClientCommand {
    SubscribeToSession { name: String },
    UnsubscribeFromSession { name: String },
    SendInput { name: String, bytes: String },
    TerminalResize { name: String, cols: u16, rows: u16 },
    SubscribeToChat { conv_id: Option<String> },
    UnsubscribeFromChat { conv_id: Option<String> },
    ChatTyping { conv_id: Option<String> },
}

/// Server -> client envelope: `{type, payload, timestamp}` (§6).
#[derive(Debug, Serialize)]
struct Envelope<T: Serialize> {
    #[serde(rename = "type")]
    kind: &'static str,
    payload: T,
    timestamp: String,
}

impl<T: Serialize> Envelope<T> {
    fn new(kind: &'static str, payload: T) -> Self {
        Self {
            kind,
            payload,
            timestamp: chrono::Utc::now().to_rfc3339(),
        }
    }
}

/// Escape sequences the gateway refuses to forward from a client's raw
/// `send_input` (§4.7 Behavior): OSC, DCS, and cursor-manipulation CSI.
fn validate_input(bytes: &[u8]) -> bool {
    if bytes.contains(&0) {
        return false;
    }
    let text = String::from_utf8_lossy(bytes);
    if text.contains("\x1b]") || text.contains("\x1bP") {
        return false;
    }
    // Cursor-manipulation CSI final bytes: A/B/C/D (move), H/f (position).
    let mut chars = text.char_indices().peekable();
    while let Some((i, c)) = chars.next() {
        if c == '\x1b' && text.as_bytes().get(i + 1) == Some(&b'[') {
            if let Some(end) = text[i + 2..].find(|c: char| c.is_ascii_alphabetic()) {
                let final_byte = text.as_bytes()[i + 2 + end];
                if matches!(final_byte, b'A' | b'B' | b'C' | b'D' | b'H' | b'f') {
                    return false;
                }
            }
        }
    }
    true
}

#[derive(Clone)]
pub struct GatewayState {
    backend: Arc<SessionBackend>,
    registration: Arc<AgentRegistration>,
    queue: Arc<MessageQueue>,
    status_tx: broadcast::Sender<StatusEvent>,
}

impl GatewayState {
    pub fn new(backend: Arc<SessionBackend>, registration: Arc<AgentRegistration>, queue: Arc<MessageQueue>) -> Self {
        let (status_tx, _rx) = broadcast::channel(256);
        Self {
            backend,
            registration,
            queue,
            status_tx,
        }
    }

    pub fn subscribe_status(&self) -> broadcast::Receiver<StatusEvent> {
        self.status_tx.subscribe()
    }

    pub fn publish_status(&self, event: StatusEvent) {
        let _ = self.status_tx.send(event);
    }

    /// Forwards registration lifecycle events onto the status bus; spawn
    /// this once alongside the registration component.
    pub async fn forward_registration_events(self, mut events: broadcast::Receiver<RegistrationEvent>) {
        while let Ok(event) = events.recv().await {
            let status = match event {
                RegistrationEvent::Activated { session_name } => StatusEvent::TeamMemberStatusChanged {
                    session_name,
                    status: "active".to_string(),
                },
                RegistrationEvent::Created { session_name, .. } => StatusEvent::TeamMemberStatusChanged {
                    session_name,
                    status: "activating".to_string(),
                },
                RegistrationEvent::Error { session_name, .. } => StatusEvent::TeamMemberStatusChanged {
                    session_name,
                    status: "error".to_string(),
                },
                RegistrationEvent::Terminated { session_name } => StatusEvent::TeamMemberStatusChanged {
                    session_name,
                    status: "inactive".to_string(),
                },
                RegistrationEvent::Restarted { session_name } => {
                    StatusEvent::TeamActivityUpdated { session_name }
                }
            };
            self.publish_status(status);
        }
    }
}

pub fn router(state: GatewayState, _config: &GatewayConfig) -> Router {
    Router::new()
        .route("/ws/terminal/:name", get(terminal_ws))
        .route("/ws/events", get(events_ws))
        .with_state(state)
        .layer(CorsLayer::permissive())
}

async fn terminal_ws(
    axum::extract::Path(name): axum::extract::Path<String>,
    State(state): State<GatewayState>,
    ws: WebSocketUpgrade,
) -> impl IntoResponse {
    ws.on_upgrade(move |socket| handle_terminal_socket(socket, state, name))
}

/// Per-session terminal room (`terminal_<name>`, §4.7 Rooms). First
/// subscriber drives the backend `onData` subscription directly; last
/// disconnect tears it down with the socket itself, matching the single
/// always-on subscription the first-subscriber rule describes.
async fn handle_terminal_socket(socket: WebSocket, state: GatewayState, session_name: String) {
    let mut sub = match state.backend.on_data(&session_name) {
        Ok(s) => s,
        Err(e) => {
            tracing::warn!(session = %session_name, error = %e, "terminal ws: no such session");
            return;
        }
    };

    let (mut ws_sink, mut ws_stream) = socket.split();
    let processor = OutputProcessor::new();
    let outbound_cap = 256usize;
    let mut pending = 0usize;

    loop {
        tokio::select! {
            data = sub.recv() => {
                let Some((chunk, dropped)) = data else { break };
                if dropped > 0 {
                    tracing::warn!(session = %session_name, dropped, "terminal ws subscriber lagged");
                }
                let (cleaned, _markers) = processor.process_chunk(&session_name, &chunk);
                pending += 1;
                if pending > outbound_cap {
                    tracing::warn!(session = %session_name, "terminal ws backpressure exceeded, disconnecting");
                    let _ = ws_sink.send(Message::Close(None)).await;
                    break;
                }
                if ws_sink.send(Message::Text(cleaned)).await.is_err() {
                    break;
                }
                pending = pending.saturating_sub(1);
            }
            msg = ws_stream.next() => {
                let Some(Ok(msg)) = msg else { break };
                if !handle_client_command(&state, &session_name, msg).await {
                    break;
                }
            }
        }
    }
}

async fn handle_client_command(state: &GatewayState, session_name: &str, msg: Message) -> bool {
    let text = match msg {
        Message::Text(t) => t,
        Message::Close(_) => return false,
        Message::Binary(bytes) => {
            if !validate_input(&bytes) {
                return true;
            }
            let _ = state.backend.write(session_name, &bytes);
            return true;
        }
        _ => return true,
    };

    let Ok(command) = serde_json::from_str::<ClientCommand>(&text) else {
        return true;
    };

    match command {
        ClientCommand::SendInput { bytes, .. } => {
            if validate_input(bytes.as_bytes()) {
                let _ = state.backend.write(session_name, bytes.as_bytes());
            }
        }
        ClientCommand::TerminalResize { cols, rows, .. } => {
            let _ = state.backend.resize(session_name, cols, rows);
        }
        ClientCommand::SubscribeToSession { .. } | ClientCommand::UnsubscribeFromSession { .. } => {
            // Handled implicitly: the socket's own connection IS the
            // session subscription in this 1-socket-per-session model.
        }
        ClientCommand::SubscribeToChat { .. }
        | ClientCommand::UnsubscribeFromChat { .. }
        | ClientCommand::ChatTyping { .. } => {
            // Chat commands arrive on the events socket, not here.
        }
    }
    true
}

async fn events_ws(State(state): State<GatewayState>, ws: WebSocketUpgrade) -> impl IntoResponse {
    ws.on_upgrade(move |socket| handle_events_socket(socket, state))
}

/// Global `chat` room plus per-conversation `chat_<convId>` rooms and the
/// status broadcasts (§4.7 Behavior), multiplexed onto one socket.
async fn handle_events_socket(socket: WebSocket, state: GatewayState) {
    let (mut ws_sink, mut ws_stream) = socket.split();
    let mut chat_rx = state.queue.subscribe_chat();
    let mut status_rx = state.subscribe_status();
    let subscribed_convs: Arc<Mutex<HashMap<String, bool>>> = Arc::new(Mutex::new(HashMap::new()));

    loop {
        tokio::select! {
            chat = chat_rx.recv() => {
                let Ok(chat) = chat else { break };
                if !should_forward(&subscribed_convs, &chat).await {
                    continue;
                }
                let envelope = Envelope::new("chat_message", chat);
                let Ok(json) = serde_json::to_string(&envelope) else { continue };
                if ws_sink.send(Message::Text(json)).await.is_err() {
                    break;
                }
            }
            status = status_rx.recv() => {
                let Ok(status) = status else { break };
                let envelope = Envelope::new(status_kind(&status), status);
                let Ok(json) = serde_json::to_string(&envelope) else { continue };
                if ws_sink.send(Message::Text(json)).await.is_err() {
                    break;
                }
            }
            msg = ws_stream.next() => {
                let Some(Ok(msg)) = msg else { break };
                if !handle_events_command(&state, &subscribed_convs, msg).await {
                    break;
                }
            }
        }
    }
}

async fn should_forward(subscribed: &Arc<Mutex<HashMap<String, bool>>>, chat: &ChatBroadcast) -> bool {
    let map = subscribed.lock().await;
    map.is_empty() || map.contains_key(&chat.conversation_id)
}

fn status_kind(event: &StatusEvent) -> &'static str {
    match event {
        StatusEvent::OrchestratorStatusChanged { .. } => "orchestrator_status_changed",
        StatusEvent::TeamMemberStatusChanged { .. } => "team_member_status_changed",
        StatusEvent::TeamActivityUpdated { .. } => "team_activity_updated",
        StatusEvent::ContextWindowStatus { .. } => "context_window_status",
    }
}

async fn handle_events_command(
    state: &GatewayState,
    subscribed: &Arc<Mutex<HashMap<String, bool>>>,
    msg: Message,
) -> bool {
    let Message::Text(text) = msg else {
        return !matches!(msg, Message::Close(_));
    };
    let Ok(command) = serde_json::from_str::<ClientCommand>(&text) else {
        return true;
    };

    match command {
        ClientCommand::SubscribeToChat { conv_id: Some(id) } => {
            subscribed.lock().await.insert(id, true);
        }
        ClientCommand::SubscribeToChat { conv_id: None } => {
            subscribed.lock().await.clear();
        }
        ClientCommand::UnsubscribeFromChat { conv_id: Some(id) } => {
            subscribed.lock().await.remove(&id);
        }
        ClientCommand::UnsubscribeFromChat { conv_id: None } => {
            subscribed.lock().await.clear();
        }
        ClientCommand::ChatTyping { .. } => {}
        _ => {}
    }
    true
}

/// Bridge exposed for an HTTP-path enqueue (not WebSocket), reusing the
/// same `MessageQueue` the gateway's chat room drains into.
pub async fn enqueue_chat_message(queue: &Arc<MessageQueue>, req: EnqueueRequest) -> Result<String, String> {
    queue.enqueue(req).await
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn rejects_null_bytes() {
        assert!(!validate_input(b"hello\0world"));
    }

    #[test]
    fn rejects_osc_and_dcs_sequences() {
        assert!(!validate_input(b"\x1b]0;title\x07"));
        assert!(!validate_input(b"\x1bPq...\x1b\\"));
    }

    #[test]
    fn rejects_cursor_manipulation_csi() {
        assert!(!validate_input(b"\x1b[10C"));
        assert!(!validate_input(b"\x1b[2;5H"));
    }

    #[test]
    fn allows_plain_text_and_color_codes() {
        assert!(validate_input(b"ls -la\r"));
        assert!(validate_input(b"\x1b[31mred\x1b[0m"));
    }
}
