//! Message Queue & Chat Router (§4.6): delivers user/bridge messages to
//! the orchestrator agent one at a time and routes markers it produces
//! back to the originating conversation.

use std::collections::VecDeque;
use std::sync::Arc;
use std::time::Duration;

use serde::{Deserialize, Serialize};
use serde_json::Value;
use tokio::sync::{broadcast, oneshot, Mutex, Notify};

use fleet_runtime::{Marker, MarkerPayload, NotifyBody};

use crate::collaborators::{BridgeNotification, Collaborators};
use crate::config::QueueConfig;
use crate::errors::ORCHESTRATOR_NOT_RUNNING;
use crate::registration::{AgentRegistration, AgentStatus};

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct SourceMetadata {
    pub channel_id: Option<String>,
    pub thread_ts: Option<String>,
}

/// A message admitted to the queue. `resolve_callback`, when set, is the
/// synchronous Slack/WhatsApp reply path (§4.6 step 6) and is carried
/// out-of-band from the serializable fields via `oneshot`.
pub struct QueuedMessage {
    pub id: String,
    pub content: String,
    pub conversation_id: String,
    pub source: String,
    pub source_metadata: Option<SourceMetadata>,
    pub resolve_callback: Option<oneshot::Sender<String>>,
}

#[derive(Debug, Clone)]
pub struct EnqueueRequest {
    pub content: String,
    pub conversation_id: String,
    pub source: String,
    pub source_metadata: Option<SourceMetadata>,
}

/// A chat message broadcast to the Terminal Gateway once a response
/// resolves or a `[NOTIFY]`/`[SLACK_NOTIFY]` marker routes (§4.6 step 7).
#[derive(Debug, Clone, Serialize)]
pub struct ChatBroadcast {
    pub conversation_id: String,
    pub content: String,
}

struct InFlight {
    id: String,
    conversation_id: String,
    resolve_callback: Option<oneshot::Sender<String>>,
}

struct DispatcherState {
    pending: VecDeque<QueuedMessage>,
    in_flight: Option<InFlight>,
}

/// Owns the FIFO and is the sole consumer of it (§5 shared-resource
/// policy): nothing outside `dispatch_loop` ever pops `pending` or
/// mutates `in_flight`.
pub struct MessageQueue {
    orchestrator_name: String,
    registration: Arc<AgentRegistration>,
    collaborators: Arc<Collaborators>,
    config: Arc<QueueConfig>,
    state: Mutex<DispatcherState>,
    has_work: Notify,
    resolved: Notify,
    chat_tx: broadcast::Sender<ChatBroadcast>,
    active_conversation: Mutex<Option<String>>,
}

impl MessageQueue {
    pub fn new(
        orchestrator_name: impl Into<String>,
        registration: Arc<AgentRegistration>,
        collaborators: Arc<Collaborators>,
        config: Arc<QueueConfig>,
    ) -> Arc<Self> {
        let (chat_tx, _rx) = broadcast::channel(256);
        Arc::new(Self {
            orchestrator_name: orchestrator_name.into(),
            registration,
            collaborators,
            config,
            state: Mutex::new(DispatcherState {
                pending: VecDeque::new(),
                in_flight: None,
            }),
            has_work: Notify::new(),
            resolved: Notify::new(),
            chat_tx,
            active_conversation: Mutex::new(None),
        })
    }

    pub fn subscribe_chat(&self) -> broadcast::Receiver<ChatBroadcast> {
        self.chat_tx.subscribe()
    }

    /// `enqueue` (§4.6): rejected with `OrchestratorNotRunning` unless the
    /// orchestrator session exists; otherwise appended and returns its id.
    pub async fn enqueue(self: &Arc<Self>, req: EnqueueRequest) -> Result<String, String> {
        if self.registration.status(&self.orchestrator_name).is_none() {
            return Err(ORCHESTRATOR_NOT_RUNNING.to_string());
        }

        let id = uuid::Uuid::new_v4().to_string();
        let message = QueuedMessage {
            id: id.clone(),
            content: req.content,
            conversation_id: req.conversation_id,
            source: req.source,
            source_metadata: req.source_metadata,
            resolve_callback: None,
        };
        self.push(message).await;
        Ok(id)
    }

    /// Same as `enqueue` but wires a synchronous resolve callback, used by
    /// bridges that block on the orchestrator's reply (§4.6 step 6).
    pub async fn enqueue_with_callback(
        self: &Arc<Self>,
        req: EnqueueRequest,
    ) -> Result<oneshot::Receiver<String>, String> {
        if self.registration.status(&self.orchestrator_name).is_none() {
            return Err(ORCHESTRATOR_NOT_RUNNING.to_string());
        }
        let (tx, rx) = oneshot::channel();
        let id = uuid::Uuid::new_v4().to_string();
        let message = QueuedMessage {
            id,
            content: req.content,
            conversation_id: req.conversation_id,
            source: req.source,
            source_metadata: req.source_metadata,
            resolve_callback: Some(tx),
        };
        self.push(message).await;
        Ok(rx)
    }

    async fn push(self: &Arc<Self>, message: QueuedMessage) {
        let mut state = self.state.lock().await;
        state.pending.push_back(message);
        drop(state);
        self.has_work.notify_one();
    }

    /// The dispatch loop (§4.6): one message in flight at a time. Runs for
    /// the lifetime of the process; spawn it once in `app.rs`.
    pub async fn dispatch_loop(self: Arc<Self>) {
        loop {
            // Step 1: wait for the orchestrator to be active.
            while !matches!(self.registration.status(&self.orchestrator_name), Some(AgentStatus::Active)) {
                tokio::time::sleep(Duration::from_millis(200)).await;
            }

            // Step 2: dequeue head, mark in-flight.
            let mut message = loop {
                let mut state = self.state.lock().await;
                if let Some(m) = state.pending.pop_front() {
                    break m;
                }
                drop(state);
                self.has_work.notified().await;
            };

            let conversation_id = message.conversation_id.clone();
            *self.active_conversation.lock().await = Some(conversation_id.clone());

            // Carry the caller's resolve callback into the in-flight record
            // itself: it is `route_chat_response`'s job to fire it with the
            // actual response text once a matching marker arrives, not the
            // dispatcher's.
            let resolve_callback = message.resolve_callback.take();
            {
                let mut state = self.state.lock().await;
                state.in_flight = Some(InFlight {
                    id: message.id.clone(),
                    conversation_id: conversation_id.clone(),
                    resolve_callback,
                });
            }

            // Step 3: paste-safe write to the orchestrator PTY.
            let write_result = self
                .registration
                .write_paste_safe(&self.orchestrator_name, &message.content)
                .await;
            if let Err(e) = write_result {
                let callback = {
                    let mut state = self.state.lock().await;
                    state.in_flight.take().and_then(|f| f.resolve_callback)
                };
                self.resolve(ORCHESTRATOR_NOT_RUNNING.to_string(), callback).await;
                tracing::warn!(error = %e, "queue dispatch write failed");
                continue;
            }

            // Steps 4-5: wait for resolution or timeout.
            let deadline = Duration::from_millis(self.config.default_message_timeout_ms + self.config.timeout_grace_ms);
            let resolution = tokio::time::timeout(deadline, self.resolved.notified()).await;

            // Step 6-7: on a timeout, resolve with the uniform timeout
            // message ourselves; on a genuine resolution,
            // `route_chat_response` has already taken the in-flight record
            // and fired the callback with the real response text.
            if resolution.is_err() {
                let callback = {
                    let mut state = self.state.lock().await;
                    state.in_flight.take().and_then(|f| f.resolve_callback)
                };
                self.resolve(crate::errors::ORCHESTRATOR_SLOW.to_string(), callback).await;
            }
        }
    }

    async fn resolve(&self, text: String, callback: Option<oneshot::Sender<String>>) {
        if let Some(tx) = callback {
            let _ = tx.send(text);
        }
    }

    /// Marker routing table (§4.6): called by the orchestrator session's
    /// `onData` consumer loop for every marker the Output Processor
    /// extracts, in addition to the Exit/Context monitors observing the
    /// same stream independently.
    pub async fn route_marker(self: &Arc<Self>, marker: Marker) {
        match marker.payload {
            MarkerPayload::ChatResponse { content } => {
                self.route_chat_response(marker.conversation_id, content).await;
            }
            MarkerPayload::Notify(body) => {
                self.route_notify(marker.conversation_id, body).await;
            }
            MarkerPayload::SlackNotify { json } => {
                self.route_slack_notify(json).await;
            }
            MarkerPayload::ContextUsage { .. } | MarkerPayload::RuntimeExit => {}
        }
    }

    async fn route_chat_response(self: &Arc<Self>, conv_id: Option<String>, content: String) {
        let active = self.active_conversation.lock().await.clone();
        let target = conv_id.clone().or(active);
        let Some(target) = target else { return };

        let mut state = self.state.lock().await;
        let advances = matches!(&state.in_flight, Some(f) if conv_id.as_deref().map(|c| c == f.conversation_id).unwrap_or(true));
        let callback = if advances {
            state.in_flight.take().and_then(|f| f.resolve_callback)
        } else {
            None
        };
        drop(state);

        if advances {
            self.resolved.notify_one();
        }
        if let Some(tx) = callback {
            let _ = tx.send(content.clone());
        }

        let _ = self.chat_tx.send(ChatBroadcast {
            conversation_id: target,
            content,
        });
    }

    async fn route_notify(self: &Arc<Self>, _conv_id: Option<String>, body: NotifyBody) {
        let (fields, message) = match body {
            NotifyBody::Json(v) => (json_object_to_fields(&v), json_field(&v, "message")),
            NotifyBody::Header { fields, body } => (fields, body),
        };

        let conversation_id = fields.get("conversationId").cloned();
        let channel_id = fields.get("channelId").cloned();

        // A `channelId` means the Slack bridge's own skill already sends
        // the message, so the core only acknowledges delivery and never
        // calls `send_notification` itself — independent of whether a
        // conversation broadcast also happens below.
        if let Some(channel) = &channel_id {
            let thread_ts = fields.get("threadTs").cloned();
            let _ = self
                .collaborators
                .bridges
                .mark_delivered_by_skill(channel, thread_ts.as_deref())
                .await;
        }

        if let Some(conv) = conversation_id {
            let _ = self.chat_tx.send(ChatBroadcast {
                conversation_id: conv,
                content: message,
            });
        }

        // Typed event with neither conversationId nor channelId: dropped
        // (§4.6 routing table).
    }

    async fn route_slack_notify(&self, json: Value) {
        let notification = BridgeNotification {
            notification_type: json_field_opt(&json, "type"),
            title: json_field_opt(&json, "title"),
            message: json_field(&json, "message"),
            urgency: json_field_opt(&json, "urgency"),
        };
        let _ = self.collaborators.bridges.send_notification(notification).await;
    }

    /// Purge on orchestrator termination (§4.6 invariants): resolve every
    /// pending and in-flight message with the uniform error.
    pub async fn purge(&self) {
        let mut state = self.state.lock().await;
        let drained: Vec<QueuedMessage> = state.pending.drain(..).collect();
        let in_flight_cb = state.in_flight.take().and_then(|f| f.resolve_callback);
        drop(state);

        if let Some(tx) = in_flight_cb {
            let _ = tx.send(ORCHESTRATOR_NOT_RUNNING.to_string());
        }
        for message in drained {
            if let Some(tx) = message.resolve_callback {
                let _ = tx.send(ORCHESTRATOR_NOT_RUNNING.to_string());
            }
        }
    }

    pub async fn pending_len(&self) -> usize {
        self.state.lock().await.pending.len()
    }
}

fn json_field(v: &Value, key: &str) -> String {
    v.get(key).and_then(Value::as_str).unwrap_or_default().to_string()
}

fn json_field_opt(v: &Value, key: &str) -> Option<String> {
    v.get(key).and_then(Value::as_str).map(str::to_string)
}

fn json_object_to_fields(v: &Value) -> std::collections::BTreeMap<String, String> {
    let mut fields = std::collections::BTreeMap::new();
    for key in ["conversationId", "channelId", "threadTs"] {
        if let Some(val) = v.get(key).and_then(Value::as_str) {
            fields.insert(key.to_string(), val.to_string());
        }
    }
    fields
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::collaborators::Collaborators;
    use crate::config::AppConfig;
    use fleet_runtime::SessionBackend;

    fn test_queue() -> Arc<MessageQueue> {
        let backend = Arc::new(SessionBackend::new());
        let collaborators = Arc::new(Collaborators::in_memory());
        let app_config = Arc::new(AppConfig::default());
        let registration = Arc::new(AgentRegistration::new(backend, collaborators.clone(), app_config.clone()));
        MessageQueue::new("orc", registration, collaborators, Arc::new(app_config.queue.clone()))
    }

    #[tokio::test]
    async fn enqueue_rejected_when_orchestrator_missing() {
        let queue = test_queue();
        let result = queue
            .enqueue(EnqueueRequest {
                content: "hello".to_string(),
                conversation_id: "c1".to_string(),
                source: "web".to_string(),
                source_metadata: None,
            })
            .await;
        assert_eq!(result, Err(ORCHESTRATOR_NOT_RUNNING.to_string()));
    }

    #[tokio::test]
    async fn purge_resolves_pending_with_uniform_error() {
        let queue = test_queue();
        let (tx, rx) = oneshot::channel();
        queue
            .push(QueuedMessage {
                id: "m1".to_string(),
                content: "hi".to_string(),
                conversation_id: "c1".to_string(),
                source: "web".to_string(),
                source_metadata: None,
                resolve_callback: Some(tx),
            })
            .await;
        queue.purge().await;
        assert_eq!(rx.await.unwrap(), ORCHESTRATOR_NOT_RUNNING);
        assert_eq!(queue.pending_len().await, 0);
    }

    #[tokio::test]
    async fn notify_with_conversation_id_broadcasts_to_that_conversation() {
        let queue = test_queue();
        let mut chat_rx = queue.subscribe_chat();
        let body = NotifyBody::Header {
            fields: [("conversationId".to_string(), "c-9".to_string())].into_iter().collect(),
            body: "hello from notify".to_string(),
        };
        queue.route_notify(None, body).await;
        let broadcast = chat_rx.try_recv().expect("expected a broadcast");
        assert_eq!(broadcast.conversation_id, "c-9");
        assert_eq!(broadcast.content, "hello from notify");
    }

    #[tokio::test]
    async fn notify_with_channel_only_marks_delivered_by_skill_without_broadcast() {
        let queue = test_queue();
        let mut chat_rx = queue.subscribe_chat();
        let body = NotifyBody::Header {
            fields: [("channelId".to_string(), "C1".to_string())].into_iter().collect(),
            body: "hi".to_string(),
        };
        queue.route_notify(None, body).await;
        assert!(chat_rx.try_recv().is_err());
    }
}
