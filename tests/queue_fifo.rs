//! End-to-end Message Queue FIFO dispatch: messages enqueued while one is
//! already in flight wait their turn, and each is written to the
//! orchestrator PTY in order, not before the previous one resolves.

use std::sync::Arc;
use std::time::Duration;

use agentfleet::collaborators::Collaborators;
use agentfleet::config::AppConfig;
use agentfleet::queue::{EnqueueRequest, MessageQueue};
use agentfleet::registration::AgentRegistration;
use fleet_runtime::{CreateSessionOptions, Marker, MarkerPayload, RuntimeType, SessionBackend, SessionSize};

async fn spawn_cat_orchestrator() -> (Arc<SessionBackend>, Arc<AgentRegistration>) {
    let backend = Arc::new(SessionBackend::new());
    let collaborators = Arc::new(Collaborators::in_memory());
    let config = Arc::new(AppConfig::default());
    let registration = Arc::new(AgentRegistration::new(backend.clone(), collaborators, config));

    backend
        .create_session(
            "agentfleet-orc",
            std::env::temp_dir(),
            CreateSessionOptions {
                runtime_type: RuntimeType::ClaudeCode,
                command: "cat".to_string(),
                args: vec![],
                env: vec![],
                role: "orchestrator".to_string(),
                team_id: None,
                member_id: None,
                size: SessionSize::default(),
                allow_headless_fallback: true,
            },
        )
        .await
        .expect("spawning /bin/cat as an orchestrator stand-in");

    registration.mark_active("agentfleet-orc").await;
    (backend, registration)
}

#[tokio::test]
async fn fifo_dispatch_holds_later_messages_until_the_head_resolves() {
    let (backend, registration) = spawn_cat_orchestrator().await;
    let config = Arc::new(AppConfig::default().queue);
    let collaborators = Arc::new(Collaborators::in_memory());
    let queue = MessageQueue::new("agentfleet-orc", registration.clone(), collaborators, config);

    let mut sub = backend.on_data("agentfleet-orc").expect("subscribing to orchestrator output");

    let id1 = queue
        .enqueue(EnqueueRequest {
            content: "first".to_string(),
            conversation_id: "c1".to_string(),
            source: "test".to_string(),
            source_metadata: None,
        })
        .await
        .expect("enqueue should admit while orchestrator is active");
    let _id2 = queue
        .enqueue(EnqueueRequest {
            content: "second".to_string(),
            conversation_id: "c2".to_string(),
            source: "test".to_string(),
            source_metadata: None,
        })
        .await
        .unwrap();
    let _id3 = queue
        .enqueue(EnqueueRequest {
            content: "third".to_string(),
            conversation_id: "c3".to_string(),
            source: "test".to_string(),
            source_metadata: None,
        })
        .await
        .unwrap();

    tokio::spawn(queue.clone().dispatch_loop());

    // "cat" echoes whatever the dispatcher writes straight back out; the
    // first chunk observed on the PTY must be the head message's content.
    let (chunk, _dropped) = tokio::time::timeout(Duration::from_secs(5), sub.recv())
        .await
        .expect("timed out waiting for the dispatcher's first write")
        .expect("subscription closed unexpectedly");
    assert!(String::from_utf8_lossy(&chunk).contains("first"));

    // M2/M3 are still queued: the dispatcher has not advanced past M1.
    assert_eq!(queue.pending_len().await, 2);

    // Resolve M1 via the legacy (no convId) CHAT_RESPONSE path.
    queue
        .route_marker(Marker {
            session_name: "agentfleet-orc".to_string(),
            conversation_id: None,
            payload: MarkerPayload::ChatResponse {
                content: "reply to first".to_string(),
            },
        })
        .await;

    let (chunk, _dropped) = tokio::time::timeout(Duration::from_secs(5), sub.recv())
        .await
        .expect("timed out waiting for the dispatcher's second write")
        .expect("subscription closed unexpectedly");
    assert!(String::from_utf8_lossy(&chunk).contains("second"));

    let _ = id1;
}
