//! End-to-end NOTIFY header+body routing: a single marker with both
//! `conversationId` and `channelId` present broadcasts to the
//! conversation AND tells the Slack bridge it was delivered by skill,
//! without the bridge ever being asked to send anything itself.

use std::sync::Arc;

use agentfleet::collaborators::{Collaborators, DefaultPromptTemplate, InMemoryStorage, InMemoryTaskTracking, NoopMemory, RecordingBridges};
use agentfleet::config::AppConfig;
use agentfleet::queue::MessageQueue;
use agentfleet::registration::AgentRegistration;
use fleet_runtime::{Marker, MarkerPayload, OutputProcessor, SessionBackend};

fn test_queue() -> (Arc<MessageQueue>, Arc<RecordingBridges>) {
    let backend = Arc::new(SessionBackend::new());
    let bridges = Arc::new(RecordingBridges::default());
    let collaborators = Arc::new(Collaborators {
        storage: Arc::new(InMemoryStorage::default()),
        task_tracking: Arc::new(InMemoryTaskTracking::default()),
        memory: Arc::new(NoopMemory),
        bridges: bridges.clone(),
        prompt_template: Arc::new(DefaultPromptTemplate),
    });
    let config = Arc::new(AppConfig::default());
    let registration = Arc::new(AgentRegistration::new(backend, collaborators.clone(), config.clone()));
    let queue = MessageQueue::new("agentfleet-orc", registration, collaborators, Arc::new(config.queue.clone()));
    (queue, bridges)
}

#[tokio::test]
async fn notify_header_and_body_routes_to_conversation_and_marks_delivered_by_skill() {
    let (queue, bridges) = test_queue();
    let mut chat_rx = queue.subscribe_chat();

    let raw = "[NOTIFY]\nconversationId: c-1\nchannelId: C7\n---\n## Hi\n[/NOTIFY]";
    let processor = OutputProcessor::new();
    let (_, markers) = processor.process_chunk("agent-1", raw.as_bytes());
    assert_eq!(markers.len(), 1);

    let marker: Marker = markers.into_iter().next().unwrap();
    assert!(matches!(&marker.payload, MarkerPayload::Notify(_)));

    queue.route_marker(marker).await;

    let broadcast = chat_rx.try_recv().expect("expected a chat broadcast");
    assert_eq!(broadcast.conversation_id, "c-1");
    assert_eq!(broadcast.content, "## Hi");

    let delivered = bridges.delivered_by_skill.lock().unwrap();
    assert_eq!(delivered.as_slice(), [("C7".to_string(), None)]);
    assert!(bridges.notifications.lock().unwrap().is_empty());
}
