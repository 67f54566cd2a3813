//! End-to-end exit-with-tasks restart (§4.4 steps 1-6): killing a session
//! with in-progress tasks assigned and restarting it re-delivers every
//! task, in order, as its own `[TASK RE-DELIVERY]` block.
//!
//! Requires a real `claude` binary on PATH to spawn the PTY; skipped
//! (rather than failed) when it's unavailable, since this repo doesn't
//! vendor the CLI it orchestrates.

use std::sync::Arc;

use agentfleet::collaborators::{Collaborators, InMemoryTaskTracking, TaskTrackingStatus};
use agentfleet::config::AppConfig;
use agentfleet::errors::RuntimeError;
use agentfleet::registration::{AgentRegistration, CreateAgentSessionOptions};
use fleet_runtime::{RuntimeType, SessionBackend};

fn claude_missing(err: &RuntimeError) -> bool {
    matches!(err, RuntimeError::Session(fleet_runtime::SessionError::Spawn(_)) | RuntimeError::Spawn(_))
}

#[tokio::test]
async fn restart_redelivers_every_in_progress_task_in_order() {
    let backend = Arc::new(SessionBackend::new());
    let task_tracking = Arc::new(InMemoryTaskTracking::default());

    let dir = tempfile::tempdir().expect("tempdir");
    let t1_path = dir.path().join("t1.md");
    let t2_path = dir.path().join("t2.md");
    tokio::fs::write(&t1_path, "work on the login bug").await.unwrap();
    tokio::fs::write(&t2_path, "write the signup test").await.unwrap();

    task_tracking.seed(
        "restart-target",
        vec![
            agentfleet::collaborators::InProgressTask {
                id: "task-1".to_string(),
                assigned_session_name: "restart-target".to_string(),
                task_file_path: t1_path.display().to_string(),
                task_name: "Fix login bug".to_string(),
                status: TaskTrackingStatus::Active,
            },
            agentfleet::collaborators::InProgressTask {
                id: "task-2".to_string(),
                assigned_session_name: "restart-target".to_string(),
                task_file_path: t2_path.display().to_string(),
                task_name: "Write signup test".to_string(),
                status: TaskTrackingStatus::Assigned,
            },
        ],
    );

    let collaborators = Arc::new(Collaborators {
        storage: Arc::new(agentfleet::collaborators::InMemoryStorage::default()),
        task_tracking,
        memory: Arc::new(agentfleet::collaborators::NoopMemory),
        bridges: Arc::new(agentfleet::collaborators::RecordingBridges::default()),
        prompt_template: Arc::new(agentfleet::collaborators::DefaultPromptTemplate),
    });

    let mut config = AppConfig::default();
    config.queue.inter_task_gap_ms = 10;
    config.queue.paste_base_delay_ms = 10;
    config.queue.paste_max_delay_ms = 20;
    let config = Arc::new(config);

    let registration = Arc::new(AgentRegistration::new(backend.clone(), collaborators, config));

    let opts = CreateAgentSessionOptions {
        session_name: "restart-target".to_string(),
        role: "developer".to_string(),
        runtime_type: RuntimeType::ClaudeCode,
        project_path: dir.path().to_path_buf(),
        team_id: None,
        member_id: Some("restart-target".to_string()),
    };

    if let Err(e) = registration.create_agent_session(opts.clone()).await {
        if claude_missing(&e) {
            eprintln!("skipping: no `claude` binary on PATH ({e})");
            return;
        }
        panic!("unexpected error spawning the session under test: {e}");
    }

    // Give the fresh session a moment before restarting it.
    tokio::time::sleep(std::time::Duration::from_millis(300)).await;

    registration
        .restart_with_task_preservation(opts)
        .await
        .expect("restart with task preservation should succeed once the session exists");

    tokio::time::sleep(std::time::Duration::from_millis(500)).await;

    let pane = backend
        .capture_pane("restart-target", 500)
        .await
        .expect("capturing the restarted pane");

    let first = pane.find("Fix login bug").expect("first task re-delivered");
    let second = pane.find("Write signup test").expect("second task re-delivered");
    assert!(first < second, "tasks must be re-delivered in order");
    assert_eq!(pane.matches("[TASK RE-DELIVERY]").count(), 2);

    let _ = backend.kill_session("restart-target");
}
