//! External collaborator interfaces (§6). These are explicitly out of
//! scope as owned functionality — no REST endpoints, markdown I/O, or
//! bridge wire protocols live here. Each trait is the seam a real
//! deployment plugs its storage/task-tracking/memory/bridge backend into;
//! this crate ships only an in-memory default so the runtime can be
//! exercised and tested standalone.

use std::sync::Arc;

use async_trait::async_trait;
use dashmap::DashMap;
use serde::{Deserialize, Serialize};
use serde_json::Value;

use crate::registration::AgentStatus;

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct InProgressTask {
    pub id: String,
    pub assigned_session_name: String,
    pub task_file_path: String,
    pub task_name: String,
    pub status: TaskTrackingStatus,
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum TaskTrackingStatus {
    Assigned,
    Active,
    Done,
}

#[derive(Debug, Clone, Serialize, Deserialize, Default)]
pub struct OrchestratorStatus {
    pub running: bool,
}

/// `getOrchestratorStatus`, `updateAgentStatus`, `getTeams`, `getProjects`.
#[async_trait]
pub trait Storage: Send + Sync {
    async fn get_orchestrator_status(&self) -> anyhow::Result<OrchestratorStatus>;
    async fn update_agent_status(&self, session_name: &str, status: AgentStatus) -> anyhow::Result<()>;
    async fn get_teams(&self) -> anyhow::Result<Vec<String>>;
    async fn get_projects(&self) -> anyhow::Result<Vec<String>>;
}

/// `getTasksForTeamMember(memberId)`. Also fronts the task-file-content
/// read the Restart Coordinator needs for re-delivery (§4.4 step 5) —
/// markdown file I/O is an explicit external collaborator concern (§1),
/// so the core never opens task files itself.
#[async_trait]
pub trait TaskTracking: Send + Sync {
    async fn get_tasks_for_team_member(&self, member_id: &str) -> anyhow::Result<Vec<InProgressTask>>;
    async fn read_task_file_excerpt(&self, path: &str, max_chars: usize) -> anyhow::Result<String>;
}

/// `initializeForSession`, `onSessionEnd`.
#[async_trait]
pub trait Memory: Send + Sync {
    async fn initialize_for_session(&self, name: &str, role: &str, cwd: &str) -> anyhow::Result<()>;
    async fn on_session_end(&self, name: &str, role: &str, cwd: &str) -> anyhow::Result<()>;
}

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct BridgeNotification {
    pub notification_type: Option<String>,
    pub title: Option<String>,
    pub message: String,
    pub urgency: Option<String>,
}

/// `sendNotification`, `markDeliveredBySkill`.
#[async_trait]
pub trait Bridges: Send + Sync {
    async fn send_notification(&self, payload: BridgeNotification) -> anyhow::Result<()>;
    async fn mark_delivered_by_skill(&self, channel_id: &str, thread_ts: Option<&str>) -> anyhow::Result<()>;
}

/// `getOrchestratorTaskAssignmentPrompt(data)`.
#[async_trait]
pub trait PromptTemplate: Send + Sync {
    async fn orchestrator_task_assignment_prompt(&self, data: &Value) -> anyhow::Result<String>;
}

/// In-memory `Storage` sufficient to exercise the runtime standalone.
#[derive(Default)]
pub struct InMemoryStorage {
    statuses: DashMap<String, AgentStatus>,
}

#[async_trait]
impl Storage for InMemoryStorage {
    async fn get_orchestrator_status(&self) -> anyhow::Result<OrchestratorStatus> {
        Ok(OrchestratorStatus {
            running: self.statuses.contains_key("orchestrator"),
        })
    }

    async fn update_agent_status(&self, session_name: &str, status: AgentStatus) -> anyhow::Result<()> {
        self.statuses.insert(session_name.to_string(), status);
        Ok(())
    }

    async fn get_teams(&self) -> anyhow::Result<Vec<String>> {
        Ok(Vec::new())
    }

    async fn get_projects(&self) -> anyhow::Result<Vec<String>> {
        Ok(Vec::new())
    }
}

/// In-memory `TaskTracking` keyed by member id.
#[derive(Default)]
pub struct InMemoryTaskTracking {
    tasks: DashMap<String, Vec<InProgressTask>>,
}

impl InMemoryTaskTracking {
    pub fn seed(&self, member_id: impl Into<String>, tasks: Vec<InProgressTask>) {
        self.tasks.insert(member_id.into(), tasks);
    }
}

#[async_trait]
impl TaskTracking for InMemoryTaskTracking {
    async fn get_tasks_for_team_member(&self, member_id: &str) -> anyhow::Result<Vec<InProgressTask>> {
        Ok(self.tasks.get(member_id).map(|t| t.clone()).unwrap_or_default())
    }

    async fn read_task_file_excerpt(&self, path: &str, max_chars: usize) -> anyhow::Result<String> {
        match tokio::fs::read_to_string(path).await {
            Ok(content) => Ok(truncate_chars(&content, max_chars)),
            Err(_) => Ok(String::new()),
        }
    }
}

fn truncate_chars(s: &str, max_chars: usize) -> String {
    if s.chars().count() <= max_chars {
        return s.to_string();
    }
    let truncated: String = s.chars().take(max_chars).collect();
    format!("{truncated}\n…[truncated]")
}

#[derive(Default)]
pub struct NoopMemory;

#[async_trait]
impl Memory for NoopMemory {
    async fn initialize_for_session(&self, _name: &str, _role: &str, _cwd: &str) -> anyhow::Result<()> {
        Ok(())
    }

    async fn on_session_end(&self, _name: &str, _role: &str, _cwd: &str) -> anyhow::Result<()> {
        Ok(())
    }
}

/// In-memory `Bridges` that records deliveries instead of calling out to
/// Slack/WhatsApp, useful for tests asserting on routing decisions.
#[derive(Default)]
pub struct RecordingBridges {
    pub notifications: std::sync::Mutex<Vec<BridgeNotification>>,
    pub delivered_by_skill: std::sync::Mutex<Vec<(String, Option<String>)>>,
}

#[async_trait]
impl Bridges for RecordingBridges {
    async fn send_notification(&self, payload: BridgeNotification) -> anyhow::Result<()> {
        self.notifications.lock().expect("poisoned").push(payload);
        Ok(())
    }

    async fn mark_delivered_by_skill(&self, channel_id: &str, thread_ts: Option<&str>) -> anyhow::Result<()> {
        self.delivered_by_skill
            .lock()
            .expect("poisoned")
            .push((channel_id.to_string(), thread_ts.map(str::to_string)));
        Ok(())
    }
}

#[derive(Default)]
pub struct DefaultPromptTemplate;

#[async_trait]
impl PromptTemplate for DefaultPromptTemplate {
    async fn orchestrator_task_assignment_prompt(&self, data: &Value) -> anyhow::Result<String> {
        let task_name = data.get("taskName").and_then(Value::as_str).unwrap_or("task");
        Ok(format!("Please work on: {task_name}"))
    }
}

/// The set of collaborators a running instance is wired to; assembled once
/// in `app.rs` and shared by reference across components.
pub struct Collaborators {
    pub storage: Arc<dyn Storage>,
    pub task_tracking: Arc<dyn TaskTracking>,
    pub memory: Arc<dyn Memory>,
    pub bridges: Arc<dyn Bridges>,
    pub prompt_template: Arc<dyn PromptTemplate>,
}

impl Collaborators {
    pub fn in_memory() -> Self {
        Self {
            storage: Arc::new(InMemoryStorage::default()),
            task_tracking: Arc::new(InMemoryTaskTracking::default()),
            memory: Arc::new(NoopMemory),
            bridges: Arc::new(RecordingBridges::default()),
            prompt_template: Arc::new(DefaultPromptTemplate),
        }
    }
}
