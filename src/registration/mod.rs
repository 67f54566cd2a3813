//! Agent Registration / Restart Coordinator (§4.4): creates, terminates,
//! and restarts agent sessions while preserving in-progress work.

use std::path::PathBuf;
use std::sync::Arc;
use std::time::Duration;

use dashmap::DashMap;
use serde::{Deserialize, Serialize};
use tokio::sync::broadcast;

use fleet_runtime::{RuntimeType, SessionBackend, SessionName, SessionSize};

use crate::collaborators::Collaborators;
use crate::config::AppConfig;
use crate::errors::{RuntimeError, RuntimeResult};
use crate::runtime_types::{profile_for, SendKeyEncoding};
use crate::utils::ResultExt;

const MAX_REDELIVERY_EXCERPT_CHARS: usize = 2_000;

/// AgentStatus (§3): {activating, active, inactive, error}. Broadcast as
/// `status` in the WebSocket envelope — `agentStatus` is never emitted
/// (§9 Open Question 1 decision).
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum AgentStatus {
    Activating,
    Active,
    Inactive,
    Error(String),
}

#[derive(Debug, Clone)]
pub struct CreateAgentSessionOptions {
    pub session_name: String,
    pub role: String,
    pub runtime_type: RuntimeType,
    pub project_path: PathBuf,
    pub team_id: Option<String>,
    pub member_id: Option<String>,
}

#[derive(Debug, Clone)]
pub enum RegistrationEvent {
    Created {
        session_name: String,
        runtime_type: RuntimeType,
    },
    Activated {
        session_name: String,
    },
    Error {
        session_name: String,
        message: String,
    },
    Terminated {
        session_name: String,
    },
    Restarted {
        session_name: String,
    },
}

pub struct AgentRegistration {
    backend: Arc<SessionBackend>,
    collaborators: Arc<Collaborators>,
    config: Arc<AppConfig>,
    statuses: DashMap<String, AgentStatus>,
    events: broadcast::Sender<RegistrationEvent>,
}

impl AgentRegistration {
    pub fn new(backend: Arc<SessionBackend>, collaborators: Arc<Collaborators>, config: Arc<AppConfig>) -> Self {
        let (events, _rx) = broadcast::channel(256);
        Self {
            backend,
            collaborators,
            config,
            statuses: DashMap::new(),
            events,
        }
    }

    pub fn subscribe_events(&self) -> broadcast::Receiver<RegistrationEvent> {
        self.events.subscribe()
    }

    pub fn status(&self, session_name: &str) -> Option<AgentStatus> {
        self.statuses.get(session_name).map(|s| s.clone())
    }

    /// Create (§4.4): validate, fast-path if already created, else spawn,
    /// mark activating. Idempotent w.r.t. "already in target state".
    pub async fn create_agent_session(&self, opts: CreateAgentSessionOptions) -> RuntimeResult<()> {
        let name = SessionName::new(&opts.session_name).map_err(RuntimeError::from)?;

        if self.backend.session_exists(name.as_str()) {
            self.statuses.insert(name.to_string(), AgentStatus::Activating);
            let _ = self.events.send(RegistrationEvent::Created {
                session_name: name.to_string(),
                runtime_type: opts.runtime_type,
            });
            return Ok(());
        }

        self.spawn_and_activate(&name, &opts, None).await
    }

    async fn spawn_and_activate(
        &self,
        name: &SessionName,
        opts: &CreateAgentSessionOptions,
        resume_id: Option<&str>,
    ) -> RuntimeResult<()> {
        let profile = profile_for(opts.runtime_type);
        let args = (profile.launch_args)(name.as_str(), resume_id);

        let create_opts = fleet_runtime::CreateSessionOptions {
            runtime_type: opts.runtime_type,
            command: profile.launch_command.to_string(),
            args,
            env: vec![
                ("AGENTFLEET_ROLE".to_string(), opts.role.clone()),
                (
                    "AGENTFLEET_PROJECT_PATH".to_string(),
                    opts.project_path.display().to_string(),
                ),
            ],
            role: opts.role.clone(),
            team_id: opts.team_id.clone(),
            member_id: opts.member_id.clone(),
            size: SessionSize {
                cols: self.config.session.cols,
                rows: self.config.session.rows,
            },
            allow_headless_fallback: self.config.session.allow_headless_fallback,
        };

        match self
            .backend
            .create_session(name.as_str(), opts.project_path.clone(), create_opts)
            .await
        {
            Ok(_) => {
                self.statuses.insert(name.to_string(), AgentStatus::Activating);
                let _ = self
                    .collaborators
                    .storage
                    .update_agent_status(name.as_str(), AgentStatus::Activating)
                    .await;
                let _ = self
                    .collaborators
                    .memory
                    .initialize_for_session(name.as_str(), &opts.role, &opts.project_path.display().to_string())
                    .await;
                let _ = self.events.send(RegistrationEvent::Created {
                    session_name: name.to_string(),
                    runtime_type: opts.runtime_type,
                });
                Ok(())
            }
            Err(e) => {
                self.statuses
                    .insert(name.to_string(), AgentStatus::Error(e.to_string()));
                let _ = self.events.send(RegistrationEvent::Error {
                    session_name: name.to_string(),
                    message: e.to_string(),
                });
                Err(RuntimeError::from(e))
            }
        }
    }

    /// Called by the Output Processor-driven ready-pattern watcher once a
    /// runtime's ready marker has been seen (§4.4 step 6).
    pub async fn mark_active(&self, session_name: &str) {
        self.statuses
            .insert(session_name.to_string(), AgentStatus::Active);
        let _ = self
            .collaborators
            .storage
            .update_agent_status(session_name, AgentStatus::Active)
            .await;
        let _ = self.events.send(RegistrationEvent::Activated {
            session_name: session_name.to_string(),
        });
    }

    pub async fn mark_error(&self, session_name: &str, message: String) {
        self.statuses
            .insert(session_name.to_string(), AgentStatus::Error(message.clone()));
        let _ = self
            .collaborators
            .storage
            .update_agent_status(session_name, AgentStatus::Error(message.clone()))
            .await;
        let _ = self.events.send(RegistrationEvent::Error {
            session_name: session_name.to_string(),
            message,
        });
    }

    /// Terminate (§4.4): idempotent kill; no-op if already gone.
    pub async fn terminate_agent_session(&self, session_name: &str, role: &str) -> RuntimeResult<()> {
        self.backend.kill_session(session_name).map_err(RuntimeError::from)?;
        self.statuses
            .insert(session_name.to_string(), AgentStatus::Inactive);
        let _ = self
            .collaborators
            .storage
            .update_agent_status(session_name, AgentStatus::Inactive)
            .await;
        let _ = self
            .collaborators
            .memory
            .on_session_end(session_name, role, "")
            .await;
        let _ = self.events.send(RegistrationEvent::Terminated {
            session_name: session_name.to_string(),
        });
        Ok(())
    }

    /// Restart with task preservation (§4.4 steps 1-6), used by the Exit
    /// and Context monitors.
    pub async fn restart_with_task_preservation(&self, opts: CreateAgentSessionOptions) -> RuntimeResult<()> {
        let name = SessionName::new(&opts.session_name).map_err(RuntimeError::from)?;
        let profile = profile_for(opts.runtime_type);

        // Step 1: snapshot a resumable identifier when the runtime honors
        // one. The session name doubles as the identifier Claude Code was
        // launched with via `--session-id`, so `--resume <name>` recovers
        // the same conversation.
        let resume_id = if profile.resume_capable {
            Some(opts.session_name.clone())
        } else {
            None
        };

        // Step 2: kill the old PTY. Monitor unsubscription and dedup-state
        // teardown happen on their own when they observe the exit event
        // the kill triggers (they each own their state, not us).
        self.backend.kill_session(&opts.session_name).map_err(RuntimeError::from)?;

        // Steps 3-4: re-create, pre-seeded with the resume identifier.
        self.spawn_and_activate(&name, &opts, resume_id.as_deref()).await?;

        tokio::time::sleep(Duration::from_millis(500)).await;

        // Step 5: re-deliver in-progress tasks, one paste-safe message per
        // task, in order, with an inter-task gap.
        let member_id = opts.member_id.clone().unwrap_or_else(|| opts.session_name.clone());
        let tasks = self
            .collaborators
            .task_tracking
            .get_tasks_for_team_member(&member_id)
            .await
            .unwrap_or_default();

        for task in tasks {
            let excerpt = match self
                .collaborators
                .task_tracking
                .read_task_file_excerpt(&task.task_file_path, MAX_REDELIVERY_EXCERPT_CHARS)
                .await
                .context_path("read task file for re-delivery", std::path::Path::new(&task.task_file_path))
            {
                Ok(text) => text,
                Err(e) => {
                    tracing::warn!(error = %e, task = %task.task_name, "task re-delivery excerpt unavailable");
                    String::new()
                }
            };
            let body = format_task_redelivery(&task.task_name, &task.task_file_path, &excerpt);
            self.write_paste_safe(&opts.session_name, &body).await?;
            tokio::time::sleep(Duration::from_millis(self.config.queue.inter_task_gap_ms)).await;
        }

        // Step 6.
        let _ = self.events.send(RegistrationEvent::Restarted {
            session_name: opts.session_name.clone(),
        });
        Ok(())
    }

    /// Paste-safe write protocol shared with the Message Queue dispatcher
    /// (§4.4 step 5 / §4.6 step 3): write body, sleep proportional to
    /// length (capped), write Enter.
    pub async fn write_paste_safe(&self, session_name: &str, body: &str) -> RuntimeResult<()> {
        self.backend
            .write(session_name, body.as_bytes())
            .map_err(RuntimeError::from)?;

        let per_char = (body.len() as u64).div_ceil(10) * self.config.queue.paste_per_char_ms / 100;
        let delay_ms = (self.config.queue.paste_base_delay_ms + per_char).min(self.config.queue.paste_max_delay_ms);
        tokio::time::sleep(Duration::from_millis(delay_ms)).await;

        self.backend
            .write(session_name, SendKeyEncoding::ENTER)
            .map_err(RuntimeError::from)
    }
}

fn format_task_redelivery(task_name: &str, task_file_path: &str, excerpt: &str) -> String {
    format!("[TASK RE-DELIVERY]\nTask: {task_name}\nFile: {task_file_path}\n\n{excerpt}")
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::collaborators::Collaborators;

    fn test_registration() -> AgentRegistration {
        AgentRegistration::new(
            Arc::new(SessionBackend::new()),
            Arc::new(Collaborators::in_memory()),
            Arc::new(AppConfig::default()),
        )
    }

    #[test]
    fn task_redelivery_header_is_well_formed() {
        let body = format_task_redelivery("Fix login bug", "/tasks/t1.md", "details here");
        assert!(body.starts_with("[TASK RE-DELIVERY]\n"));
        assert!(body.contains("Fix login bug"));
        assert!(body.contains("/tasks/t1.md"));
        assert!(body.contains("details here"));
    }

    #[tokio::test]
    async fn create_rejects_invalid_session_name() {
        let reg = test_registration();
        let result = reg
            .create_agent_session(CreateAgentSessionOptions {
                session_name: "has space".to_string(),
                role: "developer".to_string(),
                runtime_type: RuntimeType::ClaudeCode,
                project_path: std::env::temp_dir(),
                team_id: None,
                member_id: None,
            })
            .await;
        assert!(result.is_err());
    }

    #[tokio::test]
    async fn terminate_is_idempotent_on_missing_session() {
        let reg = test_registration();
        let result = reg.terminate_agent_session("ghost", "developer").await;
        assert!(result.is_ok());
    }
}
