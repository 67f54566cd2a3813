//! Runtime Exit Monitor (§4.3): decides when an agent's CLI has actually
//! exited, as distinct from the PTY shell it ran inside dying.

use std::sync::atomic::{AtomicBool, Ordering};
use std::sync::Arc;
use std::time::{Duration, Instant};

use fleet_runtime::{OutputProcessor, RuntimeType, SessionBackend};

use crate::collaborators::Collaborators;
use crate::config::ExitMonitorConfig;
use crate::registration::{AgentRegistration, CreateAgentSessionOptions};
use crate::runtime_types::{matches_any, profile_for, shell_prompt_visible};

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
enum ExitState {
    Idle,
    PatternMatched,
    Confirmed,
    Reacted,
}

pub struct ExitMonitorHandle {
    on_exit_detected: Arc<dyn Fn(String) + Send + Sync>,
}

/// Spawns the idle→pattern-matched→confirmed→reacted state machine for one
/// session. Returns a handle the caller drops to have no further effect
/// (the task tears itself down once it reaches `Reacted`).
#[allow(clippy::too_many_arguments)]
pub fn watch_session(
    backend: Arc<SessionBackend>,
    registration: Arc<AgentRegistration>,
    collaborators: Arc<Collaborators>,
    config: Arc<ExitMonitorConfig>,
    session_name: String,
    runtime_type: RuntimeType,
    role: String,
    project_path: std::path::PathBuf,
    team_id: Option<String>,
    member_id: Option<String>,
    is_orchestrator: bool,
) -> ExitMonitorHandle {
    let cancelled = Arc::new(AtomicBool::new(false));
    let on_exit_detected: Arc<dyn Fn(String) + Send + Sync> = {
        let cancelled = cancelled.clone();
        Arc::new(move |_name: String| {
            cancelled.store(true, Ordering::SeqCst);
        })
    };

    tokio::spawn({
        let cancelled = cancelled.clone();
        async move {
            let started_at = Instant::now();
            let profile = profile_for(runtime_type);
            let processor = OutputProcessor::new();
            let mut state = ExitState::Idle;

            let mut sub = match backend.on_data(&session_name) {
                Ok(s) => s,
                Err(_) => return,
            };

            tokio::time::sleep(Duration::from_millis(config.startup_grace_ms)).await;

            loop {
                if cancelled.load(Ordering::SeqCst) {
                    return;
                }

                let recv = tokio::time::timeout(
                    Duration::from_millis(config.liveness_poll_interval_ms),
                    sub.recv(),
                )
                .await;

                let text_for_liveness_check = match recv {
                    Ok(Some((chunk, _dropped))) => {
                        let (cleaned, _markers) = processor.process_chunk(&session_name, &chunk);
                        if state == ExitState::Idle
                            && started_at.elapsed() >= Duration::from_millis(config.startup_grace_ms)
                            && matches_any(profile.exit_patterns, &cleaned)
                        {
                            state = ExitState::PatternMatched;
                        }
                        Some(cleaned)
                    }
                    Ok(None) => {
                        // Reader closed: PTY/process is gone outright.
                        state = ExitState::PatternMatched;
                        None
                    }
                    Err(_) => None, // poll interval elapsed with no data
                };

                if state == ExitState::PatternMatched {
                    tokio::time::sleep(Duration::from_millis(config.confirmation_delay_ms)).await;
                    let pane = backend.capture_pane(&session_name, 20).await.unwrap_or_default();
                    if shell_prompt_visible(&pane) {
                        state = ExitState::Confirmed;
                    } else {
                        state = ExitState::Idle;
                    }
                } else if state == ExitState::Idle
                    && started_at.elapsed() >= Duration::from_millis(config.startup_grace_ms)
                    && !backend.is_child_process_alive(&session_name)
                {
                    let pane = backend.capture_pane(&session_name, 20).await.unwrap_or_default();
                    if shell_prompt_visible(&pane) {
                        state = ExitState::Confirmed;
                    }
                }

                let _ = &text_for_liveness_check;

                if state == ExitState::Confirmed {
                    react_to_confirmed_exit(
                        &backend,
                        &registration,
                        &collaborators,
                        &session_name,
                        runtime_type,
                        &role,
                        &project_path,
                        team_id.clone(),
                        member_id.clone(),
                        is_orchestrator,
                    )
                    .await;
                    state = ExitState::Reacted;
                    return;
                }
            }
        }
    });

    ExitMonitorHandle { on_exit_detected }
}

impl ExitMonitorHandle {
    pub fn cancel(&self, session_name: String) {
        (self.on_exit_detected)(session_name);
    }
}

#[allow(clippy::too_many_arguments)]
async fn react_to_confirmed_exit(
    backend: &Arc<SessionBackend>,
    registration: &Arc<AgentRegistration>,
    collaborators: &Arc<Collaborators>,
    session_name: &str,
    runtime_type: RuntimeType,
    role: &str,
    project_path: &std::path::Path,
    team_id: Option<String>,
    member_id: Option<String>,
    is_orchestrator: bool,
) {
    let _ = backend;

    if !is_orchestrator {
        let member = member_id.clone().unwrap_or_else(|| session_name.to_string());
        let has_tasks = collaborators
            .task_tracking
            .get_tasks_for_team_member(&member)
            .await
            .map(|t| !t.is_empty())
            .unwrap_or(false);

        if has_tasks {
            let restart = registration
                .restart_with_task_preservation(CreateAgentSessionOptions {
                    session_name: session_name.to_string(),
                    role: role.to_string(),
                    runtime_type,
                    project_path: project_path.to_path_buf(),
                    team_id,
                    member_id,
                })
                .await;
            if restart.is_ok() {
                return;
            }
            tracing::warn!(session = session_name, "restart after exit failed, marking inactive");
        }
    }

    let _ = registration.terminate_agent_session(session_name, role).await;
    let _ = collaborators
        .memory
        .on_session_end(session_name, role, &project_path.display().to_string())
        .await;
}
