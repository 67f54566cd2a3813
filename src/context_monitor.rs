//! Context Window Monitor (§4.5): watches parsed context-usage percentages
//! and keeps agents below saturation via native compact commands, falling
//! back to a coordinated restart only when compaction is exhausted and the
//! deployment has opted into auto-recovery.

use std::collections::VecDeque;
use std::sync::Arc;
use std::time::{Duration, Instant};

use dashmap::DashMap;
use fleet_runtime::{OutputProcessor, RuntimeType, SessionBackend};
use tokio::sync::Mutex;

use crate::collaborators::Collaborators;
use crate::config::ContextMonitorConfig;
use crate::registration::{AgentRegistration, CreateAgentSessionOptions};
use crate::runtime_types::{profile_for, SendKeyEncoding};

#[derive(Debug, Clone, Copy, PartialEq, Eq, PartialOrd, Ord)]
pub enum ContextLevel {
    Normal,
    Yellow,
    Red,
    Critical,
}

pub struct ContextState {
    pub level: ContextLevel,
    pub context_percent: u8,
    pub last_detected_at: Instant,
    pub compact_attempts: u32,
    pub compact_in_progress: bool,
    pub last_compact_at: Option<Instant>,
    pub recovery_timestamps: VecDeque<Instant>,
}

impl Default for ContextState {
    fn default() -> Self {
        Self {
            level: ContextLevel::Normal,
            context_percent: 0,
            last_detected_at: Instant::now(),
            compact_attempts: 0,
            compact_in_progress: false,
            last_compact_at: None,
            recovery_timestamps: VecDeque::new(),
        }
    }
}

#[derive(Debug, Clone, Copy)]
pub enum ContextEvent {
    Warning { level: ContextLevel, percent: u8 },
    Critical { percent: u8 },
}

pub struct ContextMonitor {
    backend: Arc<SessionBackend>,
    registration: Arc<AgentRegistration>,
    collaborators: Arc<Collaborators>,
    config: Arc<ContextMonitorConfig>,
    processor: OutputProcessor,
    states: DashMap<String, Arc<Mutex<ContextState>>>,
    events_tx: tokio::sync::broadcast::Sender<(String, ContextEvent)>,
}

impl ContextMonitor {
    pub fn new(
        backend: Arc<SessionBackend>,
        registration: Arc<AgentRegistration>,
        collaborators: Arc<Collaborators>,
        config: Arc<ContextMonitorConfig>,
    ) -> Arc<Self> {
        let (events_tx, _rx) = tokio::sync::broadcast::channel(256);
        Arc::new(Self {
            backend,
            registration,
            collaborators,
            config,
            processor: OutputProcessor::new(),
            states: DashMap::new(),
            events_tx,
        })
    }

    pub fn subscribe_events(&self) -> tokio::sync::broadcast::Receiver<(String, ContextEvent)> {
        self.events_tx.subscribe()
    }

    pub fn drop_session(&self, session_name: &str) {
        self.states.remove(session_name);
        self.processor.drop_session(session_name);
    }

    fn level_for(&self, percent: u8) -> ContextLevel {
        if percent >= self.config.critical_threshold {
            ContextLevel::Critical
        } else if percent >= self.config.red_threshold {
            ContextLevel::Red
        } else if percent >= self.config.yellow_threshold {
            ContextLevel::Yellow
        } else {
            ContextLevel::Normal
        }
    }

    /// Feeds one output chunk through the monitor. Call this from the
    /// session's `onData` consumer loop alongside the Exit Monitor.
    pub async fn observe_chunk(
        self: &Arc<Self>,
        session_name: &str,
        chunk: &[u8],
        runtime_type: RuntimeType,
        role: &str,
        project_path: &std::path::Path,
        team_id: Option<String>,
        member_id: Option<String>,
    ) {
        let (_, markers) = self.processor.process_chunk(session_name, chunk);
        for marker in markers {
            if let fleet_runtime::MarkerPayload::ContextUsage { percent } = marker.payload {
                self.on_percent(
                    session_name,
                    percent,
                    runtime_type,
                    role,
                    project_path,
                    team_id.clone(),
                    member_id.clone(),
                )
                .await;
            }
        }
    }

    #[allow(clippy::too_many_arguments)]
    async fn on_percent(
        self: &Arc<Self>,
        session_name: &str,
        percent: u8,
        runtime_type: RuntimeType,
        role: &str,
        project_path: &std::path::Path,
        team_id: Option<String>,
        member_id: Option<String>,
    ) {
        let state_arc = self.states.entry(session_name.to_string()).or_default().clone();
        let mut state = state_arc.lock().await;

        let new_level = self.level_for(percent);
        let old_level = state.level;
        state.context_percent = percent;
        state.last_detected_at = Instant::now();

        if new_level == ContextLevel::Normal && old_level != ContextLevel::Normal {
            state.compact_attempts = 0;
        }

        // Actions fire only on upward transitions (§4.5).
        if new_level > old_level {
            state.level = new_level;
            match new_level {
                ContextLevel::Yellow => {
                    let _ = self.events_tx.send((
                        session_name.to_string(),
                        ContextEvent::Warning { level: new_level, percent },
                    ));
                }
                ContextLevel::Red => {
                    let _ = self.events_tx.send((
                        session_name.to_string(),
                        ContextEvent::Warning { level: new_level, percent },
                    ));
                    self.try_compact(session_name, runtime_type, &mut state).await;
                }
                ContextLevel::Critical => {
                    let _ = self
                        .events_tx
                        .send((session_name.to_string(), ContextEvent::Critical { percent }));
                    if state.compact_attempts < self.config.max_compact_attempts {
                        self.try_compact(session_name, runtime_type, &mut state).await;
                    } else if self.config.auto_recovery_enabled {
                        drop(state);
                        self.maybe_restart(session_name, runtime_type, role, project_path, team_id, member_id)
                            .await;
                    }
                }
                ContextLevel::Normal => {}
            }
        } else {
            state.level = new_level;
        }
    }

    async fn try_compact(&self, session_name: &str, runtime_type: RuntimeType, state: &mut ContextState) {
        let profile = profile_for(runtime_type);
        let Some(compact_cmd) = profile.compact_command else {
            return;
        };
        if state.compact_attempts >= self.config.max_compact_attempts {
            return;
        }
        state.compact_in_progress = true;
        state.compact_attempts += 1;
        state.last_compact_at = Some(Instant::now());

        let _ = self.backend.write(session_name, SendKeyEncoding::ESCAPE);
        let _ = self.backend.write(session_name, compact_cmd);
        let _ = self.backend.write(session_name, SendKeyEncoding::ENTER);
        state.compact_in_progress = false;
    }

    /// Periodic retry tick (§4.5): re-tries compact on critical sessions
    /// whose attempts exhausted once the cooldown has elapsed, and resets
    /// stale sessions with no recent percent back to normal.
    pub async fn run_periodic_tick(self: Arc<Self>, runtime_type_of: impl Fn(&str) -> Option<RuntimeType> + Send + Sync + 'static) {
        let mut interval = tokio::time::interval(Duration::from_millis(self.config.retry_tick_interval_ms));
        loop {
            interval.tick().await;
            let names: Vec<String> = self.states.iter().map(|e| e.key().clone()).collect();
            for name in names {
                let Some(state_arc) = self.states.get(&name).map(|e| e.clone()) else { continue };
                let mut state = state_arc.lock().await;

                if state.last_detected_at.elapsed() >= Duration::from_millis(self.config.stale_detection_threshold_ms) {
                    state.level = ContextLevel::Normal;
                    state.compact_attempts = 0;
                    continue;
                }

                if state.level == ContextLevel::Critical
                    && state.compact_attempts >= self.config.max_compact_attempts
                {
                    let cooled = state
                        .last_compact_at
                        .map(|t| t.elapsed() >= Duration::from_millis(self.config.compact_retry_cooldown_ms))
                        .unwrap_or(true);
                    if cooled {
                        if let Some(rt) = runtime_type_of(&name) {
                            state.compact_attempts = 0;
                            self.try_compact(&name, rt, &mut state).await;
                        }
                    }
                }
            }
        }
    }

    /// Proactive compaction (§4.5): independent of percentage detection,
    /// triggered once cumulative output exceeds a threshold and a
    /// per-session cooldown has elapsed.
    pub async fn maybe_proactive_compact(&self, session_name: &str, runtime_type: RuntimeType) {
        let Some(bytes) = self.backend.cumulative_output_bytes(session_name) else {
            return;
        };
        if bytes < self.config.proactive_compact_bytes {
            return;
        }
        let state_arc = self.states.entry(session_name.to_string()).or_default().clone();
        let mut state = state_arc.lock().await;
        let cooled = state
            .last_compact_at
            .map(|t| t.elapsed() >= Duration::from_millis(self.config.proactive_compact_cooldown_ms))
            .unwrap_or(true);
        if cooled {
            self.try_compact(session_name, runtime_type, &mut state).await;
            self.backend.reset_cumulative_output(session_name);
        }
    }

    async fn maybe_restart(
        &self,
        session_name: &str,
        runtime_type: RuntimeType,
        role: &str,
        project_path: &std::path::Path,
        team_id: Option<String>,
        member_id: Option<String>,
    ) {
        let state_arc = self.states.entry(session_name.to_string()).or_default().clone();
        {
            let mut state = state_arc.lock().await;
            let now = Instant::now();
            state
                .recovery_timestamps
                .retain(|t| now.duration_since(*t) < Duration::from_millis(self.config.cooldown_window_ms));
            if state.recovery_timestamps.len() as u32 >= self.config.max_recoveries_per_window {
                tracing::warn!(session = session_name, "auto-recovery refused: cooldown window exhausted");
                return;
            }
            state.recovery_timestamps.push_back(now);
        }

        let _ = self
            .registration
            .restart_with_task_preservation(CreateAgentSessionOptions {
                session_name: session_name.to_string(),
                role: role.to_string(),
                runtime_type,
                project_path: project_path.to_path_buf(),
                team_id,
                member_id,
            })
            .await;
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    fn monitor() -> Arc<ContextMonitor> {
        let backend = Arc::new(SessionBackend::new());
        let collaborators = Arc::new(Collaborators::in_memory());
        let app_config = Arc::new(crate::config::AppConfig::default());
        let registration = Arc::new(AgentRegistration::new(backend.clone(), collaborators.clone(), app_config.clone()));
        ContextMonitor::new(backend, registration, collaborators, Arc::new(app_config.context_monitor.clone()))
    }

    #[test]
    fn level_thresholds_match_spec() {
        let m = monitor();
        assert_eq!(m.level_for(0), ContextLevel::Normal);
        assert_eq!(m.level_for(69), ContextLevel::Normal);
        assert_eq!(m.level_for(70), ContextLevel::Yellow);
        assert_eq!(m.level_for(85), ContextLevel::Red);
        assert_eq!(m.level_for(95), ContextLevel::Critical);
    }

    #[tokio::test]
    async fn red_transition_triggers_a_single_compact_write() {
        let backend = Arc::new(SessionBackend::new());
        let collaborators = Arc::new(Collaborators::in_memory());
        let config = Arc::new(crate::config::AppConfig::default());
        let registration = Arc::new(AgentRegistration::new(backend.clone(), collaborators.clone(), config.clone()));
        let monitor = ContextMonitor::new(
            backend.clone(),
            registration,
            collaborators,
            Arc::new(config.context_monitor.clone()),
        );

        let opts = fleet_runtime::CreateSessionOptions {
            runtime_type: RuntimeType::ClaudeCode,
            command: "/bin/cat".to_string(),
            args: vec![],
            env: vec![],
            role: "orchestrator".to_string(),
            team_id: None,
            member_id: None,
            size: fleet_runtime::SessionSize::default(),
            allow_headless_fallback: true,
        };
        backend
            .create_session("ctx-test", std::env::temp_dir(), opts)
            .await
            .unwrap();

        let mut sub = backend.on_data("ctx-test").unwrap();

        monitor
            .observe_chunk(
                "ctx-test",
                b"...72% context...",
                RuntimeType::ClaudeCode,
                "orchestrator",
                &std::env::temp_dir(),
                None,
                None,
            )
            .await;
        monitor
            .observe_chunk(
                "ctx-test",
                b"...88% context...",
                RuntimeType::ClaudeCode,
                "orchestrator",
                &std::env::temp_dir(),
                None,
                None,
            )
            .await;

        let (chunk, _) = tokio::time::timeout(Duration::from_secs(2), sub.recv())
            .await
            .unwrap()
            .unwrap();
        assert_eq!(&chunk[..1], SendKeyEncoding::ESCAPE);

        backend.kill_session("ctx-test").unwrap();
    }
}
