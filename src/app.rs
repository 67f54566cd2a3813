//! Process-level bootstrap: wires the Session Backend, Registration,
//! monitors, Message Queue, and Terminal Gateway into one set of shared
//! handles, built once at process start (the teacher's `CliRunner`
//! pattern, generalized beyond CLI dispatch to the whole component graph).

use std::sync::Arc;

use anyhow::Result;

use fleet_runtime::{OutputProcessor, RuntimeType, SessionBackend};

use crate::collaborators::Collaborators;
use crate::config::AppConfig;
use crate::context_monitor::ContextMonitor;
use crate::gateway::GatewayState;
use crate::queue::MessageQueue;
use crate::registration::{AgentRegistration, CreateAgentSessionOptions};
use crate::runtime_types::{matches_any, profile_for};

/// Everything a running instance needs, assembled once and shared by
/// `Arc` across every task the process spawns (§5 shared-resource
/// policy: no shared lock crosses two components, only these handles do).
pub struct App {
    pub config: Arc<AppConfig>,
    pub backend: Arc<SessionBackend>,
    pub collaborators: Arc<Collaborators>,
    pub registration: Arc<AgentRegistration>,
    pub context_monitor: Arc<ContextMonitor>,
    pub queue: Arc<MessageQueue>,
    pub gateway: GatewayState,
}

impl App {
    pub fn new(config: AppConfig) -> Self {
        let config = Arc::new(config);
        let backend = Arc::new(SessionBackend::new());
        let collaborators = Arc::new(Collaborators::in_memory());
        let registration = Arc::new(AgentRegistration::new(backend.clone(), collaborators.clone(), config.clone()));
        let context_monitor = ContextMonitor::new(
            backend.clone(),
            registration.clone(),
            collaborators.clone(),
            Arc::new(config.context_monitor.clone()),
        );
        let queue = MessageQueue::new(
            config.orchestrator_name.clone(),
            registration.clone(),
            collaborators.clone(),
            Arc::new(config.queue.clone()),
        );
        let gateway = GatewayState::new(backend.clone(), registration.clone(), queue.clone());

        Self {
            config,
            backend,
            collaborators,
            registration,
            context_monitor,
            queue,
            gateway,
        }
    }

    /// Spawns the orchestrator session and the background tasks that keep
    /// running for the life of the process: the queue dispatcher, the
    /// context monitor's periodic retry tick, and registration-event
    /// forwarding onto the gateway's status bus.
    pub async fn start(&self, project_path: std::path::PathBuf) -> Result<()> {
        let orchestrator_name = self.config.orchestrator_name.clone();
        self.registration
            .create_agent_session(CreateAgentSessionOptions {
                session_name: orchestrator_name.clone(),
                role: "orchestrator".to_string(),
                runtime_type: RuntimeType::ClaudeCode,
                project_path: project_path.clone(),
                team_id: None,
                member_id: None,
            })
            .await?;

        spawn_output_consumer(
            self.backend.clone(),
            self.registration.clone(),
            self.queue.clone(),
            self.context_monitor.clone(),
            orchestrator_name,
            RuntimeType::ClaudeCode,
            "orchestrator".to_string(),
            project_path,
            None,
            None,
        );

        tokio::spawn(self.queue.clone().dispatch_loop());

        let runtime_type_of = |_name: &str| Some(RuntimeType::ClaudeCode);
        tokio::spawn(self.context_monitor.clone().run_periodic_tick(runtime_type_of));

        let gateway = self.gateway.clone();
        let events = self.registration.subscribe_events();
        tokio::spawn(gateway.forward_registration_events(events));

        Ok(())
    }

    /// Spawns an additional (non-orchestrator) agent session with exit and
    /// context monitoring wired in, mirroring what `create_agent_session`
    /// alone does not set up on its own.
    pub async fn spawn_agent(&self, opts: CreateAgentSessionOptions) -> Result<()> {
        let session_name = opts.session_name.clone();
        let runtime_type = opts.runtime_type;
        let role = opts.role.clone();
        let project_path = opts.project_path.clone();
        let team_id = opts.team_id.clone();
        let member_id = opts.member_id.clone();

        self.registration.create_agent_session(opts).await?;

        spawn_output_consumer(
            self.backend.clone(),
            self.registration.clone(),
            self.queue.clone(),
            self.context_monitor.clone(),
            session_name.clone(),
            runtime_type,
            role.clone(),
            project_path.clone(),
            team_id.clone(),
            member_id.clone(),
        );

        crate::exit_monitor::watch_session(
            self.backend.clone(),
            self.registration.clone(),
            self.collaborators.clone(),
            Arc::new(self.config.exit_monitor.clone()),
            session_name,
            runtime_type,
            role,
            project_path,
            team_id,
            member_id,
            false,
        );

        Ok(())
    }
}

/// Drives a session's output through the Output Processor and fans the
/// result out to everything that needs to see it (§2, §4.4 step 6, §4.6):
/// the ready pattern activates registration, markers route through the
/// chat router, and every chunk also feeds the context monitor. Without
/// this task subscribed to `on_data`, a session's output never reaches
/// any of the three.
#[allow(clippy::too_many_arguments)]
fn spawn_output_consumer(
    backend: Arc<SessionBackend>,
    registration: Arc<AgentRegistration>,
    queue: Arc<MessageQueue>,
    context_monitor: Arc<ContextMonitor>,
    session_name: String,
    runtime_type: RuntimeType,
    role: String,
    project_path: std::path::PathBuf,
    team_id: Option<String>,
    member_id: Option<String>,
) {
    tokio::spawn(async move {
        let mut sub = match backend.on_data(&session_name) {
            Ok(sub) => sub,
            Err(e) => {
                tracing::warn!(session = %session_name, error = %e, "output consumer: no such session");
                return;
            }
        };

        let processor = OutputProcessor::new();
        let profile = profile_for(runtime_type);
        let mut activated = false;

        while let Some((chunk, dropped)) = sub.recv().await {
            if dropped > 0 {
                tracing::warn!(session = %session_name, dropped, "output consumer subscriber lagged");
            }

            let (cleaned, markers) = processor.process_chunk(&session_name, &chunk);

            if !activated && matches_any(profile.ready_patterns, &cleaned) {
                registration.mark_active(&session_name).await;
                activated = true;
            }

            for marker in markers {
                queue.route_marker(marker).await;
            }

            context_monitor
                .observe_chunk(
                    &session_name,
                    &chunk,
                    runtime_type,
                    &role,
                    &project_path,
                    team_id.clone(),
                    member_id.clone(),
                )
                .await;
        }
    });
}
