//! Command-line surface: process entrypoint dispatch, kept separate from
//! `app.rs`'s component wiring the way the teacher separates `Cli`
//! parsing from its `CliRunner` execution.

use std::path::PathBuf;

use anyhow::{Context, Result};
use clap::{Parser, Subcommand};

use fleet_runtime::RuntimeType;

use crate::app::App;
use crate::config::AppConfig;
use crate::queue::EnqueueRequest;
use crate::registration::CreateAgentSessionOptions;

mod output;
use output::create_formatter;

#[derive(Parser)]
#[command(name = "agentfleet")]
#[command(about = "Agent session runtime: orchestrates long-lived CLI coding agents in PTYs")]
#[command(version = env!("CARGO_PKG_VERSION"))]
pub struct Cli {
    /// Project working directory the orchestrator session launches in
    #[arg(short, long, default_value = ".")]
    pub repo: PathBuf,

    /// Verbose logging
    #[arg(short, long)]
    pub verbose: bool,

    /// JSON output format
    #[arg(long)]
    pub json: bool,

    #[command(subcommand)]
    pub command: Commands,
}

#[derive(Subcommand)]
pub enum Commands {
    /// Start the orchestrator session, queue dispatcher, and gateway, and
    /// block until a shutdown signal arrives.
    Run {
        /// Address the Terminal Gateway binds to; overrides config
        #[arg(long)]
        bind: Option<String>,
    },
    /// Spawn an additional agent session alongside the orchestrator.
    Spawn {
        /// Session name, matching `^[A-Za-z0-9_-]{1,100}$`
        name: String,
        /// Runtime type to launch
        #[arg(long, default_value = "claude-code")]
        runtime: RuntimeArg,
        /// Role assigned to the new session
        #[arg(long, default_value = "developer")]
        role: String,
    },
    /// Enqueue a one-off message to the orchestrator and print its id.
    Enqueue {
        /// Message content to deliver
        content: String,
        /// Conversation id to tag the message with
        #[arg(long, default_value = "cli")]
        conversation_id: String,
    },
    /// Print the current status of every tracked session.
    Status,
}

#[derive(Clone, Copy, clap::ValueEnum)]
pub enum RuntimeArg {
    ClaudeCode,
    GeminiCli,
    CodexCli,
}

impl From<RuntimeArg> for RuntimeType {
    fn from(value: RuntimeArg) -> Self {
        match value {
            RuntimeArg::ClaudeCode => RuntimeType::ClaudeCode,
            RuntimeArg::GeminiCli => RuntimeType::GeminiCli,
            RuntimeArg::CodexCli => RuntimeType::CodexCli,
        }
    }
}

pub struct CliRunner {
    app: App,
    json: bool,
}

impl CliRunner {
    pub async fn new(cli: &Cli) -> Result<Self> {
        let config = AppConfig::load().context("loading configuration")?;
        Ok(Self {
            app: App::new(config),
            json: cli.json,
        })
    }

    pub async fn run(&self, repo: PathBuf, command: &Commands) -> Result<()> {
        let formatter = create_formatter(self.json);

        match command {
            Commands::Run { bind } => {
                self.app.start(repo).await?;
                let addr = bind.clone().unwrap_or_else(|| self.app.config.gateway.bind_addr.clone());
                tracing::info!(addr = %addr, "agentfleet orchestrator running");
                let router = crate::gateway::router(self.app.gateway.clone(), &self.app.config.gateway);
                let listener = tokio::net::TcpListener::bind(&addr).await.context("binding gateway")?;
                println!("{}", formatter.format_success("orchestrator started", None));
                axum::serve(listener, router)
                    .with_graceful_shutdown(shutdown_signal())
                    .await
                    .context("gateway server")?;
                Ok(())
            }
            Commands::Spawn { name, runtime, role } => {
                self.app
                    .spawn_agent(CreateAgentSessionOptions {
                        session_name: name.clone(),
                        role: role.clone(),
                        runtime_type: (*runtime).into(),
                        project_path: repo,
                        team_id: None,
                        member_id: None,
                    })
                    .await?;
                println!("{}", formatter.format_success(&format!("spawned {name}"), None));
                Ok(())
            }
            Commands::Enqueue { content, conversation_id } => {
                let id = self
                    .app
                    .queue
                    .enqueue(EnqueueRequest {
                        content: content.clone(),
                        conversation_id: conversation_id.clone(),
                        source: "cli".to_string(),
                        source_metadata: None,
                    })
                    .await
                    .map_err(anyhow::Error::msg)?;
                println!(
                    "{}",
                    formatter.format_success("enqueued", Some(serde_json::json!({ "id": id })))
                );
                Ok(())
            }
            Commands::Status => {
                let sessions = self.app.backend.list_sessions().await;
                println!("{}", formatter.format_list(&sessions, "sessions"));
                Ok(())
            }
        }
    }
}

async fn shutdown_signal() {
    let ctrl_c = async { tokio::signal::ctrl_c().await.expect("failed to install Ctrl+C handler") };

    #[cfg(unix)]
    let terminate = async {
        tokio::signal::unix::signal(tokio::signal::unix::SignalKind::terminate())
            .expect("failed to install SIGTERM handler")
            .recv()
            .await;
    };

    #[cfg(not(unix))]
    let terminate = std::future::pending::<()>();

    tokio::select! {
        _ = ctrl_c => {}
        _ = terminate => {}
    }
    tracing::info!("shutdown signal received");
}
