//! Runtime configuration: monitor thresholds, cooldowns, and the
//! orchestrator session name. Loaded by layering built-in defaults, an
//! optional `agentfleet.toml`, and `AGENTFLEET_*` environment overrides,
//! the way the teacher layers its own configuration sources.

use std::time::Duration;

use serde::{Deserialize, Serialize};

/// Session name reserved for the agent that receives routed chat messages
/// (§6 "one well-known name denotes the orchestrator").
pub const DEFAULT_ORCHESTRATOR_NAME: &str = "agentfleet-orc";

#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(default)]
pub struct SessionDefaults {
    pub cols: u16,
    pub rows: u16,
    pub allow_headless_fallback: bool,
}

impl Default for SessionDefaults {
    fn default() -> Self {
        Self {
            cols: 120,
            rows: 40,
            allow_headless_fallback: true,
        }
    }
}

/// Context Window Monitor thresholds and cooldowns (§4.5).
#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(default)]
pub struct ContextMonitorConfig {
    pub yellow_threshold: u8,
    pub red_threshold: u8,
    pub critical_threshold: u8,
    pub max_compact_attempts: u32,
    pub compact_retry_cooldown_ms: u64,
    pub stale_detection_threshold_ms: u64,
    pub proactive_compact_bytes: u64,
    pub proactive_compact_cooldown_ms: u64,
    pub retry_tick_interval_ms: u64,
    /// Off by default: "compact-first, periodic retry" is the canonical
    /// policy (§9 decision on the auto-recovery Open Question).
    pub auto_recovery_enabled: bool,
    pub max_recoveries_per_window: u32,
    pub cooldown_window_ms: u64,
}

impl Default for ContextMonitorConfig {
    fn default() -> Self {
        Self {
            yellow_threshold: 70,
            red_threshold: 85,
            critical_threshold: 95,
            max_compact_attempts: 3,
            compact_retry_cooldown_ms: 30_000,
            stale_detection_threshold_ms: 5 * 60_000,
            proactive_compact_bytes: 500 * 1024,
            proactive_compact_cooldown_ms: 10 * 60_000,
            retry_tick_interval_ms: 30_000,
            auto_recovery_enabled: false,
            max_recoveries_per_window: 3,
            cooldown_window_ms: 10 * 60_000,
        }
    }
}

/// Runtime Exit Monitor timing (§4.3).
#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(default)]
pub struct ExitMonitorConfig {
    pub startup_grace_ms: u64,
    pub confirmation_delay_ms: u64,
    pub liveness_poll_interval_ms: u64,
}

impl Default for ExitMonitorConfig {
    fn default() -> Self {
        Self {
            startup_grace_ms: 10_000,
            confirmation_delay_ms: 250,
            liveness_poll_interval_ms: 5_000,
        }
    }
}

/// Message Queue & Chat Router timing (§4.6).
#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(default)]
pub struct QueueConfig {
    pub default_message_timeout_ms: u64,
    pub timeout_grace_ms: u64,
    pub paste_base_delay_ms: u64,
    pub paste_per_char_ms: u64,
    pub paste_max_delay_ms: u64,
    pub inter_task_gap_ms: u64,
}

impl Default for QueueConfig {
    fn default() -> Self {
        Self {
            default_message_timeout_ms: 120_000,
            timeout_grace_ms: 5_000,
            paste_base_delay_ms: 100,
            paste_per_char_ms: 100, // ⌈len/10⌉ ms ≈ 100ms per 10 chars
            paste_max_delay_ms: 5_000,
            inter_task_gap_ms: 2_000,
        }
    }
}

/// Terminal Gateway backpressure (§4.7).
#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(default)]
pub struct GatewayConfig {
    pub bind_addr: String,
    pub outbound_queue_capacity: usize,
}

impl Default for GatewayConfig {
    fn default() -> Self {
        Self {
            bind_addr: "127.0.0.1:7711".to_string(),
            outbound_queue_capacity: 256,
        }
    }
}

#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(default)]
pub struct AppConfig {
    pub orchestrator_name: String,
    pub session: SessionDefaults,
    pub context_monitor: ContextMonitorConfig,
    pub exit_monitor: ExitMonitorConfig,
    pub queue: QueueConfig,
    pub gateway: GatewayConfig,
}

impl Default for AppConfig {
    fn default() -> Self {
        Self {
            orchestrator_name: DEFAULT_ORCHESTRATOR_NAME.to_string(),
            session: SessionDefaults::default(),
            context_monitor: ContextMonitorConfig::default(),
            exit_monitor: ExitMonitorConfig::default(),
            queue: QueueConfig::default(),
            gateway: GatewayConfig::default(),
        }
    }
}

impl AppConfig {
    /// Layers defaults, an optional `agentfleet.toml` in the current
    /// directory, and `AGENTFLEET_*` environment overrides.
    pub fn load() -> anyhow::Result<Self> {
        let builder = config::Config::builder()
            .add_source(config::Config::try_from(&AppConfig::default())?)
            .add_source(config::File::with_name("agentfleet").required(false))
            .add_source(config::Environment::with_prefix("AGENTFLEET").separator("__"));

        let cfg = builder.build()?;
        Ok(cfg.try_deserialize()?)
    }

    pub fn compact_retry_cooldown(&self) -> Duration {
        Duration::from_millis(self.context_monitor.compact_retry_cooldown_ms)
    }

    pub fn message_timeout(&self) -> Duration {
        Duration::from_millis(self.queue.default_message_timeout_ms + self.queue.timeout_grace_ms)
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn default_config_matches_spec_thresholds() {
        let cfg = AppConfig::default();
        assert_eq!(cfg.context_monitor.yellow_threshold, 70);
        assert_eq!(cfg.context_monitor.red_threshold, 85);
        assert_eq!(cfg.context_monitor.critical_threshold, 95);
        assert!(!cfg.context_monitor.auto_recovery_enabled);
        assert_eq!(cfg.orchestrator_name, DEFAULT_ORCHESTRATOR_NAME);
    }

    #[test]
    fn load_falls_back_to_defaults_without_a_config_file() {
        let cfg = AppConfig::load().expect("defaults should always load");
        assert_eq!(cfg.session.cols, 120);
    }
}
