use std::path::PathBuf;
use std::time::Duration;

use anyhow::{Context, Result};
use serde::{Deserialize, Serialize};

use crate::registry::RegistryLimits;
use crate::sender::breaker::BreakerConfig;
use crate::sender::SenderConfig;

#[derive(Debug, Clone, Serialize, Deserialize, Default)]
pub struct Config {
    #[serde(default)]
    pub tmux: TmuxConfig,
    #[serde(default)]
    pub registry: RegistryConfig,
    #[serde(default)]
    pub reconciler: ReconcilerConfig,
    #[serde(default)]
    pub sender: SenderSection,
    #[serde(default)]
    pub logging: LoggingConfig,
}

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct TmuxConfig {
    /// Timeout in seconds for each tmux/git invocation
    #[serde(default = "default_command_timeout")]
    pub command_timeout_secs: u64,
}

fn default_command_timeout() -> u64 {
    10
}

impl Default for TmuxConfig {
    fn default() -> Self {
        Self {
            command_timeout_secs: default_command_timeout(),
        }
    }
}

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct RegistryConfig {
    /// Per-session message queue cap; oldest entries dropped on overflow
    #[serde(default = "default_max_messages")]
    pub max_messages_per_session: usize,
    /// Messages older than this are swept
    #[serde(default = "default_max_message_age")]
    pub max_message_age_hours: i64,
}

fn default_max_messages() -> usize {
    100
}

fn default_max_message_age() -> i64 {
    24
}

impl Default for RegistryConfig {
    fn default() -> Self {
        Self {
            max_messages_per_session: default_max_messages(),
            max_message_age_hours: default_max_message_age(),
        }
    }
}

impl RegistryConfig {
    pub fn limits(&self) -> RegistryLimits {
        RegistryLimits {
            max_messages_per_session: self.max_messages_per_session,
            max_message_age_hours: self.max_message_age_hours,
        }
    }
}

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct ReconcilerConfig {
    /// Seconds between reconciliation ticks
    #[serde(default = "default_tick_interval")]
    pub tick_interval_secs: u64,
}

fn default_tick_interval() -> u64 {
    5
}

impl Default for ReconcilerConfig {
    fn default() -> Self {
        Self {
            tick_interval_secs: default_tick_interval(),
        }
    }
}

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct SenderSection {
    /// Phase-B delay in seconds when a request does not specify one
    #[serde(default = "default_send_delay")]
    pub default_delay_secs: u64,
    /// Hard cap on total enqueued send requests
    #[serde(default = "default_max_queue")]
    pub max_queue: usize,
    /// Worker pool size (max concurrently-leased sessions)
    #[serde(default = "default_max_concurrent")]
    pub max_concurrent_sessions: usize,
    /// Consecutive Phase-A failures that open the circuit breaker
    #[serde(default = "default_breaker_failures")]
    pub breaker_failure_threshold: u32,
    /// Seconds the breaker stays open before admitting probes
    #[serde(default = "default_breaker_timeout")]
    pub breaker_open_timeout_secs: u64,
}

fn default_send_delay() -> u64 {
    10
}

fn default_max_queue() -> usize {
    1000
}

fn default_max_concurrent() -> usize {
    10
}

fn default_breaker_failures() -> u32 {
    5
}

fn default_breaker_timeout() -> u64 {
    60
}

impl Default for SenderSection {
    fn default() -> Self {
        Self {
            default_delay_secs: default_send_delay(),
            max_queue: default_max_queue(),
            max_concurrent_sessions: default_max_concurrent(),
            breaker_failure_threshold: default_breaker_failures(),
            breaker_open_timeout_secs: default_breaker_timeout(),
        }
    }
}

impl SenderSection {
    pub fn sender_config(&self) -> SenderConfig {
        SenderConfig {
            default_delay: Duration::from_secs(self.default_delay_secs),
            max_queue: self.max_queue,
            max_concurrent_sessions: self.max_concurrent_sessions,
            breaker: BreakerConfig {
                failure_threshold: self.breaker_failure_threshold,
                open_timeout: Duration::from_secs(self.breaker_open_timeout_secs),
                ..BreakerConfig::default()
            },
            ..SenderConfig::default()
        }
    }
}

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct LoggingConfig {
    /// Log level (trace, debug, info, warn, error)
    #[serde(default = "default_log_level")]
    pub level: String,
    /// Write logs to a file instead of stderr
    #[serde(default)]
    pub to_file: bool,
    /// Directory for log files when `to_file` is set
    #[serde(default = "default_log_dir")]
    pub dir: String,
}

fn default_log_level() -> String {
    "info".to_string()
}

fn default_log_dir() -> String {
    ".conductor/logs".to_string()
}

impl Default for LoggingConfig {
    fn default() -> Self {
        Self {
            level: default_log_level(),
            to_file: false,
            dir: default_log_dir(),
        }
    }
}

impl Config {
    /// Default config file location
    pub fn default_config_path() -> PathBuf {
        PathBuf::from("conductor.toml")
    }

    /// Load configuration: embedded defaults, then `conductor.toml` (or an
    /// explicit path), then `CONDUCTOR_*` environment overrides.
    pub fn load(config_path: Option<&str>) -> Result<Self> {
        let defaults = Config::default();
        let defaults_json =
            serde_json::to_string(&defaults).context("Failed to serialize default config")?;

        let mut builder = config::Config::builder().add_source(config::File::from_str(
            &defaults_json,
            config::FileFormat::Json,
        ));

        let default_file = Self::default_config_path();
        if default_file.exists() {
            builder = builder.add_source(config::File::from(default_file));
        }

        if let Some(path) = config_path {
            builder = builder.add_source(config::File::with_name(path));
        }

        builder = builder.add_source(
            config::Environment::with_prefix("CONDUCTOR")
                .separator("__")
                .try_parsing(true),
        );

        let config = builder.build().context("Failed to load configuration")?;
        config
            .try_deserialize()
            .context("Failed to deserialize configuration")
    }

    /// Write the current configuration to `conductor.toml`
    pub fn save(&self) -> Result<()> {
        let toml_str =
            toml::to_string_pretty(self).context("Failed to serialize config to TOML")?;
        std::fs::write(Self::default_config_path(), toml_str)
            .context("Failed to write config file")?;
        Ok(())
    }

    pub fn command_timeout(&self) -> Duration {
        Duration::from_secs(self.tmux.command_timeout_secs)
    }

    pub fn tick_interval(&self) -> Duration {
        Duration::from_secs(self.reconciler.tick_interval_secs)
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_defaults() {
        let config = Config::default();
        assert_eq!(config.tmux.command_timeout_secs, 10);
        assert_eq!(config.registry.max_messages_per_session, 100);
        assert_eq!(config.registry.max_message_age_hours, 24);
        assert_eq!(config.reconciler.tick_interval_secs, 5);
        assert_eq!(config.sender.default_delay_secs, 10);
        assert_eq!(config.sender.max_queue, 1000);
        assert_eq!(config.sender.max_concurrent_sessions, 10);
        assert_eq!(config.logging.level, "info");
    }

    #[test]
    fn test_sender_config_mapping() {
        let section = SenderSection {
            default_delay_secs: 3,
            breaker_failure_threshold: 7,
            ..SenderSection::default()
        };
        let sender = section.sender_config();
        assert_eq!(sender.default_delay, Duration::from_secs(3));
        assert_eq!(sender.breaker.failure_threshold, 7);
        // Retry tuning keeps its built-in defaults
        assert_eq!(sender.phase_a_retries, 2);
        assert_eq!(sender.phase_b_retries, 1);
    }

    #[test]
    fn test_partial_toml_round_trip() {
        let parsed: Config = toml::from_str(
            r#"
            [reconciler]
            tick_interval_secs = 2

            [sender]
            max_queue = 50
            "#,
        )
        .unwrap();
        assert_eq!(parsed.reconciler.tick_interval_secs, 2);
        assert_eq!(parsed.sender.max_queue, 50);
        // Unspecified sections fall back to defaults
        assert_eq!(parsed.tmux.command_timeout_secs, 10);
    }
}
