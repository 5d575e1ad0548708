//! Per-instance supervision configuration

use serde::{Deserialize, Serialize};
use server_process::{ConsoleKind, LaunchCommand};
use std::collections::HashMap;
use std::path::PathBuf;
use std::time::Duration;

/// Configuration for one managed server instance
///
/// Business-level validation (whether the name refers to a configured
/// server) is the caller's responsibility; the supervisor only validates
/// what it needs to launch the process.
#[derive(Debug, Clone, Serialize, Deserialize, PartialEq)]
pub struct InstanceConfig {
    /// Unique instance name
    pub name: String,
    /// The server's install root, used as the working directory
    pub working_dir: PathBuf,
    /// Binary to execute
    pub binary: String,
    /// Command line arguments
    #[serde(default)]
    pub args: Vec<String>,
    /// Environment variables
    #[serde(default)]
    pub env: HashMap<String, String>,
    /// Which console mechanism the server uses
    #[serde(default)]
    pub console: ConsoleKind,
    /// Command text sent through the console for a graceful stop
    #[serde(default = "default_stop_command")]
    pub stop_command: String,
    /// Bound on every console write, in milliseconds
    #[serde(default = "default_console_timeout_ms")]
    pub console_timeout_ms: u64,
    /// Watchdog liveness poll interval, in milliseconds
    #[serde(default = "default_poll_interval_ms")]
    pub poll_interval_ms: u64,
    /// Startup confirmation settings
    #[serde(default)]
    pub startup: StartupConfig,
    /// Crash restart policy
    #[serde(default)]
    pub restart: RestartPolicy,
}

fn default_stop_command() -> String {
    "stop".to_string()
}

fn default_console_timeout_ms() -> u64 {
    5_000
}

fn default_poll_interval_ms() -> u64 {
    500
}

impl InstanceConfig {
    /// Create a configuration with defaults for everything but the launch
    /// essentials
    pub fn new(
        name: impl Into<String>,
        working_dir: impl Into<PathBuf>,
        binary: impl Into<String>,
    ) -> Self {
        Self {
            name: name.into(),
            working_dir: working_dir.into(),
            binary: binary.into(),
            args: Vec::new(),
            env: HashMap::new(),
            console: ConsoleKind::default(),
            stop_command: default_stop_command(),
            console_timeout_ms: default_console_timeout_ms(),
            poll_interval_ms: default_poll_interval_ms(),
            startup: StartupConfig::default(),
            restart: RestartPolicy::default(),
        }
    }

    /// Build the launch command for this instance
    pub(crate) fn launch_command(&self) -> LaunchCommand {
        let mut cmd = LaunchCommand::new(&self.binary);
        cmd.args(&self.args)
            .envs(&self.env)
            .current_dir(&self.working_dir);
        cmd
    }

    /// Bound on console writes
    pub fn console_timeout(&self) -> Duration {
        Duration::from_millis(self.console_timeout_ms)
    }

    /// Watchdog poll interval
    pub fn poll_interval(&self) -> Duration {
        Duration::from_millis(self.poll_interval_ms)
    }
}

/// Startup confirmation settings
///
/// A successful spawn call is not enough to report Running; the process must
/// still be alive after the grace window.
#[derive(Debug, Clone, Serialize, Deserialize, PartialEq)]
pub struct StartupConfig {
    /// How long the process must stay alive before Running is confirmed,
    /// in milliseconds
    #[serde(default = "default_grace_ms")]
    pub grace_ms: u64,
}

fn default_grace_ms() -> u64 {
    1_500
}

impl Default for StartupConfig {
    fn default() -> Self {
        Self {
            grace_ms: default_grace_ms(),
        }
    }
}

impl StartupConfig {
    /// Grace window as a duration
    pub fn grace(&self) -> Duration {
        Duration::from_millis(self.grace_ms)
    }
}

/// Crash restart policy
///
/// Applied only to watchdog-detected crashes; manual stops reset the
/// consecutive-crash counter.
#[derive(Debug, Clone, Serialize, Deserialize, PartialEq)]
pub struct RestartPolicy {
    /// Whether to restart automatically after a crash
    #[serde(default)]
    pub auto_restart: bool,
    /// Ceiling on consecutive crash restarts before giving up
    #[serde(default = "default_max_restarts")]
    pub max_restarts: u32,
    /// Backoff before the first crash restart, in milliseconds
    #[serde(default = "default_backoff_initial_ms")]
    pub backoff_initial_ms: u64,
    /// Backoff ceiling, in milliseconds
    #[serde(default = "default_backoff_cap_ms")]
    pub backoff_cap_ms: u64,
}

fn default_max_restarts() -> u32 {
    3
}

fn default_backoff_initial_ms() -> u64 {
    1_000
}

fn default_backoff_cap_ms() -> u64 {
    30_000
}

impl Default for RestartPolicy {
    fn default() -> Self {
        Self {
            auto_restart: false,
            max_restarts: default_max_restarts(),
            backoff_initial_ms: default_backoff_initial_ms(),
            backoff_cap_ms: default_backoff_cap_ms(),
        }
    }
}

impl RestartPolicy {
    /// Backoff delay before the nth consecutive restart (1-based), doubling
    /// per crash and capped
    pub fn backoff_for(&self, attempt: u32) -> Duration {
        let doublings = attempt.saturating_sub(1).min(16);
        let delay = self
            .backoff_initial_ms
            .saturating_mul(1u64 << doublings)
            .min(self.backoff_cap_ms);
        Duration::from_millis(delay)
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_config_serialization_roundtrip() {
        let mut config = InstanceConfig::new("survival", "/srv/survival", "java");
        config.args = vec!["-jar".into(), "server.jar".into(), "nogui".into()];
        config.restart.auto_restart = true;

        let json = serde_json::to_string(&config).unwrap();
        let deserialized: InstanceConfig = serde_json::from_str(&json).unwrap();
        assert_eq!(config, deserialized);
    }

    #[test]
    fn test_defaults_fill_in() {
        let config: InstanceConfig = serde_json::from_str(
            r#"{"name": "survival", "working_dir": "/srv/survival", "binary": "java"}"#,
        )
        .unwrap();
        assert_eq!(config.stop_command, "stop");
        assert_eq!(config.console, ConsoleKind::Stdin);
        assert!(!config.restart.auto_restart);
        assert_eq!(config.restart.max_restarts, 3);
    }

    #[test]
    fn test_backoff_doubles_and_caps() {
        let policy = RestartPolicy {
            auto_restart: true,
            max_restarts: 10,
            backoff_initial_ms: 1_000,
            backoff_cap_ms: 30_000,
        };
        assert_eq!(policy.backoff_for(1), Duration::from_millis(1_000));
        assert_eq!(policy.backoff_for(2), Duration::from_millis(2_000));
        assert_eq!(policy.backoff_for(3), Duration::from_millis(4_000));
        assert_eq!(policy.backoff_for(6), Duration::from_millis(30_000));
        // Large attempt counts must not overflow
        assert_eq!(policy.backoff_for(u32::MAX), Duration::from_millis(30_000));
    }

    #[test]
    fn test_launch_command_uses_working_dir() {
        let mut config = InstanceConfig::new("survival", "/srv/survival", "java");
        config.args = vec!["-jar".into(), "server.jar".into()];
        let cmd = config.launch_command();
        assert_eq!(cmd.get_program(), "java");
        assert_eq!(
            cmd.get_current_dir(),
            Some(std::path::Path::new("/srv/survival"))
        );
    }
}
