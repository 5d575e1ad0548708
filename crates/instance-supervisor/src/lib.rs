//! # instance-supervisor
//!
//! Lifecycle supervision for externally-built game-server processes, one OS
//! process per named instance. Provides per-instance start/stop/restart with
//! serialized operations, console command delivery, a crash-detecting
//! watchdog with capped backoff restarts, PID-file recovery across manager
//! restarts, and synchronous lifecycle hook dispatch for an external plugin
//! system.
//!
//! ## Example
//!
//! ```no_run
//! use instance_supervisor::{InstanceConfig, SupervisorRegistry};
//! use std::time::Duration;
//!
//! # async fn example() -> instance_supervisor::Result<()> {
//! let registry = SupervisorRegistry::new()?;
//!
//! let mut config = InstanceConfig::new("survival", "/srv/survival", "java");
//! config.args = vec!["-jar".into(), "server.jar".into(), "nogui".into()];
//!
//! let supervisor = registry.get_or_create(config)?;
//! supervisor.start().await?;
//! supervisor.send_command("say hello").await?;
//! supervisor.stop(Duration::from_secs(10)).await?;
//! # Ok(())
//! # }
//! ```

mod config;
mod hooks;
mod pidfile;
mod registry;
pub mod rt;
mod state;
mod supervisor;
mod watchdog;

pub use config::{InstanceConfig, RestartPolicy, StartupConfig};
pub use hooks::{HookDispatcher, HookPayload, LifecycleEvent, LifecycleHook};
pub use pidfile::PidFile;
pub use registry::SupervisorRegistry;
pub use server_process::ConsoleKind;
pub use state::{InstanceStatus, StatusSnapshot};
pub use supervisor::InstanceSupervisor;

/// Error types for instance supervision
#[derive(thiserror::Error, Debug)]
pub enum Error {
    /// A start was requested while the instance is already up
    #[error("instance '{name}' is already running")]
    AlreadyRunning {
        /// The instance name
        name: String,
    },

    /// The requested operation is not valid from the current status
    #[error("cannot {operation} instance '{name}' while {status}")]
    InvalidState {
        /// The instance name
        name: String,
        /// The status the instance was in
        status: InstanceStatus,
        /// The rejected operation
        operation: &'static str,
    },

    /// The process could not be launched or never confirmed ready
    #[error("failed to launch instance '{name}': {reason}")]
    Launch {
        /// The instance name
        name: String,
        /// Spawn or readiness failure detail
        reason: String,
    },

    /// A command was sent to an instance that is not running
    #[error("instance '{name}' is not running")]
    NotRunning {
        /// The instance name
        name: String,
    },

    /// The console channel failed or timed out
    #[error("console channel error for instance '{name}': {source}")]
    Channel {
        /// The instance name
        name: String,
        /// The underlying channel failure
        #[source]
        source: server_process::Error,
    },

    /// The registry has no supervisor under that name
    #[error("unknown instance: {name}")]
    UnknownInstance {
        /// The requested name
        name: String,
    },

    /// IO error
    #[error("IO error: {0}")]
    Io(#[from] std::io::Error),
}

/// Result type alias
pub type Result<T> = std::result::Result<T, Error>;
