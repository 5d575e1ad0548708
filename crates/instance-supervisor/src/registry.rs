//! Process-wide registry of instance supervisors
//!
//! Exactly one supervisor exists per instance name; all callers share it, so
//! the per-instance operation serialization holds process-wide.

use std::collections::HashMap;
use std::path::{Path, PathBuf};
use std::sync::{Arc, RwLock};
use std::time::Duration;
use tracing::{info, warn};

use crate::config::InstanceConfig;
use crate::hooks::HookDispatcher;
use crate::rt::{self, Spawner};
use crate::supervisor::InstanceSupervisor;
use crate::{Error, Result};

/// Registry mapping instance names to their supervisors
pub struct SupervisorRegistry {
    state_dir: PathBuf,
    hooks: Arc<HookDispatcher>,
    spawner: Arc<dyn Spawner>,
    supervisors: RwLock<HashMap<String, Arc<InstanceSupervisor>>>,
}

impl SupervisorRegistry {
    /// Headroom over the caller's stop timeout before an instance is
    /// abandoned during shutdown; covers the SIGTERM/SIGKILL escalation.
    const SHUTDOWN_SLACK: Duration = Duration::from_secs(4);

    /// Create a registry rooted at the platform-local data directory
    pub fn new() -> Result<Self> {
        let state_dir = dirs::data_local_dir()
            .unwrap_or_else(|| PathBuf::from("."))
            .join("instance-supervisor");
        Self::with_state_dir(state_dir)
    }

    /// Create a registry with an explicit state directory
    pub fn with_state_dir(state_dir: impl Into<PathBuf>) -> Result<Self> {
        Self::with_spawner(state_dir, rt::default_spawner())
    }

    /// Create a registry with an explicit state directory and task spawner
    pub fn with_spawner(state_dir: impl Into<PathBuf>, spawner: Arc<dyn Spawner>) -> Result<Self> {
        let state_dir = state_dir.into();
        std::fs::create_dir_all(&state_dir)?;
        info!(state_dir = %state_dir.display(), "supervisor registry initialized");
        Ok(Self {
            state_dir,
            hooks: Arc::new(HookDispatcher::new()),
            spawner,
            supervisors: RwLock::new(HashMap::new()),
        })
    }

    /// The directory holding per-instance runtime state
    pub fn state_dir(&self) -> &Path {
        &self.state_dir
    }

    /// The shared hook dispatcher; listeners registered here receive events
    /// from every instance
    pub fn hooks(&self) -> &Arc<HookDispatcher> {
        &self.hooks
    }

    /// Fetch the supervisor for `config.name`, creating it on first use
    ///
    /// Creation recovers any PID file left by a previous manager run and
    /// re-attaches to the recorded process when it is still alive. Repeat
    /// calls return the existing supervisor; the config of later calls is
    /// ignored.
    pub fn get_or_create(&self, config: InstanceConfig) -> Result<Arc<InstanceSupervisor>> {
        {
            let map = self.supervisors.read().unwrap_or_else(|e| e.into_inner());
            if let Some(existing) = map.get(&config.name) {
                return Ok(existing.clone());
            }
        }

        let mut map = self.supervisors.write().unwrap_or_else(|e| e.into_inner());
        // Double-check under the write lock; someone may have won the race.
        if let Some(existing) = map.get(&config.name) {
            return Ok(existing.clone());
        }

        let name = config.name.clone();
        let instance_dir = self.state_dir.join(&name);
        let supervisor = InstanceSupervisor::new(
            config,
            instance_dir,
            self.hooks.clone(),
            self.spawner.clone(),
        )?;
        map.insert(name, supervisor.clone());
        Ok(supervisor)
    }

    /// Fetch an existing supervisor by name
    pub fn get(&self, name: &str) -> Result<Arc<InstanceSupervisor>> {
        self.supervisors
            .read()
            .unwrap_or_else(|e| e.into_inner())
            .get(name)
            .cloned()
            .ok_or_else(|| Error::UnknownInstance {
                name: name.to_string(),
            })
    }

    /// Names of all registered instances
    pub fn list(&self) -> Vec<String> {
        let mut names: Vec<String> = self
            .supervisors
            .read()
            .unwrap_or_else(|e| e.into_inner())
            .keys()
            .cloned()
            .collect();
        names.sort();
        names
    }

    /// Stop an instance and drop it from the registry
    pub async fn remove(&self, name: &str, timeout: Duration) -> Result<()> {
        let supervisor = self.get(name)?;
        supervisor.stop(timeout).await?;
        self.supervisors
            .write()
            .unwrap_or_else(|e| e.into_inner())
            .remove(name);
        info!(instance = name, "instance removed from registry");
        Ok(())
    }

    /// Stop every registered instance, in parallel, with bounded patience
    ///
    /// Instances that fail to stop in time are logged and abandoned; the
    /// call itself always returns.
    pub async fn shutdown_all(&self, timeout: Duration) {
        let supervisors: Vec<Arc<InstanceSupervisor>> = {
            let map = self.supervisors.read().unwrap_or_else(|e| e.into_inner());
            map.values().cloned().collect()
        };
        if supervisors.is_empty() {
            return;
        }

        info!(count = supervisors.len(), "shutting down all instances");
        let stops = supervisors.into_iter().map(|supervisor| async move {
            let deadline = timeout + Self::SHUTDOWN_SLACK;
            match rt::timeout(deadline, supervisor.stop(timeout)).await {
                Some(Ok(())) => {}
                Some(Err(e)) => {
                    warn!(instance = supervisor.name(), "shutdown stop failed: {}", e);
                }
                None => {
                    warn!(
                        instance = supervisor.name(),
                        "shutdown timed out; abandoning instance"
                    );
                }
            }
        });
        futures::future::join_all(stops).await;
    }
}
