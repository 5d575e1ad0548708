//! Crash detection and automatic restart
//!
//! Every confirmed start spawns one watchdog task tagged with the run
//! generation current at spawn time. The task polls process liveness and
//! stands down as soon as the generation moves on, so an explicit stop or a
//! newer start never leaves a stale watchdog fighting the current one.

use serde_json::Value;
use std::sync::Arc;
use tracing::{debug, info, warn};

use crate::rt;
use crate::state::InstanceStatus;
use crate::supervisor::{InstanceSupervisor, Lifecycle};
use crate::LifecycleEvent;

impl InstanceSupervisor {
    pub(crate) fn spawn_watchdog(self: &Arc<Self>, generation: u64) {
        debug!(instance = %self.config.name, generation, "starting watchdog");
        let supervisor = self.clone();
        self.spawner.spawn(Box::pin(async move {
            supervisor.watchdog_loop(generation).await;
        }));
    }

    async fn watchdog_loop(self: Arc<Self>, generation: u64) {
        let poll = self.config.poll_interval();
        loop {
            rt::sleep(poll).await;

            // Cheap unlocked checks first; most wakeups end here.
            if self.current_generation() != generation {
                debug!(instance = %self.config.name, generation, "watchdog superseded");
                return;
            }
            if self.status().status != InstanceStatus::Running {
                return;
            }

            let mut lifecycle = self.lifecycle.lock().await;
            // Re-check under the lock: an explicit stop wins the race.
            if self.current_generation() != generation {
                return;
            }
            if self.status().status != InstanceStatus::Running {
                return;
            }

            let alive = match lifecycle.handle.as_mut() {
                Some(handle) => handle.is_alive(),
                None => false,
            };
            if !alive {
                warn!(instance = %self.config.name, "process died unexpectedly");
                self.handle_crash(&mut lifecycle).await;
                return;
            }
            drop(lifecycle);
        }
    }

    /// Shared crash path, reached from the watchdog and from a channel
    /// failure that exposes a dead process. Caller holds the lifecycle lock
    /// and has confirmed the status was Running.
    pub(crate) async fn handle_crash(self: &Arc<Self>, lifecycle: &mut Lifecycle) {
        let exit = lifecycle.handle.as_ref().and_then(|h| h.last_exit());
        let pid = self.status().pid;

        // New generation: retires the watchdog and tags the pending restart
        // so a later explicit stop can cancel it.
        let crash_generation = self.bump_generation();
        self.update_snapshot(|s| {
            s.status = InstanceStatus::Error;
            s.pid = None;
            s.started_at = None;
        });

        let mut payload = self.base_payload();
        if let Some(pid) = pid {
            payload.insert("pid".to_string(), Value::from(pid));
        }
        payload.insert(
            "exit_code".to_string(),
            exit.and_then(|e| e.code).map(Value::from).unwrap_or(Value::Null),
        );
        #[cfg(unix)]
        payload.insert(
            "signal".to_string(),
            exit.and_then(|e| e.signal)
                .map(Value::from)
                .unwrap_or(Value::Null),
        );
        self.hooks.dispatch(LifecycleEvent::CrashDetected, &payload);

        if let Some(mut channel) = self.console.lock().await.take() {
            channel.close();
        }
        lifecycle.handle = None;
        self.pidfile.remove();

        let policy = &self.config.restart;
        if !policy.auto_restart {
            return;
        }
        if lifecycle.restart_count >= policy.max_restarts {
            warn!(
                instance = %self.config.name,
                max_restarts = policy.max_restarts,
                "restart ceiling reached; instance stays in error until a manual start"
            );
            return;
        }

        lifecycle.restart_count += 1;
        let attempt = lifecycle.restart_count;
        self.update_snapshot(|s| s.restart_count = attempt);
        let backoff = policy.backoff_for(attempt);
        info!(
            instance = %self.config.name,
            attempt,
            backoff_ms = backoff.as_millis() as u64,
            "scheduling automatic restart"
        );

        let supervisor = self.clone();
        self.spawner.spawn(Box::pin(async move {
            rt::sleep(backoff).await;
            supervisor.start_auto(crash_generation).await;
        }));
    }
}
