//! Per-instance lifecycle supervision
//!
//! One `InstanceSupervisor` owns everything about a named instance: the
//! process handle, the console channel, the status snapshot and the PID
//! file. Lifecycle operations serialize on an exclusive async lock; status
//! reads and command sends deliberately stay off that lock.

use chrono::Utc;
use futures::lock::Mutex;
use serde_json::Value;
use server_process::{console_pipe_path, ConsoleChannel, ConsoleKind, ProcessHandle, StdinConsole};
use std::path::PathBuf;
use std::sync::atomic::{AtomicU64, Ordering};
use std::sync::{Arc, RwLock};
use std::time::{Duration, Instant};
use tracing::{debug, info, warn};

use crate::config::InstanceConfig;
use crate::hooks::{HookDispatcher, HookPayload, LifecycleEvent};
use crate::pidfile::PidFile;
use crate::rt::{self, Spawner};
use crate::state::{InstanceStatus, StatusSnapshot};
use crate::{Error, Result};

/// Mutable lifecycle state, guarded by the per-instance exclusive lock
pub(crate) struct Lifecycle {
    /// Handle to the live process, present exactly while the status claims
    /// a process exists
    pub(crate) handle: Option<Box<dyn ProcessHandle>>,
    /// Consecutive crash restarts since the last manual start or stop
    pub(crate) restart_count: u32,
}

/// Supervisor for one named server instance
pub struct InstanceSupervisor {
    pub(crate) config: InstanceConfig,
    pub(crate) instance_dir: PathBuf,
    pub(crate) hooks: Arc<HookDispatcher>,
    pub(crate) spawner: Arc<dyn Spawner>,
    /// Exclusive lock serializing start/stop/restart and crash handling
    pub(crate) lifecycle: Mutex<Lifecycle>,
    /// Console channel, locked separately so command sends never queue
    /// behind lifecycle work
    pub(crate) console: Mutex<Option<Box<dyn ConsoleChannel>>>,
    /// Atomically swapped status snapshot for lock-free reads
    pub(crate) snapshot: RwLock<StatusSnapshot>,
    /// Bumped on every transition out of or into Running; stale watchdogs
    /// and pending auto-restarts check it and stand down
    pub(crate) run_generation: AtomicU64,
    pub(crate) pidfile: PidFile,
}

impl InstanceSupervisor {
    /// Extra patience after SIGTERM before falling through to SIGKILL
    const SIGTERM_GRACE: Duration = Duration::from_secs(2);
    /// How long to wait for the process table to reflect a SIGKILL
    const REAP_GRACE: Duration = Duration::from_secs(1);
    /// Ceiling on the liveness poll interval during bounded waits
    const WAIT_POLL_CAP: Duration = Duration::from_millis(100);

    pub(crate) fn new(
        config: InstanceConfig,
        instance_dir: PathBuf,
        hooks: Arc<HookDispatcher>,
        spawner: Arc<dyn Spawner>,
    ) -> Result<Arc<Self>> {
        std::fs::create_dir_all(&instance_dir)?;
        let pidfile = PidFile::new(&instance_dir);

        let supervisor = Arc::new(Self {
            config,
            instance_dir,
            hooks,
            spawner,
            lifecycle: Mutex::new(Lifecycle {
                handle: None,
                restart_count: 0,
            }),
            console: Mutex::new(None),
            snapshot: RwLock::new(StatusSnapshot::default()),
            run_generation: AtomicU64::new(0),
            pidfile,
        });
        supervisor.recover_from_pidfile();
        Ok(supervisor)
    }

    /// The instance name
    pub fn name(&self) -> &str {
        &self.config.name
    }

    /// The supervision configuration
    pub fn config(&self) -> &InstanceConfig {
        &self.config
    }

    /// The instance's runtime directory (PID file, console pipe)
    pub fn instance_dir(&self) -> &std::path::Path {
        &self.instance_dir
    }

    /// Current status snapshot
    ///
    /// Never blocks behind an in-flight lifecycle operation; the snapshot is
    /// swapped atomically on every transition.
    pub fn status(&self) -> StatusSnapshot {
        self.snapshot
            .read()
            .unwrap_or_else(|e| e.into_inner())
            .clone()
    }

    /// Start the instance
    ///
    /// Fails with [`Error::AlreadyRunning`] when the instance is up, and
    /// [`Error::InvalidState`] while a stop or restart is in flight. Running
    /// is only reported after the process survives the startup grace
    /// window; a spawn that dies immediately surfaces as [`Error::Launch`]
    /// with the instance left in Error.
    pub async fn start(self: &Arc<Self>) -> Result<()> {
        let mut lifecycle = self.lifecycle.lock().await;
        match self.status().status {
            InstanceStatus::Running | InstanceStatus::Starting => {
                return Err(Error::AlreadyRunning {
                    name: self.config.name.clone(),
                });
            }
            status @ (InstanceStatus::Stopping | InstanceStatus::Restarting) => {
                return Err(Error::InvalidState {
                    name: self.config.name.clone(),
                    status,
                    operation: "start",
                });
            }
            InstanceStatus::Stopped | InstanceStatus::Error => {}
        }
        self.start_locked(&mut lifecycle, true).await
    }

    /// Crash-restart entry point: same start path as [`start`], gated on the
    /// generation recorded when the crash was handled so an explicit stop
    /// during the backoff always wins.
    ///
    /// [`start`]: InstanceSupervisor::start
    pub(crate) async fn start_auto(self: &Arc<Self>, expected_generation: u64) {
        let mut lifecycle = self.lifecycle.lock().await;
        if self.current_generation() != expected_generation {
            debug!(instance = %self.config.name, "pending automatic restart cancelled");
            return;
        }
        if self.status().status != InstanceStatus::Error {
            return;
        }
        if let Err(e) = self.start_locked(&mut lifecycle, false).await {
            warn!(instance = %self.config.name, "automatic restart failed: {}", e);
        }
    }

    pub(crate) async fn start_locked(
        self: &Arc<Self>,
        lifecycle: &mut Lifecycle,
        manual: bool,
    ) -> Result<()> {
        info!(instance = %self.config.name, "starting instance");
        self.hooks
            .dispatch(LifecycleEvent::BeforeStart, &self.base_payload());
        self.update_snapshot(|s| {
            s.status = InstanceStatus::Starting;
            s.pid = None;
            s.started_at = None;
        });

        match self.launch(lifecycle).await {
            Ok(pid) => {
                if manual {
                    lifecycle.restart_count = 0;
                }
                let restart_count = lifecycle.restart_count;
                self.update_snapshot(|s| {
                    s.status = InstanceStatus::Running;
                    s.pid = Some(pid);
                    s.started_at = Some(Utc::now());
                    s.restart_count = restart_count;
                });
                if let Err(e) = self.pidfile.write(pid) {
                    warn!(instance = %self.config.name, "failed to write PID file: {}", e);
                }

                let generation = self.bump_generation();
                self.spawn_watchdog(generation);

                let mut payload = self.base_payload();
                payload.insert("pid".to_string(), Value::from(pid));
                self.hooks.dispatch(LifecycleEvent::AfterStart, &payload);
                info!(instance = %self.config.name, pid, "instance is running");
                Ok(())
            }
            Err(reason) => {
                self.update_snapshot(|s| {
                    s.status = InstanceStatus::Error;
                    s.pid = None;
                    s.started_at = None;
                });
                let mut payload = self.base_payload();
                payload.insert("reason".to_string(), Value::String(reason.clone()));
                self.hooks.dispatch(LifecycleEvent::StartFailed, &payload);
                warn!(instance = %self.config.name, "start failed: {}", reason);
                Err(Error::Launch {
                    name: self.config.name.clone(),
                    reason,
                })
            }
        }
    }

    /// Spawn the process, attach the console, and confirm liveness.
    ///
    /// On failure every partial resource is torn down before returning, so
    /// a failed start never leaks an orphaned process or a dangling pipe.
    async fn launch(&self, lifecycle: &mut Lifecycle) -> std::result::Result<u32, String> {
        if !self.config.working_dir.is_dir() {
            return Err(format!(
                "working directory {} does not exist",
                self.config.working_dir.display()
            ));
        }

        // A FIFO console is created before the spawn so the server can
        // attach its command reader as soon as it boots.
        let mut console: Option<Box<dyn ConsoleChannel>> = None;
        if self.config.console == ConsoleKind::Fifo {
            #[cfg(unix)]
            {
                let path = console_pipe_path(&self.instance_dir);
                match server_process::FifoConsole::create(path) {
                    Ok(fifo) => console = Some(Box::new(fifo)),
                    Err(e) => return Err(format!("failed to create console pipe: {}", e)),
                }
            }
            #[cfg(not(unix))]
            {
                return Err("fifo consoles are not supported on this platform".to_string());
            }
        }

        let pipe_stdin = self.config.console == ConsoleKind::Stdin;
        let command = self.config.launch_command();
        let spawned = match server_process::spawn(&self.config.name, &command, pipe_stdin) {
            Ok(spawned) => spawned,
            Err(e) => {
                if let Some(mut channel) = console.take() {
                    channel.close();
                }
                return Err(e.to_string());
            }
        };
        let mut handle = spawned.handle;
        let pid = handle.pid().unwrap_or_default();
        // The pid exists from here on; publish it while still Starting.
        self.update_snapshot(|s| s.pid = Some(pid));

        if pipe_stdin {
            match spawned.stdin {
                Some(stdin) => console = Some(Box::new(StdinConsole::new(stdin))),
                None => {
                    let _ = handle.kill();
                    return Err("child stdin was not piped".to_string());
                }
            }
        }

        // Drain output in the background so the child never blocks on a
        // full pipe.
        self.spawner.spawn(Box::pin(spawned.output.drain_to_log()));

        // Liveness confirmation: the process must survive the grace window
        // before Running is reported.
        let poll = self.config.poll_interval().min(Self::WAIT_POLL_CAP);
        let deadline = Instant::now() + self.config.startup.grace();
        loop {
            if !handle.is_alive() {
                let exit = handle.last_exit();
                if let Some(mut channel) = console.take() {
                    channel.close();
                }
                return Err(match exit {
                    Some(exit) => format!("process exited during startup: {:?}", exit),
                    None => "process exited during startup".to_string(),
                });
            }
            if Instant::now() >= deadline {
                break;
            }
            rt::sleep(poll).await;
        }

        // Confirmed: the PID file takes over ownership tracking, so merely
        // dropping the supervisor must not take the server down.
        handle.detach_on_drop();

        *self.console.lock().await = console;
        lifecycle.handle = Some(Box::new(handle));
        Ok(pid)
    }

    /// Stop the instance
    ///
    /// A no-op success when already Stopped (no hooks fire). An instance in
    /// Error is cleared to Stopped, cancelling any pending auto-restart.
    /// Otherwise the graceful console stop is tried first, then SIGTERM,
    /// then SIGKILL; state is always cleared, and the call always makes
    /// forward progress within `timeout` plus a small escalation grace.
    pub async fn stop(&self, timeout: Duration) -> Result<()> {
        let mut lifecycle = self.lifecycle.lock().await;
        self.stop_locked(&mut lifecycle, timeout, false).await
    }

    pub(crate) async fn stop_locked(
        &self,
        lifecycle: &mut Lifecycle,
        timeout: Duration,
        restarting: bool,
    ) -> Result<()> {
        match self.status().status {
            InstanceStatus::Stopped => {
                // An explicit stop always wins over a pending auto-restart.
                self.bump_generation();
                return Ok(());
            }
            InstanceStatus::Error => {
                self.bump_generation();
                lifecycle.handle = None;
                self.update_snapshot(|s| {
                    s.status = InstanceStatus::Stopped;
                    s.pid = None;
                    s.started_at = None;
                });
                debug!(instance = %self.config.name, "cleared error state to stopped");
                return Ok(());
            }
            _ => {}
        }

        info!(instance = %self.config.name, "stopping instance");
        let mut payload = self.base_payload();
        if let Some(pid) = self.status().pid {
            payload.insert("pid".to_string(), Value::from(pid));
        }
        self.hooks.dispatch(LifecycleEvent::BeforeStop, &payload);

        self.bump_generation();
        self.update_snapshot(|s| {
            s.status = if restarting {
                InstanceStatus::Restarting
            } else {
                InstanceStatus::Stopping
            };
        });

        // Graceful phase: ask the server to shut itself down.
        let graceful_sent = {
            let mut console = self.console.lock().await;
            match console.as_mut() {
                Some(channel) => {
                    match channel
                        .send(&self.config.stop_command, self.config.console_timeout())
                        .await
                    {
                        Ok(()) => true,
                        Err(e) => {
                            warn!(
                                instance = %self.config.name,
                                "graceful stop command failed: {}", e
                            );
                            false
                        }
                    }
                }
                None => false,
            }
        };

        let poll = self.config.poll_interval().min(Self::WAIT_POLL_CAP);
        if let Some(handle) = lifecycle.handle.as_mut() {
            let handle = handle.as_mut();
            let mut dead = if graceful_sent {
                wait_dead(handle, Instant::now() + timeout, poll).await
            } else {
                // No console to ask; SIGTERM is the graceful path.
                if let Err(e) = handle.terminate() {
                    warn!(instance = %self.config.name, "SIGTERM failed: {}", e);
                }
                wait_dead(handle, Instant::now() + timeout, poll).await
            };

            if !dead && graceful_sent {
                warn!(
                    instance = %self.config.name,
                    "graceful stop timed out; escalating to SIGTERM"
                );
                if let Err(e) = handle.terminate() {
                    warn!(instance = %self.config.name, "SIGTERM failed: {}", e);
                }
                dead = wait_dead(handle, Instant::now() + Self::SIGTERM_GRACE, poll).await;
            }

            if !dead {
                warn!(
                    instance = %self.config.name,
                    "process ignored SIGTERM; killing"
                );
                if let Err(e) = handle.kill() {
                    warn!(instance = %self.config.name, "SIGKILL failed: {}", e);
                }
                wait_dead(handle, Instant::now() + Self::REAP_GRACE, poll).await;
            }
        }

        // Always clear state, even when the graceful path errored.
        if let Some(mut channel) = self.console.lock().await.take() {
            channel.close();
        }
        lifecycle.handle = None;
        self.pidfile.remove();
        self.update_snapshot(|s| {
            s.status = if restarting {
                InstanceStatus::Restarting
            } else {
                InstanceStatus::Stopped
            };
            s.pid = None;
            s.started_at = None;
        });
        self.hooks
            .dispatch(LifecycleEvent::AfterStop, &self.base_payload());
        info!(instance = %self.config.name, "instance stopped");
        Ok(())
    }

    /// Restart the instance: stop, then start
    ///
    /// From Running the instance reports Restarting instead of Stopped
    /// throughout, so observers can tell an operator restart from an
    /// independent stop-then-start. From Stopped or Error the stop phase is
    /// the usual no-op and the call behaves like a plain start.
    pub async fn restart(self: &Arc<Self>, timeout: Duration) -> Result<()> {
        let mut lifecycle = self.lifecycle.lock().await;
        match self.status().status {
            InstanceStatus::Running | InstanceStatus::Stopped | InstanceStatus::Error => {}
            status => {
                return Err(Error::InvalidState {
                    name: self.config.name.clone(),
                    status,
                    operation: "restart",
                });
            }
        }

        info!(instance = %self.config.name, "restarting instance");
        if let Err(e) = self.stop_locked(&mut lifecycle, timeout, true).await {
            self.update_snapshot(|s| {
                s.status = InstanceStatus::Error;
                s.pid = None;
                s.started_at = None;
            });
            return Err(e);
        }
        self.start_locked(&mut lifecycle, true).await
    }

    /// Send a text command to the running instance's console
    ///
    /// Returns once the channel confirms delivery to the OS; server-side
    /// command completion is asynchronous and opaque. A channel failure
    /// while the status claims Running triggers an immediate liveness
    /// re-check so a dead process folds into the crash path instead of
    /// being silently swallowed.
    pub async fn send_command(self: &Arc<Self>, text: &str) -> Result<()> {
        if self.status().status != InstanceStatus::Running {
            return Err(Error::NotRunning {
                name: self.config.name.clone(),
            });
        }

        let result = {
            let mut console = self.console.lock().await;
            // Re-check: a stop may have begun while we waited for the
            // console lock.
            if self.status().status != InstanceStatus::Running {
                return Err(Error::NotRunning {
                    name: self.config.name.clone(),
                });
            }
            match console.as_mut() {
                Some(channel) => channel.send(text, self.config.console_timeout()).await,
                None => Err(server_process::Error::channel_closed(
                    "no console attached to this process",
                )),
            }
        };

        match result {
            Ok(()) => {
                debug!(instance = %self.config.name, command = text, "console command delivered");
                Ok(())
            }
            Err(e) => {
                warn!(instance = %self.config.name, "console send failed: {}", e);
                self.recheck_liveness_after_channel_failure().await;
                Err(Error::Channel {
                    name: self.config.name.clone(),
                    source: e,
                })
            }
        }
    }

    async fn recheck_liveness_after_channel_failure(self: &Arc<Self>) {
        let mut lifecycle = self.lifecycle.lock().await;
        if self.status().status != InstanceStatus::Running {
            return;
        }
        let dead = match lifecycle.handle.as_mut() {
            Some(handle) => !handle.is_alive(),
            None => true,
        };
        if dead {
            warn!(
                instance = %self.config.name,
                "channel failure exposed a dead process; handling as crash"
            );
            self.handle_crash(&mut lifecycle).await;
        }
    }

    /// Adopt a process recorded in the PID file by a previous manager run
    fn recover_from_pidfile(self: &Arc<Self>) {
        #[cfg(unix)]
        {
            let Some(pid) = self.pidfile.recover() else {
                return;
            };
            info!(
                instance = %self.config.name,
                pid, "re-attaching to process from PID file"
            );

            let Some(mut lifecycle) = self.lifecycle.try_lock() else {
                return;
            };
            lifecycle.handle = Some(Box::new(server_process::AdoptedHandle::new(pid)));

            // The FIFO console survives the manager; a stdin console cannot
            // be re-attached and stays unavailable until the next start.
            if self.config.console == ConsoleKind::Fifo {
                let path = console_pipe_path(&self.instance_dir);
                match server_process::FifoConsole::create(path) {
                    Ok(fifo) => {
                        if let Some(mut console) = self.console.try_lock() {
                            *console = Some(Box::new(fifo));
                        }
                    }
                    Err(e) => {
                        warn!(
                            instance = %self.config.name,
                            "failed to re-open console pipe: {}", e
                        );
                    }
                }
            }

            self.update_snapshot(|s| {
                s.status = InstanceStatus::Running;
                s.pid = Some(pid);
                // Start time predates this manager and is unknown.
                s.started_at = None;
            });
            drop(lifecycle);
            let generation = self.bump_generation();
            self.spawn_watchdog(generation);
        }

        #[cfg(not(unix))]
        {
            // Still clears stale records so later operations start clean.
            self.pidfile.recover();
        }
    }

    pub(crate) fn update_snapshot(&self, apply: impl FnOnce(&mut StatusSnapshot)) {
        let mut snapshot = self.snapshot.write().unwrap_or_else(|e| e.into_inner());
        apply(&mut snapshot);
    }

    pub(crate) fn current_generation(&self) -> u64 {
        self.run_generation.load(Ordering::SeqCst)
    }

    pub(crate) fn bump_generation(&self) -> u64 {
        self.run_generation.fetch_add(1, Ordering::SeqCst) + 1
    }

    pub(crate) fn base_payload(&self) -> HookPayload {
        let mut payload = HookPayload::new();
        payload.insert(
            "instance".to_string(),
            Value::String(self.config.name.clone()),
        );
        payload
    }
}

/// Poll a handle until the process is dead or the deadline passes
async fn wait_dead(handle: &mut dyn ProcessHandle, deadline: Instant, poll: Duration) -> bool {
    loop {
        if !handle.is_alive() {
            return true;
        }
        if Instant::now() >= deadline {
            return false;
        }
        rt::sleep(poll).await;
    }
}
