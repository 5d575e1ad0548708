//! Synchronous lifecycle hook dispatch
//!
//! The external plugin system registers listeners here; the supervisor
//! dispatches events around every transition. Dispatch is synchronous so the
//! ordering guarantees hold (`before_x` completes before the action,
//! `after_x` before the call returns), and each listener is isolated: a
//! panicking listener is logged and skipped, never allowed to block a
//! lifecycle transition.

use serde_json::Value;
use std::panic::{catch_unwind, AssertUnwindSafe};
use std::sync::{Arc, RwLock};
use tracing::{debug, warn};

/// Lifecycle events dispatched to registered hooks
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum LifecycleEvent {
    /// A start was requested and is about to begin
    BeforeStart,
    /// A start completed and the instance is Running
    AfterStart,
    /// A start failed; the instance is in Error
    StartFailed,
    /// A stop was requested and is about to begin
    BeforeStop,
    /// A stop completed and the instance is Stopped
    AfterStop,
    /// The watchdog found the process dead without a stop being requested
    CrashDetected,
}

impl LifecycleEvent {
    /// Stable event name, as seen by external listeners
    pub fn name(&self) -> &'static str {
        match self {
            LifecycleEvent::BeforeStart => "before_start",
            LifecycleEvent::AfterStart => "after_start",
            LifecycleEvent::StartFailed => "start_failed",
            LifecycleEvent::BeforeStop => "before_stop",
            LifecycleEvent::AfterStop => "after_stop",
            LifecycleEvent::CrashDetected => "crash_detected",
        }
    }
}

impl std::fmt::Display for LifecycleEvent {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.write_str(self.name())
    }
}

/// Payload mapping passed to listeners with each event
pub type HookPayload = serde_json::Map<String, Value>;

/// A lifecycle event listener
///
/// Implementations must not assume they are the only listener and must not
/// block for long; dispatch is synchronous on the lifecycle path.
pub trait LifecycleHook: Send + Sync {
    /// Listener name used in logs when it fails
    fn name(&self) -> &str;

    /// Called once per dispatched event
    fn on_event(&self, event: LifecycleEvent, payload: &HookPayload);
}

/// Fan-out dispatcher for lifecycle events
#[derive(Default)]
pub struct HookDispatcher {
    listeners: RwLock<Vec<Arc<dyn LifecycleHook>>>,
}

impl HookDispatcher {
    /// Create an empty dispatcher
    pub fn new() -> Self {
        Self::default()
    }

    /// Register a listener; it receives every subsequent event
    pub fn register(&self, hook: Arc<dyn LifecycleHook>) {
        debug!(listener = hook.name(), "registering lifecycle hook");
        self.listeners
            .write()
            .unwrap_or_else(|e| e.into_inner())
            .push(hook);
    }

    /// Dispatch one event to every listener, isolating failures
    pub fn dispatch(&self, event: LifecycleEvent, payload: &HookPayload) {
        let listeners = {
            let guard = self.listeners.read().unwrap_or_else(|e| e.into_inner());
            guard.clone()
        };

        debug!(%event, listeners = listeners.len(), "dispatching lifecycle event");
        for listener in listeners {
            let result = catch_unwind(AssertUnwindSafe(|| listener.on_event(event, payload)));
            if result.is_err() {
                warn!(
                    listener = listener.name(),
                    %event,
                    "lifecycle hook panicked; continuing with remaining listeners"
                );
            }
        }
    }
}
