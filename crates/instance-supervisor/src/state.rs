//! Instance status and snapshots

use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};

/// Lifecycle status of a managed instance
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize, Default)]
#[serde(rename_all = "lowercase")]
pub enum InstanceStatus {
    /// No process; the instance is at rest
    #[default]
    Stopped,
    /// A start is in flight; the process is spawned but not yet confirmed
    Starting,
    /// The process is confirmed alive
    Running,
    /// A stop is in flight
    Stopping,
    /// An operator-initiated restart is in flight
    Restarting,
    /// The last operation failed or the process crashed; operator attention
    /// required unless auto-restart recovers it
    Error,
}

impl InstanceStatus {
    /// Whether a process is (or should be) associated with this status
    pub fn has_process(&self) -> bool {
        matches!(
            self,
            InstanceStatus::Starting
                | InstanceStatus::Running
                | InstanceStatus::Stopping
                | InstanceStatus::Restarting
        )
    }
}

impl std::fmt::Display for InstanceStatus {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        let s = match self {
            InstanceStatus::Stopped => "stopped",
            InstanceStatus::Starting => "starting",
            InstanceStatus::Running => "running",
            InstanceStatus::Stopping => "stopping",
            InstanceStatus::Restarting => "restarting",
            InstanceStatus::Error => "error",
        };
        f.write_str(s)
    }
}

/// Point-in-time view of an instance
///
/// Readable without touching the lifecycle lock; the supervisor swaps a new
/// snapshot in on every transition.
#[derive(Debug, Clone, Serialize, Deserialize, Default)]
pub struct StatusSnapshot {
    /// Current lifecycle status
    pub status: InstanceStatus,
    /// OS process id while a process is associated
    pub pid: Option<u32>,
    /// When Running was last confirmed; `None` for adopted processes whose
    /// start time predates this manager
    pub started_at: Option<DateTime<Utc>>,
    /// Consecutive crash restarts since the last manual start or stop
    pub restart_count: u32,
}

impl StatusSnapshot {
    /// Time since Running was confirmed, when known
    pub fn uptime(&self) -> Option<chrono::Duration> {
        match self.status {
            InstanceStatus::Running => self.started_at.map(|t| Utc::now() - t),
            _ => None,
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_has_process_matches_status() {
        assert!(!InstanceStatus::Stopped.has_process());
        assert!(!InstanceStatus::Error.has_process());
        assert!(InstanceStatus::Starting.has_process());
        assert!(InstanceStatus::Running.has_process());
        assert!(InstanceStatus::Stopping.has_process());
        assert!(InstanceStatus::Restarting.has_process());
    }

    #[test]
    fn test_uptime_only_while_running() {
        let snapshot = StatusSnapshot {
            status: InstanceStatus::Running,
            pid: Some(4242),
            started_at: Some(Utc::now() - chrono::Duration::seconds(90)),
            restart_count: 0,
        };
        assert!(snapshot.uptime().unwrap() >= chrono::Duration::seconds(90));

        let stopped = StatusSnapshot::default();
        assert_eq!(stopped.uptime(), None);
    }

    #[test]
    fn test_status_serializes_lowercase() {
        let json = serde_json::to_string(&InstanceStatus::Restarting).unwrap();
        assert_eq!(json, "\"restarting\"");
    }
}
