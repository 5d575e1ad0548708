//! Registry-level tests: shared supervisors, shutdown, PID-file recovery
#![cfg(unix)]

use instance_supervisor::{InstanceConfig, InstanceStatus, SupervisorRegistry};
use std::time::{Duration, Instant};

const STDIN_SERVER: &str = r#"while read line; do [ "$line" = stop ] && exit 0; done"#;

fn fast_config(name: &str, working_dir: &std::path::Path) -> InstanceConfig {
    let mut config = InstanceConfig::new(name, working_dir, "sh");
    config.args = vec!["-c".to_string(), STDIN_SERVER.to_string()];
    config.startup.grace_ms = 150;
    config.poll_interval_ms = 50;
    config.console_timeout_ms = 2_000;
    config
}

async fn wait_until(mut pred: impl FnMut() -> bool, timeout: Duration) -> bool {
    let deadline = Instant::now() + timeout;
    while Instant::now() < deadline {
        if pred() {
            return true;
        }
        smol::Timer::after(Duration::from_millis(20)).await;
    }
    pred()
}

#[smol_potat::test]
async fn test_concurrent_starts_one_winner() {
    let dir = tempfile::tempdir().unwrap();
    let registry = SupervisorRegistry::with_state_dir(dir.path()).unwrap();

    let supervisor = registry
        .get_or_create(fast_config("survival", dir.path()))
        .unwrap();

    let (a, b) = futures::join!(supervisor.start(), supervisor.start());
    // Exactly one start wins; the loser sees AlreadyRunning
    assert_ne!(a.is_ok(), b.is_ok());
    assert_eq!(supervisor.status().status, InstanceStatus::Running);

    supervisor.stop(Duration::from_secs(5)).await.unwrap();
}

#[smol_potat::test]
async fn test_remove_stops_and_forgets() {
    let dir = tempfile::tempdir().unwrap();
    let registry = SupervisorRegistry::with_state_dir(dir.path()).unwrap();

    let supervisor = registry
        .get_or_create(fast_config("survival", dir.path()))
        .unwrap();
    supervisor.start().await.unwrap();
    let pid = supervisor.status().pid.unwrap();

    registry
        .remove("survival", Duration::from_secs(5))
        .await
        .unwrap();
    assert!(registry.list().is_empty());
    assert!(
        wait_until(|| !server_process::pid_alive(pid), Duration::from_secs(2)).await,
        "removed instance's process should be gone"
    );
}

#[smol_potat::test]
async fn test_shutdown_all_stops_every_instance() {
    let dir = tempfile::tempdir().unwrap();
    let registry = SupervisorRegistry::with_state_dir(dir.path()).unwrap();

    let names = ["survival", "creative", "minigames"];
    for name in names {
        let supervisor = registry.get_or_create(fast_config(name, dir.path())).unwrap();
        supervisor.start().await.unwrap();
    }

    registry.shutdown_all(Duration::from_secs(5)).await;

    for name in names {
        let supervisor = registry.get(name).unwrap();
        assert_eq!(
            supervisor.status().status,
            InstanceStatus::Stopped,
            "instance {} should be stopped",
            name
        );
    }
}

#[smol_potat::test]
async fn test_pidfile_recovery_reattaches_live_process() {
    let dir = tempfile::tempdir().unwrap();
    let config = fast_config("survival", dir.path());

    // First manager run: start, then walk away without stopping
    let pid = {
        let registry = SupervisorRegistry::with_state_dir(dir.path()).unwrap();
        let supervisor = registry.get_or_create(config.clone()).unwrap();
        supervisor.start().await.unwrap();
        supervisor.status().pid.unwrap()
    };
    assert!(server_process::pid_alive(pid), "server outlives the manager");

    // Second manager run adopts the recorded process
    let registry = SupervisorRegistry::with_state_dir(dir.path()).unwrap();
    let supervisor = registry.get_or_create(config).unwrap();
    let snapshot = supervisor.status();
    assert_eq!(snapshot.status, InstanceStatus::Running);
    assert_eq!(snapshot.pid, Some(pid));
    // Start time predates this manager and is reported as unknown
    assert_eq!(snapshot.started_at, None);

    // The adopted process still stops cleanly (stdin is gone, so this
    // exercises the signal path)
    supervisor.stop(Duration::from_secs(1)).await.unwrap();
    assert_eq!(supervisor.status().status, InstanceStatus::Stopped);
    assert!(wait_until(|| !server_process::pid_alive(pid), Duration::from_secs(2)).await);
}

#[smol_potat::test]
async fn test_stale_pidfile_is_ignored() {
    let dir = tempfile::tempdir().unwrap();
    let instance_dir = dir.path().join("survival");
    std::fs::create_dir_all(&instance_dir).unwrap();

    // Record a pid that is guaranteed dead
    let mut child = std::process::Command::new("true").spawn().unwrap();
    let dead_pid = child.id();
    child.wait().unwrap();
    std::fs::write(instance_dir.join("instance.pid"), format!("{}\n", dead_pid)).unwrap();

    let registry = SupervisorRegistry::with_state_dir(dir.path()).unwrap();
    let supervisor = registry
        .get_or_create(fast_config("survival", dir.path()))
        .unwrap();

    assert_eq!(supervisor.status().status, InstanceStatus::Stopped);
    assert!(!instance_dir.join("instance.pid").exists());

    // And the instance starts normally afterwards
    supervisor.start().await.unwrap();
    assert_eq!(supervisor.status().status, InstanceStatus::Running);
    supervisor.stop(Duration::from_secs(5)).await.unwrap();
}
