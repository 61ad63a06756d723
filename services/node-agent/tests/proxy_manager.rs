//! Integration tests for the proxy instance manager.
//!
//! Daemons are mock daemons that bind real loopback sockets, so startup
//! verification runs against actual TCP listeners. Addresses are IPv4-mapped
//! (`::ffff:127.0.0.x`) so every test can use its own loopback address.

use std::sync::Arc;
use std::time::Duration;

use pv6_agent::daemon::{AccessControl, DaemonHandle, MockBehavior, MockLauncher};
use pv6_agent::{ManagerError, ManagerSettings, PortRange, ProxyManager};
use pv6_models::{AccessMode, Ipv6Address, ProxyMetrics, ProxyStatus};
use tempfile::TempDir;

fn settings(dir: &TempDir, low: u16, high: u16) -> ManagerSettings {
    ManagerSettings {
        port_range: PortRange::new(low, high).unwrap(),
        runtime_dir: dir.path().to_path_buf(),
        startup_attempts: 5,
        startup_interval: Duration::from_millis(20),
        probe_timeout: Duration::from_millis(500),
    }
}

fn loopback(last_octet: u8) -> Ipv6Address {
    let ip = format!("::ffff:127.0.0.{last_octet}").parse().unwrap();
    Ipv6Address::new(ip, "lo", false)
}

fn manager(dir: &TempDir, low: u16, high: u16) -> (ProxyManager, Arc<MockLauncher>) {
    let launcher = Arc::new(MockLauncher::new());
    let manager = ProxyManager::new(settings(dir, low, high), launcher.clone());
    (manager, launcher)
}

async fn wait_for_status(manager: &ProxyManager, id: &str, status: ProxyStatus) {
    for _ in 0..100 {
        let current = manager
            .get_instances()
            .await
            .into_iter()
            .find(|i| i.id == id)
            .map(|i| i.status);
        if current == Some(status) {
            return;
        }
        tokio::time::sleep(Duration::from_millis(20)).await;
    }
    panic!("instance {id} never reached {status}");
}

#[tokio::test]
async fn three_addresses_fill_range_then_exhaust() {
    let dir = tempfile::tempdir().unwrap();
    let (manager, _launcher) = manager(&dir, 10000, 10002);

    let mut ports = Vec::new();
    for octet in 1..=3 {
        let instance = manager.start_proxy(loopback(octet)).await.unwrap();
        assert_eq!(instance.status, ProxyStatus::Running);
        ports.push(instance.port);
    }
    assert_eq!(ports, vec![10000, 10001, 10002]);

    let err = manager.start_proxy(loopback(4)).await.unwrap_err();
    assert!(matches!(
        err,
        ManagerError::PortExhausted {
            low: 10000,
            high: 10002
        }
    ));

    let instances = manager.get_instances().await;
    assert_eq!(instances.len(), 3);
    assert!(instances.iter().all(|i| i.status == ProxyStatus::Running));
    assert_eq!(instances[1].id, "::ffff:127.0.0.2-10001");

    assert_eq!(manager.shutdown().await, 3);
    let instances = manager.get_instances().await;
    assert!(instances.iter().all(|i| i.status == ProxyStatus::Stopped));
}

#[tokio::test]
async fn crashed_daemon_is_demoted_and_keeps_its_port() {
    let dir = tempfile::tempdir().unwrap();
    let (manager, launcher) = manager(&dir, 31100, 31100);

    let instance = manager.start_proxy(loopback(11)).await.unwrap();
    launcher.daemon_for(&instance.id).unwrap().crash(1);
    wait_for_status(&manager, &instance.id, ProxyStatus::Error).await;

    // Error still holds the only port.
    let err = manager.start_proxy(loopback(12)).await.unwrap_err();
    assert_eq!(err.code(), "port_exhausted");

    let stopped = manager.stop_proxy(&instance.id).await.unwrap();
    assert_eq!(stopped.status, ProxyStatus::Stopped);

    let replacement = manager.start_proxy(loopback(12)).await.unwrap();
    assert_eq!(replacement.port, 31100);
    assert_eq!(replacement.status, ProxyStatus::Running);
    manager.shutdown().await;
}

#[tokio::test]
async fn stopped_daemon_exit_does_not_demote() {
    let dir = tempfile::tempdir().unwrap();
    let (manager, launcher) = manager(&dir, 31110, 31110);

    let instance = manager.start_proxy(loopback(13)).await.unwrap();
    let daemon = launcher.daemon_for(&instance.id).unwrap();

    manager.stop_proxy(&instance.id).await.unwrap();
    assert!(!daemon.is_running());

    tokio::time::sleep(Duration::from_millis(50)).await;
    let instances = manager.get_instances().await;
    assert_eq!(instances[0].status, ProxyStatus::Stopped);

    // Re-stopping a stopped instance just re-marks it.
    let again = manager.stop_proxy(&instance.id).await.unwrap();
    assert_eq!(again.status, ProxyStatus::Stopped);
}

#[tokio::test]
async fn unreachable_daemon_fails_verification() {
    let dir = tempfile::tempdir().unwrap();
    let launcher = Arc::new(MockLauncher::with_behavior(MockBehavior::Unreachable));
    let manager = ProxyManager::new(settings(&dir, 31120, 31121), launcher.clone());

    let err = manager.start_proxy(loopback(21)).await.unwrap_err();
    let ManagerError::StartupVerificationFailed { instance, reason } = &err else {
        panic!("unexpected error: {err}");
    };
    assert_eq!(instance.status, ProxyStatus::Error);
    assert!(reason.contains("after 5 attempts"), "{reason}");

    // The daemon was still alive, so it has been terminated.
    let daemon = launcher.daemon_for(&instance.id).unwrap();
    assert!(!daemon.is_running());

    let instances = manager.get_instances().await;
    assert_eq!(instances.len(), 1);
    assert_eq!(instances[0].status, ProxyStatus::Error);

    // The failed instance still holds its port.
    launcher.set_behavior(MockBehavior::Listen);
    let next = manager.start_proxy(loopback(22)).await.unwrap();
    assert_eq!(next.port, 31121);
    manager.shutdown().await;
}

#[tokio::test]
async fn daemon_exiting_during_startup_fails_fast() {
    let dir = tempfile::tempdir().unwrap();
    let launcher = Arc::new(MockLauncher::with_behavior(MockBehavior::ExitImmediately));
    let manager = ProxyManager::new(settings(&dir, 31130, 31130), launcher);

    let err = manager.start_proxy(loopback(31)).await.unwrap_err();
    assert_eq!(err.code(), "startup_verification_failed");
    assert!(err.to_string().contains("exited during startup"), "{err}");
    assert_eq!(err.instance().unwrap().status, ProxyStatus::Error);
}

#[tokio::test]
async fn spawn_failure_leaves_no_instance() {
    let dir = tempfile::tempdir().unwrap();
    let launcher = Arc::new(MockLauncher::with_behavior(MockBehavior::FailSpawn));
    let manager = ProxyManager::new(settings(&dir, 31140, 31140), launcher);

    let err = manager.start_proxy(loopback(41)).await.unwrap_err();
    assert!(matches!(err, ManagerError::ProcessSpawnFailed(_)));
    assert!(manager.get_instances().await.is_empty());
}

#[tokio::test]
async fn spawn_failure_removes_config_and_reuses_port() {
    let dir = tempfile::tempdir().unwrap();
    let launcher = Arc::new(MockLauncher::with_behavior(MockBehavior::FailSpawn));
    let manager = ProxyManager::new(settings(&dir, 31142, 31143), launcher.clone());

    manager.start_proxy(loopback(42)).await.unwrap_err();
    assert_eq!(std::fs::read_dir(dir.path()).unwrap().count(), 0);

    launcher.set_behavior(MockBehavior::Listen);
    let instance = manager.start_proxy(loopback(42)).await.unwrap();
    assert_eq!(instance.port, 31142);

    manager.stop_proxy(&instance.id).await.unwrap();
}

#[tokio::test]
async fn unwritable_runtime_dir_is_config_error() {
    let dir = tempfile::tempdir().unwrap();
    let mut settings = settings(&dir, 31145, 31145);
    settings.runtime_dir = dir.path().join("missing");
    let manager = ProxyManager::new(settings, Arc::new(MockLauncher::new()));

    let err = manager.start_proxy(loopback(45)).await.unwrap_err();
    assert_eq!(err.code(), "config_write_failed");
}

#[tokio::test]
async fn stop_unknown_instance_changes_nothing() {
    let dir = tempfile::tempdir().unwrap();
    let (manager, _launcher) = manager(&dir, 31150, 31150);
    let instance = manager.start_proxy(loopback(51)).await.unwrap();
    let before = manager.get_instances().await;

    let err = manager.stop_proxy("2001:db8::1-31150").await.unwrap_err();
    assert!(matches!(err, ManagerError::UnknownInstance(ref id) if id == "2001:db8::1-31150"));
    assert_eq!(manager.get_instances().await, before);

    manager.stop_proxy(&instance.id).await.unwrap();
}

#[tokio::test]
async fn concurrent_starts_get_distinct_ports() {
    let dir = tempfile::tempdir().unwrap();
    let (manager, _launcher) = manager(&dir, 31160, 31163);

    let (a, b, c, d) = tokio::join!(
        manager.start_proxy(loopback(61)),
        manager.start_proxy(loopback(62)),
        manager.start_proxy(loopback(63)),
        manager.start_proxy(loopback(64)),
    );
    let mut ports: Vec<u16> = [a, b, c, d]
        .into_iter()
        .map(|r| r.unwrap().port)
        .collect();
    ports.sort_unstable();
    assert_eq!(ports, vec![31160, 31161, 31162, 31163]);
    manager.shutdown().await;
}

#[tokio::test]
async fn access_control_applies_to_new_configs() {
    let dir = tempfile::tempdir().unwrap();
    let (manager, _launcher) = manager(&dir, 31170, 31171);

    let first = manager.start_proxy(loopback(71)).await.unwrap();
    manager
        .set_access_control(AccessControl::new(
            AccessMode::Restricted,
            vec!["198.51.100.4".to_string()],
        ))
        .await;
    let second = manager.start_proxy(loopback(72)).await.unwrap();

    let read = |id: &str| {
        std::fs::read_to_string(dir.path().join(format!("tinyproxy-{id}.conf"))).unwrap()
    };
    let first_config = read(&first.id);
    let second_config = read(&second.id);

    assert!(first_config.contains("Listen 127.0.0.71\n"));
    assert!(first_config.contains("Port 31170\n"));
    assert!(!first_config.contains("Allow 198.51.100.4"));
    assert!(second_config.contains("Allow 198.51.100.4"));
    manager.shutdown().await;
}

#[tokio::test]
async fn metrics_are_replaced_for_known_instances_only() {
    let dir = tempfile::tempdir().unwrap();
    let (manager, _launcher) = manager(&dir, 31180, 31180);
    let instance = manager.start_proxy(loopback(81)).await.unwrap();

    let metrics = ProxyMetrics {
        requests_total: 40,
        bytes_transmitted: 1 << 20,
        error_count: 2,
        last_request: None,
        response_time_ms: 12.5,
    };
    manager
        .update_metrics(&instance.id, metrics.clone())
        .await
        .unwrap();

    let stored = manager.get_instances().await.remove(0);
    assert_eq!(stored.metrics, metrics);
    assert!(stored.last_checked >= instance.last_checked);

    let err = manager
        .update_metrics("missing", ProxyMetrics::default())
        .await
        .unwrap_err();
    assert_eq!(err.code(), "unknown_instance");
    manager.shutdown().await;
}
