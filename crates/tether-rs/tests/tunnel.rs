//! Integration tests for the tunnel supervisor.
//!
//! Shell scripts stand in for the tunnel binary; each one prints what a real
//! client would print and then either idles or exits.

#![cfg(unix)]

mod common;

use std::os::unix::fs::PermissionsExt;
use std::path::PathBuf;
use std::sync::Arc;
use std::sync::atomic::{AtomicBool, Ordering};
use std::time::Duration;

use common::{eventually, quiet_config, spawn_backend};
use tempfile::TempDir;
use tether_rs::api::retry::RetryPolicy;
use tether_rs::config::TunnelConfig;
use tether_rs::credentials::{FnCredentials, NoCredentials, StaticToken};
use tether_rs::error::{ConnectionError, DefaultErrorClassifier};
use tether_rs::status::StatusBus;
use tether_rs::transport::{ConnectionState, TransportConnection, TunneledEndpoint};
use tether_rs::tunnel::{TunnelProcessState, TunnelSupervisor};
use tokio::time::timeout;

const RELAY: &str = "https://relay.example.com";

fn write_script(dir: &TempDir, body: &str) -> PathBuf {
    let path = dir.path().join("fake-tunnel");
    std::fs::write(&path, format!("#!/bin/sh\n{body}\n")).unwrap();
    std::fs::set_permissions(&path, std::fs::Permissions::from_mode(0o755)).unwrap();
    path
}

/// Restarts far enough in the future that none fires during a test.
fn slow_retry() -> RetryPolicy {
    RetryPolicy::tunnel().with_base_delay(Duration::from_secs(60))
}

/// Restarts quickly enough to fire during a test.
fn fast_retry() -> RetryPolicy {
    RetryPolicy::tunnel()
        .with_base_delay(Duration::from_millis(100))
        .with_max_delay(Duration::from_millis(400))
}

/// A script that exits on its first run and connects on every later one.
fn fails_once_script(dir: &TempDir) -> PathBuf {
    let marker = dir.path().join("ran-once");
    write_script(
        dir,
        &format!(
            "if [ -f '{marker}' ]; then\n\
               echo 'client: Connected'\n\
               sleep 30\n\
             fi\n\
             touch '{marker}'\n\
             exit 1",
            marker = marker.display()
        ),
    )
}

fn supervisor(relay: &str, binary: PathBuf) -> TunnelSupervisor {
    let config = TunnelConfig::new(relay)
        .with_binary_path(binary)
        .with_retry(slow_retry());
    TunnelSupervisor::new(
        config,
        Arc::new(StaticToken::new("tunnel-token")),
        StatusBus::default(),
    )
}

async fn wait_connected(tunnel: &TunnelSupervisor) -> TunnelProcessState {
    let mut state = tunnel.subscribe();
    let connected = timeout(Duration::from_secs(5), state.wait_for(|s| s.is_connected))
        .await
        .expect("tunnel did not connect in time")
        .unwrap()
        .clone();
    connected
}

#[tokio::test]
async fn port_announcement_marks_the_tunnel_connected() {
    let dir = TempDir::new().unwrap();
    let script = write_script(
        &dir,
        "echo 'client: Connecting to wss://relay.example.com'\n\
         echo 'client: tunnel ready on port 40123'\n\
         sleep 30",
    );
    let tunnel = supervisor(RELAY, script);

    tunnel.connect().unwrap();
    let state = wait_connected(&tunnel).await;
    assert_eq!(state.assigned_port, Some(40123));
    assert!(state.pid.is_some());

    // Already running: a second connect is a no-op.
    tunnel.connect().unwrap();
    assert_eq!(tunnel.state().pid, state.pid);

    tunnel.disconnect();
    assert_eq!(tunnel.state(), TunnelProcessState::default());
    assert!(!tunnel.has_pending_reconnect());
    assert_eq!(tunnel.reconnects_scheduled(), 0);
}

#[tokio::test]
async fn json_handshake_is_authoritative() {
    let dir = TempDir::new().unwrap();
    let script = write_script(
        &dir,
        "echo '{\"status\":\"connected\",\"port\":51820}'\n\
         sleep 30",
    );
    let tunnel = supervisor(RELAY, script);

    tunnel.connect().unwrap();
    let state = wait_connected(&tunnel).await;
    assert_eq!(state.assigned_port, Some(51820));
    tunnel.disconnect();
}

#[tokio::test]
async fn keyword_on_stderr_connects_without_a_port() {
    let dir = TempDir::new().unwrap();
    let script = write_script(&dir, "echo 'client: Connected (Latency 12ms)' >&2\nsleep 30");
    let tunnel = supervisor(RELAY, script);

    tunnel.connect().unwrap();
    let state = wait_connected(&tunnel).await;
    assert_eq!(state.assigned_port, None);
    tunnel.disconnect();
}

#[tokio::test]
async fn error_then_exit_schedules_exactly_one_restart() {
    let dir = TempDir::new().unwrap();
    let script = write_script(&dir, "echo 'client: connection refused' >&2\nexit 1");
    let bus = StatusBus::default();
    let mut events = bus.subscribe();
    let config = TunnelConfig::new(RELAY)
        .with_binary_path(script)
        .with_retry(slow_retry());
    let tunnel = TunnelSupervisor::new(config, Arc::new(StaticToken::new("t")), bus);

    tunnel.connect().unwrap();
    assert!(eventually(Duration::from_secs(5), || tunnel.reconnects_scheduled() == 1).await);

    // Both the error line and the exit were seen; only one restart is armed.
    tokio::time::sleep(Duration::from_millis(300)).await;
    assert_eq!(tunnel.reconnects_scheduled(), 1);
    assert!(tunnel.has_pending_reconnect());
    assert_eq!(tunnel.retry_state().attempt_count, 1);
    assert_eq!(tunnel.state(), TunnelProcessState::default());

    let states: Vec<ConnectionState> = std::iter::from_fn(|| events.try_recv().ok())
        .map(|e| e.state)
        .collect();
    assert_eq!(states, vec![ConnectionState::Connecting, ConnectionState::Error]);

    tunnel.disconnect();
    assert!(!tunnel.has_pending_reconnect());
    assert_eq!(tunnel.retry_state().attempt_count, 0);
}

#[tokio::test]
async fn restarted_process_connects_and_resets_the_counter() {
    let dir = TempDir::new().unwrap();
    let config = TunnelConfig::new(RELAY)
        .with_binary_path(fails_once_script(&dir))
        .with_retry(fast_retry());
    let tunnel = TunnelSupervisor::new(config, Arc::new(StaticToken::new("t")), StatusBus::default());

    tunnel.connect().unwrap();
    let state = wait_connected(&tunnel).await;
    assert!(state.pid.is_some());
    assert_eq!(tunnel.reconnects_scheduled(), 1);
    assert_eq!(tunnel.retry_state().attempt_count, 0);
    assert!(!tunnel.has_pending_reconnect());
    tunnel.disconnect();
}

#[tokio::test]
async fn restart_retries_while_the_token_is_missing() {
    let dir = TempDir::new().unwrap();
    let withheld = Arc::new(AtomicBool::new(false));
    let credentials = {
        let withheld = Arc::clone(&withheld);
        FnCredentials(move || (!withheld.load(Ordering::SeqCst)).then(|| "t".to_string()))
    };
    let bus = StatusBus::default();
    let mut events = bus.subscribe();
    let config = TunnelConfig::new(RELAY)
        .with_binary_path(fails_once_script(&dir))
        .with_retry(fast_retry());
    let tunnel = TunnelSupervisor::new(config, Arc::new(credentials), bus);

    tunnel.connect().unwrap();
    withheld.store(true, Ordering::SeqCst);

    // The first restart finds no token and arms another one.
    assert!(eventually(Duration::from_secs(5), || tunnel.reconnects_scheduled() >= 2).await);
    assert!(tunnel.state().pid.is_none());
    let auth_errors = std::iter::from_fn(|| events.try_recv().ok())
        .filter(|e| e.state == ConnectionState::Error)
        .filter_map(|e| e.error)
        .filter(|e| e.contains("no access token"))
        .count();
    assert!(auth_errors >= 1);

    withheld.store(false, Ordering::SeqCst);
    wait_connected(&tunnel).await;
    assert_eq!(tunnel.retry_state().attempt_count, 0);
    tunnel.disconnect();
}

#[tokio::test]
async fn undecodable_output_does_not_stop_scanning() {
    let dir = TempDir::new().unwrap();
    let script = write_script(
        &dir,
        "printf '\\377\\376\\n'\n\
         echo 'client: Connected'\n\
         sleep 30",
    );
    let tunnel = supervisor(RELAY, script);

    tunnel.connect().unwrap();
    let state = wait_connected(&tunnel).await;
    assert!(state.is_connected);
    tunnel.disconnect();
}

#[tokio::test]
async fn unexpected_exit_after_connecting_is_a_disconnection() {
    let dir = TempDir::new().unwrap();
    let script = write_script(&dir, "echo 'tunnel established, port 40200'\nsleep 0.3");
    let tunnel = supervisor(RELAY, script);

    tunnel.connect().unwrap();
    wait_connected(&tunnel).await;

    let mut state = tunnel.subscribe();
    timeout(Duration::from_secs(5), state.wait_for(|s| !s.is_connected))
        .await
        .expect("exit was not noticed")
        .unwrap();
    assert!(eventually(Duration::from_secs(2), || tunnel.has_pending_reconnect()).await);
    assert_eq!(tunnel.reconnects_scheduled(), 1);
    tunnel.disconnect();
}

#[tokio::test]
async fn missing_binary_fails_without_restarting() {
    let dir = TempDir::new().unwrap();
    let tunnel = supervisor(RELAY, dir.path().join("does-not-exist"));

    assert!(matches!(tunnel.connect(), Err(ConnectionError::Process(_))));
    assert!(!tunnel.has_pending_reconnect());
    assert_eq!(tunnel.reconnects_scheduled(), 0);
}

#[tokio::test]
async fn missing_token_is_an_auth_error() {
    let dir = TempDir::new().unwrap();
    let script = write_script(&dir, "sleep 30");
    let config = TunnelConfig::new(RELAY).with_binary_path(script);
    let tunnel = TunnelSupervisor::new(config, Arc::new(NoCredentials), StatusBus::default());

    assert!(matches!(tunnel.connect(), Err(ConnectionError::Auth(_))));
    assert!(tunnel.state().pid.is_none());
}

#[tokio::test]
async fn cloud_transport_waits_for_the_tunnel() {
    let relay = spawn_backend().await;
    let dir = TempDir::new().unwrap();
    let script = write_script(&dir, "sleep 0.3\necho 'client: Connected'\nsleep 30");
    let tunnel = supervisor(&relay.url, script);

    let endpoint = TunneledEndpoint::new(&relay.url, Arc::new(StaticToken::new("relay-token")))
        .unwrap()
        .with_tunnel(tunnel.subscribe());
    let cloud = TransportConnection::new(
        endpoint,
        quiet_config(),
        Arc::new(DefaultErrorClassifier),
        StatusBus::default(),
    )
    .unwrap();

    // Tunnel down: no request leaves and no attempt is consumed.
    assert!(matches!(
        cloud.establish_connection().await,
        Err(ConnectionError::Process(_))
    ));
    assert_eq!(relay.version_calls(), 0);
    assert_eq!(cloud.retry_state().attempt_count, 0);
    assert_eq!(cloud.state(), ConnectionState::Error);

    // Tunnel up: the transport reconnects on its own.
    tunnel.connect().unwrap();
    assert!(
        eventually(Duration::from_secs(5), || cloud.state() == ConnectionState::Connected).await
    );
    assert_eq!(relay.version_calls(), 1);

    // Tunnel down again: the transport follows.
    tunnel.disconnect();
    assert!(eventually(Duration::from_secs(2), || cloud.state() == ConnectionState::Error).await);
}
