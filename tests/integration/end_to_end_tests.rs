//! End-to-end tests driving the real session factory against a
//! stand-in server process (`sleep`) and an in-test command-channel
//! responder.

#![cfg(unix)]

use std::fs;
use std::sync::Arc;
use std::time::Duration;

use serial_test::serial;
use tokio::io::{AsyncBufReadExt, AsyncWriteExt, BufReader};
use tokio::net::TcpListener;
use tokio_util::sync::CancellationToken;

use game_warden::control::RestartCoordinator;
use game_warden::hooks::{LoggingEventConsumer, LoggingJobManager, NullCommandRegistrar};
use game_warden::models::build::Build;
use game_warden::models::launch::{LaunchParameters, SecurityLevel, Visibility};
use game_warden::models::session::ExitKind;
use game_warden::persistence::{db, reattach_store::ReattachStore};
use game_warden::registry::BuildRegistry;
use game_warden::session::process::pid_alive;
use game_warden::session::{ProcessSessionFactory, SessionFactory};
use game_warden::watchdog::{Watchdog, WatchdogState};
use game_warden::AppError;

use super::support::wait_until;

/// Answer every command-channel request on the listener with a healthy
/// reply, forever.
fn spawn_world_responder(listener: TcpListener) {
    tokio::spawn(async move {
        while let Ok((stream, _)) = listener.accept().await {
            tokio::spawn(async move {
                let (read_half, mut write_half) = stream.into_split();
                let mut line = String::new();
                let mut reader = BufReader::new(read_half);
                if reader.read_line(&mut line).await.is_ok() {
                    let _ = write_half
                        .write_all(b"{\"ok\": true, \"reboot_count\": 0}\n")
                        .await;
                }
            });
        }
    });
}

async fn bound_port() -> (TcpListener, u16) {
    let listener = TcpListener::bind("127.0.0.1:0").await.expect("bind");
    let port = listener.local_addr().expect("addr").port();
    (listener, port)
}

fn params_for(port: u16) -> LaunchParameters {
    LaunchParameters {
        primary_port: port,
        secondary_port: port.wrapping_add(1).max(1),
        security_level: SecurityLevel::Safe,
        visibility: Visibility::Public,
        startup_timeout_seconds: 10,
        topic_timeout_seconds: 1,
        shutdown_grace_seconds: 1,
        health_check_interval_seconds: 3600,
        health_check_failure_limit: 3,
        auto_update: false,
        restart_on_crash: false,
        additional_arguments: Vec::new(),
    }
}

/// Registry seeded with one real on-disk build directory.
fn registry_with_build(dir: &std::path::Path) -> Arc<BuildRegistry> {
    fs::write(dir.join("world.pack"), b"compiled world").expect("entrypoint");
    let registry = Arc::new(BuildRegistry::new());
    registry.install(Build::new(
        "live-build".into(),
        dir.to_path_buf(),
        "world.pack".into(),
    ));
    registry
}

fn sleep_factory(scope: &CancellationToken) -> ProcessSessionFactory {
    ProcessSessionFactory::new(
        "/bin/sleep".into(),
        vec!["300".to_owned()],
        "127.0.0.1".into(),
        scope.clone(),
    )
}

// ── Factory against a live process ───────────────────────────

#[tokio::test]
#[serial]
async fn factory_launches_and_terminates_a_real_process() {
    let dir = tempfile::tempdir().expect("tempdir");
    let registry = registry_with_build(dir.path());
    let (listener, port) = bound_port().await;
    spawn_world_responder(listener);

    let scope = CancellationToken::new();
    let factory = sleep_factory(&scope);
    let params = params_for(port);
    let handle = Arc::new(registry.acquire_latest(1).expect("acquire"));

    let cancel = CancellationToken::new();
    let session = factory
        .launch_new(&params, handle, None, true, &cancel)
        .await
        .expect("launch");

    let pid = session.pid().expect("pid");
    assert!(pid_alive(pid), "server process must be running");
    assert!(session.launch_result().startup_time > Duration::ZERO);
    assert_eq!(registry.reference_count("live-build"), Some(1));

    // Graceful terminate: the stand-in ignores the shutdown request, so
    // the grace period lapses and the hard kill lands.
    session.terminate(false).await;
    let exit = session.wait_exit().await;
    assert_eq!(exit.kind, ExitKind::Killed);
    assert!(!pid_alive(pid), "process must be gone after terminate");

    let released = wait_until(
        || registry.reference_count("live-build") == Some(0),
        Duration::from_secs(5),
    )
    .await;
    assert!(released, "session exit must release its build unit");
}

#[tokio::test]
#[serial]
async fn handshake_timeout_fails_the_launch_and_kills_the_child() {
    let dir = tempfile::tempdir().expect("tempdir");
    let registry = registry_with_build(dir.path());
    // Nothing listens on this port: the handshake can never complete.
    let (listener, port) = bound_port().await;
    drop(listener);

    let scope = CancellationToken::new();
    let factory = sleep_factory(&scope);
    let mut params = params_for(port);
    params.startup_timeout_seconds = 2;
    let handle = Arc::new(registry.acquire_latest(1).expect("acquire"));
    let cleanup = Arc::clone(&handle);

    let cancel = CancellationToken::new();
    let result = factory.launch_new(&params, handle, None, true, &cancel).await;
    assert!(matches!(result, Err(AppError::Launch(_))));

    // The caller's units are untouched on failure; release them.
    cleanup.release_remaining();
    assert_eq!(registry.reference_count("live-build"), Some(0));
}

#[tokio::test]
#[serial]
async fn early_process_exit_fails_the_launch() {
    let dir = tempfile::tempdir().expect("tempdir");
    let registry = registry_with_build(dir.path());
    let (listener, port) = bound_port().await;
    drop(listener);

    let scope = CancellationToken::new();
    let factory = ProcessSessionFactory::new(
        "/bin/false".into(),
        Vec::new(),
        "127.0.0.1".into(),
        scope.clone(),
    );
    let params = params_for(port);
    let handle = Arc::new(registry.acquire_latest(1).expect("acquire"));
    let cleanup = Arc::clone(&handle);

    let cancel = CancellationToken::new();
    let result = factory.launch_new(&params, handle, None, true, &cancel).await;
    match result {
        Err(AppError::Launch(message)) => {
            assert!(message.contains("exited during startup"), "got: {message}");
        }
        other => panic!("expected launch failure, got {other:?}"),
    }
    cleanup.release_remaining();
}

#[tokio::test]
#[serial]
async fn cancelled_handshake_kills_the_child() {
    let dir = tempfile::tempdir().expect("tempdir");
    let registry = registry_with_build(dir.path());
    let (listener, port) = bound_port().await;
    drop(listener);

    let scope = CancellationToken::new();
    let factory = sleep_factory(&scope);
    let params = params_for(port);
    let handle = Arc::new(registry.acquire_latest(1).expect("acquire"));
    let cleanup = Arc::clone(&handle);

    let cancel = CancellationToken::new();
    let trigger = cancel.clone();
    tokio::spawn(async move {
        tokio::time::sleep(Duration::from_millis(200)).await;
        trigger.cancel();
    });

    let result = factory.launch_new(&params, handle, None, true, &cancel).await;
    assert!(matches!(result, Err(AppError::Cancelled)));
    cleanup.release_remaining();
}

// ── Reattach against a live process ──────────────────────────

#[tokio::test]
#[serial]
async fn factory_adopts_a_running_process_from_a_record() {
    let dir = tempfile::tempdir().expect("tempdir");
    let registry = registry_with_build(dir.path());
    let (listener, port) = bound_port().await;
    spawn_world_responder(listener);

    // A "previous supervisor's" server: spawn it ourselves and let a
    // reaper task collect it once it dies.
    let mut orphan = tokio::process::Command::new("/bin/sleep")
        .arg("300")
        .spawn()
        .expect("spawn orphan");
    let pid = orphan.id().expect("orphan pid");
    tokio::spawn(async move {
        let _ = orphan.wait().await;
    });

    let record = game_warden::models::reattach::ReattachRecord {
        process_id: pid,
        process_start_ticks: game_warden::session::process::process_start_ticks(pid).unwrap_or(0),
        access_token: "recorded-token".into(),
        host: "127.0.0.1".into(),
        port,
        build_id: "live-build".into(),
        role: game_warden::models::reattach::SessionRole::Primary,
    };

    let scope = CancellationToken::new();
    let factory = sleep_factory(&scope);
    let params = params_for(port);
    let handle = Arc::new(registry.acquire_latest(1).expect("acquire"));

    let cancel = CancellationToken::new();
    let session = factory
        .launch_new(&params, handle, Some(record), true, &cancel)
        .await
        .expect("adopt");

    assert_eq!(session.pid(), Some(pid), "session rides the recorded pid");
    assert!(pid_alive(pid));

    session.terminate(true).await;
    let exit = session.wait_exit().await;
    assert_eq!(exit.kind, ExitKind::Killed);

    let released = wait_until(
        || registry.reference_count("live-build") == Some(0),
        Duration::from_secs(10),
    )
    .await;
    assert!(released);
}

// ── Full watchdog scenario ───────────────────────────────────

#[tokio::test]
#[serial]
async fn watchdog_scenario_launch_then_terminate() {
    let dir = tempfile::tempdir().expect("tempdir");
    let registry = registry_with_build(dir.path());
    let (listener, port) = bound_port().await;
    spawn_world_responder(listener);

    let pool = Arc::new(db::connect_memory().await.expect("db"));
    let store = ReattachStore::new(Arc::clone(&pool));

    let scope = CancellationToken::new();
    let control = RestartCoordinator::new();
    let registrar = NullCommandRegistrar::default();
    let ct = CancellationToken::new();

    let watchdog = Watchdog::new(
        params_for(port),
        Arc::clone(&registry),
        Arc::new(sleep_factory(&scope)),
        store.clone(),
        Arc::new(LoggingEventConsumer),
        Arc::new(LoggingJobManager::default()),
        &control,
        &registrar,
        ct.clone(),
    )
    .expect("watchdog");

    watchdog.launch(&ct).await.expect("launch");
    let status = watchdog.status();
    assert_eq!(status.state, WatchdogState::Running);
    assert_eq!(status.build_id.as_deref(), Some("live-build"));
    let pid = status.pid.expect("pid");
    assert!(pid_alive(pid));
    assert!(store.peek().await.expect("peek").is_some());

    // Terminate(false): hard stop, bounded window.
    let stopped = tokio::time::timeout(Duration::from_secs(10), watchdog.terminate(false, &ct))
        .await
        .expect("terminate within bounded window");
    stopped.expect("terminate");

    assert_eq!(watchdog.status().state, WatchdogState::Terminated);
    assert!(!pid_alive(pid));
    assert!(store.peek().await.expect("peek").is_none());

    let released = wait_until(
        || registry.reference_count("live-build") == Some(0),
        Duration::from_secs(5),
    )
    .await;
    assert!(released, "zero live processes and zero held units");
}
