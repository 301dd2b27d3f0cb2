//! Unit tests for collaborator hooks and the restart coordinator.

use std::sync::Arc;

use async_trait::async_trait;
use game_warden::control::RestartCoordinator;
use game_warden::hooks::{
    CommandHandler, CommandRegistrar, JobManager, LoggingJobManager, NullCommandRegistrar,
    RestartHandler, ServerControl, WatchdogEvent,
};
use game_warden::{AppError, Result};

struct NoopHandler;

#[async_trait]
impl RestartHandler for NoopHandler {
    async fn before_restart(&self) -> Result<()> {
        Ok(())
    }
}

struct FailingHandler;

#[async_trait]
impl RestartHandler for FailingHandler {
    async fn before_restart(&self) -> Result<()> {
        Err(AppError::Reattach("disk gone".into()))
    }
}

// ── Restart registration lifecycle ───────────────────────────

#[tokio::test]
async fn register_and_release_round_trip() {
    let coordinator = RestartCoordinator::new();
    assert_eq!(coordinator.registration_count(), 0);

    let registration = coordinator.register_for_restart(Arc::new(NoopHandler));
    assert_eq!(coordinator.registration_count(), 1);

    registration.release();
    assert_eq!(coordinator.registration_count(), 0);
}

#[tokio::test]
async fn notify_restart_reaches_registered_handlers() {
    let coordinator = RestartCoordinator::new();
    let _registration = coordinator.register_for_restart(Arc::new(NoopHandler));
    coordinator.notify_restart().await.expect("notify");
}

#[tokio::test]
async fn handler_failure_is_fatal_to_the_restart_path() {
    let coordinator = RestartCoordinator::new();
    let _registration = coordinator.register_for_restart(Arc::new(FailingHandler));
    assert!(coordinator.notify_restart().await.is_err());
}

#[tokio::test]
async fn released_handler_is_not_notified() {
    let coordinator = RestartCoordinator::new();
    let registration = coordinator.register_for_restart(Arc::new(FailingHandler));
    registration.release();

    // The failing handler is gone, so nothing can fail.
    coordinator.notify_restart().await.expect("notify");
}

// ── Job manager ──────────────────────────────────────────────

#[tokio::test]
async fn job_ids_are_unique_and_increasing() {
    let jobs = LoggingJobManager::default();
    let first = jobs.begin("first").await;
    let second = jobs.begin("second").await;
    assert!(second > first);

    jobs.complete(first).await;
    jobs.fail(second, "broke").await;
}

// ── Command registrar ────────────────────────────────────────

struct EchoHandler;

impl CommandHandler for EchoHandler {
    fn handle_command(&self, command: &str) -> String {
        command.to_owned()
    }
}

#[test]
fn registrar_records_handlers() {
    let registrar = NullCommandRegistrar::default();
    assert_eq!(registrar.handler_count(), 0);

    registrar.register_command_handler(Arc::new(EchoHandler));
    assert_eq!(registrar.handler_count(), 1);
}

// ── Event names ──────────────────────────────────────────────

#[test]
fn event_names_are_stable_hook_identifiers() {
    assert_eq!(WatchdogEvent::Launch.name(), "launch");
    assert_eq!(WatchdogEvent::Crash.name(), "crash");
    assert_eq!(WatchdogEvent::RolloverComplete.name(), "rollover_complete");
    assert_eq!(WatchdogEvent::Detach.name(), "detach");
}
