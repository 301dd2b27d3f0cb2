//! Collaborator contracts the watchdog core consumes.
//!
//! The web layer, job tracking, chat integration and host restart
//! control all live outside this crate; the watchdog only sees the
//! traits below. Logging implementations are provided for running the
//! daemon standalone.

use std::sync::atomic::{AtomicU64, Ordering};
use std::sync::{Arc, Mutex};

use async_trait::async_trait;
use tokio_util::sync::CancellationToken;
use tracing::{info, warn};

use crate::Result;

/// Lifecycle events dispatched to hook scripts.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum WatchdogEvent {
    /// A session completed its launch.
    Launch,
    /// The watchdog shut its session down on request.
    Shutdown,
    /// The session's process exited without a terminate in flight.
    Crash,
    /// The world performed an in-game reboot without exiting.
    Reboot,
    /// A rollover to a newer build began.
    RolloverStarted,
    /// A rollover finished; the secondary is now primary.
    RolloverComplete,
    /// A rollover was abandoned; the old primary kept serving.
    RolloverFailed,
    /// The daemon detached, leaving the session running.
    Detach,
    /// The session stopped answering health probes.
    HealthCheckFailed,
}

impl WatchdogEvent {
    /// Hook-script name for the event.
    #[must_use]
    pub fn name(self) -> &'static str {
        match self {
            Self::Launch => "launch",
            Self::Shutdown => "shutdown",
            Self::Crash => "crash",
            Self::Reboot => "reboot",
            Self::RolloverStarted => "rollover_started",
            Self::RolloverComplete => "rollover_complete",
            Self::RolloverFailed => "rollover_failed",
            Self::Detach => "detach",
            Self::HealthCheckFailed => "health_check_failed",
        }
    }
}

/// Consumer of lifecycle events (hook scripts).
#[async_trait]
pub trait EventConsumer: Send + Sync {
    /// Handle one event. Returning `false` signals a hook script
    /// failure; the watchdog logs it and moves on — it is never thrown
    /// across this boundary.
    async fn handle_event(
        &self,
        event: WatchdogEvent,
        parameters: &[String],
        cancel: &CancellationToken,
    ) -> bool;
}

/// Event consumer that only logs; used when no hook scripts are wired.
pub struct LoggingEventConsumer;

#[async_trait]
impl EventConsumer for LoggingEventConsumer {
    async fn handle_event(
        &self,
        event: WatchdogEvent,
        parameters: &[String],
        _cancel: &CancellationToken,
    ) -> bool {
        info!(event = event.name(), ?parameters, "lifecycle event");
        true
    }
}

/// Registers long operations as externally observable units of work.
#[async_trait]
pub trait JobManager: Send + Sync {
    /// Register a new job and return its identifier.
    async fn begin(&self, description: &str) -> u64;

    /// Mark a job finished.
    async fn complete(&self, job_id: u64);

    /// Mark a job failed. Failures inside the core are reported here,
    /// not raised as uncaught errors.
    async fn fail(&self, job_id: u64, reason: &str);
}

/// Job manager that tracks nothing beyond the log stream.
#[derive(Default)]
pub struct LoggingJobManager {
    next_id: AtomicU64,
}

#[async_trait]
impl JobManager for LoggingJobManager {
    async fn begin(&self, description: &str) -> u64 {
        let job_id = self.next_id.fetch_add(1, Ordering::SeqCst) + 1;
        info!(job_id, description, "job started");
        job_id
    }

    async fn complete(&self, job_id: u64) {
        info!(job_id, "job complete");
    }

    async fn fail(&self, job_id: u64, reason: &str) {
        warn!(job_id, reason, "job failed");
    }
}

/// Handler invoked shortly before the host restarts.
#[async_trait]
pub trait RestartHandler: Send + Sync {
    /// Persist whatever must survive the restart. Must return quickly.
    ///
    /// # Errors
    ///
    /// Any error is fatal to the restart path; a missed persist means
    /// the next supervisor instance cannot recover the running process.
    async fn before_restart(&self) -> Result<()>;
}

/// Subscription token returned by
/// [`ServerControl::register_for_restart`]; releasing it unsubscribes.
pub struct RestartRegistration {
    unsubscribe: Option<Box<dyn FnOnce() + Send>>,
}

impl RestartRegistration {
    /// Build a registration around an unsubscribe action.
    #[must_use]
    pub fn new(unsubscribe: impl FnOnce() + Send + 'static) -> Self {
        Self {
            unsubscribe: Some(Box::new(unsubscribe)),
        }
    }

    /// Explicitly unsubscribe the handler.
    pub fn release(mut self) {
        if let Some(unsubscribe) = self.unsubscribe.take() {
            unsubscribe();
        }
    }
}

/// Host control surface offering the pre-restart notification.
pub trait ServerControl: Send + Sync {
    /// Subscribe a handler to the host's "about to restart"
    /// notification.
    fn register_for_restart(&self, handler: Arc<dyn RestartHandler>) -> RestartRegistration;
}

/// Handler for operator commands arriving through the chat integration.
pub trait CommandHandler: Send + Sync {
    /// Answer one command with response text.
    fn handle_command(&self, command: &str) -> String;
}

/// The chat integration's command-registration hook. Only this hook is
/// consumed here; message routing lives outside the crate.
pub trait CommandRegistrar: Send + Sync {
    /// Register the watchdog's command handler.
    fn register_command_handler(&self, handler: Arc<dyn CommandHandler>);
}

/// Registrar that records handlers but routes nothing; used when no
/// chat integration is wired.
#[derive(Default)]
pub struct NullCommandRegistrar {
    handlers: Mutex<Vec<Arc<dyn CommandHandler>>>,
}

impl NullCommandRegistrar {
    /// Number of handlers registered so far.
    #[must_use]
    pub fn handler_count(&self) -> usize {
        self.handlers.lock().map_or(0, |handlers| handlers.len())
    }
}

impl CommandRegistrar for NullCommandRegistrar {
    fn register_command_handler(&self, handler: Arc<dyn CommandHandler>) {
        if let Ok(mut handlers) = self.handlers.lock() {
            handlers.push(handler);
        }
    }
}
