//! The process-supervision state machine.
//!
//! Composes the build registry, session factory, reattach store and
//! collaborator hooks into the watchdog: launch (with reattach),
//! terminate, automatic rollover to newer builds, crash relaunch,
//! health probing, and durable handoff before host restarts.
//!
//! One mutex protects the state-transition decisions (which session is
//! primary, whether a terminate is in flight). It is a `std` mutex held
//! only across decision logic — the guard cannot live across an
//! `.await`, so no status query ever stalls behind process I/O.

use std::sync::{Arc, Mutex, MutexGuard};

use async_trait::async_trait;
use chrono::{DateTime, Utc};
use serde::Serialize;
use tokio_util::sync::CancellationToken;
use tracing::{debug, error, info, warn};

use crate::hooks::{
    CommandHandler, CommandRegistrar, EventConsumer, JobManager, RestartHandler,
    RestartRegistration, ServerControl, WatchdogEvent,
};
use crate::models::launch::LaunchParameters;
use crate::models::reattach::SessionRole;
use crate::models::session::SessionExit;
use crate::persistence::reattach_store::ReattachStore;
use crate::registry::BuildRegistry;
use crate::session::{Session, SessionFactory};
use crate::{AppError, Result};

/// Lifecycle states of the watchdog.
#[derive(Debug, Clone, Copy, Serialize, PartialEq, Eq)]
#[serde(rename_all = "snake_case")]
pub enum WatchdogState {
    /// No session; initial state and the crash-path resting state.
    Offline,
    /// Attempting to adopt a running process from a reattach record.
    Reattaching,
    /// Spawning a fresh session.
    Starting,
    /// One primary session serving.
    Running,
    /// Primary still serving while a secondary launches on a new build.
    RollingOver,
    /// Stopped on operator request.
    Terminated,
}

/// Point-in-time snapshot of the watchdog.
#[derive(Debug, Clone, Serialize)]
pub struct WatchdogStatus {
    /// Current state.
    pub state: WatchdogState,
    /// Pid of the live session, when any.
    pub pid: Option<u32>,
    /// Port of the live session, when any.
    pub port: Option<u16>,
    /// Build the live session is bound to, when any.
    pub build_id: Option<String>,
    /// When the live session went primary.
    pub since: Option<DateTime<Utc>>,
}

struct Inner {
    state: WatchdogState,
    session: Option<Arc<dyn Session>>,
    since: Option<DateTime<Utc>>,
    /// Set while a terminate is in flight so exits are not treated as
    /// crashes and in-flight launches abort instead of committing.
    terminating: bool,
    health_failures: u32,
}

/// The orchestrating state machine.
pub struct Watchdog {
    params: LaunchParameters,
    registry: Arc<BuildRegistry>,
    factory: Arc<dyn SessionFactory>,
    store: ReattachStore,
    events: Arc<dyn EventConsumer>,
    jobs: Arc<dyn JobManager>,
    inner: Mutex<Inner>,
    /// Serializes launch, terminate and rollover against each other.
    /// Status queries use only the decision mutex and never wait here.
    op_gate: tokio::sync::Mutex<()>,
    restart_registration: Mutex<Option<RestartRegistration>>,
    cancel: CancellationToken,
}

impl Watchdog {
    /// Assemble the watchdog and register it with the host's restart
    /// hook and the chat integration's command hook.
    ///
    /// # Errors
    ///
    /// Returns `AppError::Construction` when the launch parameters are
    /// unusable (identical or zero rollover ports).
    #[allow(clippy::too_many_arguments)]
    pub fn new(
        params: LaunchParameters,
        registry: Arc<BuildRegistry>,
        factory: Arc<dyn SessionFactory>,
        store: ReattachStore,
        events: Arc<dyn EventConsumer>,
        jobs: Arc<dyn JobManager>,
        server_control: &dyn ServerControl,
        command_registrar: &dyn CommandRegistrar,
        cancel: CancellationToken,
    ) -> Result<Arc<Self>> {
        if params.primary_port == 0 || params.secondary_port == 0 {
            return Err(AppError::Construction("game ports must be non-zero".into()));
        }
        if params.primary_port == params.secondary_port {
            return Err(AppError::Construction(
                "primary and secondary ports must differ".into(),
            ));
        }

        let watchdog = Arc::new(Self {
            params,
            registry,
            factory,
            store,
            events,
            jobs,
            inner: Mutex::new(Inner {
                state: WatchdogState::Offline,
                session: None,
                since: None,
                terminating: false,
                health_failures: 0,
            }),
            op_gate: tokio::sync::Mutex::new(()),
            restart_registration: Mutex::new(None),
            cancel,
        });

        let registration = server_control
            .register_for_restart(Arc::clone(&watchdog) as Arc<dyn RestartHandler>);
        if let Ok(mut slot) = watchdog.restart_registration.lock() {
            *slot = Some(registration);
        }

        command_registrar.register_command_handler(Arc::clone(&watchdog) as Arc<dyn CommandHandler>);

        Ok(watchdog)
    }

    /// Current snapshot; never blocks behind process I/O.
    #[must_use]
    pub fn status(&self) -> WatchdogStatus {
        let inner = self.lock();
        let session = inner.session.as_ref();
        WatchdogStatus {
            state: inner.state,
            pid: session.and_then(|s| s.pid()),
            port: session.map(|s| s.port()),
            build_id: session.map(|s| s.build_id().to_owned()),
            since: inner.since,
        }
    }

    /// Bring a session up: reattach when a valid record exists,
    /// otherwise acquire the latest build and spawn fresh.
    ///
    /// # Errors
    ///
    /// `AppError::InvalidState` when a session is live or an operation
    /// is in flight; `AppError::Launch` when the spawn or handshake
    /// fails (the watchdog returns to `Offline`, retry is the caller's
    /// choice); `AppError::Cancelled` when `cancel` fires mid-launch —
    /// no session is left tracked and no build reference leaks.
    pub async fn launch(&self, cancel: &CancellationToken) -> Result<()> {
        let _gate = self.op_gate.lock().await;
        {
            let mut inner = self.lock();
            match inner.state {
                WatchdogState::Offline | WatchdogState::Terminated => {
                    inner.state = WatchdogState::Reattaching;
                    inner.terminating = false;
                }
                state => {
                    return Err(AppError::InvalidState(format!(
                        "launch rejected while {state:?}"
                    )))
                }
            }
        }

        match self.try_reattach(cancel).await {
            Ok(true) => return Ok(()),
            Ok(false) => {}
            Err(err) => {
                self.lock().state = WatchdogState::Offline;
                return Err(err);
            }
        }

        self.lock().state = WatchdogState::Starting;
        let result = self.launch_fresh(cancel).await;
        if result.is_err() {
            self.lock().state = WatchdogState::Offline;
        }
        result
    }

    /// Stop the live session and park the machine in `Terminated`.
    ///
    /// Graceful termination issues an in-band shutdown request with a
    /// bounded grace period before the hard kill. Idempotent: a no-op
    /// when already `Offline` or `Terminated`. A cancellation arriving
    /// mid-terminate escalates to a hard kill and the terminate is
    /// completed rather than unwound.
    ///
    /// # Errors
    ///
    /// Returns `AppError::Db` when the reattach record cannot be
    /// cleared.
    pub async fn terminate(&self, graceful: bool, cancel: &CancellationToken) -> Result<()> {
        self.terminate_inner(graceful, cancel, true).await
    }

    /// Persist the handoff record and leave the session running.
    ///
    /// Used on daemon shutdown when the server should survive the
    /// supervisor; the next instance reattaches from the record.
    ///
    /// # Errors
    ///
    /// Returns `AppError::Reattach` when the record cannot be written —
    /// the caller must not pretend the handoff is safe.
    pub async fn detach(&self) -> Result<()> {
        let session = { self.lock().session.clone() };
        let Some(session) = session else {
            return Ok(());
        };

        let record = session
            .reattach_record(SessionRole::Primary)
            .ok_or_else(|| AppError::Reattach("live session has no adoptable identity".into()))?;
        self.store.persist(&record).await?;
        self.dispatch(WatchdogEvent::Detach, vec![record.build_id.clone()])
            .await;
        info!(pid = record.process_id, "detached, server left running");
        Ok(())
    }

    /// Release the host restart registration.
    pub fn release_restart_registration(&self) {
        if let Ok(mut slot) = self.restart_registration.lock() {
            if let Some(registration) = slot.take() {
                registration.release();
            }
        }
    }

    /// Drive the watchdog's signals until `cancel` fires: newer-build
    /// notifications, health probes, session exits and in-game reboots.
    pub async fn run(self: Arc<Self>, cancel: CancellationToken) {
        let mut newer = self.registry.subscribe();
        let mut health = tokio::time::interval(self.params.health_check_interval());
        health.set_missed_tick_behavior(tokio::time::MissedTickBehavior::Skip);

        // A compile may have landed between launch and here.
        self.handle_newer_build(&cancel).await;

        loop {
            let session = { self.lock().session.clone() };

            tokio::select! {
                () = cancel.cancelled() => {
                    debug!("watchdog loop stopped");
                    return;
                }
                changed = newer.changed() => {
                    if changed.is_err() {
                        return;
                    }
                    self.handle_newer_build(&cancel).await;
                }
                _ = health.tick(), if session.is_some() => {
                    self.handle_health_tick(&cancel).await;
                }
                exit = wait_exit_opt(session.clone()) => {
                    if let Some(session) = session.clone() {
                        self.handle_session_exit(&session, exit, &cancel).await;
                    }
                }
                reboot = next_reboot_opt(session.clone()) => {
                    if let Some(count) = reboot {
                        self.handle_reboot(count).await;
                    }
                }
            }
        }
    }

    // ── Launch internals ─────────────────────────────────────────

    async fn try_reattach(&self, cancel: &CancellationToken) -> Result<bool> {
        let Some(record) = self.store.take().await? else {
            return Ok(false);
        };

        let Some(handle) = self.registry.acquire(&record.build_id, 1) else {
            info!(
                build_id = %record.build_id,
                "recorded build no longer registered, launching fresh"
            );
            return Ok(false);
        };
        let handle = Arc::new(handle);
        let cleanup = Arc::clone(&handle);

        match self
            .factory
            .launch_new(&self.params, handle, Some(record), true, cancel)
            .await
        {
            Ok(session) => {
                self.commit_running(session, true).await?;
                Ok(true)
            }
            Err(AppError::Cancelled) => {
                cleanup.release_remaining();
                Err(AppError::Cancelled)
            }
            Err(err) => {
                cleanup.release_remaining();
                warn!(%err, "reattach failed, launching fresh");
                Ok(false)
            }
        }
    }

    async fn launch_fresh(&self, cancel: &CancellationToken) -> Result<()> {
        let handle = Arc::new(self.registry.acquire_latest(1)?);
        let cleanup = Arc::clone(&handle);
        let job = self.jobs.begin("launching game server").await;

        match self
            .factory
            .launch_new(&self.params, handle, None, true, cancel)
            .await
        {
            Ok(session) => {
                self.commit_running(session, false).await?;
                self.jobs.complete(job).await;
                Ok(())
            }
            Err(err) => {
                cleanup.release_remaining();
                self.jobs.fail(job, &err.to_string()).await;
                Err(err)
            }
        }
    }

    /// Persist the new session's record and publish it as primary.
    ///
    /// If a terminate raced the launch, the fresh session is stopped
    /// instead of committed and the launch reports cancellation.
    async fn commit_running(&self, session: Arc<dyn Session>, reattached: bool) -> Result<()> {
        if let Some(record) = session.reattach_record(SessionRole::Primary) {
            if let Err(err) = self.store.persist(&record).await {
                warn!(%err, "could not persist reattach record after launch");
            }
        }

        let aborted = {
            let mut inner = self.lock();
            if inner.terminating {
                true
            } else {
                inner.state = WatchdogState::Running;
                inner.session = Some(Arc::clone(&session));
                inner.since = Some(Utc::now());
                inner.health_failures = 0;
                false
            }
        };

        if aborted {
            warn!("terminate raced the launch, stopping fresh session");
            session.terminate(true).await;
            let _ = self.store.clear().await;
            return Err(AppError::Cancelled);
        }

        let startup_ms =
            u64::try_from(session.launch_result().startup_time.as_millis()).unwrap_or(u64::MAX);
        info!(
            pid = ?session.pid(),
            port = session.port(),
            build_id = %session.build_id(),
            startup_ms,
            reattached,
            "session running"
        );
        self.dispatch(
            WatchdogEvent::Launch,
            vec![session.build_id().to_owned(), reattached.to_string()],
        )
        .await;
        Ok(())
    }

    // ── Terminate internals ──────────────────────────────────────

    async fn terminate_inner(
        &self,
        graceful: bool,
        cancel: &CancellationToken,
        dispatch_shutdown: bool,
    ) -> Result<()> {
        let _gate = self.op_gate.lock().await;
        let session = {
            let mut inner = self.lock();
            match inner.state {
                WatchdogState::Offline | WatchdogState::Terminated => return Ok(()),
                _ => {}
            }
            inner.terminating = true;
            inner.session.clone()
        };

        if let Some(session) = session {
            if graceful {
                tokio::select! {
                    () = session.terminate(false) => {}
                    () = cancel.cancelled() => {
                        // Late cancellation escalates; the terminate is
                        // completed, not unwound.
                        session.terminate(true).await;
                    }
                }
            } else {
                session.terminate(true).await;
            }
            let exit = session.wait_exit().await;
            debug!(kind = ?exit.kind, code = ?exit.code, "session termination signal resolved");
        }

        self.store.clear().await?;

        {
            let mut inner = self.lock();
            inner.state = WatchdogState::Terminated;
            inner.session = None;
            inner.since = None;
            inner.terminating = false;
            inner.health_failures = 0;
        }

        if dispatch_shutdown {
            self.dispatch(WatchdogEvent::Shutdown, Vec::new()).await;
        }
        info!("watchdog terminated");
        Ok(())
    }

    // ── Run-loop handlers ────────────────────────────────────────

    async fn handle_newer_build(&self, cancel: &CancellationToken) {
        let _gate = self.op_gate.lock().await;
        let (eligible, old_session) = {
            let inner = self.lock();
            (
                inner.state == WatchdogState::Running && self.params.auto_update,
                inner.session.clone(),
            )
        };
        let Some(old_session) = old_session else {
            return;
        };
        if !eligible {
            debug!("newer build noted, rollover not eligible now");
            return;
        }
        if self.registry.latest_id().as_deref() == Some(old_session.build_id()) {
            return;
        }

        self.lock().state = WatchdogState::RollingOver;
        self.dispatch(WatchdogEvent::RolloverStarted, Vec::new()).await;
        let job = self.jobs.begin("rolling over to newer build").await;

        // Two units: one rides with the secondary session, one covers
        // the swap itself and is released when the rollover settles.
        let handle = match self.registry.acquire_latest(2) {
            Ok(handle) => Arc::new(handle),
            Err(err) => {
                error!(%err, "could not acquire new build for rollover");
                self.rollback_rollover_state();
                self.jobs.fail(job, &err.to_string()).await;
                return;
            }
        };
        let cleanup = Arc::clone(&handle);

        match self
            .factory
            .launch_new(&self.params, handle, None, false, cancel)
            .await
        {
            Ok(secondary) => {
                let promoted = {
                    let mut inner = self.lock();
                    if inner.state == WatchdogState::RollingOver && !inner.terminating {
                        inner.session = Some(Arc::clone(&secondary));
                        inner.since = Some(Utc::now());
                        inner.state = WatchdogState::Running;
                        inner.health_failures = 0;
                        true
                    } else {
                        false
                    }
                };

                if promoted {
                    if let Some(record) = secondary.reattach_record(SessionRole::Primary) {
                        if let Err(err) = self.store.persist(&record).await {
                            warn!(%err, "could not persist record after rollover");
                        }
                    }

                    old_session.terminate(false).await;
                    let exit = old_session.wait_exit().await;
                    debug!(kind = ?exit.kind, "old primary stopped after rollover");

                    cleanup.release_unit();
                    info!(build_id = %secondary.build_id(), "rollover complete");
                    self.dispatch(
                        WatchdogEvent::RolloverComplete,
                        vec![secondary.build_id().to_owned()],
                    )
                    .await;
                    self.jobs.complete(job).await;
                } else {
                    // A terminate won the race; stop the candidate and
                    // give back both units.
                    warn!("rollover abandoned, terminate in flight");
                    secondary.terminate(true).await;
                    let _ = secondary.wait_exit().await;
                    cleanup.release_remaining();
                    self.jobs.fail(job, "terminated during rollover").await;
                }
            }
            Err(err) => {
                cleanup.release_remaining();
                self.rollback_rollover_state();
                warn!(%err, "secondary launch failed, primary untouched");
                self.dispatch(WatchdogEvent::RolloverFailed, vec![err.to_string()])
                    .await;
                self.jobs.fail(job, &err.to_string()).await;
            }
        }
    }

    fn rollback_rollover_state(&self) {
        let mut inner = self.lock();
        if inner.state == WatchdogState::RollingOver {
            inner.state = WatchdogState::Running;
        }
    }

    async fn handle_health_tick(&self, cancel: &CancellationToken) {
        let session = {
            let inner = self.lock();
            if inner.state != WatchdogState::Running {
                return;
            }
            inner.session.clone()
        };
        let Some(session) = session else {
            return;
        };

        match session.check_health().await {
            Ok(()) => {
                self.lock().health_failures = 0;
            }
            Err(err) => {
                let failures = {
                    let mut inner = self.lock();
                    inner.health_failures += 1;
                    inner.health_failures
                };
                warn!(%err, failures, "health probe failed");

                if failures >= self.params.health_check_failure_limit {
                    self.dispatch(WatchdogEvent::HealthCheckFailed, vec![failures.to_string()])
                        .await;
                    self.restart_unhealthy(cancel).await;
                }
            }
        }
    }

    /// Replace a session that stopped answering probes.
    async fn restart_unhealthy(&self, cancel: &CancellationToken) {
        warn!("restarting unhealthy session");
        if let Err(err) = self.terminate_inner(false, cancel, false).await {
            error!(%err, "could not stop unhealthy session");
            return;
        }
        if self.params.restart_on_crash {
            if let Err(err) = self.launch(cancel).await {
                error!(%err, "relaunch after failed health checks failed");
            }
        }
    }

    async fn handle_session_exit(
        &self,
        session: &Arc<dyn Session>,
        exit: SessionExit,
        cancel: &CancellationToken,
    ) {
        let relaunch = {
            let mut inner = self.lock();
            if inner.terminating {
                return;
            }
            let is_current =
                matches!(inner.session.as_ref(), Some(current) if Arc::ptr_eq(current, session));
            if !is_current {
                // A stale signal from a session already replaced.
                return;
            }
            inner.session = None;
            inner.since = None;
            inner.state = WatchdogState::Offline;
            self.params.restart_on_crash
        };

        warn!(kind = ?exit.kind, code = ?exit.code, "session exited unexpectedly");
        let _ = self.store.clear().await;
        self.dispatch(
            WatchdogEvent::Crash,
            vec![
                format!("{:?}", exit.kind),
                exit.code.map_or_else(String::new, |code| code.to_string()),
            ],
        )
        .await;

        if relaunch {
            info!("relaunching after unexpected exit");
            if let Err(err) = self.launch(cancel).await {
                error!(%err, "automatic relaunch failed");
            }
        }
    }

    async fn handle_reboot(&self, count: u64) {
        let stale = {
            let inner = self.lock();
            match inner.session.as_ref() {
                Some(session) => {
                    self.registry.latest_id().as_deref() != Some(session.build_id())
                }
                None => return,
            }
        };

        // When the bound build is stale the newer-build path performs
        // the actual swap; this only records the observation.
        info!(count, stale, "world rebooted in place");
        self.dispatch(WatchdogEvent::Reboot, vec![count.to_string()])
            .await;
    }

    // ── Shared plumbing ──────────────────────────────────────────

    async fn dispatch(&self, event: WatchdogEvent, parameters: Vec<String>) {
        if !self
            .events
            .handle_event(event, &parameters, &self.cancel)
            .await
        {
            warn!(event = event.name(), "event hook reported failure");
        }
    }

    fn lock(&self) -> MutexGuard<'_, Inner> {
        match self.inner.lock() {
            Ok(guard) => guard,
            Err(poisoned) => poisoned.into_inner(),
        }
    }
}

#[async_trait]
impl RestartHandler for Watchdog {
    async fn before_restart(&self) -> Result<()> {
        let session = { self.lock().session.clone() };
        let Some(session) = session else {
            return Ok(());
        };
        let record = session
            .reattach_record(SessionRole::Primary)
            .ok_or_else(|| AppError::Reattach("live session has no adoptable identity".into()))?;
        self.store.persist(&record).await
    }
}

impl CommandHandler for Watchdog {
    fn handle_command(&self, command: &str) -> String {
        match command.trim() {
            "status" => {
                let status = self.status();
                format!(
                    "state: {:?}, pid: {}, port: {}, build: {}",
                    status.state,
                    status.pid.map_or_else(|| "-".into(), |pid| pid.to_string()),
                    status.port.map_or_else(|| "-".into(), |port| port.to_string()),
                    status.build_id.as_deref().unwrap_or("-"),
                )
            }
            other => format!("unknown command: {other}"),
        }
    }
}

/// Resolves with the session's exit, or never when there is none.
async fn wait_exit_opt(session: Option<Arc<dyn Session>>) -> SessionExit {
    match session {
        Some(session) => session.wait_exit().await,
        None => std::future::pending().await,
    }
}

/// Resolves with the next reboot occurrence, or never when there is no
/// session.
async fn next_reboot_opt(session: Option<Arc<dyn Session>>) -> Option<u64> {
    match session {
        Some(session) => session.next_reboot().await,
        None => std::future::pending().await,
    }
}
