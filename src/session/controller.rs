//! Production session implementation backed by a real OS process.
//!
//! A background monitor task polls the process for exit (the same
//! polling shape as a child monitor that must never block a concurrent
//! kill) and resolves the termination signal exactly once. Reboot
//! occurrences are detected through the world reboot counter carried in
//! health replies and surfaced as a re-armable stream.

use std::sync::atomic::{AtomicBool, AtomicU64, Ordering};
use std::sync::Arc;
use std::time::Duration;

use async_trait::async_trait;
use tokio::sync::{mpsc, watch, Mutex};
use tokio_util::sync::CancellationToken;
use tracing::{debug, info, warn};

use crate::models::launch::LaunchResult;
use crate::models::reattach::{ReattachRecord, SessionRole};
use crate::models::session::{ExitKind, SessionExit};
use crate::registry::BuildHandle;
use crate::session::process::{process_start_ticks, ServerProcess};
use crate::session::Session;
use crate::topic::{TopicClient, TopicCommand};
use crate::Result;

/// Interval between exit polls of the supervised process.
const MONITOR_POLL_INTERVAL: Duration = Duration::from_millis(250);

/// Extra polls granted after a hard kill before the termination signal
/// is force-resolved.
const KILL_CONFIRM_POLLS: u32 = 20;

/// Sentinel marking the reboot counter as not yet observed.
const REBOOT_COUNT_UNSEEN: u64 = u64::MAX;

/// One live supervised process.
pub struct SessionController {
    build_handle: Arc<BuildHandle>,
    topic: TopicClient,
    launch_result: LaunchResult,
    shutdown_grace: Duration,
    pid: Option<u32>,
    start_ticks: Option<i64>,
    port: u16,
    process: Mutex<ServerProcess>,
    exit_tx: watch::Sender<Option<SessionExit>>,
    exit_rx: watch::Receiver<Option<SessionExit>>,
    exit_resolved: AtomicBool,
    terminating: AtomicBool,
    reboot_tx: mpsc::Sender<u64>,
    reboot_rx: Mutex<mpsc::Receiver<u64>>,
    last_reboot_count: AtomicU64,
    cancel: CancellationToken,
}

impl SessionController {
    /// Wrap a live process and start its exit monitor.
    ///
    /// `cancel` stops monitoring without touching the process — the
    /// detach path relies on the process outliving the daemon.
    #[must_use]
    pub fn spawn(
        build_handle: Arc<BuildHandle>,
        topic: TopicClient,
        launch_result: LaunchResult,
        process: ServerProcess,
        shutdown_grace: Duration,
        cancel: CancellationToken,
    ) -> Arc<Self> {
        let pid = process.id();
        let start_ticks = pid.and_then(process_start_ticks);
        let (exit_tx, exit_rx) = watch::channel(None);
        let (reboot_tx, reboot_rx) = mpsc::channel(8);

        let port = topic.port();
        let controller = Arc::new(Self {
            build_handle,
            topic,
            launch_result,
            shutdown_grace,
            pid,
            start_ticks,
            port,
            process: Mutex::new(process),
            exit_tx,
            exit_rx,
            exit_resolved: AtomicBool::new(false),
            terminating: AtomicBool::new(false),
            reboot_tx,
            reboot_rx: Mutex::new(reboot_rx),
            last_reboot_count: AtomicU64::new(REBOOT_COUNT_UNSEEN),
            cancel,
        });

        tokio::spawn(Self::monitor(Arc::clone(&controller)));
        controller
    }

    /// Resolve the termination signal and release the session's build
    /// unit, exactly once across all callers.
    fn resolve_exit(&self, exit: SessionExit) {
        if self
            .exit_resolved
            .compare_exchange(false, true, Ordering::SeqCst, Ordering::SeqCst)
            .is_ok()
        {
            info!(pid = ?self.pid, kind = ?exit.kind, code = ?exit.code, "session ended");
            let _ = self.exit_tx.send(Some(exit));
            self.build_handle.release_unit();
        }
    }

    /// Background exit monitor.
    async fn monitor(controller: Arc<Self>) {
        loop {
            if controller.exit_resolved.load(Ordering::SeqCst) {
                return;
            }
            tokio::select! {
                () = controller.cancel.cancelled() => {
                    debug!(pid = ?controller.pid, "session monitor detached");
                    return;
                }
                () = tokio::time::sleep(MONITOR_POLL_INTERVAL) => {}
            }

            let status = {
                let mut process = controller.process.lock().await;
                process.try_status()
            };

            if let Some(mut exit) = status {
                // An exit we caused is a kill, not a crash; a clean exit
                // stays clean even mid-terminate.
                if controller.terminating.load(Ordering::SeqCst) && exit.kind != ExitKind::Normal {
                    exit = SessionExit {
                        kind: ExitKind::Killed,
                        code: exit.code,
                    };
                }
                controller.resolve_exit(exit);
                return;
            }
        }
    }

    fn exit_value(&self) -> Option<SessionExit> {
        *self.exit_rx.borrow()
    }
}

impl std::fmt::Debug for SessionController {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("SessionController")
            .field("build_id", &self.build_handle.build_id())
            .field("pid", &self.pid)
            .field("port", &self.port)
            .finish_non_exhaustive()
    }
}

#[async_trait]
impl Session for SessionController {
    fn build_id(&self) -> &str {
        self.build_handle.build_id()
    }

    fn build_handle(&self) -> &Arc<BuildHandle> {
        &self.build_handle
    }

    fn pid(&self) -> Option<u32> {
        self.pid
    }

    fn port(&self) -> u16 {
        self.port
    }

    fn launch_result(&self) -> LaunchResult {
        self.launch_result
    }

    fn reattach_record(&self, role: SessionRole) -> Option<ReattachRecord> {
        let process_id = self.pid?;
        Some(ReattachRecord {
            process_id,
            process_start_ticks: self.start_ticks.unwrap_or(0),
            access_token: self.topic.token().to_owned(),
            host: self.topic.host().to_owned(),
            port: self.port,
            build_id: self.build_id().to_owned(),
            role,
        })
    }

    async fn wait_exit(&self) -> SessionExit {
        let mut rx = self.exit_rx.clone();
        loop {
            if let Some(exit) = *rx.borrow_and_update() {
                return exit;
            }
            if rx.changed().await.is_err() {
                // Sender half lives in self; unreachable in practice.
                return SessionExit::killed();
            }
        }
    }

    async fn next_reboot(&self) -> Option<u64> {
        let mut rx = self.reboot_rx.lock().await;
        tokio::select! {
            occurrence = rx.recv() => occurrence,
            _ = self.wait_exit() => None,
        }
    }

    async fn check_health(&self) -> Result<()> {
        let response = self.topic.send(TopicCommand::Health).await?;

        if let Some(count) = response.reboot_count {
            let previous = self.last_reboot_count.load(Ordering::SeqCst);
            if previous == REBOOT_COUNT_UNSEEN {
                // First observation is the baseline, not an occurrence.
                self.last_reboot_count.store(count, Ordering::SeqCst);
            } else if count > previous {
                self.last_reboot_count.store(count, Ordering::SeqCst);
                if self.reboot_tx.try_send(count).is_err() {
                    debug!(count, "reboot occurrence dropped, stream full");
                }
            }
        }

        Ok(())
    }

    async fn terminate(&self, force: bool) {
        if self.exit_value().is_some() {
            return;
        }
        self.terminating.store(true, Ordering::SeqCst);

        if !force {
            match self.topic.send(TopicCommand::Shutdown).await {
                Ok(_) => debug!(pid = ?self.pid, "shutdown request accepted"),
                Err(err) => debug!(pid = ?self.pid, %err, "shutdown request failed"),
            }

            if tokio::time::timeout(self.shutdown_grace, self.wait_exit())
                .await
                .is_ok()
            {
                return;
            }
            warn!(
                pid = ?self.pid,
                grace = ?self.shutdown_grace,
                "process did not exit within grace period, forcing kill"
            );
        }

        {
            let mut process = self.process.lock().await;
            process.kill().await;
        }

        // The monitor confirms the exit; if it was detached, resolve here.
        let confirm = MONITOR_POLL_INTERVAL * KILL_CONFIRM_POLLS;
        if tokio::time::timeout(confirm, self.wait_exit()).await.is_err() {
            self.resolve_exit(SessionExit::killed());
        }
    }
}
