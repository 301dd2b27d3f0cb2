//! Session abstraction: one live supervised process and its signals.
//!
//! [`Session`] and [`SessionFactory`] are the seams the watchdog is
//! wired (and tested) against; [`SessionController`] and
//! [`ProcessSessionFactory`] are the production implementations backed
//! by a real OS process.

pub mod controller;
pub mod factory;
pub mod process;

use std::sync::Arc;

use async_trait::async_trait;
use tokio_util::sync::CancellationToken;

use crate::models::launch::{LaunchParameters, LaunchResult};
use crate::models::reattach::{ReattachRecord, SessionRole};
use crate::models::session::SessionExit;
use crate::registry::BuildHandle;
use crate::Result;

pub use controller::SessionController;
pub use factory::ProcessSessionFactory;

/// One live supervised process and its observable signals.
///
/// The termination signal resolves exactly once for every cause; the
/// reboot signal is a re-armable stream of occurrences, pulled once per
/// occurrence by the caller.
#[async_trait]
pub trait Session: Send + Sync + std::fmt::Debug {
    /// Identifier of the build this session is bound to.
    fn build_id(&self) -> &str;

    /// The build handle this session rides on.
    fn build_handle(&self) -> &Arc<BuildHandle>;

    /// OS process identifier, when known.
    fn pid(&self) -> Option<u32>;

    /// Port the session serves on.
    fn port(&self) -> u16;

    /// Launch outcome, resolved by the factory before the session is
    /// handed out.
    fn launch_result(&self) -> LaunchResult;

    /// Reattach record describing this session, when it can be adopted
    /// by a future supervisor instance.
    fn reattach_record(&self, role: SessionRole) -> Option<ReattachRecord>;

    /// Wait for the termination signal.
    ///
    /// Resolves once, terminally, with the exit classification. Safe to
    /// await from multiple tasks.
    async fn wait_exit(&self) -> SessionExit;

    /// Wait for the next in-game reboot occurrence.
    ///
    /// Re-arm by calling again; yields `None` once the session is over.
    async fn next_reboot(&self) -> Option<u64>;

    /// Probe the process over the command channel.
    ///
    /// # Errors
    ///
    /// Returns `AppError::Topic` when the process does not answer in
    /// time or answers garbage; callers treat that as unhealthy.
    async fn check_health(&self) -> Result<()>;

    /// Stop the session's process.
    ///
    /// Graceful (`force == false`) issues an in-band shutdown request
    /// and falls back to a hard kill after the grace period. Idempotent
    /// and safe to invoke concurrently.
    async fn terminate(&self, force: bool);
}

/// Constructs sessions from parameters, a build handle, and an optional
/// reattach record.
#[async_trait]
pub trait SessionFactory: Send + Sync {
    /// Launch a new session, or adopt a running process when `reattach`
    /// is supplied.
    ///
    /// # Errors
    ///
    /// Returns `AppError::Launch` if the process cannot be spawned or
    /// does not complete its startup handshake within the bounded
    /// timeout, and `AppError::Cancelled` when `cancel` fires first; in
    /// both cases no process is left running and the caller's build
    /// handle units are untouched.
    async fn launch_new(
        &self,
        params: &LaunchParameters,
        handle: Arc<BuildHandle>,
        reattach: Option<ReattachRecord>,
        primary: bool,
        cancel: &CancellationToken,
    ) -> Result<Arc<dyn Session>>;
}
