//! OS-level process handle for a session.
//!
//! A session's process is either a child we spawned (waitable through
//! the OS) or an adopted process from a reattach, which can only be
//! observed by liveness polling since it is not our child. Exits are
//! detected by polling so a concurrent kill never has to contend with a
//! blocked wait.

use tokio::process::Child;
use tracing::warn;

use crate::models::session::{ExitKind, SessionExit};

/// The OS process behind a session.
#[derive(Debug)]
pub enum ServerProcess {
    /// A child this daemon spawned.
    Spawned(Child),
    /// A process adopted from a reattach record.
    Reattached {
        /// OS process identifier.
        pid: u32,
    },
}

impl ServerProcess {
    /// OS process identifier, when still known.
    #[must_use]
    pub fn id(&self) -> Option<u32> {
        match self {
            Self::Spawned(child) => child.id(),
            Self::Reattached { pid } => Some(*pid),
        }
    }

    /// Non-blocking exit check.
    ///
    /// Returns `Some` once the process is gone. An adopted process
    /// reports no exit status, so its disappearance classifies as a
    /// crash; the caller overrides that when a terminate was in flight.
    pub fn try_status(&mut self) -> Option<SessionExit> {
        match self {
            Self::Spawned(child) => match child.try_wait() {
                Ok(Some(status)) => Some(SessionExit::from_status(status)),
                Ok(None) => None,
                Err(err) => {
                    warn!(%err, "failed to poll child process status");
                    // Treat as exited to clean up the dead entry.
                    Some(SessionExit::killed())
                }
            },
            Self::Reattached { pid } => {
                if pid_alive(*pid) {
                    None
                } else {
                    Some(SessionExit {
                        kind: ExitKind::Crashed,
                        code: None,
                    })
                }
            }
        }
    }

    /// Hard-kill the process. Errors are logged, not returned; the
    /// caller observes the outcome through the termination signal.
    pub async fn kill(&mut self) {
        match self {
            Self::Spawned(child) => {
                if let Err(err) = child.kill().await {
                    warn!(%err, "kill of child process failed");
                }
            }
            Self::Reattached { pid } => kill_pid(*pid),
        }
    }
}

/// Whether a process with the given pid currently exists.
#[cfg(unix)]
#[must_use]
pub fn pid_alive(pid: u32) -> bool {
    let Ok(pid) = i32::try_from(pid) else {
        return false;
    };
    // Signal 0 probes existence without delivering anything.
    nix::sys::signal::kill(nix::unistd::Pid::from_raw(pid), None).is_ok()
}

/// Whether a process with the given pid currently exists.
#[cfg(not(unix))]
#[must_use]
pub fn pid_alive(_pid: u32) -> bool {
    false
}

#[cfg(unix)]
fn kill_pid(pid: u32) {
    let Ok(raw) = i32::try_from(pid) else {
        return;
    };
    if let Err(err) = nix::sys::signal::kill(
        nix::unistd::Pid::from_raw(raw),
        nix::sys::signal::Signal::SIGKILL,
    ) {
        warn!(pid, %err, "kill of adopted process failed");
    }
}

#[cfg(not(unix))]
fn kill_pid(pid: u32) {
    warn!(pid, "cannot kill adopted process on this platform");
}

/// Kernel-reported start time of a process, in clock ticks since boot.
///
/// Used to tell a reattach record's process apart from an unrelated
/// process that reused the pid. Returns `None` where the information is
/// unavailable (non-Linux hosts, vanished process).
#[must_use]
pub fn process_start_ticks(pid: u32) -> Option<i64> {
    let stat = std::fs::read_to_string(format!("/proc/{pid}/stat")).ok()?;
    // The comm field is parenthesized and may contain spaces; fields
    // resume after the last ')'. starttime is the 22nd stat field, the
    // 20th after comm.
    let after_comm = stat.rsplit_once(')')?.1;
    after_comm
        .split_whitespace()
        .nth(19)
        .and_then(|field| field.parse().ok())
}
