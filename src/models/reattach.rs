//! Durable reattach record for surviving supervisor restarts.

use serde::{Deserialize, Serialize};

/// Role a session plays inside the watchdog.
#[derive(Debug, Clone, Copy, Serialize, Deserialize, PartialEq, Eq)]
#[serde(rename_all = "snake_case")]
pub enum SessionRole {
    /// Serving operator traffic.
    Primary,
    /// Candidate session spun up for a rollover.
    Secondary,
}

/// Everything the next supervisor instance needs to adopt a running
/// game-server process instead of spawning a new one.
///
/// Written by the watchdog whenever session identity changes and read at
/// most once at startup. A record whose process no longer exists, or whose
/// recorded start time no longer matches the live process (PID reuse), is
/// treated as absent.
#[derive(Debug, Clone, Serialize, Deserialize, PartialEq, Eq)]
#[serde(rename_all = "snake_case")]
pub struct ReattachRecord {
    /// OS process identifier of the running session.
    pub process_id: u32,
    /// Kernel-reported start time of the process, in clock ticks since
    /// boot. Guards against PID reuse after a host reboot or recycle.
    pub process_start_ticks: i64,
    /// Shared secret the command channel authenticates with.
    pub access_token: String,
    /// Host the command channel connects to.
    pub host: String,
    /// Port the command channel connects to.
    pub port: u16,
    /// Identifier of the build the session is bound to.
    pub build_id: String,
    /// Role the session held when the record was written.
    pub role: SessionRole,
}

impl ReattachRecord {
    /// Command-channel endpoint as a connectable address string.
    #[must_use]
    pub fn endpoint(&self) -> String {
        format!("{}:{}", self.host, self.port)
    }
}
