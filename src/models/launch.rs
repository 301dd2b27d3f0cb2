//! Launch parameters for the supervised game-server process.

use std::time::Duration;

use serde::{Deserialize, Serialize};

/// Sandboxing level the game server is started with.
#[derive(Debug, Clone, Copy, Serialize, Deserialize, PartialEq, Eq)]
#[serde(rename_all = "snake_case")]
pub enum SecurityLevel {
    /// Full host access; required for native extensions.
    Trusted,
    /// Default sandbox.
    Safe,
    /// Maximum sandbox; no file or network access from game code.
    Ultrasafe,
}

impl SecurityLevel {
    /// Command-line token passed to the server executable.
    #[must_use]
    pub fn as_arg(self) -> &'static str {
        match self {
            Self::Trusted => "trusted",
            Self::Safe => "safe",
            Self::Ultrasafe => "ultrasafe",
        }
    }
}

/// Hub visibility the game server advertises.
#[derive(Debug, Clone, Copy, Serialize, Deserialize, PartialEq, Eq)]
#[serde(rename_all = "snake_case")]
pub enum Visibility {
    /// Listed publicly.
    Public,
    /// Joinable but unlisted.
    Private,
    /// Hidden entirely.
    Invisible,
}

impl Visibility {
    /// Command-line token passed to the server executable.
    #[must_use]
    pub fn as_arg(self) -> &'static str {
        match self {
            Self::Public => "public",
            Self::Private => "private",
            Self::Invisible => "invisible",
        }
    }
}

/// Immutable description of how to start the supervised process.
///
/// Assembled from configuration; the watchdog never mutates it. Two game
/// ports are carried so a rollover pair can coexist on one host.
#[derive(Debug, Clone, Serialize, Deserialize, PartialEq, Eq)]
#[serde(rename_all = "snake_case")]
pub struct LaunchParameters {
    /// Port the primary session serves on.
    pub primary_port: u16,
    /// Alternate port used by the secondary session during a rollover.
    pub secondary_port: u16,
    /// Sandboxing level.
    pub security_level: SecurityLevel,
    /// Hub visibility.
    pub visibility: Visibility,
    /// Seconds allowed for the startup handshake before a launch is failed.
    pub startup_timeout_seconds: u64,
    /// Per-request timeout for command-channel exchanges, in seconds.
    pub topic_timeout_seconds: u64,
    /// Seconds a graceful shutdown request is given before a hard kill.
    pub shutdown_grace_seconds: u64,
    /// Interval between health probes while running, in seconds.
    pub health_check_interval_seconds: u64,
    /// Consecutive failed probes before the session is declared unhealthy.
    pub health_check_failure_limit: u32,
    /// Whether a newer build triggers an automatic rollover.
    pub auto_update: bool,
    /// Whether an unexpected exit triggers an automatic relaunch.
    pub restart_on_crash: bool,
    /// Extra arguments appended to the server command line.
    pub additional_arguments: Vec<String>,
}

impl LaunchParameters {
    /// Port assigned to a session of the given role.
    #[must_use]
    pub fn port_for(&self, primary: bool) -> u16 {
        if primary {
            self.primary_port
        } else {
            self.secondary_port
        }
    }

    /// Startup handshake deadline.
    #[must_use]
    pub fn startup_timeout(&self) -> Duration {
        Duration::from_secs(self.startup_timeout_seconds)
    }

    /// Command-channel request deadline.
    #[must_use]
    pub fn topic_timeout(&self) -> Duration {
        Duration::from_secs(self.topic_timeout_seconds)
    }

    /// Grace period for in-band shutdown before a hard kill.
    #[must_use]
    pub fn shutdown_grace(&self) -> Duration {
        Duration::from_secs(self.shutdown_grace_seconds)
    }

    /// Interval between health probes.
    #[must_use]
    pub fn health_check_interval(&self) -> Duration {
        Duration::from_secs(self.health_check_interval_seconds)
    }
}

/// Outcome of a successful session launch.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct LaunchResult {
    /// Time from process spawn to a completed startup handshake.
    pub startup_time: Duration,
}
