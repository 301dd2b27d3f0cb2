//! Session exit classification.

use serde::{Deserialize, Serialize};

/// How a session's process came to stop.
#[derive(Debug, Clone, Copy, Serialize, Deserialize, PartialEq, Eq)]
#[serde(rename_all = "snake_case")]
pub enum ExitKind {
    /// Clean exit with status zero.
    Normal,
    /// Non-zero exit status.
    Crashed,
    /// Stopped by a signal or an explicit kill.
    Killed,
    /// Launch was cancelled before the session went live.
    Cancelled,
}

/// Terminal classification of a session's lifetime.
///
/// Resolves exactly once for every cause: clean exit, crash, external
/// kill, or cancellation.
#[derive(Debug, Clone, Copy, Serialize, Deserialize, PartialEq, Eq)]
#[serde(rename_all = "snake_case")]
pub struct SessionExit {
    /// Exit cause.
    pub kind: ExitKind,
    /// Process exit code, when the OS reported one.
    pub code: Option<i32>,
}

impl SessionExit {
    /// Classify a standard process exit status.
    #[must_use]
    pub fn from_status(status: std::process::ExitStatus) -> Self {
        if status.success() {
            Self {
                kind: ExitKind::Normal,
                code: Some(0),
            }
        } else {
            match status.code() {
                Some(code) => Self {
                    kind: ExitKind::Crashed,
                    code: Some(code),
                },
                // No code means a signal stopped it.
                None => Self {
                    kind: ExitKind::Killed,
                    code: None,
                },
            }
        }
    }

    /// Classification used when the watchdog itself stopped the process.
    #[must_use]
    pub fn killed() -> Self {
        Self {
            kind: ExitKind::Killed,
            code: None,
        }
    }

    /// Classification used when a launch was cancelled before going live.
    #[must_use]
    pub fn cancelled() -> Self {
        Self {
            kind: ExitKind::Cancelled,
            code: None,
        }
    }

    /// Whether this exit counts as a crash for restart policy.
    #[must_use]
    pub fn is_crash(&self) -> bool {
        matches!(self.kind, ExitKind::Crashed)
    }
}
