//! Daemon configuration parsing and validation.

use std::fs;
use std::path::{Path, PathBuf};

use serde::Deserialize;

use crate::models::launch::{LaunchParameters, SecurityLevel, Visibility};
use crate::{AppError, Result};

/// Nested launch configuration mapped onto [`LaunchParameters`].
#[derive(Debug, Clone, Deserialize, PartialEq, Eq)]
#[serde(rename_all = "snake_case")]
pub struct LaunchConfig {
    /// Port the primary session serves on.
    pub primary_port: u16,
    /// Alternate port for the secondary session during rollovers.
    pub secondary_port: u16,
    /// Sandboxing level for the server process.
    #[serde(default = "default_security_level")]
    pub security_level: SecurityLevel,
    /// Hub visibility for the server process.
    #[serde(default = "default_visibility")]
    pub visibility: Visibility,
    /// Startup handshake deadline.
    #[serde(default = "default_startup_timeout")]
    pub startup_timeout_seconds: u64,
    /// Command-channel request deadline.
    #[serde(default = "default_topic_timeout")]
    pub topic_timeout_seconds: u64,
    /// Grace period for in-band shutdown before a hard kill.
    #[serde(default = "default_shutdown_grace")]
    pub shutdown_grace_seconds: u64,
    /// Interval between health probes.
    #[serde(default = "default_health_interval")]
    pub health_check_interval_seconds: u64,
    /// Consecutive failed probes before the session is restarted.
    #[serde(default = "default_health_failure_limit")]
    pub health_check_failure_limit: u32,
    /// Whether a newer build triggers an automatic rollover.
    #[serde(default = "default_true")]
    pub auto_update: bool,
    /// Whether an unexpected exit triggers an automatic relaunch.
    #[serde(default = "default_true")]
    pub restart_on_crash: bool,
    /// Extra arguments appended to the server command line.
    #[serde(default)]
    pub additional_arguments: Vec<String>,
}

fn default_security_level() -> SecurityLevel {
    SecurityLevel::Safe
}

fn default_visibility() -> Visibility {
    Visibility::Public
}

fn default_startup_timeout() -> u64 {
    60
}

fn default_topic_timeout() -> u64 {
    5
}

fn default_shutdown_grace() -> u64 {
    10
}

fn default_health_interval() -> u64 {
    60
}

fn default_health_failure_limit() -> u32 {
    3
}

fn default_true() -> bool {
    true
}

fn default_host() -> String {
    "127.0.0.1".into()
}

/// Global configuration parsed from `warden.toml`.
#[derive(Debug, Clone, Deserialize, PartialEq, Eq)]
#[serde(rename_all = "snake_case")]
pub struct GlobalConfig {
    /// Directory state (the reattach database) is kept under.
    pub data_dir: PathBuf,
    /// Directory the compile pipeline deploys finished builds into.
    pub builds_dir: PathBuf,
    /// Server runtime executable launched per session.
    pub server_executable: PathBuf,
    /// Argument template for the server command line. Occurrences of
    /// `{entrypoint}`, `{port}`, `{token}`, `{security}` and `{visibility}`
    /// are substituted per session.
    #[serde(default)]
    pub server_args: Vec<String>,
    /// Host the command channel connects to.
    #[serde(default = "default_host")]
    pub host: String,
    /// Whether the watchdog launches as soon as the daemon starts.
    #[serde(default = "default_true")]
    pub auto_start: bool,
    /// Whether the server is left running (detached) when the daemon
    /// exits, instead of being terminated with it.
    #[serde(default = "default_true")]
    pub leave_running_on_exit: bool,
    /// Launch parameters for supervised sessions.
    pub launch: LaunchConfig,
}

impl GlobalConfig {
    /// Load and validate configuration from a TOML file path.
    ///
    /// # Errors
    ///
    /// Returns `AppError::Config` if the file cannot be read or contains
    /// invalid TOML, or if validation fails.
    pub fn load_from_path(path: impl AsRef<Path>) -> Result<Self> {
        let raw = fs::read_to_string(path)
            .map_err(|err| AppError::Config(format!("failed to read config: {err}")))?;
        Self::from_toml_str(&raw)
    }

    /// Parse configuration from a TOML string.
    ///
    /// # Errors
    ///
    /// Returns `AppError::Config` if parsing or validation fails.
    pub fn from_toml_str(raw: &str) -> Result<Self> {
        let config: Self = toml::from_str(raw)?;
        config.validate()?;
        Ok(config)
    }

    /// Derived path of the reattach database.
    #[must_use]
    pub fn db_path(&self) -> PathBuf {
        self.data_dir.join("warden.sqlite")
    }

    /// Assemble the immutable launch parameters for the watchdog.
    #[must_use]
    pub fn launch_parameters(&self) -> LaunchParameters {
        LaunchParameters {
            primary_port: self.launch.primary_port,
            secondary_port: self.launch.secondary_port,
            security_level: self.launch.security_level,
            visibility: self.launch.visibility,
            startup_timeout_seconds: self.launch.startup_timeout_seconds,
            topic_timeout_seconds: self.launch.topic_timeout_seconds,
            shutdown_grace_seconds: self.launch.shutdown_grace_seconds,
            health_check_interval_seconds: self.launch.health_check_interval_seconds,
            health_check_failure_limit: self.launch.health_check_failure_limit,
            auto_update: self.launch.auto_update,
            restart_on_crash: self.launch.restart_on_crash,
            additional_arguments: self.launch.additional_arguments.clone(),
        }
    }

    fn validate(&self) -> Result<()> {
        if self.launch.primary_port == 0 || self.launch.secondary_port == 0 {
            return Err(AppError::Config("game ports must be non-zero".into()));
        }

        if self.launch.primary_port == self.launch.secondary_port {
            return Err(AppError::Config(
                "primary_port and secondary_port must differ for rollovers".into(),
            ));
        }

        if self.launch.health_check_failure_limit == 0 {
            return Err(AppError::Config(
                "health_check_failure_limit must be greater than zero".into(),
            ));
        }

        if self.launch.startup_timeout_seconds == 0 {
            return Err(AppError::Config(
                "startup_timeout_seconds must be greater than zero".into(),
            ));
        }

        if self.host.is_empty() {
            return Err(AppError::Config("host must not be empty".into()));
        }

        Ok(())
    }
}
