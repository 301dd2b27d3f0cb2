//! Spawns new sessions and adopts reattached ones.
//!
//! A fresh launch spawns the configured server executable against the
//! build's entrypoint, injects the session environment, and then polls
//! the command channel with `identify` until the startup handshake
//! succeeds or the startup timeout lapses. A reattach adopts the
//! recorded pid without spawning anything.

use std::path::PathBuf;
use std::process::Stdio;
use std::sync::Arc;
use std::time::{Duration, Instant};

use async_trait::async_trait;
use tokio::process::Command;
use tokio_util::sync::CancellationToken;
use tracing::{info, warn};
use uuid::Uuid;

use crate::models::launch::{LaunchParameters, LaunchResult};
use crate::models::reattach::ReattachRecord;
use crate::registry::BuildHandle;
use crate::session::controller::SessionController;
use crate::session::process::ServerProcess;
use crate::session::{Session, SessionFactory};
use crate::topic::{TopicClient, TopicCommand};
use crate::{AppError, Result};

/// Interval between startup handshake attempts.
const HANDSHAKE_POLL_INTERVAL: Duration = Duration::from_millis(500);

/// Render a server argument template for one session.
///
/// Each template argument may carry `{entrypoint}`, `{port}`, `{token}`,
/// `{security}` and `{visibility}` placeholders.
#[must_use]
pub fn render_args(
    template: &[String],
    entrypoint: &str,
    port: u16,
    token: &str,
    params: &LaunchParameters,
) -> Vec<String> {
    template
        .iter()
        .map(|arg| {
            arg.replace("{entrypoint}", entrypoint)
                .replace("{port}", &port.to_string())
                .replace("{token}", token)
                .replace("{security}", params.security_level.as_arg())
                .replace("{visibility}", params.visibility.as_arg())
        })
        .collect()
}

/// Production [`SessionFactory`] backed by real OS processes.
pub struct ProcessSessionFactory {
    executable: PathBuf,
    args_template: Vec<String>,
    host: String,
    /// Daemon-scoped token; cancelling it detaches session monitors
    /// without touching the processes.
    session_scope: CancellationToken,
}

impl ProcessSessionFactory {
    /// Create a factory for the configured server executable.
    #[must_use]
    pub fn new(
        executable: PathBuf,
        args_template: Vec<String>,
        host: String,
        session_scope: CancellationToken,
    ) -> Self {
        Self {
            executable,
            args_template,
            host,
            session_scope,
        }
    }

    fn adopt(
        &self,
        params: &LaunchParameters,
        handle: Arc<BuildHandle>,
        record: ReattachRecord,
    ) -> Arc<dyn Session> {
        info!(
            pid = record.process_id,
            endpoint = %record.endpoint(),
            build_id = %record.build_id,
            "adopting running server process"
        );

        let topic = TopicClient::new(
            record.host,
            record.port,
            record.access_token,
            params.topic_timeout(),
        );

        SessionController::spawn(
            handle,
            topic,
            LaunchResult {
                startup_time: Duration::ZERO,
            },
            ServerProcess::Reattached {
                pid: record.process_id,
            },
            params.shutdown_grace(),
            self.session_scope.child_token(),
        )
    }
}

#[async_trait]
impl SessionFactory for ProcessSessionFactory {
    async fn launch_new(
        &self,
        params: &LaunchParameters,
        handle: Arc<BuildHandle>,
        reattach: Option<ReattachRecord>,
        primary: bool,
        cancel: &CancellationToken,
    ) -> Result<Arc<dyn Session>> {
        if let Some(record) = reattach {
            let session = self.adopt(params, handle, record);
            // A dead channel here is not fatal; the health loop deals
            // with an unresponsive world.
            if let Err(err) = session.check_health().await {
                warn!(%err, "adopted session not answering yet");
            }
            return Ok(session);
        }

        let port = params.port_for(primary);
        let token = Uuid::new_v4().to_string();
        let build = handle.build().clone();
        let entrypoint = build.entrypoint_path();

        let mut args = render_args(
            &self.args_template,
            &entrypoint.to_string_lossy(),
            port,
            &token,
            params,
        );
        args.extend(params.additional_arguments.iter().cloned());

        let mut cmd = Command::new(&self.executable);
        cmd.args(&args)
            .current_dir(&build.directory)
            .env("WARDEN_PORT", port.to_string())
            .env("WARDEN_ACCESS_TOKEN", &token)
            .env("WARDEN_BUILD_ID", &build.id)
            .stdin(Stdio::null())
            .stdout(Stdio::null())
            .stderr(Stdio::null());

        let mut child = cmd
            .spawn()
            .map_err(|err| AppError::Launch(format!("failed to spawn server process: {err}")))?;

        info!(
            pid = child.id().unwrap_or(0),
            port,
            build_id = %build.id,
            "server process spawned, waiting for startup handshake"
        );

        let started = Instant::now();
        let topic = TopicClient::new(self.host.clone(), port, token, params.topic_timeout());
        let deadline = params.startup_timeout();

        loop {
            if let Ok(Some(status)) = child.try_wait() {
                return Err(AppError::Launch(format!(
                    "server process exited during startup ({status})"
                )));
            }

            if started.elapsed() >= deadline {
                let _ = child.kill().await;
                return Err(AppError::Launch(format!(
                    "startup handshake not completed within {deadline:?}"
                )));
            }

            tokio::select! {
                () = cancel.cancelled() => {
                    let _ = child.kill().await;
                    return Err(AppError::Cancelled);
                }
                () = tokio::time::sleep(HANDSHAKE_POLL_INTERVAL) => {}
            }

            let identified = tokio::select! {
                () = cancel.cancelled() => {
                    let _ = child.kill().await;
                    return Err(AppError::Cancelled);
                }
                result = topic.send(TopicCommand::Identify) => result.is_ok(),
            };
            if identified {
                break;
            }
        }

        let launch_result = LaunchResult {
            startup_time: started.elapsed(),
        };
        info!(
            port,
            startup_ms = u64::try_from(launch_result.startup_time.as_millis()).unwrap_or(u64::MAX),
            "startup handshake complete"
        );

        Ok(SessionController::spawn(
            handle,
            topic,
            launch_result,
            ServerProcess::Spawned(child),
            params.shutdown_grace(),
            self.session_scope.child_token(),
        ))
    }
}
