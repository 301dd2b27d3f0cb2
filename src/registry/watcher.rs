//! Builds-directory watcher installing completed external compiles.
//!
//! The compile pipeline deploys a build by populating a subdirectory of
//! the builds directory and writing a `.complete` marker last. The marker
//! names the entrypoint artifact on its first line and may carry an
//! explicit build identifier on its second; without one the identifier is
//! derived from the marker contents.
//!
//! [`DeployWatcher`] uses the `notify` crate to pick markers up as they
//! land and installs them into the shared [`BuildRegistry`]. Dropping the
//! watcher stops the underlying OS watch.

use std::fs;
use std::path::{Path, PathBuf};
use std::sync::Arc;

use chrono::{DateTime, Utc};
use notify::{Event, EventKind, RecommendedWatcher, RecursiveMode, Watcher};
use tracing::{info, warn};

use crate::models::build::Build;
use crate::registry::BuildRegistry;
use crate::{AppError, Result};

/// Marker file the compile pipeline writes last.
pub const DEPLOY_MARKER: &str = ".complete";

/// Read a deploy directory's marker into a [`Build`].
///
/// Returns `Ok(None)` when the directory carries no marker (deploy still
/// in progress or not a deploy at all).
///
/// # Errors
///
/// Returns `AppError::Registry` if the marker exists but is unreadable or
/// names no entrypoint.
pub fn read_deploy_marker(dir: &Path) -> Result<Option<Build>> {
    let marker = dir.join(DEPLOY_MARKER);
    if !marker.is_file() {
        return Ok(None);
    }

    let raw = fs::read_to_string(&marker)
        .map_err(|err| AppError::Registry(format!("unreadable deploy marker: {err}")))?;
    let mut lines = raw.lines().map(str::trim);

    let entrypoint = lines
        .next()
        .filter(|line| !line.is_empty())
        .ok_or_else(|| AppError::Registry("deploy marker names no entrypoint".into()))?;

    let id = match lines.next().filter(|line| !line.is_empty()) {
        Some(explicit) => explicit.to_owned(),
        None => {
            let mut seed = raw.clone().into_bytes();
            seed.extend_from_slice(dir.as_os_str().as_encoded_bytes());
            Build::derive_id(&seed)
        }
    };

    let installed_at = marker_timestamp(&marker);

    Ok(Some(Build {
        id,
        directory: dir.to_path_buf(),
        entrypoint: PathBuf::from(entrypoint),
        installed_at,
    }))
}

/// Marker modification time, falling back to now when unavailable.
fn marker_timestamp(marker: &Path) -> DateTime<Utc> {
    fs::metadata(marker)
        .and_then(|meta| meta.modified())
        .map_or_else(|_| Utc::now(), DateTime::<Utc>::from)
}

/// Returns `true` for file-system events that may represent a completed
/// deploy landing (marker created or replaced).
fn is_deploy_event(event: &Event) -> bool {
    matches!(event.kind, EventKind::Create(_) | EventKind::Modify(_))
        && event
            .paths
            .iter()
            .any(|path| path.file_name().is_some_and(|name| name == DEPLOY_MARKER))
}

/// Watches the builds directory and installs completed deploys.
///
/// Holds the `notify` watcher alive for its own lifetime; keep it alive
/// for as long as new compiles should be picked up.
pub struct DeployWatcher {
    _watcher: RecommendedWatcher,
}

impl DeployWatcher {
    /// Start watching `builds_dir` and installing new deploys into
    /// `registry`.
    ///
    /// # Errors
    ///
    /// Returns `AppError::Registry` if the watcher cannot be created or
    /// the builds directory cannot be watched.
    pub fn start(builds_dir: &Path, registry: Arc<BuildRegistry>) -> Result<Self> {
        let mut watcher = notify::recommended_watcher(
            move |result: std::result::Result<Event, notify::Error>| match result {
                Ok(event) if is_deploy_event(&event) => {
                    for marker in &event.paths {
                        let Some(dir) = marker.parent() else {
                            continue;
                        };
                        match read_deploy_marker(dir) {
                            Ok(Some(build)) => {
                                if registry.reference_count(&build.id).is_some() {
                                    // Already installed; markers can fire
                                    // multiple events per write.
                                    continue;
                                }
                                info!(build_id = %build.id, dir = %dir.display(), "deploy detected");
                                registry.install(build);
                            }
                            Ok(None) => {}
                            Err(err) => {
                                warn!(dir = %dir.display(), %err, "ignoring malformed deploy");
                            }
                        }
                    }
                }
                Err(err) => warn!(%err, "builds directory watcher error"),
                Ok(_) => {}
            },
        )
        .map_err(|err| AppError::Registry(format!("failed to create deploy watcher: {err}")))?;

        watcher
            .watch(builds_dir, RecursiveMode::Recursive)
            .map_err(|err| {
                AppError::Registry(format!(
                    "failed to watch builds directory '{}': {err}",
                    builds_dir.display()
                ))
            })?;

        info!(dir = %builds_dir.display(), "deploy watcher started");

        Ok(Self { _watcher: watcher })
    }
}
