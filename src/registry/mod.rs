//! Reference-counted registry of compiled builds.
//!
//! The registry is an explicit arena: callers acquire units against a
//! build and release them one call per unit; deletion of superseded
//! builds is performed only by the registry, never by holders, and only
//! once a build's count is zero and it is no longer the latest pointer.
//!
//! A completed external compile is surfaced through a re-armable
//! generation counter (`tokio::sync::watch`) that fires once per install.

pub mod watcher;

use std::collections::HashMap;
use std::fs;
use std::path::Path;
use std::sync::atomic::{AtomicU32, Ordering};
use std::sync::{Arc, Mutex, MutexGuard};

use tokio::sync::watch;
use tracing::{debug, info, warn};

use crate::models::build::Build;
use crate::{AppError, Result};

struct Slot {
    build: Build,
    refcount: u32,
}

struct Inner {
    slots: HashMap<String, Slot>,
    latest: Option<String>,
    generation: u64,
}

/// Tracks the current latest build plus any build still referenced by a
/// live handle.
pub struct BuildRegistry {
    inner: Mutex<Inner>,
    newer_tx: watch::Sender<u64>,
}

impl BuildRegistry {
    /// Create an empty registry.
    #[must_use]
    pub fn new() -> Self {
        let (newer_tx, _) = watch::channel(0);
        Self {
            inner: Mutex::new(Inner {
                slots: HashMap::new(),
                latest: None,
                generation: 0,
            }),
            newer_tx,
        }
    }

    /// Create a registry seeded from an existing builds directory.
    ///
    /// Every subdirectory carrying a completed-deploy marker is installed;
    /// the most recently installed one becomes latest.
    ///
    /// # Errors
    ///
    /// Returns `AppError::Registry` if the builds directory does not exist
    /// or cannot be read. Individual malformed deploys are skipped with a
    /// warning.
    pub fn load_from_dir(builds_dir: &Path) -> Result<Self> {
        let registry = Self::new();

        let entries = fs::read_dir(builds_dir).map_err(|err| {
            AppError::Registry(format!(
                "builds directory {} unavailable: {err}",
                builds_dir.display()
            ))
        })?;

        let mut found: Vec<Build> = Vec::new();
        for entry in entries {
            let entry = entry
                .map_err(|err| AppError::Registry(format!("builds directory unreadable: {err}")))?;
            let path = entry.path();
            if !path.is_dir() {
                continue;
            }
            match watcher::read_deploy_marker(&path) {
                Ok(Some(build)) => found.push(build),
                Ok(None) => debug!(dir = %path.display(), "no deploy marker, skipping"),
                Err(err) => warn!(dir = %path.display(), %err, "malformed deploy, skipping"),
            }
        }

        // Oldest first so the newest deploy ends up as latest.
        found.sort_by_key(|build| build.installed_at);
        for build in found {
            registry.install(build);
        }

        Ok(registry)
    }

    /// Install a build, making it the latest and notifying subscribers.
    ///
    /// Superseded builds with no remaining references are deleted as part
    /// of the same mutation.
    pub fn install(&self, build: Build) {
        let id = build.id.clone();
        let mut inner = self.lock();

        inner.slots.entry(id.clone()).or_insert_with(|| Slot {
            build,
            refcount: 0,
        });
        inner.latest = Some(id.clone());
        inner.generation += 1;
        let generation = inner.generation;
        Self::sweep(&mut inner);
        drop(inner);

        info!(build_id = %id, generation, "build installed");
        let _ = self.newer_tx.send(generation);
    }

    /// Identifier of the current latest build.
    #[must_use]
    pub fn latest_id(&self) -> Option<String> {
        self.lock().latest.clone()
    }

    /// Subscribe to the newer-build notification.
    ///
    /// The channel carries a generation counter; one change per completed
    /// install. Await `changed()` and re-arm by awaiting again.
    #[must_use]
    pub fn subscribe(&self) -> watch::Receiver<u64> {
        self.newer_tx.subscribe()
    }

    /// Acquire `units` references against the latest build.
    ///
    /// # Errors
    ///
    /// Returns `AppError::Registry` if no build has been installed yet.
    pub fn acquire_latest(self: &Arc<Self>, units: u32) -> Result<BuildHandle> {
        let mut inner = self.lock();
        let id = inner
            .latest
            .clone()
            .ok_or_else(|| AppError::Registry("no build installed".into()))?;
        Self::acquire_locked(self, &mut inner, &id, units)
            .ok_or_else(|| AppError::Registry(format!("latest build {id} missing from registry")))
    }

    /// Acquire `units` references against a specific build, if registered.
    #[must_use]
    pub fn acquire(self: &Arc<Self>, build_id: &str, units: u32) -> Option<BuildHandle> {
        let mut inner = self.lock();
        Self::acquire_locked(self, &mut inner, build_id, units)
    }

    /// Current reference count for a build; `None` if not registered.
    #[must_use]
    pub fn reference_count(&self, build_id: &str) -> Option<u32> {
        self.lock().slots.get(build_id).map(|slot| slot.refcount)
    }

    /// Number of builds currently registered.
    #[must_use]
    pub fn len(&self) -> usize {
        self.lock().slots.len()
    }

    /// Whether no builds are registered.
    #[must_use]
    pub fn is_empty(&self) -> bool {
        self.lock().slots.is_empty()
    }

    fn acquire_locked(
        registry: &Arc<Self>,
        inner: &mut MutexGuard<'_, Inner>,
        build_id: &str,
        units: u32,
    ) -> Option<BuildHandle> {
        let slot = inner.slots.get_mut(build_id)?;
        slot.refcount += units;
        debug!(build_id, units, refcount = slot.refcount, "build acquired");
        Some(BuildHandle {
            registry: Arc::clone(registry),
            build: slot.build.clone(),
            remaining: AtomicU32::new(units),
        })
    }

    fn release_one(&self, build_id: &str) {
        let mut inner = self.lock();
        match inner.slots.get_mut(build_id) {
            Some(slot) if slot.refcount > 0 => {
                slot.refcount -= 1;
                debug!(build_id, refcount = slot.refcount, "build released");
            }
            Some(_) => warn!(build_id, "release on zero reference count ignored"),
            None => warn!(build_id, "release for unregistered build ignored"),
        }
        Self::sweep(&mut inner);
    }

    /// Delete every zero-reference build that is not the latest pointer.
    fn sweep(inner: &mut MutexGuard<'_, Inner>) {
        let latest = inner.latest.clone();
        let doomed: Vec<String> = inner
            .slots
            .iter()
            .filter(|(id, slot)| slot.refcount == 0 && latest.as_deref() != Some(id.as_str()))
            .map(|(id, _)| id.clone())
            .collect();

        for id in doomed {
            if let Some(slot) = inner.slots.remove(&id) {
                info!(build_id = %id, "superseded build deleted");
                if slot.build.exists() {
                    if let Err(err) = fs::remove_dir_all(&slot.build.directory) {
                        warn!(build_id = %id, %err, "failed to remove build directory");
                    }
                }
            }
        }
    }

    fn lock(&self) -> MutexGuard<'_, Inner> {
        match self.inner.lock() {
            Ok(guard) => guard,
            Err(poisoned) => poisoned.into_inner(),
        }
    }
}

impl Default for BuildRegistry {
    fn default() -> Self {
        Self::new()
    }
}

/// A caller-held acquisition of one or more units against a build.
///
/// One [`release_unit`](Self::release_unit) call per unit held; the
/// registry performs all deletion.
pub struct BuildHandle {
    registry: Arc<BuildRegistry>,
    build: Build,
    remaining: AtomicU32,
}

impl BuildHandle {
    /// The build this handle references.
    #[must_use]
    pub fn build(&self) -> &Build {
        &self.build
    }

    /// Identifier of the referenced build.
    #[must_use]
    pub fn build_id(&self) -> &str {
        &self.build.id
    }

    /// Units not yet released from this handle.
    #[must_use]
    pub fn units_remaining(&self) -> u32 {
        self.remaining.load(Ordering::SeqCst)
    }

    /// Release exactly one unit back to the registry.
    ///
    /// Releasing more units than were acquired is ignored with a warning.
    pub fn release_unit(&self) {
        let previous = self
            .remaining
            .fetch_update(Ordering::SeqCst, Ordering::SeqCst, |units| {
                units.checked_sub(1)
            });
        match previous {
            Ok(_) => self.registry.release_one(&self.build.id),
            Err(_) => warn!(build_id = %self.build.id, "release beyond held units ignored"),
        }
    }

    /// Release every unit still held by this handle.
    pub fn release_remaining(&self) {
        while self
            .remaining
            .fetch_update(Ordering::SeqCst, Ordering::SeqCst, |units| {
                units.checked_sub(1)
            })
            .is_ok()
        {
            self.registry.release_one(&self.build.id);
        }
    }
}

impl std::fmt::Debug for BuildHandle {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("BuildHandle")
            .field("build_id", &self.build.id)
            .field("remaining", &self.remaining.load(Ordering::SeqCst))
            .finish()
    }
}
