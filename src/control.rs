//! The daemon's own host-restart coordinator.
//!
//! Implements [`ServerControl`] for the standalone daemon: handlers
//! registered here are invoked from the signal path in `main` right
//! before the process goes down, so state is durably saved before the
//! supervisor is replaced.

use std::collections::HashMap;
use std::sync::atomic::{AtomicU64, Ordering};
use std::sync::{Arc, Mutex};

use tracing::{error, info};

use crate::hooks::{RestartHandler, RestartRegistration, ServerControl};
use crate::Result;

type HandlerMap = Arc<Mutex<HashMap<u64, Arc<dyn RestartHandler>>>>;

/// Dispatches the pre-restart notification to registered handlers.
#[derive(Default)]
pub struct RestartCoordinator {
    handlers: HandlerMap,
    next_id: AtomicU64,
}

impl RestartCoordinator {
    /// Create an empty coordinator.
    #[must_use]
    pub fn new() -> Self {
        Self::default()
    }

    /// Number of live registrations.
    #[must_use]
    pub fn registration_count(&self) -> usize {
        self.handlers.lock().map_or(0, |map| map.len())
    }

    /// Invoke every registered handler, in registration order.
    ///
    /// # Errors
    ///
    /// Returns the first handler failure — a missed persist means the
    /// next supervisor instance cannot recover the running process, so
    /// the restart path must see it.
    pub async fn notify_restart(&self) -> Result<()> {
        let snapshot: Vec<(u64, Arc<dyn RestartHandler>)> = {
            let Ok(map) = self.handlers.lock() else {
                return Ok(());
            };
            let mut entries: Vec<_> = map.iter().map(|(id, h)| (*id, Arc::clone(h))).collect();
            entries.sort_by_key(|(id, _)| *id);
            entries
        };

        info!(handlers = snapshot.len(), "dispatching pre-restart notification");
        for (id, handler) in snapshot {
            if let Err(err) = handler.before_restart().await {
                error!(registration = id, %err, "pre-restart handler failed");
                return Err(err);
            }
        }
        Ok(())
    }
}

impl ServerControl for RestartCoordinator {
    fn register_for_restart(&self, handler: Arc<dyn RestartHandler>) -> RestartRegistration {
        let id = self.next_id.fetch_add(1, Ordering::SeqCst) + 1;
        if let Ok(mut map) = self.handlers.lock() {
            map.insert(id, handler);
        }

        let handlers = Arc::clone(&self.handlers);
        RestartRegistration::new(move || {
            if let Ok(mut map) = handlers.lock() {
                map.remove(&id);
            }
        })
    }
}
