//! Coordinator registry
//!
//! Independent consumers opening the same script must share one
//! coordinator; separate per-consumer coordinators would issue acquire
//! calls indistinguishable from competing clients and churn the lock
//! against themselves. The registry hands out reference-counted leases:
//! the first checkout spawns the coordinator, the last drop tears it
//! down (releasing the lock).
//!
//! Created at the composition root and shared by `Arc`; nothing here is
//! process-global.

use std::sync::Arc;

use dashmap::DashMap;
use dashmap::mapref::entry::Entry;
use tracing::debug;

use quill_common::EditSession;
use quill_persistence::{LockEventBus, LockPersistence};

use crate::service::coordinator::{CoordinatorConfig, LockCoordinator, LockHandle};

struct RegistryEntry {
    handle: LockHandle,
    refs: usize,
}

/// Process-wide map of script id to live coordinator
pub struct LockRegistry {
    store: Arc<dyn LockPersistence>,
    bus: Arc<LockEventBus>,
    config: CoordinatorConfig,
    entries: DashMap<String, RegistryEntry>,
}

impl LockRegistry {
    pub fn new(
        store: Arc<dyn LockPersistence>,
        bus: Arc<LockEventBus>,
        config: CoordinatorConfig,
    ) -> Arc<Self> {
        Arc::new(Self {
            store,
            bus,
            config,
            entries: DashMap::new(),
        })
    }

    /// Return a lease on the script's coordinator, spawning it on the
    /// first checkout. Later checkouts share the existing coordinator
    /// without issuing another acquire.
    ///
    /// The session is fixed by whoever checks out first; one process is
    /// one editing session.
    pub fn checkout(self: &Arc<Self>, script_id: &str, session: &EditSession) -> LockLease {
        let handle = match self.entries.entry(script_id.to_string()) {
            Entry::Occupied(mut entry) => {
                let entry = entry.get_mut();
                entry.refs += 1;
                entry.handle.clone()
            }
            Entry::Vacant(entry) => {
                debug!(script_id = %script_id, "spawning lock coordinator");
                let handle = LockCoordinator::spawn(
                    script_id,
                    session.clone(),
                    self.store.clone(),
                    self.bus.subscribe(),
                    self.config.clone(),
                );
                entry.insert(RegistryEntry {
                    handle: handle.clone(),
                    refs: 1,
                });
                handle
            }
        };

        LockLease {
            registry: Arc::clone(self),
            script_id: script_id.to_string(),
            handle,
        }
    }

    /// Number of scripts with a live coordinator.
    pub fn open_count(&self) -> usize {
        self.entries.len()
    }

    fn checkin(&self, script_id: &str) {
        if let Entry::Occupied(mut entry) = self.entries.entry(script_id.to_string()) {
            let remaining = {
                let entry = entry.get_mut();
                entry.refs -= 1;
                entry.refs
            };
            if remaining == 0 {
                let (_, entry) = entry.remove_entry();
                debug!(script_id = %script_id, "last lease dropped; stopping coordinator");
                entry.handle.shutdown();
            }
        }
    }
}

/// Reference-counted claim on a script's coordinator.
///
/// Derefs to the shared [`LockHandle`]; dropping the last lease for a
/// script tears the coordinator down.
pub struct LockLease {
    registry: Arc<LockRegistry>,
    script_id: String,
    handle: LockHandle,
}

impl LockLease {
    pub fn handle(&self) -> &LockHandle {
        &self.handle
    }
}

impl std::ops::Deref for LockLease {
    type Target = LockHandle;

    fn deref(&self) -> &Self::Target {
        &self.handle
    }
}

impl Drop for LockLease {
    fn drop(&mut self) {
        self.registry.checkin(&self.script_id);
    }
}
