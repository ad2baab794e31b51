//! Save-time lock verification
//!
//! Coordinator state is advisory UX; this gate is the authoritative
//! check in the content-write path. The cached status may be arbitrarily
//! stale (a force-unlock lands between two heartbeats), so data-loss
//! prevention depends entirely on re-reading the store here. With the
//! SQL store the check can run inside the caller's own content-write
//! transaction via `SqlLockService::verify_holder_in_txn`.

use std::sync::Arc;

use quill_persistence::LockPersistence;

/// Gate in the content-persistence write path
pub struct SaveGate {
    store: Arc<dyn LockPersistence>,
}

impl SaveGate {
    pub fn new(store: Arc<dyn LockPersistence>) -> Self {
        Self { store }
    }

    /// Allow the save only while `holder_id` still owns a fresh lock.
    ///
    /// The `QuillError::LockLost` failure is the one error this
    /// subsystem propagates to edit-submission callers; everything else
    /// is translated into coordinator state transitions.
    pub async fn verify_and_proceed(&self, script_id: &str, holder_id: &str) -> anyhow::Result<()> {
        self.store.verify_holder(script_id, holder_id).await
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use quill_common::{EditSession, QuillError};
    use quill_persistence::{LockPersistence, MemoryLockService};

    #[tokio::test]
    async fn test_gate_follows_store_not_cache() {
        let store = Arc::new(MemoryLockService::new());
        let gate = SaveGate::new(store.clone());
        let session = EditSession::new("h-1", "Ada");

        store.acquire("S1", &session).await.unwrap();
        gate.verify_and_proceed("S1", "h-1").await.unwrap();

        // Record removed out from under the holder
        store.force_unlock("S1").await.unwrap();
        let err = gate.verify_and_proceed("S1", "h-1").await.unwrap_err();
        assert!(QuillError::is_lock_lost(&err));
    }
}
