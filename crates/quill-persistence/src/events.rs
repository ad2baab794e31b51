//! Lock change events
//!
//! Stores publish every committed mutation here; coordinators subscribe
//! to learn about releases, takeovers, and force-unlocks. Delivery is
//! at-least-once from the consumer's perspective and may arrive out of
//! order relative to direct store calls.

use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};
use tokio::sync::broadcast;
use tracing::debug;

use crate::model::LockRecord;

/// Kind of change applied to a lock record
#[derive(Clone, Copy, Debug, PartialEq, Eq, Serialize, Deserialize)]
pub enum LockChangeKind {
    /// A lock record was created
    Insert,
    /// An existing record was mutated (heartbeat refresh or expired-lock takeover)
    Update,
    /// A record was removed (release, force-unlock, or expiry sweep)
    Delete,
}

impl std::fmt::Display for LockChangeKind {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        match self {
            LockChangeKind::Insert => write!(f, "INSERT"),
            LockChangeKind::Update => write!(f, "UPDATE"),
            LockChangeKind::Delete => write!(f, "DELETE"),
        }
    }
}

/// One committed change to a script's lock record
#[derive(Clone, Debug, Serialize, Deserialize)]
pub struct LockChangeEvent {
    pub kind: LockChangeKind,
    pub script_id: String,
    /// Row state after the change; for deletes, the row that was removed.
    pub record: Option<LockRecord>,
    /// When the change was committed at the store.
    pub at: DateTime<Utc>,
}

impl LockChangeEvent {
    pub fn inserted(record: LockRecord) -> Self {
        Self {
            kind: LockChangeKind::Insert,
            script_id: record.script_id.clone(),
            record: Some(record),
            at: Utc::now(),
        }
    }

    pub fn updated(record: LockRecord) -> Self {
        Self {
            kind: LockChangeKind::Update,
            script_id: record.script_id.clone(),
            record: Some(record),
            at: Utc::now(),
        }
    }

    pub fn deleted(record: LockRecord) -> Self {
        Self {
            kind: LockChangeKind::Delete,
            script_id: record.script_id.clone(),
            record: Some(record),
            at: Utc::now(),
        }
    }

    /// Holder carried by the event, when the row state is known.
    pub fn holder_id(&self) -> Option<&str> {
        self.record.as_ref().map(|r| r.holder_id.as_str())
    }
}

/// Broadcast bus carrying committed lock-store changes to subscribers.
///
/// A thin wrapper over `tokio::sync::broadcast`; publishing never blocks
/// and events for slow subscribers are dropped (they observe a lagged
/// receiver and resynchronize from the store).
pub struct LockEventBus {
    tx: broadcast::Sender<LockChangeEvent>,
}

impl LockEventBus {
    pub fn new(capacity: usize) -> Self {
        let (tx, _) = broadcast::channel(capacity);
        Self { tx }
    }

    pub fn publish(&self, event: LockChangeEvent) {
        debug!(script_id = %event.script_id, kind = %event.kind, "lock change published");
        // No receivers is fine; nobody is watching this script right now
        let _ = self.tx.send(event);
    }

    pub fn subscribe(&self) -> broadcast::Receiver<LockChangeEvent> {
        self.tx.subscribe()
    }
}

impl Default for LockEventBus {
    fn default() -> Self {
        Self::new(256)
    }
}
