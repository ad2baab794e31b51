//! Coordinator state model

use serde::{Deserialize, Serialize};

use quill_persistence::LockRecord;

/// Where a coordinator is in the lock lifecycle
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum LockStatus {
    /// Initial transient state while an acquire is in flight
    Checking,
    /// This session holds the lock; edits may flow
    Acquired,
    /// Another session holds the lock; waiting for its release
    Locked,
    /// Lock given up or lost; re-acquisition needs an explicit request
    Unlocked,
}

impl Default for LockStatus {
    fn default() -> Self {
        Self::Checking
    }
}

/// Identity shown as currently holding the lock
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct RemoteHolder {
    pub id: String,
    pub name: String,
}

impl RemoteHolder {
    pub fn new(id: impl Into<String>, name: impl Into<String>) -> Self {
        Self {
            id: id.into(),
            name: name.into(),
        }
    }
}

impl From<&LockRecord> for RemoteHolder {
    fn from(record: &LockRecord) -> Self {
        Self::new(&record.holder_id, &record.holder_name)
    }
}

/// Snapshot consumers observe through the coordinator's watch channel.
/// Advisory only: the save gate re-validates against the store.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct LockState {
    pub script_id: String,
    pub status: LockStatus,
    pub held_by: Option<RemoteHolder>,
}

impl LockState {
    pub fn checking(script_id: impl Into<String>) -> Self {
        Self {
            script_id: script_id.into(),
            status: LockStatus::Checking,
            held_by: None,
        }
    }
}
