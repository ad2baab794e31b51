//! Lock persistence trait
//!
//! Defines the storage contract for script locks. Implementations must
//! make `acquire` atomic: the holder/expiry check and the write happen in
//! one critical section per script (row lock, map entry guard), so two
//! concurrent acquires for the same script can never both succeed.

use async_trait::async_trait;

use quill_common::EditSession;

use crate::model::{AcquireOutcome, LockRecord};

/// Script lock storage operations
#[async_trait]
pub trait LockPersistence: Send + Sync {
    /// Claim the lock for `session` if no record exists or the existing
    /// record has expired. Idempotent for the current holder. On denial
    /// the outcome carries the current holder and nothing is mutated.
    async fn acquire(
        &self,
        script_id: &str,
        session: &EditSession,
    ) -> anyhow::Result<AcquireOutcome>;

    /// Refresh `last_heartbeat` if `holder_id` still owns the record.
    /// `false` signals loss of ownership.
    async fn heartbeat(&self, script_id: &str, holder_id: &str) -> anyhow::Result<bool>;

    /// Delete the record only if `holder_id` owns it.
    async fn release(&self, script_id: &str, holder_id: &str) -> anyhow::Result<bool>;

    /// Delete the record regardless of holder. The administrative
    /// capability is enforced at the coordinator boundary, not here.
    async fn force_unlock(&self, script_id: &str) -> anyhow::Result<bool>;

    /// Read the current record, if any.
    async fn find_one(&self, script_id: &str) -> anyhow::Result<Option<LockRecord>>;

    /// Save-time ownership check: a record must exist, `holder_id` must
    /// match, and the heartbeat must be within the expiry threshold.
    /// Fails with `QuillError::LockLost` otherwise.
    async fn verify_holder(&self, script_id: &str, holder_id: &str) -> anyhow::Result<()>;

    /// Delete every expired record, publishing a delete event per row.
    /// Returns how many were removed.
    async fn sweep_expired(&self) -> anyhow::Result<u64>;
}
