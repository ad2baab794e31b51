//! SQL lock store (MySQL/PostgreSQL via SeaORM)
//!
//! Every mutation runs inside a transaction that takes the row lock
//! (`SELECT ... FOR UPDATE`) before deciding, so the expiry check and
//! the write form one critical section. The `script_id` primary key
//! closes the vacant-row insert race: when two sessions race to create
//! the first record, the loser's insert fails with a unique violation
//! and is reported as an ordinary denial.

use std::sync::Arc;
use std::time::Duration;

use async_trait::async_trait;
use chrono::{DateTime, Utc};
use sea_orm::*;
use tracing::{debug, info};

use quill_common::{EditSession, QuillError};

use crate::entity::script_lock;
use crate::events::{LockChangeEvent, LockEventBus};
use crate::model::{AcquireOutcome, DEFAULT_EXPIRY_THRESHOLD, LockRecord};
use crate::traits::LockPersistence;

/// Lock store backed by an external database
pub struct SqlLockService {
    db: DatabaseConnection,
    expiry: Duration,
    bus: Option<Arc<LockEventBus>>,
}

fn record_from(model: script_lock::Model) -> LockRecord {
    LockRecord {
        script_id: model.script_id,
        holder_id: model.holder_id,
        holder_name: model.holder_name,
        acquired_at: model.acquired_at,
        last_heartbeat: model.last_heartbeat,
    }
}

impl SqlLockService {
    pub fn new(db: DatabaseConnection) -> Self {
        Self {
            db,
            expiry: DEFAULT_EXPIRY_THRESHOLD,
            bus: None,
        }
    }

    pub fn with_expiry(mut self, expiry: Duration) -> Self {
        self.expiry = expiry;
        self
    }

    pub fn with_event_bus(mut self, bus: Arc<LockEventBus>) -> Self {
        self.bus = Some(bus);
        self
    }

    pub fn db(&self) -> &DatabaseConnection {
        &self.db
    }

    fn publish(&self, event: LockChangeEvent) {
        if let Some(bus) = &self.bus {
            bus.publish(event);
        }
    }

    fn is_expired(&self, model: &script_lock::Model, now: DateTime<Utc>) -> bool {
        match (now - model.last_heartbeat).to_std() {
            Ok(age) => age > self.expiry,
            Err(_) => false,
        }
    }

    /// Save-time ownership check inside a caller-owned transaction.
    ///
    /// Content writers call this from the same transaction that persists
    /// the edit; the row stays locked until that transaction commits, so
    /// no competing acquire can slip between the check and the write.
    pub async fn verify_holder_in_txn(
        &self,
        txn: &DatabaseTransaction,
        script_id: &str,
        holder_id: &str,
    ) -> anyhow::Result<()> {
        let now = Utc::now();
        let row = script_lock::Entity::find_by_id(script_id)
            .lock_exclusive()
            .one(txn)
            .await?;

        match row {
            Some(row) if row.holder_id == holder_id && !self.is_expired(&row, now) => Ok(()),
            _ => Err(QuillError::LockLost(script_id.to_string()).into()),
        }
    }
}

#[async_trait]
impl LockPersistence for SqlLockService {
    async fn acquire(
        &self,
        script_id: &str,
        session: &EditSession,
    ) -> anyhow::Result<AcquireOutcome> {
        let now = Utc::now();
        let tx = self.db.begin().await?;
        let existing = script_lock::Entity::find_by_id(script_id)
            .lock_exclusive()
            .one(&tx)
            .await?;

        match existing {
            Some(row) if row.holder_id == session.holder_id => {
                // Idempotent re-acquisition, nothing to write
                tx.commit().await?;
                Ok(AcquireOutcome::granted(&record_from(row)))
            }
            Some(row) if !self.is_expired(&row, now) => {
                tx.commit().await?;
                metrics::counter!("quill_lock_contention_total").increment(1);
                debug!(script_id = %script_id, holder = %row.holder_id, "lock acquire denied");
                Ok(AcquireOutcome::denied(&record_from(row)))
            }
            Some(row) => {
                // Expired: overwrite for the requester
                let stale_holder = row.holder_id.clone();
                let mut active: script_lock::ActiveModel = row.into();
                active.holder_id = Set(session.holder_id.clone());
                active.holder_name = Set(session.holder_name.clone());
                active.acquired_at = Set(now);
                active.last_heartbeat = Set(now);
                let updated = active.update(&tx).await?;
                tx.commit().await?;

                info!(
                    script_id = %script_id,
                    holder = %session.holder_id,
                    superseded = %stale_holder,
                    "expired lock taken over"
                );
                let record = record_from(updated);
                self.publish(LockChangeEvent::updated(record.clone()));
                Ok(AcquireOutcome::granted(&record))
            }
            None => {
                let active = script_lock::ActiveModel {
                    script_id: Set(script_id.to_string()),
                    holder_id: Set(session.holder_id.clone()),
                    holder_name: Set(session.holder_name.clone()),
                    acquired_at: Set(now),
                    last_heartbeat: Set(now),
                };
                match script_lock::Entity::insert(active).exec(&tx).await {
                    Ok(_) => {
                        tx.commit().await?;
                        debug!(script_id = %script_id, holder = %session.holder_id, "lock acquired");
                        let record = LockRecord::new(
                            script_id,
                            &session.holder_id,
                            &session.holder_name,
                            now,
                        );
                        self.publish(LockChangeEvent::inserted(record.clone()));
                        Ok(AcquireOutcome::granted(&record))
                    }
                    Err(err)
                        if matches!(err.sql_err(), Some(SqlErr::UniqueConstraintViolation(_))) =>
                    {
                        // Lost the vacant-row race: someone else committed first
                        tx.rollback().await?;
                        metrics::counter!("quill_lock_contention_total").increment(1);
                        match self.find_one(script_id).await? {
                            Some(record) => Ok(AcquireOutcome::denied(&record)),
                            None => Err(QuillError::StoreUnavailable(format!(
                                "lock row for '{script_id}' vanished mid-acquire"
                            ))
                            .into()),
                        }
                    }
                    Err(err) => Err(err.into()),
                }
            }
        }
    }

    async fn heartbeat(&self, script_id: &str, holder_id: &str) -> anyhow::Result<bool> {
        let now = Utc::now();
        let tx = self.db.begin().await?;
        let existing = script_lock::Entity::find_by_id(script_id)
            .lock_exclusive()
            .one(&tx)
            .await?;

        match existing {
            Some(row) if row.holder_id == holder_id => {
                let mut active: script_lock::ActiveModel = row.into();
                active.last_heartbeat = Set(now);
                let updated = active.update(&tx).await?;
                tx.commit().await?;
                self.publish(LockChangeEvent::updated(record_from(updated)));
                Ok(true)
            }
            _ => {
                tx.commit().await?;
                Ok(false)
            }
        }
    }

    async fn release(&self, script_id: &str, holder_id: &str) -> anyhow::Result<bool> {
        let tx = self.db.begin().await?;
        let existing = script_lock::Entity::find_by_id(script_id)
            .lock_exclusive()
            .one(&tx)
            .await?;

        match existing {
            Some(row) if row.holder_id == holder_id => {
                script_lock::Entity::delete_by_id(script_id).exec(&tx).await?;
                tx.commit().await?;
                debug!(script_id = %script_id, holder = %holder_id, "lock released");
                self.publish(LockChangeEvent::deleted(record_from(row)));
                Ok(true)
            }
            _ => {
                tx.commit().await?;
                Ok(false)
            }
        }
    }

    async fn force_unlock(&self, script_id: &str) -> anyhow::Result<bool> {
        let tx = self.db.begin().await?;
        let existing = script_lock::Entity::find_by_id(script_id)
            .lock_exclusive()
            .one(&tx)
            .await?;

        match existing {
            Some(row) => {
                script_lock::Entity::delete_by_id(script_id).exec(&tx).await?;
                tx.commit().await?;
                info!(script_id = %script_id, holder = %row.holder_id, "lock force-unlocked");
                self.publish(LockChangeEvent::deleted(record_from(row)));
                Ok(true)
            }
            None => {
                tx.commit().await?;
                Ok(false)
            }
        }
    }

    async fn find_one(&self, script_id: &str) -> anyhow::Result<Option<LockRecord>> {
        let row = script_lock::Entity::find_by_id(script_id)
            .one(&self.db)
            .await?;
        Ok(row.map(record_from))
    }

    async fn verify_holder(&self, script_id: &str, holder_id: &str) -> anyhow::Result<()> {
        let tx = self.db.begin().await?;
        let result = self.verify_holder_in_txn(&tx, script_id, holder_id).await;
        tx.commit().await?;
        result
    }

    async fn sweep_expired(&self) -> anyhow::Result<u64> {
        let now = Utc::now();
        let Ok(window) = chrono::Duration::from_std(self.expiry) else {
            // Threshold too large to ever expire anything
            return Ok(0);
        };
        let cutoff = now - window;

        let stale = script_lock::Entity::find()
            .filter(script_lock::Column::LastHeartbeat.lt(cutoff))
            .all(&self.db)
            .await?;

        let mut removed = 0u64;
        for row in stale {
            // The predicate is re-applied at delete time; a heartbeat may
            // have landed between the scan and the delete
            let result = script_lock::Entity::delete_many()
                .filter(script_lock::Column::ScriptId.eq(row.script_id.clone()))
                .filter(script_lock::Column::LastHeartbeat.lt(cutoff))
                .exec(&self.db)
                .await?;
            if result.rows_affected > 0 {
                self.publish(LockChangeEvent::deleted(record_from(row)));
                removed += 1;
            }
        }

        metrics::counter!("quill_lock_expired_total").increment(removed);
        let active = script_lock::Entity::find().count(&self.db).await?;
        metrics::gauge!("quill_lock_active").set(active as f64);

        if removed > 0 {
            debug!(count = removed, "swept expired lock records");
        }
        Ok(removed)
    }
}
