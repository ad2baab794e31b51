//! In-memory lock store
//!
//! Suitable for single-process deployments and tests. Atomicity comes
//! from the DashMap entry guard: the expiry check and the write happen
//! while the shard lock for the key is held, so two concurrent acquires
//! for the same script serialize at the map.

use std::sync::Arc;
use std::time::Duration;

use async_trait::async_trait;
use chrono::Utc;
use dashmap::DashMap;
use dashmap::mapref::entry::Entry;
use tracing::{debug, info};

use quill_common::{EditSession, QuillError};

use crate::events::{LockChangeEvent, LockEventBus};
use crate::model::{AcquireOutcome, DEFAULT_EXPIRY_THRESHOLD, LockRecord};
use crate::traits::LockPersistence;

/// In-memory lock store using DashMap
pub struct MemoryLockService {
    locks: Arc<DashMap<String, LockRecord>>,
    expiry: Duration,
    bus: Option<Arc<LockEventBus>>,
    _sweeper: Option<tokio::task::JoinHandle<()>>,
}

impl MemoryLockService {
    pub fn new() -> Self {
        Self {
            locks: Arc::new(DashMap::new()),
            expiry: DEFAULT_EXPIRY_THRESHOLD,
            bus: None,
            _sweeper: None,
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

    /// Start the background expiry sweeper. Abandoned locks are then
    /// removed (and their delete events published) without waiting for a
    /// competing acquire to reclaim them.
    ///
    /// Configure the event bus before this; the sweeper captures it here.
    pub fn with_sweeper(self, period: Duration) -> Self {
        let locks = self.locks.clone();
        let expiry = self.expiry;
        let bus = self.bus.clone();

        let handle = tokio::spawn(async move {
            let mut interval = tokio::time::interval(period);
            interval.set_missed_tick_behavior(tokio::time::MissedTickBehavior::Delay);
            loop {
                interval.tick().await;
                Self::sweep(&locks, expiry, bus.as_deref());
            }
        });

        info!("memory lock store sweeper started");

        Self {
            _sweeper: Some(handle),
            ..self
        }
    }

    fn publish(&self, event: LockChangeEvent) {
        if let Some(bus) = &self.bus {
            bus.publish(event);
        }
    }

    fn sweep(
        locks: &DashMap<String, LockRecord>,
        expiry: Duration,
        bus: Option<&LockEventBus>,
    ) -> u64 {
        let now = Utc::now();
        let expired_keys: Vec<String> = locks
            .iter()
            .filter(|entry| entry.value().is_expired(expiry, now))
            .map(|entry| entry.key().clone())
            .collect();

        let mut removed = 0u64;
        for key in &expired_keys {
            // Re-check under the entry guard; a heartbeat may have landed
            // between the scan and the remove
            if let Some((_, record)) = locks.remove_if(key, |_, r| r.is_expired(expiry, now)) {
                if let Some(bus) = bus {
                    bus.publish(LockChangeEvent::deleted(record));
                }
                removed += 1;
            }
        }

        metrics::counter!("quill_lock_expired_total").increment(removed);
        metrics::gauge!("quill_lock_active").set(locks.len() as f64);

        if removed > 0 {
            debug!(count = removed, "swept expired lock records");
        }
        removed
    }
}

impl Default for MemoryLockService {
    fn default() -> Self {
        Self::new()
    }
}

#[async_trait]
impl LockPersistence for MemoryLockService {
    async fn acquire(
        &self,
        script_id: &str,
        session: &EditSession,
    ) -> anyhow::Result<AcquireOutcome> {
        let now = Utc::now();

        let (outcome, event) = match self.locks.entry(script_id.to_string()) {
            Entry::Occupied(mut entry) => {
                let current = entry.get();
                if current.is_held_by(&session.holder_id) {
                    // Idempotent re-acquisition, nothing to write
                    (AcquireOutcome::granted(current), None)
                } else if !current.is_expired(self.expiry, now) {
                    (AcquireOutcome::denied(current), None)
                } else {
                    let record = LockRecord::new(
                        script_id,
                        &session.holder_id,
                        &session.holder_name,
                        now,
                    );
                    entry.insert(record.clone());
                    (
                        AcquireOutcome::granted(&record),
                        Some(LockChangeEvent::updated(record)),
                    )
                }
            }
            Entry::Vacant(entry) => {
                let record =
                    LockRecord::new(script_id, &session.holder_id, &session.holder_name, now);
                entry.insert(record.clone());
                (
                    AcquireOutcome::granted(&record),
                    Some(LockChangeEvent::inserted(record)),
                )
            }
        };

        if outcome.acquired {
            debug!(script_id = %script_id, holder = %session.holder_id, "lock acquired");
        } else {
            metrics::counter!("quill_lock_contention_total").increment(1);
            debug!(script_id = %script_id, holder = %outcome.holder_id, "lock acquire denied");
        }
        if let Some(event) = event {
            self.publish(event);
        }
        Ok(outcome)
    }

    async fn heartbeat(&self, script_id: &str, holder_id: &str) -> anyhow::Result<bool> {
        let now = Utc::now();

        let refreshed = match self.locks.get_mut(script_id) {
            Some(mut entry) if entry.is_held_by(holder_id) => {
                entry.last_heartbeat = now;
                Some(entry.clone())
            }
            _ => None,
        };

        match refreshed {
            Some(record) => {
                self.publish(LockChangeEvent::updated(record));
                Ok(true)
            }
            None => Ok(false),
        }
    }

    async fn release(&self, script_id: &str, holder_id: &str) -> anyhow::Result<bool> {
        match self.locks.entry(script_id.to_string()) {
            Entry::Occupied(entry) if entry.get().is_held_by(holder_id) => {
                let (_, record) = entry.remove_entry();
                debug!(script_id = %script_id, holder = %holder_id, "lock released");
                self.publish(LockChangeEvent::deleted(record));
                Ok(true)
            }
            _ => Ok(false),
        }
    }

    async fn force_unlock(&self, script_id: &str) -> anyhow::Result<bool> {
        match self.locks.remove(script_id) {
            Some((_, record)) => {
                info!(script_id = %script_id, holder = %record.holder_id, "lock force-unlocked");
                self.publish(LockChangeEvent::deleted(record));
                Ok(true)
            }
            None => Ok(false),
        }
    }

    async fn find_one(&self, script_id: &str) -> anyhow::Result<Option<LockRecord>> {
        Ok(self.locks.get(script_id).map(|entry| entry.clone()))
    }

    async fn verify_holder(&self, script_id: &str, holder_id: &str) -> anyhow::Result<()> {
        let now = Utc::now();
        let valid = self
            .locks
            .get(script_id)
            .map(|record| record.is_held_by(holder_id) && !record.is_expired(self.expiry, now))
            .unwrap_or(false);

        if valid {
            Ok(())
        } else {
            Err(QuillError::LockLost(script_id.to_string()).into())
        }
    }

    async fn sweep_expired(&self) -> anyhow::Result<u64> {
        Ok(Self::sweep(&self.locks, self.expiry, self.bus.as_deref()))
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    fn session(id: &str, name: &str) -> EditSession {
        EditSession::new(id, name)
    }

    #[tokio::test]
    async fn test_acquire_and_release() {
        let svc = MemoryLockService::new();

        let outcome = svc.acquire("S1", &session("h-1", "Ada")).await.unwrap();
        assert!(outcome.acquired);
        assert!(svc.release("S1", "h-1").await.unwrap());
        assert!(svc.find_one("S1").await.unwrap().is_none());
    }

    #[tokio::test]
    async fn test_acquire_conflict_reports_holder() {
        let svc = MemoryLockService::new();

        assert!(svc.acquire("S1", &session("h-1", "Ada")).await.unwrap().acquired);

        let denied = svc.acquire("S1", &session("h-2", "Ben")).await.unwrap();
        assert!(!denied.acquired);
        assert_eq!(denied.holder_id, "h-1");
        assert_eq!(denied.holder_name, "Ada");

        // Same holder can re-acquire
        assert!(svc.acquire("S1", &session("h-1", "Ada")).await.unwrap().acquired);
    }

    #[tokio::test]
    async fn test_concurrent_acquires_single_winner() {
        let svc = Arc::new(MemoryLockService::new());

        let mut handles = Vec::new();
        for i in 0..8 {
            let svc = svc.clone();
            handles.push(tokio::spawn(async move {
                let s = EditSession::new(format!("h-{i}"), format!("user-{i}"));
                svc.acquire("S1", &s).await.unwrap().acquired
            }));
        }

        let mut winners = 0;
        for handle in handles {
            if handle.await.unwrap() {
                winners += 1;
            }
        }
        assert_eq!(winners, 1);
    }

    #[tokio::test]
    async fn test_release_wrong_holder() {
        let svc = MemoryLockService::new();

        assert!(svc.acquire("S1", &session("h-1", "Ada")).await.unwrap().acquired);
        assert!(!svc.release("S1", "h-2").await.unwrap());
        assert!(svc.find_one("S1").await.unwrap().is_some());
        assert!(svc.release("S1", "h-1").await.unwrap());
    }

    #[tokio::test]
    async fn test_acquire_after_expiry() {
        let svc = MemoryLockService::new().with_expiry(Duration::from_millis(20));

        assert!(svc.acquire("S1", &session("h-1", "Ada")).await.unwrap().acquired);
        tokio::time::sleep(Duration::from_millis(40)).await;

        let outcome = svc.acquire("S1", &session("h-2", "Ben")).await.unwrap();
        assert!(outcome.acquired);
        assert_eq!(outcome.holder_id, "h-2");

        // The superseded holder's heartbeat is rejected
        assert!(!svc.heartbeat("S1", "h-1").await.unwrap());
        assert!(svc.heartbeat("S1", "h-2").await.unwrap());
    }

    #[tokio::test]
    async fn test_heartbeat_keeps_lock_fresh() {
        let svc = MemoryLockService::new().with_expiry(Duration::from_millis(50));

        assert!(svc.acquire("S1", &session("h-1", "Ada")).await.unwrap().acquired);
        for _ in 0..4 {
            tokio::time::sleep(Duration::from_millis(25)).await;
            assert!(svc.heartbeat("S1", "h-1").await.unwrap());
        }

        // Still held: a competitor is denied
        assert!(!svc.acquire("S1", &session("h-2", "Ben")).await.unwrap().acquired);
    }

    #[tokio::test]
    async fn test_force_unlock_ignores_holder() {
        let svc = MemoryLockService::new();

        assert!(svc.acquire("S1", &session("h-1", "Ada")).await.unwrap().acquired);
        assert!(svc.force_unlock("S1").await.unwrap());
        assert!(!svc.force_unlock("S1").await.unwrap());
        assert!(svc.find_one("S1").await.unwrap().is_none());
    }

    #[tokio::test]
    async fn test_verify_holder() {
        let svc = MemoryLockService::new().with_expiry(Duration::from_millis(20));

        assert!(svc.acquire("S1", &session("h-1", "Ada")).await.unwrap().acquired);
        svc.verify_holder("S1", "h-1").await.unwrap();

        let err = svc.verify_holder("S1", "h-2").await.unwrap_err();
        assert!(QuillError::is_lock_lost(&err));

        // Stale heartbeat fails verification even for the holder
        tokio::time::sleep(Duration::from_millis(40)).await;
        let err = svc.verify_holder("S1", "h-1").await.unwrap_err();
        assert!(QuillError::is_lock_lost(&err));
    }

    #[tokio::test]
    async fn test_sweep_publishes_deletes() {
        let bus = Arc::new(LockEventBus::default());
        let svc = MemoryLockService::new()
            .with_expiry(Duration::from_millis(20))
            .with_event_bus(bus.clone());
        let mut rx = bus.subscribe();

        assert!(svc.acquire("S1", &session("h-1", "Ada")).await.unwrap().acquired);
        let _ = rx.try_recv(); // insert event

        tokio::time::sleep(Duration::from_millis(40)).await;
        assert_eq!(svc.sweep_expired().await.unwrap(), 1);
        assert!(svc.find_one("S1").await.unwrap().is_none());

        let event = rx.try_recv().expect("sweep should publish a delete");
        assert_eq!(event.kind, crate::events::LockChangeKind::Delete);
        assert_eq!(event.script_id, "S1");
    }
}
