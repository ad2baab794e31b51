//! Lock record storage model

use std::time::Duration;

use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};

/// Maximum gap since the last heartbeat before a lock is considered
/// abandoned and becomes reclaimable by other sessions.
pub const DEFAULT_EXPIRY_THRESHOLD: Duration = Duration::from_secs(30 * 60);

/// A persisted lock row. At most one exists per script at any instant;
/// the store's atomic acquire enforces that, never application code.
#[derive(Clone, Debug, PartialEq, Eq, Serialize, Deserialize)]
pub struct LockRecord {
    pub script_id: String,
    pub holder_id: String,
    pub holder_name: String,
    pub acquired_at: DateTime<Utc>,
    pub last_heartbeat: DateTime<Utc>,
}

impl LockRecord {
    pub fn new(
        script_id: impl Into<String>,
        holder_id: impl Into<String>,
        holder_name: impl Into<String>,
        now: DateTime<Utc>,
    ) -> Self {
        Self {
            script_id: script_id.into(),
            holder_id: holder_id.into(),
            holder_name: holder_name.into(),
            acquired_at: now,
            last_heartbeat: now,
        }
    }

    /// The single expiry predicate shared by every store operation and
    /// the sweeper. A heartbeat stamped in the future (clock skew) counts
    /// as fresh.
    pub fn is_expired(&self, threshold: Duration, now: DateTime<Utc>) -> bool {
        match (now - self.last_heartbeat).to_std() {
            Ok(age) => age > threshold,
            Err(_) => false,
        }
    }

    pub fn is_held_by(&self, holder_id: &str) -> bool {
        self.holder_id == holder_id
    }
}

/// Result of an acquire attempt. On denial the holder fields describe
/// the current holder, so callers can surface who has the script open.
#[derive(Clone, Debug, Serialize, Deserialize)]
pub struct AcquireOutcome {
    pub acquired: bool,
    pub holder_id: String,
    pub holder_name: String,
    pub acquired_at: DateTime<Utc>,
}

impl AcquireOutcome {
    pub fn granted(record: &LockRecord) -> Self {
        Self {
            acquired: true,
            holder_id: record.holder_id.clone(),
            holder_name: record.holder_name.clone(),
            acquired_at: record.acquired_at,
        }
    }

    pub fn denied(record: &LockRecord) -> Self {
        Self {
            acquired: false,
            holder_id: record.holder_id.clone(),
            holder_name: record.holder_name.clone(),
            acquired_at: record.acquired_at,
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_expiry_predicate() {
        let now = Utc::now();
        let record = LockRecord::new("S1", "h-1", "Ada", now);
        let threshold = Duration::from_secs(60);

        assert!(!record.is_expired(threshold, now));
        assert!(!record.is_expired(threshold, now + chrono::Duration::seconds(60)));
        assert!(record.is_expired(threshold, now + chrono::Duration::seconds(61)));
    }

    #[test]
    fn test_future_heartbeat_counts_as_fresh() {
        let now = Utc::now();
        let mut record = LockRecord::new("S1", "h-1", "Ada", now);
        record.last_heartbeat = now + chrono::Duration::seconds(30);

        assert!(!record.is_expired(Duration::from_secs(1), now));
    }

    #[test]
    fn test_outcome_carries_holder() {
        let record = LockRecord::new("S1", "h-1", "Ada", Utc::now());
        let denied = AcquireOutcome::denied(&record);

        assert!(!denied.acquired);
        assert_eq!(denied.holder_id, "h-1");
        assert_eq!(denied.holder_name, "Ada");
        assert!(AcquireOutcome::granted(&record).acquired);
    }
}
