//! Consumed provider transaction ids.
//!
//! A confirmation is applied only if its transaction id was not recorded
//! within the retention window. Ids are stored as SHA-256 digests so the
//! snapshot never holds raw payment references.

use crate::clock::Clock;
use crate::correlation::file::SnapshotFile;
use crate::SubwardenError;
use chrono::{DateTime, Duration, Utc};
use std::collections::HashMap;
use std::path::PathBuf;
use std::sync::{Arc, Mutex};
use tracing::debug;

/// Hash a provider transaction id for storage.
pub fn hash_transaction_id(transaction_id: &str) -> String {
    use sha2::{Digest, Sha256};
    let hash = Sha256::digest(transaction_id.as_bytes());
    hex::encode(hash)
}

/// Retention-bounded set of applied transaction ids.
pub struct ConfirmationLedger {
    seen: Mutex<HashMap<String, DateTime<Utc>>>,
    retention: Duration,
    clock: Arc<dyn Clock>,
    snapshot: Option<SnapshotFile>,
}

impl ConfirmationLedger {
    /// Volatile ledger.
    pub fn in_memory(retention: Duration, clock: Arc<dyn Clock>) -> Self {
        Self {
            seen: Mutex::new(HashMap::new()),
            retention,
            clock,
            snapshot: None,
        }
    }

    /// Ledger backed by a JSON snapshot at `path`.
    pub fn open(
        path: PathBuf,
        retention: Duration,
        clock: Arc<dyn Clock>,
    ) -> Result<Self, SubwardenError> {
        let snapshot = SnapshotFile::new(path)?;
        let seen = snapshot.load()?.unwrap_or_default();
        let ledger = Self {
            seen: Mutex::new(seen),
            retention,
            clock,
            snapshot: Some(snapshot),
        };
        ledger.purge_expired()?;
        Ok(ledger)
    }

    fn lock(&self) -> std::sync::MutexGuard<'_, HashMap<String, DateTime<Utc>>> {
        self.seen.lock().unwrap_or_else(|e| e.into_inner())
    }

    fn persist(&self, seen: &HashMap<String, DateTime<Utc>>) -> Result<(), SubwardenError> {
        match &self.snapshot {
            Some(snapshot) => snapshot.save(seen),
            None => Ok(()),
        }
    }

    fn is_live(&self, recorded_at: DateTime<Utc>, now: DateTime<Utc>) -> bool {
        // past the representable range counts as forever
        recorded_at
            .checked_add_signed(self.retention)
            .map_or(true, |until| now < until)
    }

    /// Record `transaction_id` as applied.
    ///
    /// # Errors
    /// - `DuplicateConfirmation` - already recorded within retention
    /// - `StateIO` - snapshot write failed (nothing is recorded)
    pub fn record(&self, transaction_id: &str) -> Result<(), SubwardenError> {
        let now = self.clock.now_utc();
        let digest = hash_transaction_id(transaction_id);
        let mut seen = self.lock();

        if let Some(recorded_at) = seen.get(&digest) {
            if self.is_live(*recorded_at, now) {
                return Err(SubwardenError::DuplicateConfirmation {
                    transaction_id: transaction_id.to_string(),
                });
            }
        }

        seen.insert(digest.clone(), now);
        if let Err(e) = self.persist(&seen) {
            seen.remove(&digest);
            return Err(e);
        }
        Ok(())
    }

    /// Drop a recorded id whose effect could not be applied.
    pub fn forget(&self, transaction_id: &str) -> Result<(), SubwardenError> {
        let mut seen = self.lock();
        if seen.remove(&hash_transaction_id(transaction_id)).is_some() {
            self.persist(&seen)?;
        }
        Ok(())
    }

    /// Whether `transaction_id` is recorded within retention.
    pub fn contains(&self, transaction_id: &str) -> bool {
        let now = self.clock.now_utc();
        self.lock()
            .get(&hash_transaction_id(transaction_id))
            .is_some_and(|recorded_at| self.is_live(*recorded_at, now))
    }

    /// Evict ids past retention, returning how many were removed.
    pub fn purge_expired(&self) -> Result<usize, SubwardenError> {
        let now = self.clock.now_utc();
        let mut seen = self.lock();
        let before = seen.len();
        seen.retain(|_, recorded_at| self.is_live(*recorded_at, now));
        let removed = before - seen.len();
        if removed > 0 {
            self.persist(&seen)?;
            debug!(removed, "purged expired confirmation ids");
        }
        Ok(removed)
    }

    /// Ids currently held.
    pub fn len(&self) -> usize {
        self.lock().len()
    }

    /// Whether the ledger is empty.
    pub fn is_empty(&self) -> bool {
        self.lock().is_empty()
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::clock::MockClock;
    use tempfile::TempDir;

    fn clock() -> Arc<MockClock> {
        Arc::new(MockClock::from_rfc3339("2025-03-01T10:00:00Z"))
    }

    #[test]
    fn test_hash_transaction_id() {
        let a = hash_transaction_id("QKL81XYZ");
        assert_eq!(a, hash_transaction_id("QKL81XYZ"));
        assert_ne!(a, hash_transaction_id("QKL81XYY"));
        assert_eq!(a.len(), 64);
    }

    #[test]
    fn test_second_record_is_duplicate() {
        let ledger = ConfirmationLedger::in_memory(Duration::days(1), clock());
        ledger.record("QKL81XYZ").unwrap();
        assert!(matches!(
            ledger.record("QKL81XYZ"),
            Err(SubwardenError::DuplicateConfirmation { .. })
        ));
        assert!(ledger.contains("QKL81XYZ"));
    }

    #[test]
    fn test_retention_expiry() {
        let clock = clock();
        let ledger = ConfirmationLedger::in_memory(Duration::hours(1), clock.clone());
        ledger.record("T1").unwrap();

        clock.advance(Duration::hours(1));
        assert!(!ledger.contains("T1"));
        assert_eq!(ledger.purge_expired().unwrap(), 1);
        assert!(ledger.is_empty());
    }

    #[test]
    fn test_forget_allows_rerecord() {
        let ledger = ConfirmationLedger::in_memory(Duration::days(1), clock());
        ledger.record("T2").unwrap();
        ledger.forget("T2").unwrap();
        assert!(ledger.record("T2").is_ok());
    }

    #[test]
    fn test_snapshot_holds_digests_only() {
        let dir = TempDir::new().unwrap();
        let path = dir.path().join("ledger.json");
        {
            let ledger = ConfirmationLedger::open(path.clone(), Duration::days(7), clock()).unwrap();
            ledger.record("QKL81XYZ").unwrap();
        }

        let raw = std::fs::read_to_string(&path).unwrap();
        assert!(!raw.contains("QKL81XYZ"));
        assert!(raw.contains(&hash_transaction_id("QKL81XYZ")));

        let reopened = ConfirmationLedger::open(path, Duration::days(7), clock()).unwrap();
        assert!(matches!(
            reopened.record("QKL81XYZ"),
            Err(SubwardenError::DuplicateConfirmation { .. })
        ));
    }

    #[test]
    fn test_unrepresentable_retention_does_not_panic() {
        let ledger = ConfirmationLedger::in_memory(Duration::days(100_000_000), clock());
        ledger.record("T3").unwrap();
        assert!(ledger.contains("T3"));
        assert!(ledger.record("T3").is_err());
        assert_eq!(ledger.purge_expired().unwrap(), 0);
    }
}
