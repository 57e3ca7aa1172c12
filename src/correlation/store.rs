//! Outstanding payment requests, keyed by provider request id.
//!
//! Entries carry their own expiry. An expired entry is never returned by
//! [`CorrelationStore::consume`], and [`CorrelationStore::purge_expired`]
//! evicts abandoned ones. With a snapshot file attached, every change is
//! written through so a restart neither forgets nor resurrects requests.

use crate::clock::Clock;
use crate::correlation::file::SnapshotFile;
use crate::model::{Plan, SubscriberId};
use crate::SubwardenError;
use chrono::{DateTime, Duration, Utc};
use serde::{Deserialize, Serialize};
use std::collections::HashMap;
use std::path::PathBuf;
use std::sync::{Arc, Mutex};
use tracing::{debug, error, info};

/// Longest provider request id accepted.
pub const MAX_REQUEST_ID_LEN: usize = 128;

/// One outstanding payment request.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct CorrelationEntry {
    /// Subscriber that initiated the payment.
    pub subscriber_id: SubscriberId,
    /// Plan being paid for.
    pub plan: Plan,
    /// When the request was registered.
    pub created_at: DateTime<Utc>,
    /// After this instant the request is rejected.
    pub expires_at: DateTime<Utc>,
}

impl CorrelationEntry {
    /// Whether the entry is past its lifetime at `now`.
    pub fn is_expired(&self, now: DateTime<Utc>) -> bool {
        now >= self.expires_at
    }
}

/// TTL-bounded map from request id to initiating subscriber.
pub struct CorrelationStore {
    entries: Mutex<HashMap<String, CorrelationEntry>>,
    clock: Arc<dyn Clock>,
    snapshot: Option<SnapshotFile>,
}

impl CorrelationStore {
    /// Volatile store.
    pub fn in_memory(clock: Arc<dyn Clock>) -> Self {
        Self {
            entries: Mutex::new(HashMap::new()),
            clock,
            snapshot: None,
        }
    }

    /// Store backed by a JSON snapshot at `path`; expired entries are
    /// dropped on load.
    pub fn open(path: PathBuf, clock: Arc<dyn Clock>) -> Result<Self, SubwardenError> {
        let snapshot = SnapshotFile::new(path)?;
        let mut entries: HashMap<String, CorrelationEntry> = snapshot.load()?.unwrap_or_default();

        let now = clock.now_utc();
        let before = entries.len();
        entries.retain(|_, entry| !entry.is_expired(now));
        if entries.len() != before {
            snapshot.save(&entries)?;
        }
        debug!(
            path = %snapshot.path().display(),
            outstanding = entries.len(),
            "correlation store opened"
        );

        Ok(Self {
            entries: Mutex::new(entries),
            clock,
            snapshot: Some(snapshot),
        })
    }

    fn lock(&self) -> std::sync::MutexGuard<'_, HashMap<String, CorrelationEntry>> {
        self.entries.lock().unwrap_or_else(|e| e.into_inner())
    }

    fn persist(&self, entries: &HashMap<String, CorrelationEntry>) -> Result<(), SubwardenError> {
        match &self.snapshot {
            Some(snapshot) => snapshot.save(entries),
            None => Ok(()),
        }
    }

    /// Register an outstanding request that expires after `ttl`.
    ///
    /// # Errors
    /// - `InvalidParameter` - empty or oversized request id, non-positive ttl
    /// - `CorrelationConflict` - an unexpired entry already uses `request_id`
    /// - `StateIO` - snapshot write failed (nothing is registered)
    pub fn create(
        &self,
        request_id: &str,
        subscriber_id: SubscriberId,
        plan: Plan,
        ttl: Duration,
    ) -> Result<(), SubwardenError> {
        validate_request_id(request_id)?;
        if ttl <= Duration::zero() {
            return Err(SubwardenError::InvalidParameter {
                field: "ttl",
                reason: "must be positive".to_string(),
            });
        }

        let now = self.clock.now_utc();
        let expires_at = now
            .checked_add_signed(ttl)
            .ok_or_else(|| SubwardenError::InvalidParameter {
                field: "ttl",
                reason: "expiry out of range".to_string(),
            })?;
        let mut entries = self.lock();
        if let Some(existing) = entries.get(request_id) {
            if !existing.is_expired(now) {
                return Err(SubwardenError::CorrelationConflict {
                    request_id: request_id.to_string(),
                });
            }
        }

        let entry = CorrelationEntry {
            subscriber_id,
            plan,
            created_at: now,
            expires_at,
        };
        let previous = entries.insert(request_id.to_string(), entry);
        if let Err(e) = self.persist(&entries) {
            match previous {
                Some(previous) => entries.insert(request_id.to_string(), previous),
                None => entries.remove(request_id),
            };
            return Err(e);
        }
        Ok(())
    }

    /// Remove and return the entry for `request_id`.
    ///
    /// # Errors
    /// - `CorrelationMiss` - no entry, or the entry has expired (it is evicted)
    pub fn consume(&self, request_id: &str) -> Result<CorrelationEntry, SubwardenError> {
        let now = self.clock.now_utc();
        let mut entries = self.lock();
        let entry = entries.remove(request_id);

        if entry.is_some() {
            if let Err(e) = self.persist(&entries) {
                // In-memory removal stands; the ledger guards redelivery.
                error!(request_id, error = %e, "failed to persist consumed correlation");
            }
        }

        match entry {
            Some(entry) if !entry.is_expired(now) => Ok(entry),
            Some(entry) => {
                info!(
                    request_id,
                    subscriber_id = %entry.subscriber_id,
                    "correlation entry expired before confirmation"
                );
                Err(SubwardenError::CorrelationMiss {
                    request_id: request_id.to_string(),
                })
            }
            None => Err(SubwardenError::CorrelationMiss {
                request_id: request_id.to_string(),
            }),
        }
    }

    /// Put back an entry taken by [`consume`](Self::consume) whose effect
    /// could not be applied. Expiry is kept as it was.
    pub fn restore(&self, request_id: &str, entry: CorrelationEntry) -> Result<(), SubwardenError> {
        let mut entries = self.lock();
        entries.entry(request_id.to_string()).or_insert(entry);
        self.persist(&entries)
    }

    /// Evict expired entries, returning how many were removed.
    pub fn purge_expired(&self) -> Result<usize, SubwardenError> {
        let now = self.clock.now_utc();
        let mut entries = self.lock();
        let before = entries.len();
        entries.retain(|_, entry| !entry.is_expired(now));
        let removed = before - entries.len();
        if removed > 0 {
            self.persist(&entries)?;
            debug!(removed, "purged expired correlation entries");
        }
        Ok(removed)
    }

    /// Entries currently held, expired or not.
    pub fn len(&self) -> usize {
        self.lock().len()
    }

    /// Whether no entries are held.
    pub fn is_empty(&self) -> bool {
        self.lock().is_empty()
    }
}

fn validate_request_id(request_id: &str) -> Result<(), SubwardenError> {
    if request_id.is_empty() || request_id.len() > MAX_REQUEST_ID_LEN {
        return Err(SubwardenError::InvalidParameter {
            field: "request_id",
            reason: format!("length must be 1..={}", MAX_REQUEST_ID_LEN),
        });
    }
    if request_id.chars().any(char::is_control) {
        return Err(SubwardenError::InvalidParameter {
            field: "request_id",
            reason: "control characters not allowed".to_string(),
        });
    }
    Ok(())
}
