//! Subscriber persistence collaborator.
//!
//! The reconciler reads snapshots and writes status and window changes
//! back through [`SubscriberStore`]. The real schema lives elsewhere;
//! [`InMemorySubscriberStore`] backs tests and embedded use.

use crate::model::{Subscriber, SubscriberId, SubscriberStatus};
use crate::SubwardenError;
use async_trait::async_trait;
use chrono::{DateTime, Utc};
use std::collections::BTreeMap;
use std::sync::RwLock;

/// Persistence operations the enforcement core needs.
#[async_trait]
pub trait SubscriberStore: Send + Sync {
    /// Snapshot of every subscriber.
    async fn list(&self) -> Result<Vec<Subscriber>, SubwardenError>;

    /// Snapshot of one subscriber.
    async fn get(&self, id: &SubscriberId) -> Result<Option<Subscriber>, SubwardenError>;

    /// Record a status transition.
    async fn set_status(
        &self,
        id: &SubscriberId,
        status: SubscriberStatus,
    ) -> Result<(), SubwardenError>;

    /// Replace the entitlement window.
    async fn set_window(
        &self,
        id: &SubscriberId,
        start: DateTime<Utc>,
        end: DateTime<Utc>,
    ) -> Result<(), SubwardenError>;
}

/// Map-backed store.
#[derive(Debug, Default)]
pub struct InMemorySubscriberStore {
    subscribers: RwLock<BTreeMap<SubscriberId, Subscriber>>,
}

impl InMemorySubscriberStore {
    /// Empty store.
    pub fn new() -> Self {
        Self::default()
    }

    /// Insert or replace a record.
    pub fn upsert(&self, subscriber: Subscriber) {
        self.subscribers
            .write()
            .unwrap_or_else(|e| e.into_inner())
            .insert(subscriber.id.clone(), subscriber);
    }

    /// Remove a record, returning it.
    pub fn remove(&self, id: &SubscriberId) -> Option<Subscriber> {
        self.subscribers
            .write()
            .unwrap_or_else(|e| e.into_inner())
            .remove(id)
    }

    /// Synchronous read, for callers outside the async path.
    pub fn snapshot(&self, id: &SubscriberId) -> Option<Subscriber> {
        self.subscribers
            .read()
            .unwrap_or_else(|e| e.into_inner())
            .get(id)
            .cloned()
    }

    fn update<F>(&self, id: &SubscriberId, f: F) -> Result<(), SubwardenError>
    where
        F: FnOnce(&mut Subscriber),
    {
        let mut subscribers = self.subscribers.write().unwrap_or_else(|e| e.into_inner());
        let subscriber = subscribers
            .get_mut(id)
            .ok_or_else(|| SubwardenError::Store(format!("unknown subscriber {}", id)))?;
        f(subscriber);
        Ok(())
    }
}

#[async_trait]
impl SubscriberStore for InMemorySubscriberStore {
    async fn list(&self) -> Result<Vec<Subscriber>, SubwardenError> {
        Ok(self
            .subscribers
            .read()
            .unwrap_or_else(|e| e.into_inner())
            .values()
            .cloned()
            .collect())
    }

    async fn get(&self, id: &SubscriberId) -> Result<Option<Subscriber>, SubwardenError> {
        Ok(self.snapshot(id))
    }

    async fn set_status(
        &self,
        id: &SubscriberId,
        status: SubscriberStatus,
    ) -> Result<(), SubwardenError> {
        self.update(id, |s| s.status = status)
    }

    async fn set_window(
        &self,
        id: &SubscriberId,
        start: DateTime<Utc>,
        end: DateTime<Utc>,
    ) -> Result<(), SubwardenError> {
        if end <= start {
            return Err(SubwardenError::Store(format!(
                "window end {} is not after start {}",
                end, start
            )));
        }
        self.update(id, |s| {
            s.subscription_start = start;
            s.subscription_end = end;
        })
    }
}
