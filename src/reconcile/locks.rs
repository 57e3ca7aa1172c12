//! Per-key exclusive sections.
//!
//! One async mutex per key, created on first use. A slot is dropped when
//! the last holder lets go with nobody waiting. Slots orphaned by a
//! cancelled waiter are swept on the next `lock` call, so the registry
//! never holds more idle slots than were cancelled since then. Different
//! keys never contend.

use crate::model::RuleKey;
use std::collections::HashMap;
use std::hash::Hash;
use std::sync::{Arc, Mutex};
use tokio::sync::{Mutex as AsyncMutex, OwnedMutexGuard};

type Slot = Arc<AsyncMutex<()>>;
type Registry<K> = Arc<Mutex<HashMap<K, Slot>>>;

/// Registry of per-key locks. Keyed by [`RuleKey`] unless stated.
#[derive(Debug)]
pub struct KeyedLocks<K: Eq + Hash = RuleKey> {
    slots: Registry<K>,
}

/// Held exclusive section for one key. Released on drop.
#[derive(Debug)]
pub struct KeyGuard<K: Eq + Hash = RuleKey> {
    key: K,
    guard: Option<OwnedMutexGuard<()>>,
    slots: Registry<K>,
}

impl<K: Eq + Hash> Default for KeyedLocks<K> {
    fn default() -> Self {
        Self {
            slots: Arc::new(Mutex::new(HashMap::new())),
        }
    }
}

impl<K: Eq + Hash + Clone> KeyedLocks<K> {
    /// Empty registry.
    pub fn new() -> Self {
        Self::default()
    }

    /// Wait for the exclusive section of `key`.
    pub async fn lock(&self, key: &K) -> KeyGuard<K> {
        let slot = {
            let mut slots = self.slots.lock().unwrap_or_else(|e| e.into_inner());
            // only the registry holds an idle slot
            slots.retain(|_, slot| Arc::strong_count(slot) > 1);
            slots.entry(key.clone()).or_default().clone()
        };
        let guard = slot.lock_owned().await;
        KeyGuard {
            key: key.clone(),
            guard: Some(guard),
            slots: self.slots.clone(),
        }
    }

    /// Keys with a live slot (held or awaited).
    pub fn active_keys(&self) -> usize {
        self.slots.lock().unwrap_or_else(|e| e.into_inner()).len()
    }
}

impl<K: Eq + Hash> KeyGuard<K> {
    /// Key this section protects.
    pub fn key(&self) -> &K {
        &self.key
    }
}

impl<K: Eq + Hash> Drop for KeyGuard<K> {
    fn drop(&mut self) {
        // Unlock first; afterwards a count of one means no waiter is left.
        drop(self.guard.take());
        let mut slots = self.slots.lock().unwrap_or_else(|e| e.into_inner());
        if let Some(slot) = slots.get(&self.key) {
            if Arc::strong_count(slot) == 1 {
                slots.remove(&self.key);
            }
        }
    }
}
