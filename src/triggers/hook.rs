//! Post-commit mutation hook.
//!
//! Called right after a subscriber record is created, updated or deleted.
//! Best effort: outcomes and failures are logged, never returned, so the
//! triggering request does not fail because the device is unreachable.

use crate::clock::Clock;
use crate::model::Subscriber;
use crate::reconcile::{AccessReconciler, Action};
use crate::SubwardenError;
use std::sync::Arc;
use tracing::{debug, warn};

/// A committed change to a subscriber record.
#[derive(Debug, Clone)]
pub enum SubscriberMutation {
    /// New record.
    Created(Subscriber),
    /// Changed record; `previous` is the pre-commit snapshot when known.
    Updated {
        /// Snapshot before the commit.
        previous: Option<Subscriber>,
        /// Snapshot after the commit.
        current: Subscriber,
    },
    /// Deleted record (last known snapshot).
    Deleted(Subscriber),
}

/// Reconciles one subscriber per committed mutation.
pub struct MutationHook {
    reconciler: Arc<AccessReconciler>,
    clock: Arc<dyn Clock>,
}

impl MutationHook {
    /// Create a hook.
    pub fn new(reconciler: Arc<AccessReconciler>, clock: Arc<dyn Clock>) -> Self {
        Self { reconciler, clock }
    }

    /// Handle a committed mutation.
    pub async fn on_commit(&self, mutation: SubscriberMutation) {
        match mutation {
            SubscriberMutation::Created(current) => {
                let result = self.reconciler.reconcile(&current, self.clock.now_utc()).await;
                log_outcome("created", &current, result);
            }
            SubscriberMutation::Updated { previous, current } => {
                if let Some(previous) = previous.filter(|p| p.address != current.address) {
                    let stale = previous.rule_key();
                    let result = self.reconciler.release_address(&stale).await;
                    log_outcome("address released", &previous, result);
                }
                let result = self.reconciler.reconcile(&current, self.clock.now_utc()).await;
                log_outcome("updated", &current, result);
            }
            SubscriberMutation::Deleted(last) => {
                let result = self.reconciler.reconcile_removed(&last).await;
                log_outcome("deleted", &last, result);
            }
        }
    }
}

fn log_outcome(trigger: &'static str, subscriber: &Subscriber, result: Result<Action, SubwardenError>) {
    match result {
        Ok(action) => debug!(
            trigger,
            subscriber_id = %subscriber.id,
            ?action,
            "mutation hook reconciled"
        ),
        Err(e) => warn!(
            trigger,
            subscriber_id = %subscriber.id,
            address = %subscriber.address,
            error = %e,
            "mutation hook reconciliation failed"
        ),
    }
}
