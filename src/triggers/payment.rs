//! Payment-confirmation trigger.
//!
//! Bridges an asynchronous provider callback back to the subscriber that
//! started the payment. A confirmation takes effect at most once: the
//! provider transaction id is recorded in the [`ConfirmationLedger`]
//! before the correlation entry is consumed, and both are rolled back if
//! the extended window cannot be written.
//!
//! The provider always receives the same [`Acknowledgement`], whatever the
//! outcome, so it never retries a confirmation that was rejected on
//! purpose.

use crate::clock::Clock;
use crate::correlation::{ConfirmationLedger, CorrelationEntry, CorrelationStore};
use crate::model::{Plan, SubscriberId, SubscriberStatus};
use crate::reconcile::{AccessReconciler, Action, KeyedLocks};
use crate::store::SubscriberStore;
use crate::SubwardenError;
use chrono::{DateTime, Duration, Utc};
use serde::{Deserialize, Serialize};
use std::sync::Arc;
use tracing::{debug, error, info, warn};

/// Provider result code for a completed payment.
pub const RESULT_CODE_SUCCESS: i32 = 0;

/// Payment outcome delivered by the provider.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct PaymentConfirmation {
    /// Request id returned by the provider at initiation.
    pub request_id: String,
    /// Provider result code; [`RESULT_CODE_SUCCESS`] means paid.
    pub result_code: i32,
    /// Amount paid, in minor units.
    #[serde(default)]
    pub amount: u64,
    /// Provider transaction reference, present on successful payments.
    #[serde(default)]
    pub provider_transaction_id: Option<String>,
}

impl PaymentConfirmation {
    /// Key used for duplicate detection.
    ///
    /// Falls back to the request id when the provider sent no transaction
    /// reference.
    fn dedup_key(&self) -> String {
        match &self.provider_transaction_id {
            Some(txn) if !txn.is_empty() => txn.clone(),
            _ => format!("request:{}", self.request_id),
        }
    }
}

/// Fixed reply sent back to the provider.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct Acknowledgement {
    /// Always 0.
    #[serde(rename = "ResultCode")]
    pub result_code: i32,
    /// Always "Accepted".
    #[serde(rename = "ResultDesc")]
    pub result_desc: String,
}

impl Default for Acknowledgement {
    fn default() -> Self {
        Self {
            result_code: 0,
            result_desc: "Accepted".to_string(),
        }
    }
}

/// What a confirmation did.
#[derive(Debug, Clone, PartialEq)]
pub enum ConfirmationOutcome {
    /// Window extended and persisted.
    Applied {
        /// Subscriber whose window moved.
        subscriber_id: SubscriberId,
        /// The new window end.
        subscription_end: DateTime<Utc>,
        /// Result of the follow-up reconciliation; `None` if it failed.
        action: Option<Action>,
    },
    /// Payment failed or was short; nothing extended.
    Declined {
        /// Why the payment was not honoured.
        reason: String,
    },
    /// No outstanding request matched, or it had expired.
    Unmatched,
    /// Transaction already applied.
    Duplicate,
    /// Could not be applied; a redelivery may still succeed.
    Failed(String),
}

/// Handles payment initiation and confirmation.
pub struct PaymentTrigger {
    correlations: Arc<CorrelationStore>,
    ledger: Arc<ConfirmationLedger>,
    store: Arc<dyn SubscriberStore>,
    reconciler: Arc<AccessReconciler>,
    clock: Arc<dyn Clock>,
    ttl: Duration,
    windows: KeyedLocks<SubscriberId>,
}

impl PaymentTrigger {
    /// Create a trigger. `ttl` bounds how long an initiated request waits
    /// for its confirmation.
    pub fn new(
        correlations: Arc<CorrelationStore>,
        ledger: Arc<ConfirmationLedger>,
        store: Arc<dyn SubscriberStore>,
        reconciler: Arc<AccessReconciler>,
        clock: Arc<dyn Clock>,
        ttl: Duration,
    ) -> Self {
        Self {
            correlations,
            ledger,
            store,
            reconciler,
            clock,
            ttl,
            windows: KeyedLocks::new(),
        }
    }

    /// Register an outstanding payment request for `subscriber_id`.
    ///
    /// A subscriber without a current entitlement is marked `Pending`.
    ///
    /// # Errors
    /// - `InvalidParameter` - unknown subscriber or bad request id
    /// - `CorrelationConflict` - `request_id` is already outstanding
    /// - `Store`, `StateIO` - persistence failed
    pub async fn initiate(
        &self,
        request_id: &str,
        subscriber_id: &SubscriberId,
        plan: Plan,
    ) -> Result<(), SubwardenError> {
        let subscriber = self.store.get(subscriber_id).await?.ok_or_else(|| {
            SubwardenError::InvalidParameter {
                field: "subscriber_id",
                reason: format!("unknown subscriber {}", subscriber_id),
            }
        })?;

        self.correlations
            .create(request_id, subscriber_id.clone(), plan, self.ttl)?;
        info!(request_id, subscriber_id = %subscriber_id, "payment request registered");

        let now = self.clock.now_utc();
        if subscriber.is_blocked_at(now) && subscriber.status != SubscriberStatus::Pending {
            if let Err(e) = self
                .store
                .set_status(subscriber_id, SubscriberStatus::Pending)
                .await
            {
                warn!(subscriber_id = %subscriber_id, error = %e, "failed to mark subscriber pending");
            }
        }
        Ok(())
    }

    /// Apply a provider confirmation.
    pub async fn confirm(&self, confirmation: &PaymentConfirmation) -> ConfirmationOutcome {
        let request_id = confirmation.request_id.as_str();

        if confirmation.result_code != RESULT_CODE_SUCCESS {
            if let Ok(entry) = self.correlations.consume(request_id) {
                info!(
                    request_id,
                    subscriber_id = %entry.subscriber_id,
                    result_code = confirmation.result_code,
                    "payment declined by provider"
                );
            }
            return ConfirmationOutcome::Declined {
                reason: format!("provider result code {}", confirmation.result_code),
            };
        }

        let dedup_key = confirmation.dedup_key();
        match self.ledger.record(&dedup_key) {
            Ok(()) => {}
            Err(SubwardenError::DuplicateConfirmation { .. }) => {
                info!(request_id, "duplicate payment confirmation ignored");
                return ConfirmationOutcome::Duplicate;
            }
            Err(e) => {
                error!(request_id, error = %e, "failed to record payment confirmation");
                return ConfirmationOutcome::Failed(e.to_string());
            }
        }

        let entry = match self.correlations.consume(request_id) {
            Ok(entry) => entry,
            Err(e) => {
                warn!(request_id, error = %e, "payment confirmation has no outstanding request");
                return ConfirmationOutcome::Unmatched;
            }
        };

        if !entry.plan.is_covered_by(confirmation.amount) {
            warn!(
                request_id,
                subscriber_id = %entry.subscriber_id,
                paid = confirmation.amount,
                required = entry.plan.amount,
                "payment below plan amount"
            );
            return ConfirmationOutcome::Declined {
                reason: format!(
                    "paid {} of required {}",
                    confirmation.amount, entry.plan.amount
                ),
            };
        }

        match self.extend(&entry).await {
            Ok(outcome) => outcome,
            Err(e) => {
                error!(
                    request_id,
                    subscriber_id = %entry.subscriber_id,
                    error = %e,
                    "failed to apply payment; rolling back"
                );
                self.roll_back(request_id, &dedup_key, entry);
                ConfirmationOutcome::Failed(e.to_string())
            }
        }
    }

    /// Apply a confirmation and produce the provider reply.
    pub async fn handle(&self, confirmation: &PaymentConfirmation) -> Acknowledgement {
        let outcome = self.confirm(confirmation).await;
        debug!(request_id = %confirmation.request_id, ?outcome, "payment confirmation handled");
        Acknowledgement::default()
    }

    async fn extend(&self, entry: &CorrelationEntry) -> Result<ConfirmationOutcome, SubwardenError> {
        let id = &entry.subscriber_id;
        let now = self.clock.now_utc();

        // Read-extend-write must not interleave with another payment for
        // the same subscriber.
        let subscriber = {
            let _window = self.windows.lock(id).await;
            let mut subscriber = self
                .store
                .get(id)
                .await?
                .ok_or_else(|| SubwardenError::Store(format!("subscriber {} not found", id)))?;

            let (start, end) = subscriber
                .extended_window(entry.plan.months, now)
                .ok_or_else(|| SubwardenError::InvalidParameter {
                    field: "plan.months",
                    reason: "window end out of range".to_string(),
                })?;

            self.store.set_window(id, start, end).await?;
            subscriber.subscription_start = start;
            subscriber.subscription_end = end;
            subscriber
        };
        info!(
            subscriber_id = %id,
            plan = %entry.plan.code,
            subscription_end = %subscriber.subscription_end,
            "subscription extended"
        );

        let action = match self.reconciler.reconcile(&subscriber, now).await {
            Ok(action) => Some(action),
            Err(e) => {
                warn!(subscriber_id = %id, error = %e, "post-payment reconciliation failed");
                None
            }
        };

        Ok(ConfirmationOutcome::Applied {
            subscriber_id: id.clone(),
            subscription_end: subscriber.subscription_end,
            action,
        })
    }

    fn roll_back(&self, request_id: &str, dedup_key: &str, entry: CorrelationEntry) {
        if let Err(e) = self.ledger.forget(dedup_key) {
            error!(request_id, error = %e, "failed to release confirmation id");
        }
        if let Err(e) = self.correlations.restore(request_id, entry) {
            error!(request_id, error = %e, "failed to restore payment request");
        }
    }
}
