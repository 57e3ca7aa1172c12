//! Access reconciler: the compare-then-act core.
//!
//! For one rule key:
//! 1. take the key's exclusive section
//! 2. read the current record and compute the desired state
//! 3. probe the device
//! 4. apply at most one corrective command
//! 5. bring the recorded status in line
//!
//! A converged key costs one probe and nothing else, so repeated calls are
//! idempotent. Transport failures while probing defer; failures while
//! applying surface as `EnforcementFailure`. Nothing is retried here.

use crate::model::{RuleKey, Subscriber, SubscriberStatus};
use crate::reconcile::locks::KeyedLocks;
use crate::remote::command::{CommandTemplate, RuleOp};
use crate::remote::executor::CommandExecutor;
use crate::remote::probe::{RuleProbe, RuleState};
use crate::store::SubscriberStore;
use crate::SubwardenError;
use chrono::{DateTime, Utc};
use std::fmt;
use std::sync::Arc;
use tracing::{debug, error, info, warn};

/// A corrective action on the device.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum Enforcement {
    /// Block rule added.
    Block,
    /// Block rule removed.
    Unblock,
}

impl Enforcement {
    /// Short name used in logs and errors.
    pub fn as_str(self) -> &'static str {
        match self {
            Enforcement::Block => "block",
            Enforcement::Unblock => "unblock",
        }
    }

    fn op(self) -> RuleOp {
        match self {
            Enforcement::Block => RuleOp::Add,
            Enforcement::Unblock => RuleOp::Remove,
        }
    }
}

impl fmt::Display for Enforcement {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(self.as_str())
    }
}

/// Outcome of one reconciliation.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum Action {
    /// Already converged; nothing was changed.
    None,
    /// One corrective command was applied.
    Applied(Enforcement),
    /// Remote state unknown; retry on the next trigger.
    Deferred,
}

/// What the caller wants for a key, before the record is consulted.
#[derive(Debug, Clone, Copy)]
enum Desired {
    /// Follow the stored record's window at this instant.
    Entitlement(DateTime<Utc>),
    /// Block unconditionally.
    Blocked,
    /// Unblock unconditionally.
    Released,
}

/// Resolved state for a key inside its exclusive section.
#[derive(Debug, Clone, Copy)]
struct Target {
    blocked: bool,
    /// Status on record, `None` when no record owns the key.
    recorded: Option<SubscriberStatus>,
}

impl Target {
    fn untracked(blocked: bool) -> Self {
        Self {
            blocked,
            recorded: None,
        }
    }

    /// Status to write once the rule has converged, if it differs.
    ///
    /// A blocked `Pending` subscriber stays `Pending` until paid.
    fn status_update(&self) -> Option<SubscriberStatus> {
        let recorded = self.recorded?;
        let wanted = match (self.blocked, recorded) {
            (false, _) => SubscriberStatus::Active,
            (true, SubscriberStatus::Pending) => SubscriberStatus::Pending,
            (true, _) => SubscriberStatus::Inactive,
        };
        (wanted != recorded).then_some(wanted)
    }
}

/// Reconciles subscriber entitlement with device rules.
pub struct AccessReconciler {
    executor: Arc<dyn CommandExecutor>,
    probe: RuleProbe,
    template: CommandTemplate,
    store: Arc<dyn SubscriberStore>,
    locks: KeyedLocks,
}

impl AccessReconciler {
    /// Create a reconciler over an arbitrary executor.
    pub fn new(
        executor: Arc<dyn CommandExecutor>,
        template: CommandTemplate,
        store: Arc<dyn SubscriberStore>,
    ) -> Self {
        Self {
            probe: RuleProbe::new(executor.clone(), template.clone()),
            executor,
            template,
            store,
            locks: KeyedLocks::new(),
        }
    }

    /// Bring the subscriber's rule in line with its window at `now`.
    ///
    /// `subscriber` only names the key. The record is read again inside the
    /// key's exclusive section, so a caller holding an old snapshot never
    /// undoes a newer decision. A record that has disappeared is blocked;
    /// one that has moved to another address releases this one.
    pub async fn reconcile(
        &self,
        subscriber: &Subscriber,
        now: DateTime<Utc>,
    ) -> Result<Action, SubwardenError> {
        self.converge(&subscriber.rule_key(), Desired::Entitlement(now))
            .await
    }

    /// Block a subscriber whose record was deleted, regardless of dates.
    pub async fn reconcile_removed(&self, subscriber: &Subscriber) -> Result<Action, SubwardenError> {
        self.converge(&subscriber.rule_key(), Desired::Blocked).await
    }

    /// Drop the rule for an address the subscriber no longer owns.
    pub async fn release_address(&self, key: &RuleKey) -> Result<Action, SubwardenError> {
        self.converge(key, Desired::Released).await
    }

    async fn resolve(&self, key: &RuleKey, desired: Desired) -> Result<Target, SubwardenError> {
        let now = match desired {
            Desired::Blocked => return Ok(Target::untracked(true)),
            Desired::Released => return Ok(Target::untracked(false)),
            Desired::Entitlement(now) => now,
        };

        match self.store.get(&key.subscriber_id).await? {
            None => {
                debug!(rule = %key, "record gone, treating as deleted");
                Ok(Target::untracked(true))
            }
            Some(current) if current.address != key.address => {
                debug!(rule = %key, address = %current.address, "address moved, releasing");
                Ok(Target::untracked(false))
            }
            Some(current) => Ok(Target {
                blocked: current.is_blocked_at(now),
                recorded: Some(current.status),
            }),
        }
    }

    async fn converge(&self, key: &RuleKey, desired: Desired) -> Result<Action, SubwardenError> {
        let _section = self.locks.lock(key).await;
        let target = self.resolve(key, desired).await?;

        let present = match self.probe.exists(key).await {
            RuleState::Indeterminate => {
                info!(rule = %key, "reconciliation deferred, remote state unknown");
                return Ok(Action::Deferred);
            }
            RuleState::Present => true,
            RuleState::Absent => false,
        };

        let action = if target.blocked == present {
            debug!(rule = %key, blocked = target.blocked, "already converged");
            Action::None
        } else {
            let enforcement = if target.blocked {
                Enforcement::Block
            } else {
                Enforcement::Unblock
            };
            self.apply(key, enforcement).await?;
            info!(
                subscriber_id = %key.subscriber_id,
                address = %key.address,
                action = %enforcement,
                "enforcement applied"
            );
            Action::Applied(enforcement)
        };

        if let Some(status) = target.status_update() {
            if let Err(e) = self.store.set_status(&key.subscriber_id, status).await {
                warn!(
                    subscriber_id = %key.subscriber_id,
                    ?status,
                    error = %e,
                    "rule converged but status write failed"
                );
                return Err(e);
            }
        }

        Ok(action)
    }

    async fn apply(&self, key: &RuleKey, enforcement: Enforcement) -> Result<(), SubwardenError> {
        let command = self.template.command(enforcement.op(), key);
        let detail = match self.executor.run(&command).await {
            Ok(output) if output.success() => return Ok(()),
            Ok(output) => format!("exit status {}: {}", output.status, output.stderr.trim()),
            Err(e) => e.to_string(),
        };

        error!(
            subscriber_id = %key.subscriber_id,
            address = %key.address,
            action = %enforcement,
            detail = %detail,
            "enforcement failed"
        );
        Err(SubwardenError::EnforcementFailure {
            subscriber_id: key.subscriber_id.to_string(),
            action: enforcement.as_str(),
            detail,
        })
    }
}
