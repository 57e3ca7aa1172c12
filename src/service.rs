//! Subwarden service - wires the enforcement core to its triggers.
//!
//! One [`Subwarden`] per managed device. It owns the reconciler (and with
//! it the per-key locks and session bound) so every trigger handed out
//! shares the same serialization.

use crate::clock::{Clock, SystemClock};
use crate::config::SubwardenConfig;
use crate::correlation::{ConfirmationLedger, CorrelationStore, CORRELATIONS_FILE, LEDGER_FILE};
use crate::reconcile::AccessReconciler;
use crate::remote::{CommandExecutor, CommandTemplate, LimitedExecutor, SshExecutor};
use crate::store::SubscriberStore;
use crate::triggers::{MutationHook, PaymentTrigger, Sweeper};
use crate::SubwardenError;
use std::sync::Arc;
use tracing::info;

/// Entry point owning the shared enforcement state.
pub struct Subwarden {
    config: SubwardenConfig,
    clock: Arc<dyn Clock>,
    store: Arc<dyn SubscriberStore>,
    reconciler: Arc<AccessReconciler>,
    correlations: Arc<CorrelationStore>,
    ledger: Arc<ConfirmationLedger>,
    payments: Arc<PaymentTrigger>,
}

impl Subwarden {
    /// Create a service that reaches the device over ssh.
    ///
    /// # Errors
    /// - `ConfigError` - configuration validation fails
    /// - `InvalidParameter` - host, user or chain rejected
    /// - `StateIO` - payment state cannot be opened
    pub fn new(
        config: SubwardenConfig,
        store: Arc<dyn SubscriberStore>,
    ) -> Result<Self, SubwardenError> {
        config.validate()?;
        let ssh = Arc::new(SshExecutor::new(&config.remote)?);
        Self::with_executor(config, store, ssh, Arc::new(SystemClock))
    }

    /// Create a service over a caller-supplied executor and clock.
    ///
    /// The executor is wrapped in the configured session bound.
    pub fn with_executor(
        config: SubwardenConfig,
        store: Arc<dyn SubscriberStore>,
        executor: Arc<dyn CommandExecutor>,
        clock: Arc<dyn Clock>,
    ) -> Result<Self, SubwardenError> {
        config.validate()?;
        let template = CommandTemplate::new(&config.remote.chain, config.remote.use_sudo)?;
        let executor = Arc::new(LimitedExecutor::new(executor, config.remote.max_sessions));
        let reconciler = Arc::new(AccessReconciler::new(executor, template, store.clone()));

        let state_dir = config.payments.resolve_state_dir()?;
        let correlations = Arc::new(CorrelationStore::open(
            state_dir.join(CORRELATIONS_FILE),
            clock.clone(),
        )?);
        let ledger = Arc::new(ConfirmationLedger::open(
            state_dir.join(LEDGER_FILE),
            config.payments.confirmation_retention(),
            clock.clone(),
        )?);
        let payments = Arc::new(PaymentTrigger::new(
            correlations.clone(),
            ledger.clone(),
            store.clone(),
            reconciler.clone(),
            clock.clone(),
            config.payments.correlation_ttl(),
        ));
        info!(
            host = %config.remote.host,
            chain = %config.remote.chain,
            state_dir = %state_dir.display(),
            "subwarden initialised"
        );

        Ok(Self {
            config,
            clock,
            store,
            reconciler,
            correlations,
            ledger,
            payments,
        })
    }

    /// The shared reconciler.
    pub fn reconciler(&self) -> Arc<AccessReconciler> {
        self.reconciler.clone()
    }

    /// Post-commit hook for subscriber mutations.
    pub fn mutation_hook(&self) -> MutationHook {
        MutationHook::new(self.reconciler.clone(), self.clock.clone())
    }

    /// Periodic sweeper, also evicting expired payment state.
    pub fn sweeper(&self) -> Sweeper {
        Sweeper::new(
            self.store.clone(),
            self.reconciler.clone(),
            self.clock.clone(),
            &self.config.sweep,
        )
        .with_housekeeping(self.correlations.clone(), self.ledger.clone())
    }

    /// Payment initiation and confirmation handler, shared so concurrent
    /// confirmations for one subscriber are serialized.
    pub fn payments(&self) -> Arc<PaymentTrigger> {
        self.payments.clone()
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::clock::MockClock;
    use crate::model::{Plan, Subscriber, SubscriberId, SubscriberStatus};
    use crate::remote::memory::MemoryFirewall;
    use crate::store::InMemorySubscriberStore;
    use crate::triggers::{ConfirmationOutcome, PaymentConfirmation};
    use chrono::Duration;
    use tempfile::TempDir;
    use tokio::sync::watch;

    fn config(dir: &TempDir) -> SubwardenConfig {
        let mut config = SubwardenConfig::default();
        config.remote.host = "gw.example.net".to_string();
        config.payments.state_dir = Some(dir.path().to_path_buf());
        config
    }

    #[test]
    fn test_new_rejects_invalid_config() {
        let store = Arc::new(InMemorySubscriberStore::new());
        let result = Subwarden::new(SubwardenConfig::default(), store);
        assert!(matches!(result, Err(SubwardenError::ConfigError(_))));
    }

    #[test]
    fn test_new_opens_state_files() {
        let dir = TempDir::new().unwrap();
        let store = Arc::new(InMemorySubscriberStore::new());
        assert!(Subwarden::new(config(&dir), store).is_ok());
    }

    #[tokio::test]
    async fn test_payment_state_survives_restart() {
        let dir = TempDir::new().unwrap();
        let clock = Arc::new(MockClock::from_rfc3339("2025-06-15T12:00:00Z"));
        let store = Arc::new(InMemorySubscriberStore::new());
        let id = SubscriberId::new("sub-1").unwrap();
        store.upsert(Subscriber {
            id: id.clone(),
            address: "10.1.0.1".parse().unwrap(),
            subscription_start: clock.now_utc() - Duration::days(40),
            subscription_end: clock.now_utc() - Duration::days(10),
            status: SubscriberStatus::Inactive,
        });
        let plan = Plan {
            code: "monthly".into(),
            months: 1,
            amount: 500,
        };
        let confirmation = PaymentConfirmation {
            request_id: "ws_CO_1".into(),
            result_code: 0,
            amount: 500,
            provider_transaction_id: Some("QKL1".into()),
        };

        {
            let service = Subwarden::with_executor(
                config(&dir),
                store.clone(),
                Arc::new(MemoryFirewall::new()),
                clock.clone(),
            )
            .unwrap();
            service.payments().initiate("ws_CO_1", &id, plan).await.unwrap();
        }

        let service = Subwarden::with_executor(
            config(&dir),
            store.clone(),
            Arc::new(MemoryFirewall::new()),
            clock.clone(),
        )
        .unwrap();
        let payments = service.payments();
        assert!(matches!(
            payments.confirm(&confirmation).await,
            ConfirmationOutcome::Applied { .. }
        ));

        let service = Subwarden::with_executor(
            config(&dir),
            store,
            Arc::new(MemoryFirewall::new()),
            clock,
        )
        .unwrap();
        assert_eq!(
            service.payments().confirm(&confirmation).await,
            ConfirmationOutcome::Duplicate
        );
    }

    #[tokio::test]
    async fn test_triggers_share_the_reconciler() {
        let dir = TempDir::new().unwrap();
        let firewall = Arc::new(MemoryFirewall::new());
        let store = Arc::new(InMemorySubscriberStore::new());
        let clock = Arc::new(MockClock::from_rfc3339("2025-06-15T12:00:00Z"));
        let expired = Subscriber {
            id: SubscriberId::new("sub-2").unwrap(),
            address: "10.1.0.2".parse().unwrap(),
            subscription_start: clock.now_utc() - Duration::days(40),
            subscription_end: clock.now_utc() - Duration::days(1),
            status: SubscriberStatus::Active,
        };
        store.upsert(expired.clone());

        let service =
            Subwarden::with_executor(config(&dir), store, firewall.clone(), clock).unwrap();
        service
            .mutation_hook()
            .on_commit(crate::triggers::SubscriberMutation::Created(expired.clone()))
            .await;

        let (_tx, rx) = watch::channel(false);
        let report = service.sweeper().sweep_once(&rx).await.unwrap();
        assert_eq!(report.converged, 1);
        assert_eq!(firewall.rule_count(&expired.rule_key()), 1);
    }
}
