//! Periodic sweep over every subscriber.
//!
//! Each sweep lists the full subscriber set and reconciles it through a
//! fixed-size worker pool, so a slow or unreachable device only occupies
//! its own worker. Shutdown stops new work, including a sweep parked on a
//! full pool; reconciliations already in flight run to completion.

use crate::clock::Clock;
use crate::config::SweepConfig;
use crate::correlation::{ConfirmationLedger, CorrelationStore};
use crate::reconcile::{AccessReconciler, Action, Enforcement};
use crate::store::SubscriberStore;
use crate::SubwardenError;
use std::sync::Arc;
use std::time::Duration;
use tokio::sync::{watch, Semaphore};
use tokio::task::JoinSet;
use tokio::time::MissedTickBehavior;
use tracing::{debug, error, info, warn};

/// Tally of one sweep.
#[derive(Debug, Clone, Default, PartialEq, Eq)]
pub struct SweepReport {
    /// Subscribers listed.
    pub total: usize,
    /// Already converged.
    pub converged: usize,
    /// Block rules added.
    pub blocked: usize,
    /// Block rules removed.
    pub unblocked: usize,
    /// Deferred on an unknown remote state.
    pub deferred: usize,
    /// Enforcement or status-write failures.
    pub failed: usize,
    /// Not started because shutdown was requested.
    pub skipped: usize,
}

impl SweepReport {
    fn record(&mut self, result: Result<Action, SubwardenError>) {
        match result {
            Ok(Action::None) => self.converged += 1,
            Ok(Action::Applied(Enforcement::Block)) => self.blocked += 1,
            Ok(Action::Applied(Enforcement::Unblock)) => self.unblocked += 1,
            Ok(Action::Deferred) => self.deferred += 1,
            Err(_) => self.failed += 1,
        }
    }
}

/// Drives periodic reconciliation.
pub struct Sweeper {
    store: Arc<dyn SubscriberStore>,
    reconciler: Arc<AccessReconciler>,
    clock: Arc<dyn Clock>,
    workers: usize,
    interval: Duration,
    correlations: Option<Arc<CorrelationStore>>,
    ledger: Option<Arc<ConfirmationLedger>>,
}

impl Sweeper {
    /// Create a sweeper.
    pub fn new(
        store: Arc<dyn SubscriberStore>,
        reconciler: Arc<AccessReconciler>,
        clock: Arc<dyn Clock>,
        config: &SweepConfig,
    ) -> Self {
        Self {
            store,
            reconciler,
            clock,
            workers: config.workers.max(1),
            interval: config.interval(),
            correlations: None,
            ledger: None,
        }
    }

    /// Also evict expired payment state after each sweep.
    pub fn with_housekeeping(
        mut self,
        correlations: Arc<CorrelationStore>,
        ledger: Arc<ConfirmationLedger>,
    ) -> Self {
        self.correlations = Some(correlations);
        self.ledger = Some(ledger);
        self
    }

    /// Run one sweep.
    ///
    /// # Errors
    /// Only when the subscriber set cannot be listed; per-subscriber
    /// failures are counted in the report.
    pub async fn sweep_once(
        &self,
        shutdown: &watch::Receiver<bool>,
    ) -> Result<SweepReport, SubwardenError> {
        let subscribers = self.store.list().await?;
        let mut report = SweepReport {
            total: subscribers.len(),
            ..SweepReport::default()
        };

        let pool = Arc::new(Semaphore::new(self.workers));
        let mut tasks = JoinSet::new();
        let mut pending = subscribers.into_iter();
        let mut stop = shutdown.clone();

        while let Some(subscriber) = pending.next() {
            if *stop.borrow() {
                report.skipped = 1 + pending.len();
                break;
            }
            let permit = tokio::select! {
                acquired = pool.clone().acquire_owned() => match acquired {
                    Ok(permit) => permit,
                    Err(_) => break,
                },
                _ = shutdown_requested(&mut stop) => {
                    report.skipped = 1 + pending.len();
                    break;
                }
            };
            let reconciler = self.reconciler.clone();
            let clock = self.clock.clone();
            tasks.spawn(async move {
                let _permit = permit;
                let result = reconciler.reconcile(&subscriber, clock.now_utc()).await;
                if let Err(e) = &result {
                    warn!(
                        subscriber_id = %subscriber.id,
                        address = %subscriber.address,
                        error = %e,
                        "sweep reconciliation failed"
                    );
                }
                result
            });
        }

        while let Some(joined) = tasks.join_next().await {
            match joined {
                Ok(result) => report.record(result),
                Err(e) => {
                    error!(error = %e, "sweep worker panicked");
                    report.failed += 1;
                }
            }
        }

        self.housekeeping();
        Ok(report)
    }

    fn housekeeping(&self) {
        if let Some(correlations) = &self.correlations {
            if let Err(e) = correlations.purge_expired() {
                warn!(error = %e, "failed to purge expired payment requests");
            }
        }
        if let Some(ledger) = &self.ledger {
            if let Err(e) = ledger.purge_expired() {
                warn!(error = %e, "failed to purge expired confirmation ids");
            }
        }
    }

    /// Sweep every interval until `shutdown` becomes `true` or its sender
    /// is dropped.
    pub async fn run(&self, mut shutdown: watch::Receiver<bool>) {
        let mut ticker = tokio::time::interval(self.interval);
        ticker.set_missed_tick_behavior(MissedTickBehavior::Delay);
        info!(interval_secs = self.interval.as_secs(), workers = self.workers, "sweeper started");

        loop {
            tokio::select! {
                _ = ticker.tick() => {}
                changed = shutdown.changed() => {
                    if changed.is_err() || *shutdown.borrow() {
                        break;
                    }
                    continue;
                }
            }
            if *shutdown.borrow() {
                break;
            }

            match self.sweep_once(&shutdown).await {
                Ok(report) => info!(
                    total = report.total,
                    blocked = report.blocked,
                    unblocked = report.unblocked,
                    deferred = report.deferred,
                    failed = report.failed,
                    skipped = report.skipped,
                    "sweep finished"
                ),
                Err(e) => error!(error = %e, "sweep could not list subscribers"),
            }
        }

        debug!("sweeper stopped");
    }
}

/// Resolves once `true` is published; never resolves after the sender is
/// dropped without it.
async fn shutdown_requested(rx: &mut watch::Receiver<bool>) {
    let closed = rx.wait_for(|stop| *stop).await.is_err();
    if closed {
        std::future::pending::<()>().await;
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::clock::MockClock;
    use crate::model::{Plan, Subscriber, SubscriberId, SubscriberStatus};
    use crate::remote::command::{CommandTemplate, FirewallCommand};
    use crate::remote::executor::{CommandExecutor, CommandOutput};
    use crate::remote::memory::MemoryFirewall;
    use crate::store::InMemorySubscriberStore;
    use crate::triggers::{
        ConfirmationOutcome, MutationHook, PaymentConfirmation, PaymentTrigger,
        SubscriberMutation,
    };
    use async_trait::async_trait;
    use chrono::{DateTime, Utc};
    use std::net::IpAddr;

    fn now() -> DateTime<Utc> {
        DateTime::parse_from_rfc3339("2025-06-15T12:00:00Z")
            .unwrap()
            .with_timezone(&Utc)
    }

    fn subscriber(i: u8, entitled: bool) -> Subscriber {
        let end = if entitled {
            now() + chrono::Duration::days(5)
        } else {
            now() - chrono::Duration::days(5)
        };
        Subscriber {
            id: SubscriberId::new(format!("sub-{}", i)).unwrap(),
            address: format!("10.0.2.{}", i).parse().unwrap(),
            subscription_start: now() - chrono::Duration::days(30),
            subscription_end: end,
            status: SubscriberStatus::Active,
        }
    }

    fn config(workers: usize) -> SweepConfig {
        SweepConfig {
            interval_secs: 1,
            workers,
        }
    }

    fn build(
        executor: Arc<dyn CommandExecutor>,
        store: Arc<InMemorySubscriberStore>,
        workers: usize,
    ) -> Sweeper {
        let reconciler = Arc::new(AccessReconciler::new(
            executor,
            CommandTemplate::default(),
            store.clone(),
        ));
        Sweeper::new(
            store,
            reconciler,
            Arc::new(MockClock::new(now())),
            &config(workers),
        )
    }

    /// Device where one address never answers.
    struct OneDeadAddress {
        dead: IpAddr,
        inner: MemoryFirewall,
    }

    #[async_trait]
    impl CommandExecutor for OneDeadAddress {
        async fn run(&self, command: &FirewallCommand) -> Result<CommandOutput, SubwardenError> {
            if command.key().address == self.dead {
                tokio::time::sleep(Duration::from_secs(30)).await;
                return Err(SubwardenError::CommandTimeout { timeout_ms: 30_000 });
            }
            self.inner.run(command).await
        }
    }

    #[tokio::test]
    async fn test_sweep_converges_everyone() {
        let firewall = Arc::new(MemoryFirewall::new());
        let store = Arc::new(InMemorySubscriberStore::new());
        for i in 1..=6 {
            store.upsert(subscriber(i, i % 2 == 0));
        }
        // entitled subscriber with a leftover block
        firewall.insert_rule(subscriber(2, true).rule_key());

        let sweeper = build(firewall.clone(), store.clone(), 3);
        let (_tx, rx) = watch::channel(false);
        let report = sweeper.sweep_once(&rx).await.unwrap();

        assert_eq!(report.total, 6);
        assert_eq!(report.blocked, 3);
        assert_eq!(report.unblocked, 1);
        assert_eq!(report.converged, 2);
        assert_eq!(report.failed + report.deferred + report.skipped, 0);

        let second = sweeper.sweep_once(&rx).await.unwrap();
        assert_eq!(second.converged, 6);
    }

    #[tokio::test(start_paused = true)]
    async fn test_dead_device_does_not_stall_others() {
        let dead: IpAddr = "10.0.2.1".parse().unwrap();
        let executor = Arc::new(OneDeadAddress {
            dead,
            inner: MemoryFirewall::new(),
        });
        let store = Arc::new(InMemorySubscriberStore::new());
        for i in 1..=5 {
            store.upsert(subscriber(i, false));
        }

        let sweeper = build(executor.clone(), store, 2);
        let (_tx, rx) = watch::channel(false);
        let report = sweeper.sweep_once(&rx).await.unwrap();

        assert_eq!(report.deferred, 1);
        assert_eq!(report.blocked, 4);
        assert_eq!(executor.inner.count(crate::remote::RuleOp::Add), 4);
    }

    #[tokio::test]
    async fn test_shutdown_skips_remaining_work() {
        let firewall = Arc::new(MemoryFirewall::new());
        let store = Arc::new(InMemorySubscriberStore::new());
        for i in 1..=4 {
            store.upsert(subscriber(i, false));
        }

        let sweeper = build(firewall.clone(), store, 2);
        let (tx, rx) = watch::channel(false);
        tx.send(true).unwrap();
        let report = sweeper.sweep_once(&rx).await.unwrap();

        assert_eq!(report.skipped, 4);
        assert!(firewall.journal().is_empty());
    }

    #[tokio::test(start_paused = true)]
    async fn test_run_stops_on_shutdown() {
        let firewall = Arc::new(MemoryFirewall::new());
        let store = Arc::new(InMemorySubscriberStore::new());
        store.upsert(subscriber(1, false));

        let sweeper = Arc::new(build(firewall.clone(), store, 1));
        let (tx, rx) = watch::channel(false);
        let handle = {
            let sweeper = sweeper.clone();
            tokio::spawn(async move { sweeper.run(rx).await })
        };

        tokio::time::sleep(Duration::from_millis(2500)).await;
        tx.send(true).unwrap();
        handle.await.unwrap();

        // first tick fires immediately, then once per second
        assert!(firewall.count(crate::remote::RuleOp::Check) >= 3);
        assert_eq!(firewall.count(crate::remote::RuleOp::Add), 1);
    }

    #[tokio::test]
    async fn test_housekeeping_purges_expired_payment_state() {
        let clock = Arc::new(MockClock::new(now()));
        let correlations = Arc::new(CorrelationStore::in_memory(clock.clone()));
        let ledger = Arc::new(ConfirmationLedger::in_memory(
            chrono::Duration::hours(1),
            clock.clone(),
        ));
        let plan = Plan {
            code: "monthly".into(),
            months: 1,
            amount: 100,
        };
        correlations
            .create(
                "req-1",
                SubscriberId::new("sub-1").unwrap(),
                plan,
                chrono::Duration::minutes(5),
            )
            .unwrap();
        ledger.record("TX1").unwrap();
        clock.advance(chrono::Duration::hours(2));

        let store = Arc::new(InMemorySubscriberStore::new());
        let sweeper = build(Arc::new(MemoryFirewall::new()), store, 1)
            .with_housekeeping(correlations.clone(), ledger.clone());
        let (_tx, rx) = watch::channel(false);
        sweeper.sweep_once(&rx).await.unwrap();

        assert!(correlations.is_empty());
        assert!(ledger.is_empty());
    }

    #[tokio::test(start_paused = true)]
    async fn test_shutdown_while_waiting_for_a_worker() {
        let executor = Arc::new(OneDeadAddress {
            dead: "10.0.2.1".parse().unwrap(),
            inner: MemoryFirewall::new(),
        });
        let store = Arc::new(InMemorySubscriberStore::new());
        for i in 1..=3 {
            store.upsert(subscriber(i, false));
        }

        let sweeper = Arc::new(build(executor.clone(), store, 1));
        let (tx, rx) = watch::channel(false);
        let handle = {
            let sweeper = sweeper.clone();
            tokio::spawn(async move { sweeper.sweep_once(&rx).await })
        };

        // sub-1 holds the only worker for 30s
        tokio::time::sleep(Duration::from_millis(10)).await;
        tx.send(true).unwrap();
        let report = handle.await.unwrap().unwrap();

        assert_eq!(report.skipped, 2);
        assert_eq!(report.deferred, 1);
        assert_eq!(executor.inner.count(crate::remote::RuleOp::Check), 0);
    }

    /// One worker over a slow device, so sub-2 is still queued while its
    /// record changes underneath the sweep.
    fn slow_sweep(
        store: Arc<InMemorySubscriberStore>,
    ) -> (Arc<MemoryFirewall>, Arc<AccessReconciler>, Arc<Sweeper>) {
        let firewall = Arc::new(MemoryFirewall::new().with_latency(Duration::from_millis(50)));
        let reconciler = Arc::new(AccessReconciler::new(
            firewall.clone(),
            CommandTemplate::default(),
            store.clone(),
        ));
        let sweeper = Arc::new(Sweeper::new(
            store,
            reconciler.clone(),
            Arc::new(MockClock::new(now())),
            &config(1),
        ));
        (firewall, reconciler, sweeper)
    }

    #[tokio::test(start_paused = true)]
    async fn test_sweep_keeps_block_of_record_deleted_mid_sweep() {
        let store = Arc::new(InMemorySubscriberStore::new());
        store.upsert(subscriber(1, false));
        let removed = subscriber(2, true);
        store.upsert(removed.clone());
        let (firewall, reconciler, sweeper) = slow_sweep(store.clone());

        let (_tx, rx) = watch::channel(false);
        let handle = {
            let sweeper = sweeper.clone();
            tokio::spawn(async move { sweeper.sweep_once(&rx).await })
        };

        tokio::time::sleep(Duration::from_millis(10)).await;
        store.remove(&removed.id);
        MutationHook::new(reconciler, Arc::new(MockClock::new(now())))
            .on_commit(SubscriberMutation::Deleted(removed.clone()))
            .await;
        assert!(firewall.has_rule(&removed.rule_key()));

        let report = handle.await.unwrap().unwrap();
        assert_eq!(report.total, 2);
        assert!(firewall.has_rule(&removed.rule_key()));
        assert_eq!(firewall.count(crate::remote::RuleOp::Remove), 0);
    }

    #[tokio::test(start_paused = true)]
    async fn test_sweep_keeps_payment_made_mid_sweep() {
        let store = Arc::new(InMemorySubscriberStore::new());
        store.upsert(subscriber(1, false));
        let mut lapsed = subscriber(2, false);
        lapsed.status = SubscriberStatus::Inactive;
        store.upsert(lapsed.clone());
        let (firewall, reconciler, sweeper) = slow_sweep(store.clone());
        firewall.insert_rule(lapsed.rule_key());

        let clock = Arc::new(MockClock::new(now()));
        let payments = PaymentTrigger::new(
            Arc::new(CorrelationStore::in_memory(clock.clone())),
            Arc::new(ConfirmationLedger::in_memory(chrono::Duration::days(1), clock.clone())),
            store.clone(),
            reconciler,
            clock,
            chrono::Duration::minutes(15),
        );
        let plan = Plan {
            code: "monthly".into(),
            months: 1,
            amount: 100,
        };
        payments.initiate("req-9", &lapsed.id, plan).await.unwrap();

        let (_tx, rx) = watch::channel(false);
        let handle = {
            let sweeper = sweeper.clone();
            tokio::spawn(async move { sweeper.sweep_once(&rx).await })
        };

        tokio::time::sleep(Duration::from_millis(10)).await;
        let outcome = payments
            .confirm(&PaymentConfirmation {
                request_id: "req-9".into(),
                result_code: 0,
                amount: 100,
                provider_transaction_id: Some("TX9".into()),
            })
            .await;
        assert!(matches!(outcome, ConfirmationOutcome::Applied { .. }));

        handle.await.unwrap().unwrap();
        assert!(!firewall.has_rule(&lapsed.rule_key()));
        assert_eq!(firewall.count(crate::remote::RuleOp::Add), 1);
        assert_eq!(
            store.snapshot(&lapsed.id).unwrap().status,
            SubscriberStatus::Active
        );
    }
}
