//! # Subwarden
//!
//! **Keeps per-subscriber firewall blocks in line with entitlement windows.**
//!
//! A subscriber is entitled while `start <= now < end`. Outside that window
//! their address must carry a DROP rule on the network device; inside it,
//! it must not. Subwarden reconciles that desired state against the device
//! over a bounded, timed-out ssh channel and never stacks duplicate rules.
//!
//! ## Features
//!
//! - **Check-then-act reconciliation** - probes the rule before changing it,
//!   so repeated runs are no-ops
//! - **Per-subscriber serialization** - concurrent triggers for the same key
//!   issue at most one corrective command
//! - **Three trigger sources** - post-commit mutation hook, periodic sweep,
//!   and payment confirmations
//! - **Exactly-once payments** - correlation entries are consumed once and
//!   provider transaction ids are remembered across restarts
//! - **Fail-soft** - an unreachable device defers work to the next trigger
//!   instead of failing the caller
//!
//! ## Quickstart
//!
//! ```no_run
//! use std::sync::Arc;
//! use subwarden::{InMemorySubscriberStore, Subwarden, SubwardenConfig};
//!
//! # async fn run() -> Result<(), subwarden::SubwardenError> {
//! let mut config = SubwardenConfig::default();
//! config.remote.host = "gw.example.net".to_string();
//!
//! let store = Arc::new(InMemorySubscriberStore::new());
//! let service = Subwarden::new(config, store)?;
//!
//! let (_shutdown_tx, shutdown_rx) = tokio::sync::watch::channel(false);
//! service.sweeper().run(shutdown_rx).await;
//! # Ok(())
//! # }
//! ```
//!
//! ## Remote commands
//!
//! Commands are argument vectors built from validated values only:
//!
//! - `iptables -C <chain> -s <addr> -m comment --comment subwarden-<id> -j DROP`
//! - `iptables -I ...` to block, `iptables -D ...` to unblock
//!
//! IPv6 addresses use `ip6tables`. See [`CommandTemplate`].

#![deny(warnings)]
#![deny(missing_docs)]

// Core modules
pub mod clock;
pub mod config;
pub mod errors;

// Domain
pub mod model;
pub mod store;

// Remote layer
pub mod remote;

// Enforcement
pub mod reconcile;

// Payment state
pub mod correlation;

// Triggers
pub mod triggers;

// Service (main public API)
pub mod service;

// Re-exports for public API
pub use clock::{Clock, SystemClock};
pub use config::{PaymentConfig, RemoteConfig, SubwardenConfig, SweepConfig};
pub use errors::SubwardenError;
pub use model::{Plan, RuleKey, Subscriber, SubscriberId, SubscriberStatus};
pub use reconcile::{AccessReconciler, Action, Enforcement};
pub use remote::{CommandExecutor, CommandOutput, CommandTemplate, FirewallCommand, RuleOp, RuleState};
pub use service::Subwarden;
pub use store::{InMemorySubscriberStore, SubscriberStore};
pub use triggers::{
    Acknowledgement, ConfirmationOutcome, MutationHook, PaymentConfirmation, PaymentTrigger,
    SubscriberMutation, SweepReport, Sweeper,
};

#[cfg(any(test, feature = "test-seams"))]
pub use clock::MockClock;
