//! Trigger sources that drive reconciliation.
//!
//! - [`hook`] reacts to committed subscriber mutations
//! - [`sweep`] periodically re-checks everyone
//! - [`payment`] applies provider payment confirmations

pub mod hook;
pub mod payment;
pub mod sweep;

pub use hook::{MutationHook, SubscriberMutation};
pub use payment::{Acknowledgement, ConfirmationOutcome, PaymentConfirmation, PaymentTrigger};
pub use sweep::{SweepReport, Sweeper};
