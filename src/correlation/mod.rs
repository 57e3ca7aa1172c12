//! Payment correlation: outstanding requests and consumed confirmations.

pub mod file;
pub mod ledger;
pub mod store;

pub use ledger::ConfirmationLedger;
pub use store::{CorrelationEntry, CorrelationStore};

/// Snapshot file name for outstanding requests.
pub const CORRELATIONS_FILE: &str = "correlations.json";

/// Snapshot file name for consumed confirmations.
pub const LEDGER_FILE: &str = "confirmations.json";
