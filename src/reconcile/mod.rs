//! Reconciliation core.

pub mod locks;
pub mod reconciler;

pub use locks::{KeyGuard, KeyedLocks};
pub use reconciler::{AccessReconciler, Action, Enforcement};
