//! Paid plans that extend an entitlement window.

use serde::{Deserialize, Serialize};

/// A purchasable plan.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct Plan {
    /// Plan code shown to the provider (e.g. "monthly").
    pub code: String,

    /// Calendar months added to the entitlement window.
    pub months: u32,

    /// Minimum paid amount, in the provider's minor units.
    pub amount: u64,
}

impl Plan {
    /// Whether a confirmed payment of `paid` covers this plan.
    pub fn is_covered_by(&self, paid: u64) -> bool {
        paid >= self.amount
    }
}
