//! Reconciliation-relevant projection of a subscriber record.

use crate::SubwardenError;
use chrono::{DateTime, Months, Utc};
use serde::{Deserialize, Serialize};
use std::fmt;
use std::net::IpAddr;

/// Maximum subscriber identifier length.
pub const MAX_SUBSCRIBER_ID_LEN: usize = 64;

/// Validated subscriber identifier: `[A-Za-z0-9_-]{1,64}`.
///
/// Embedded in remote commands, so construction is the allow-list gate.
#[derive(Debug, Clone, PartialEq, Eq, Hash, PartialOrd, Ord, Serialize, Deserialize)]
#[serde(try_from = "String", into = "String")]
pub struct SubscriberId(String);

impl SubscriberId {
    /// Validate and wrap an identifier.
    pub fn new(id: impl Into<String>) -> Result<Self, SubwardenError> {
        let id = id.into();
        if id.is_empty() || id.len() > MAX_SUBSCRIBER_ID_LEN {
            return Err(SubwardenError::InvalidParameter {
                field: "subscriber_id",
                reason: format!("length must be 1..={}", MAX_SUBSCRIBER_ID_LEN),
            });
        }
        if id.starts_with('-') {
            return Err(SubwardenError::InvalidParameter {
                field: "subscriber_id",
                reason: "must not start with '-'".to_string(),
            });
        }
        if let Some(bad) = id
            .chars()
            .find(|c| !(c.is_ascii_alphanumeric() || *c == '-' || *c == '_'))
        {
            return Err(SubwardenError::InvalidParameter {
                field: "subscriber_id",
                reason: format!("character {:?} not allowed", bad),
            });
        }
        Ok(Self(id))
    }

    /// Borrow as a string slice.
    pub fn as_str(&self) -> &str {
        &self.0
    }
}

impl TryFrom<String> for SubscriberId {
    type Error = SubwardenError;

    fn try_from(value: String) -> Result<Self, Self::Error> {
        Self::new(value)
    }
}

impl From<SubscriberId> for String {
    fn from(id: SubscriberId) -> Self {
        id.0
    }
}

impl fmt::Display for SubscriberId {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(&self.0)
    }
}

/// Parse a network address strictly (dotted-decimal IPv4 or IPv6 literal).
pub fn parse_address(raw: &str) -> Result<IpAddr, SubwardenError> {
    raw.parse::<IpAddr>()
        .map_err(|e| SubwardenError::InvalidParameter {
            field: "address",
            reason: format!("{:?} is not an IP address ({})", raw, e),
        })
}

/// Identity of a firewall block rule: one logical rule per key.
#[derive(Debug, Clone, PartialEq, Eq, Hash, Serialize, Deserialize)]
pub struct RuleKey {
    /// Address the rule is scoped to.
    pub address: IpAddr,
    /// Subscriber the rule belongs to.
    pub subscriber_id: SubscriberId,
}

impl RuleKey {
    /// Build a key from already-validated parts.
    pub fn new(address: IpAddr, subscriber_id: SubscriberId) -> Self {
        Self {
            address,
            subscriber_id,
        }
    }

    /// Build a key from raw strings, validating both.
    pub fn parse(address: &str, subscriber_id: &str) -> Result<Self, SubwardenError> {
        Ok(Self::new(
            parse_address(address)?,
            SubscriberId::new(subscriber_id)?,
        ))
    }
}

impl fmt::Display for RuleKey {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "{}@{}", self.subscriber_id, self.address)
    }
}

/// Locally recorded status tag.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum SubscriberStatus {
    /// Access allowed.
    Active,
    /// Access blocked.
    Inactive,
    /// Awaiting a payment confirmation.
    Pending,
}

/// Subscriber snapshot as read from the persistence layer.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct Subscriber {
    /// Unique identifier.
    pub id: SubscriberId,
    /// Network address the subscriber currently owns.
    pub address: IpAddr,
    /// Entitlement window start (inclusive).
    pub subscription_start: DateTime<Utc>,
    /// Entitlement window end (exclusive).
    pub subscription_end: DateTime<Utc>,
    /// Current status tag.
    pub status: SubscriberStatus,
}

impl Subscriber {
    /// Rule key for this subscriber's current address.
    pub fn rule_key(&self) -> RuleKey {
        RuleKey::new(self.address, self.id.clone())
    }

    /// Desired access state: blocked outside `[start, end)`.
    pub fn is_blocked_at(&self, now: DateTime<Utc>) -> bool {
        now < self.subscription_start || now >= self.subscription_end
    }

    /// Window after paying for `months` more at `now`.
    ///
    /// Extends from the current end while entitled, otherwise restarts at `now`.
    /// Returns `None` if the date arithmetic overflows.
    pub fn extended_window(
        &self,
        months: u32,
        now: DateTime<Utc>,
    ) -> Option<(DateTime<Utc>, DateTime<Utc>)> {
        let expired = self.subscription_end <= now;
        let start = if expired {
            now
        } else {
            self.subscription_start
        };
        let base = self.subscription_end.max(now);
        let end = base.checked_add_months(Months::new(months))?;
        Some((start, end))
    }
}
