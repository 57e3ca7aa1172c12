//! Subscriber, rule key and plan types.

pub mod plan;
pub mod subscriber;

pub use plan::Plan;
pub use subscriber::{parse_address, RuleKey, Subscriber, SubscriberId, SubscriberStatus};
