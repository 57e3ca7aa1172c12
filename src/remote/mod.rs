//! Remote command channel: templates, transport, and the rule probe.

pub mod command;
pub mod executor;
pub mod probe;
pub mod ssh;

#[cfg(any(test, feature = "test-seams"))]
pub mod memory;

pub use command::{CommandTemplate, FirewallCommand, RuleOp};
pub use executor::{CommandExecutor, CommandOutput, LimitedExecutor};
pub use probe::{RuleProbe, RuleState};
pub use ssh::SshExecutor;
