//! Rule state probe: does a block rule exist for a key?

use crate::model::RuleKey;
use crate::remote::command::{CommandTemplate, RuleOp};
use crate::remote::executor::CommandExecutor;
use std::sync::Arc;
use tracing::{debug, warn};

/// Observed remote rule state.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum RuleState {
    /// Check command exited 0.
    Present,
    /// Check command ran and exited non-zero.
    Absent,
    /// Transport failed; the state is unknown.
    Indeterminate,
}

/// Probes the device with the check template.
#[derive(Clone)]
pub struct RuleProbe {
    executor: Arc<dyn CommandExecutor>,
    template: CommandTemplate,
}

impl RuleProbe {
    /// Create a probe over `executor`.
    pub fn new(executor: Arc<dyn CommandExecutor>, template: CommandTemplate) -> Self {
        Self { executor, template }
    }

    /// Probe the rule for `key`.
    pub async fn exists(&self, key: &RuleKey) -> RuleState {
        let command = self.template.command(RuleOp::Check, key);
        match self.executor.run(&command).await {
            Ok(output) if output.success() => RuleState::Present,
            Ok(output) => {
                debug!(rule = %key, status = output.status, "block rule absent");
                RuleState::Absent
            }
            Err(e) => {
                warn!(rule = %key, error = %e, "rule probe indeterminate");
                RuleState::Indeterminate
            }
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::remote::memory::{MemoryFirewall, Transport};

    fn key() -> RuleKey {
        RuleKey::parse("10.0.0.5", "sub-1").unwrap()
    }

    fn probe(firewall: &Arc<MemoryFirewall>) -> RuleProbe {
        RuleProbe::new(firewall.clone(), CommandTemplate::default())
    }

    #[tokio::test]
    async fn test_present_and_absent() {
        let firewall = Arc::new(MemoryFirewall::new());
        let probe = probe(&firewall);

        assert_eq!(probe.exists(&key()).await, RuleState::Absent);
        firewall.insert_rule(key());
        assert_eq!(probe.exists(&key()).await, RuleState::Present);
    }

    #[tokio::test]
    async fn test_connection_error_is_indeterminate() {
        let firewall = Arc::new(MemoryFirewall::new());
        firewall.insert_rule(key());
        firewall.set_transport(Transport::Unreachable);
        assert_eq!(probe(&firewall).exists(&key()).await, RuleState::Indeterminate);
    }

    #[tokio::test]
    async fn test_timeout_is_indeterminate() {
        let firewall = Arc::new(MemoryFirewall::new());
        firewall.set_transport(Transport::TimingOut);
        assert_eq!(probe(&firewall).exists(&key()).await, RuleState::Indeterminate);
    }

    #[tokio::test]
    async fn test_probe_never_mutates() {
        let firewall = Arc::new(MemoryFirewall::new());
        let probe = probe(&firewall);
        probe.exists(&key()).await;
        probe.exists(&key()).await;
        assert_eq!(firewall.mutations(), 0);
        assert_eq!(firewall.count(RuleOp::Check), 2);
    }
}
