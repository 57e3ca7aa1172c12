//! In-process firewall used as an executor double.
//!
//! Keeps a rule table and answers check/add/remove the way iptables does
//! (exit 0 or 1). Transport failures and per-op failures can be injected,
//! and every command that reached the "device" is journaled.

use crate::model::RuleKey;
use crate::remote::command::{FirewallCommand, RuleOp};
use crate::remote::executor::{CommandExecutor, CommandOutput};
use crate::SubwardenError;
use async_trait::async_trait;
use std::collections::{HashMap, HashSet};
use std::sync::Mutex;
use std::time::Duration;

/// Injected transport behavior.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum Transport {
    /// Commands reach the device.
    Up,
    /// Every call fails with `Connection`.
    Unreachable,
    /// Every call fails with `CommandTimeout`.
    TimingOut,
}

#[derive(Debug)]
struct State {
    rules: HashMap<RuleKey, usize>,
    journal: Vec<(RuleOp, RuleKey)>,
    transport: Transport,
    failing_ops: HashSet<RuleOp>,
}

/// In-memory firewall executor.
#[derive(Debug)]
pub struct MemoryFirewall {
    state: Mutex<State>,
    latency: Duration,
}

impl Default for MemoryFirewall {
    fn default() -> Self {
        Self::new()
    }
}

impl MemoryFirewall {
    /// Empty rule table, transport up, no latency.
    pub fn new() -> Self {
        Self {
            state: Mutex::new(State {
                rules: HashMap::new(),
                journal: Vec::new(),
                transport: Transport::Up,
                failing_ops: HashSet::new(),
            }),
            latency: Duration::ZERO,
        }
    }

    /// Suspend every command for `latency` before it takes effect.
    pub fn with_latency(mut self, latency: Duration) -> Self {
        self.latency = latency;
        self
    }

    fn lock(&self) -> std::sync::MutexGuard<'_, State> {
        self.state.lock().unwrap_or_else(|e| e.into_inner())
    }

    /// Seed a rule directly on the device.
    pub fn insert_rule(&self, key: RuleKey) {
        *self.lock().rules.entry(key).or_insert(0) += 1;
    }

    /// Number of rule instances for `key`.
    pub fn rule_count(&self, key: &RuleKey) -> usize {
        self.lock().rules.get(key).copied().unwrap_or(0)
    }

    /// Whether any rule exists for `key`.
    pub fn has_rule(&self, key: &RuleKey) -> bool {
        self.rule_count(key) > 0
    }

    /// Set transport behavior.
    pub fn set_transport(&self, transport: Transport) {
        self.lock().transport = transport;
    }

    /// Make `op` report a non-zero exit without changing state.
    pub fn fail_op(&self, op: RuleOp) {
        self.lock().failing_ops.insert(op);
    }

    /// Commands that reached the device, in order.
    pub fn journal(&self) -> Vec<(RuleOp, RuleKey)> {
        self.lock().journal.clone()
    }

    /// Count of journaled commands with the given op.
    pub fn count(&self, op: RuleOp) -> usize {
        self.lock().journal.iter().filter(|(o, _)| *o == op).count()
    }

    /// Count of mutating commands (add or remove).
    pub fn mutations(&self) -> usize {
        self.count(RuleOp::Add) + self.count(RuleOp::Remove)
    }
}

#[async_trait]
impl CommandExecutor for MemoryFirewall {
    async fn run(&self, command: &FirewallCommand) -> Result<CommandOutput, SubwardenError> {
        let transport = self.lock().transport;
        match transport {
            Transport::Up => {}
            Transport::Unreachable => {
                return Err(SubwardenError::Connection("connection refused".to_string()))
            }
            Transport::TimingOut => return Err(SubwardenError::CommandTimeout { timeout_ms: 0 }),
        }

        if self.latency.is_zero() {
            tokio::task::yield_now().await;
        } else {
            tokio::time::sleep(self.latency).await;
        }

        let mut state = self.lock();
        let key = command.key().clone();
        state.journal.push((command.op(), key.clone()));
        if state.failing_ops.contains(&command.op()) {
            return Ok(CommandOutput::with_status(1));
        }

        let status = match command.op() {
            RuleOp::Check => i32::from(!state.rules.contains_key(&key)),
            RuleOp::Add => {
                *state.rules.entry(key).or_insert(0) += 1;
                0
            }
            RuleOp::Remove => match state.rules.get_mut(&key) {
                Some(n) if *n > 1 => {
                    *n -= 1;
                    0
                }
                Some(_) => {
                    state.rules.remove(&key);
                    0
                }
                None => 1,
            },
        };
        Ok(CommandOutput::with_status(status))
    }
}
