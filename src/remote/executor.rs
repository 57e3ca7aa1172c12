//! Remote command executor contract and the global session limiter.

use crate::remote::command::FirewallCommand;
use crate::SubwardenError;
use async_trait::async_trait;
use std::sync::Arc;
use tokio::sync::Semaphore;

/// Result of a command that reached the remote host.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct CommandOutput {
    /// Exit status of the remote command.
    pub status: i32,

    /// Captured standard output.
    pub stdout: String,

    /// Captured standard error.
    pub stderr: String,
}

impl CommandOutput {
    /// Output with the given status and nothing captured.
    pub fn with_status(status: i32) -> Self {
        Self {
            status,
            stdout: String::new(),
            stderr: String::new(),
        }
    }

    /// Exit status 0: predicate true / action succeeded.
    pub fn success(&self) -> bool {
        self.status == 0
    }
}

/// Runs one firewall command per call over a transient session.
///
/// Implementations return `Connection` or `CommandTimeout` for transport
/// failures and `Ok` with the exit status for everything that ran.
/// They never retry.
#[async_trait]
pub trait CommandExecutor: Send + Sync {
    /// Run a single command.
    async fn run(&self, command: &FirewallCommand) -> Result<CommandOutput, SubwardenError>;
}

#[async_trait]
impl<E: CommandExecutor + ?Sized> CommandExecutor for Arc<E> {
    async fn run(&self, command: &FirewallCommand) -> Result<CommandOutput, SubwardenError> {
        (**self).run(command).await
    }
}

/// Bounds outstanding remote sessions across every caller.
pub struct LimitedExecutor<E> {
    inner: E,
    sessions: Arc<Semaphore>,
}

impl<E: CommandExecutor> LimitedExecutor<E> {
    /// Wrap `inner`, allowing at most `max_sessions` concurrent calls.
    pub fn new(inner: E, max_sessions: usize) -> Self {
        Self {
            inner,
            sessions: Arc::new(Semaphore::new(max_sessions.max(1))),
        }
    }

    /// Sessions currently free.
    pub fn available_sessions(&self) -> usize {
        self.sessions.available_permits()
    }
}

#[async_trait]
impl<E: CommandExecutor> CommandExecutor for LimitedExecutor<E> {
    async fn run(&self, command: &FirewallCommand) -> Result<CommandOutput, SubwardenError> {
        let _permit = self
            .sessions
            .acquire()
            .await
            .map_err(|_| SubwardenError::Connection("session limiter closed".to_string()))?;
        self.inner.run(command).await
    }
}
