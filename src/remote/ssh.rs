//! SSH transport for firewall commands.
//!
//! Each call spawns the system `ssh` client for exactly one command, waits
//! for it under a fixed timeout, and lets the process exit. No connection
//! multiplexing, no retries.

use crate::config::RemoteConfig;
use crate::remote::command::FirewallCommand;
use crate::remote::executor::{CommandExecutor, CommandOutput};
use crate::SubwardenError;
use async_trait::async_trait;
use std::path::PathBuf;
use std::process::Stdio;
use std::time::Duration;
use tokio::process::Command;
use tracing::{debug, warn};

/// Exit status the OpenSSH client uses for its own failures.
pub const SSH_CLIENT_FAILURE: i32 = 255;

/// Executor that runs commands over `ssh`.
#[derive(Debug, Clone)]
pub struct SshExecutor {
    program: PathBuf,
    host: String,
    port: u16,
    user: String,
    identity_file: Option<PathBuf>,
    connect_timeout_secs: u64,
    timeout: Duration,
}

impl SshExecutor {
    /// Create an executor from the remote channel config.
    pub fn new(config: &RemoteConfig) -> Result<Self, SubwardenError> {
        if config.host.is_empty() || config.host.starts_with('-') {
            return Err(SubwardenError::ConfigError(format!(
                "invalid remote host: {:?}",
                config.host
            )));
        }
        if config.user.is_empty() || config.user.starts_with('-') {
            return Err(SubwardenError::ConfigError(format!(
                "invalid remote user: {:?}",
                config.user
            )));
        }

        Ok(Self {
            program: PathBuf::from("ssh"),
            host: config.host.clone(),
            port: config.port,
            user: config.user.clone(),
            identity_file: config.identity_file.clone(),
            connect_timeout_secs: config.connect_timeout_secs.max(1),
            timeout: config.command_timeout(),
        })
    }

    /// Use a different ssh client binary.
    pub fn with_program(mut self, program: impl Into<PathBuf>) -> Self {
        self.program = program.into();
        self
    }

    /// Override the per-command timeout.
    pub fn with_timeout(mut self, timeout: Duration) -> Self {
        self.timeout = timeout;
        self
    }

    /// Per-command timeout.
    pub fn timeout(&self) -> Duration {
        self.timeout
    }

    /// Client arguments for one command, excluding the program.
    pub fn client_args(&self, command: &FirewallCommand) -> Vec<String> {
        let mut args = vec![
            "-T".to_string(),
            "-o".to_string(),
            "BatchMode=yes".to_string(),
            "-o".to_string(),
            format!("ConnectTimeout={}", self.connect_timeout_secs),
            "-p".to_string(),
            self.port.to_string(),
            "-l".to_string(),
            self.user.clone(),
        ];
        if let Some(identity) = &self.identity_file {
            args.push("-i".to_string());
            args.push(identity.display().to_string());
            args.push("-o".to_string());
            args.push("IdentitiesOnly=yes".to_string());
        }
        args.push("--".to_string());
        args.push(self.host.clone());
        args.push(command.to_shell_line());
        args
    }
}

#[async_trait]
impl CommandExecutor for SshExecutor {
    async fn run(&self, command: &FirewallCommand) -> Result<CommandOutput, SubwardenError> {
        let mut child = Command::new(&self.program);
        child
            .args(self.client_args(command))
            .stdin(Stdio::null())
            .stdout(Stdio::piped())
            .stderr(Stdio::piped())
            .kill_on_drop(true);

        debug!(host = %self.host, command = %command, "running remote command");

        // Dropping the output future on timeout kills the client.
        let output = match tokio::time::timeout(self.timeout, child.output()).await {
            Ok(Ok(output)) => output,
            Ok(Err(e)) => {
                return Err(SubwardenError::Connection(format!(
                    "failed to start {}: {}",
                    self.program.display(),
                    e
                )))
            }
            Err(_) => {
                warn!(host = %self.host, command = %command, "remote command timed out");
                return Err(SubwardenError::CommandTimeout {
                    timeout_ms: self.timeout.as_millis() as u64,
                });
            }
        };

        let stdout = String::from_utf8_lossy(&output.stdout).into_owned();
        let stderr = String::from_utf8_lossy(&output.stderr).into_owned();

        match output.status.code() {
            Some(SSH_CLIENT_FAILURE) => Err(SubwardenError::Connection(format!(
                "{}: {}",
                self.host,
                stderr.trim()
            ))),
            Some(status) => Ok(CommandOutput {
                status,
                stdout,
                stderr,
            }),
            None => Err(SubwardenError::Connection(format!(
                "ssh client for {} terminated by signal",
                self.host
            ))),
        }
    }
}
