//! Firewall command templates.
//!
//! A command is an argument vector built from one of three fixed templates
//! and a validated [`RuleKey`]. Arguments are quoted individually when the
//! vector is rendered for a remote shell, so parameters stay data.

use crate::model::RuleKey;
use crate::SubwardenError;
use shell_escape::escape;
use std::borrow::Cow;
use std::fmt;
use std::net::IpAddr;

/// Maximum chain name length accepted by iptables.
pub const MAX_CHAIN_LEN: usize = 28;

/// Comment prefix tagging rules owned by this crate.
pub const RULE_COMMENT_PREFIX: &str = "subwarden-";

/// Validate a firewall chain name: `[A-Za-z0-9_-]{1,28}`, no leading '-'.
pub fn validate_chain(chain: &str) -> Result<(), SubwardenError> {
    let valid = !chain.is_empty()
        && chain.len() <= MAX_CHAIN_LEN
        && !chain.starts_with('-')
        && chain
            .chars()
            .all(|c| c.is_ascii_alphanumeric() || c == '-' || c == '_');
    if valid {
        Ok(())
    } else {
        Err(SubwardenError::ConfigError(format!(
            "invalid firewall chain name: {:?}",
            chain
        )))
    }
}

/// The three template operations.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub enum RuleOp {
    /// Does the block rule exist?
    Check,
    /// Insert the block rule.
    Add,
    /// Delete the block rule.
    Remove,
}

impl RuleOp {
    fn flag(self) -> &'static str {
        match self {
            RuleOp::Check => "-C",
            RuleOp::Add => "-I",
            RuleOp::Remove => "-D",
        }
    }
}

impl fmt::Display for RuleOp {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(match self {
            RuleOp::Check => "check",
            RuleOp::Add => "add",
            RuleOp::Remove => "remove",
        })
    }
}

/// Shared template settings.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct CommandTemplate {
    chain: String,
    use_sudo: bool,
}

impl CommandTemplate {
    /// Build a template, validating the chain name.
    pub fn new(chain: &str, use_sudo: bool) -> Result<Self, SubwardenError> {
        validate_chain(chain)?;
        Ok(Self {
            chain: chain.to_string(),
            use_sudo,
        })
    }

    /// Instantiate the template for one rule.
    pub fn command(&self, op: RuleOp, key: &RuleKey) -> FirewallCommand {
        FirewallCommand {
            op,
            key: key.clone(),
            chain: self.chain.clone(),
            use_sudo: self.use_sudo,
        }
    }
}

impl Default for CommandTemplate {
    fn default() -> Self {
        Self {
            chain: "FORWARD".to_string(),
            use_sudo: false,
        }
    }
}

/// One concrete firewall command.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct FirewallCommand {
    op: RuleOp,
    key: RuleKey,
    chain: String,
    use_sudo: bool,
}

impl FirewallCommand {
    /// Operation performed.
    pub fn op(&self) -> RuleOp {
        self.op
    }

    /// Rule the command targets.
    pub fn key(&self) -> &RuleKey {
        &self.key
    }

    /// Argument vector, program first.
    pub fn argv(&self) -> Vec<String> {
        let program = match self.key.address {
            IpAddr::V4(_) => "iptables",
            IpAddr::V6(_) => "ip6tables",
        };
        let mut argv = Vec::with_capacity(14);
        if self.use_sudo {
            argv.push("sudo".to_string());
            argv.push("-n".to_string());
        }
        argv.extend([
            program.to_string(),
            self.op.flag().to_string(),
            self.chain.clone(),
            "-s".to_string(),
            self.key.address.to_string(),
            "-m".to_string(),
            "comment".to_string(),
            "--comment".to_string(),
            format!("{}{}", RULE_COMMENT_PREFIX, self.key.subscriber_id),
            "-j".to_string(),
            "DROP".to_string(),
        ]);
        argv
    }

    /// Single line for a remote shell, every argument quoted.
    pub fn to_shell_line(&self) -> String {
        self.argv()
            .iter()
            .map(|arg| escape(Cow::Borrowed(arg.as_str())).into_owned())
            .collect::<Vec<_>>()
            .join(" ")
    }
}

impl fmt::Display for FirewallCommand {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "{} {}", self.op, self.key)
    }
}
