//! Subwarden configuration.
//!
//! Loaded from JSON (all fields optional, falling back to defaults) and
//! checked with [`SubwardenConfig::validate`] before any component is built.

use crate::SubwardenError;
use serde::Deserialize;
use std::path::{Path, PathBuf};
use std::time::Duration;

/// Top-level configuration.
#[derive(Debug, Clone, Default, Deserialize)]
#[serde(default)]
pub struct SubwardenConfig {
    /// Remote command channel to the enforcing device.
    pub remote: RemoteConfig,

    /// Periodic sweep settings.
    pub sweep: SweepConfig,

    /// Payment correlation settings.
    pub payments: PaymentConfig,
}

/// Longest accepted payment request lifetime (one day).
pub const MAX_CORRELATION_TTL_SECS: u64 = 24 * 60 * 60;

/// Longest accepted confirmation retention (one year).
pub const MAX_CONFIRMATION_RETENTION_SECS: u64 = 366 * 24 * 60 * 60;

/// Static settings for the remote command channel.
#[derive(Debug, Clone, Deserialize)]
#[serde(default)]
pub struct RemoteConfig {
    /// Device hostname or address.
    pub host: String,

    /// SSH port.
    pub port: u16,

    /// Login user on the device.
    pub user: String,

    /// Private key used for authentication.
    /// When unset the ssh client's own defaults apply.
    pub identity_file: Option<PathBuf>,

    /// Firewall chain holding subscriber block rules.
    pub chain: String,

    /// Prefix firewall commands with `sudo -n`.
    pub use_sudo: bool,

    /// Bound on a single remote command, including session setup.
    pub command_timeout_secs: u64,

    /// Bound on TCP connect + handshake passed to the ssh client.
    pub connect_timeout_secs: u64,

    /// Maximum simultaneous remote sessions across all callers.
    pub max_sessions: usize,
}

impl Default for RemoteConfig {
    fn default() -> Self {
        Self {
            host: String::new(),
            port: 22,
            user: "root".to_string(),
            identity_file: None,
            chain: "FORWARD".to_string(),
            use_sudo: false,
            command_timeout_secs: 15,
            connect_timeout_secs: 5,
            max_sessions: 4,
        }
    }
}

impl RemoteConfig {
    /// Per-command timeout.
    pub fn command_timeout(&self) -> Duration {
        Duration::from_secs(self.command_timeout_secs)
    }
}

/// Periodic sweep settings.
#[derive(Debug, Clone, Deserialize)]
#[serde(default)]
pub struct SweepConfig {
    /// Seconds between sweep starts.
    pub interval_secs: u64,

    /// Subscribers reconciled concurrently within one sweep.
    pub workers: usize,
}

impl Default for SweepConfig {
    fn default() -> Self {
        Self {
            interval_secs: 60,
            workers: 8,
        }
    }
}

impl SweepConfig {
    /// Interval between sweeps.
    pub fn interval(&self) -> Duration {
        Duration::from_secs(self.interval_secs)
    }
}

/// Payment correlation settings.
#[derive(Debug, Clone, Deserialize)]
#[serde(default)]
pub struct PaymentConfig {
    /// Lifetime of an outstanding payment request.
    pub correlation_ttl_secs: u64,

    /// How long consumed transaction ids are remembered.
    /// Must cover the provider's redelivery horizon.
    pub confirmation_retention_secs: u64,

    /// Namespace for the state directory under the platform data dir.
    pub state_namespace: String,

    /// Explicit state directory; overrides `state_namespace`.
    pub state_dir: Option<PathBuf>,
}

impl Default for PaymentConfig {
    fn default() -> Self {
        Self {
            correlation_ttl_secs: 15 * 60,
            confirmation_retention_secs: 7 * 24 * 60 * 60,
            state_namespace: "subwarden".to_string(),
            state_dir: None,
        }
    }
}

impl PaymentConfig {
    /// Correlation entry lifetime, capped at [`MAX_CORRELATION_TTL_SECS`].
    pub fn correlation_ttl(&self) -> chrono::Duration {
        let secs = self.correlation_ttl_secs.min(MAX_CORRELATION_TTL_SECS);
        chrono::Duration::seconds(secs as i64)
    }

    /// Consumed-confirmation retention window, capped at
    /// [`MAX_CONFIRMATION_RETENTION_SECS`].
    pub fn confirmation_retention(&self) -> chrono::Duration {
        let secs = self
            .confirmation_retention_secs
            .min(MAX_CONFIRMATION_RETENTION_SECS);
        chrono::Duration::seconds(secs as i64)
    }

    /// Resolve the directory holding correlation and ledger snapshots.
    pub fn resolve_state_dir(&self) -> Result<PathBuf, SubwardenError> {
        if let Some(dir) = &self.state_dir {
            return Ok(dir.clone());
        }
        let base_dir = dirs::data_dir().ok_or_else(|| {
            SubwardenError::StateIO("Could not find data directory".to_string())
        })?;
        Ok(base_dir.join(&self.state_namespace))
    }
}

impl SubwardenConfig {
    /// Load configuration from a JSON file.
    pub fn from_json_file(path: &Path) -> Result<Self, SubwardenError> {
        let json = std::fs::read_to_string(path).map_err(|e| {
            SubwardenError::ConfigError(format!("Failed to read {}: {}", path.display(), e))
        })?;
        let config: Self = serde_json::from_str(&json)
            .map_err(|e| SubwardenError::ConfigError(format!("Failed to parse config: {}", e)))?;
        config.validate()?;
        Ok(config)
    }

    /// Validate configuration for obvious errors.
    pub fn validate(&self) -> Result<(), SubwardenError> {
        let remote = &self.remote;
        if remote.host.is_empty() {
            return Err(SubwardenError::ConfigError(
                "remote.host cannot be empty".to_string(),
            ));
        }
        if remote.host.starts_with('-') || remote.host.chars().any(char::is_whitespace) {
            return Err(SubwardenError::ConfigError(format!(
                "remote.host is not a valid hostname: {}",
                remote.host
            )));
        }
        if remote.user.is_empty() || remote.user.starts_with('-') {
            return Err(SubwardenError::ConfigError(
                "remote.user must be a plain login name".to_string(),
            ));
        }
        crate::remote::command::validate_chain(&remote.chain)?;
        if remote.command_timeout_secs == 0 {
            return Err(SubwardenError::ConfigError(
                "remote.command_timeout_secs must be positive".to_string(),
            ));
        }
        if remote.max_sessions == 0 {
            return Err(SubwardenError::ConfigError(
                "remote.max_sessions must be positive".to_string(),
            ));
        }
        if self.sweep.workers == 0 || self.sweep.interval_secs == 0 {
            return Err(SubwardenError::ConfigError(
                "sweep.workers and sweep.interval_secs must be positive".to_string(),
            ));
        }
        if self.payments.correlation_ttl_secs == 0 {
            return Err(SubwardenError::ConfigError(
                "payments.correlation_ttl_secs must be positive".to_string(),
            ));
        }
        if self.payments.correlation_ttl_secs > MAX_CORRELATION_TTL_SECS {
            return Err(SubwardenError::ConfigError(format!(
                "payments.correlation_ttl_secs must be at most {}",
                MAX_CORRELATION_TTL_SECS
            )));
        }
        if self.payments.confirmation_retention_secs > MAX_CONFIRMATION_RETENTION_SECS {
            return Err(SubwardenError::ConfigError(format!(
                "payments.confirmation_retention_secs must be at most {}",
                MAX_CONFIRMATION_RETENTION_SECS
            )));
        }
        if self.payments.confirmation_retention_secs < self.payments.correlation_ttl_secs {
            return Err(SubwardenError::ConfigError(
                "payments.confirmation_retention_secs must cover the correlation TTL".to_string(),
            ));
        }
        if self.payments.state_dir.is_none() && self.payments.state_namespace.is_empty() {
            return Err(SubwardenError::ConfigError(
                "payments.state_namespace cannot be empty".to_string(),
            ));
        }
        Ok(())
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use tempfile::TempDir;

    fn valid_config() -> SubwardenConfig {
        let mut config = SubwardenConfig::default();
        config.remote.host = "router.lan".to_string();
        config
    }

    #[test]
    fn test_defaults_need_a_host() {
        let result = SubwardenConfig::default().validate();
        assert!(matches!(result, Err(SubwardenError::ConfigError(_))));
        assert!(valid_config().validate().is_ok());
    }

    #[test]
    fn test_rejects_option_like_host() {
        let mut config = valid_config();
        config.remote.host = "-oProxyCommand=sh".to_string();
        assert!(config.validate().is_err());
    }

    #[test]
    fn test_rejects_bad_chain() {
        let mut config = valid_config();
        config.remote.chain = "FORWARD; reboot".to_string();
        assert!(config.validate().is_err());
    }

    #[test]
    fn test_rejects_zero_sessions() {
        let mut config = valid_config();
        config.remote.max_sessions = 0;
        assert!(config.validate().is_err());
    }

    #[test]
    fn test_retention_must_cover_ttl() {
        let mut config = valid_config();
        config.payments.confirmation_retention_secs = 10;
        config.payments.correlation_ttl_secs = 60;
        assert!(config.validate().is_err());
    }

    #[test]
    fn test_from_json_file_partial() {
        let dir = TempDir::new().unwrap();
        let path = dir.path().join("subwarden.json");
        std::fs::write(
            &path,
            r#"{"remote": {"host": "10.0.0.1", "port": 2222}, "sweep": {"workers": 2}}"#,
        )
        .unwrap();

        let config = SubwardenConfig::from_json_file(&path).unwrap();
        assert_eq!(config.remote.host, "10.0.0.1");
        assert_eq!(config.remote.port, 2222);
        assert_eq!(config.remote.chain, "FORWARD");
        assert_eq!(config.sweep.workers, 2);
        assert_eq!(config.sweep.interval(), Duration::from_secs(60));
    }

    #[test]
    fn test_explicit_state_dir_wins() {
        let mut config = valid_config();
        config.payments.state_dir = Some(PathBuf::from("/var/lib/subwarden"));
        assert_eq!(
            config.payments.resolve_state_dir().unwrap(),
            PathBuf::from("/var/lib/subwarden")
        );
    }

    #[test]
    fn test_rejects_out_of_range_payment_durations() {
        let mut config = valid_config();
        config.payments.confirmation_retention_secs = 10_u64.pow(16);
        assert!(matches!(config.validate(), Err(SubwardenError::ConfigError(_))));
        assert_eq!(
            config.payments.confirmation_retention(),
            chrono::Duration::seconds(MAX_CONFIRMATION_RETENTION_SECS as i64)
        );

        let mut config = valid_config();
        config.payments.correlation_ttl_secs = u64::MAX;
        config.payments.confirmation_retention_secs = u64::MAX;
        assert!(config.validate().is_err());
        assert_eq!(
            config.payments.correlation_ttl(),
            chrono::Duration::seconds(MAX_CORRELATION_TTL_SECS as i64)
        );
    }
}
