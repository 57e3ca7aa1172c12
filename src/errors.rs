//! Subwarden error types.

use thiserror::Error;

/// Errors raised by the enforcement core and its triggers.
#[derive(Debug, Error)]
pub enum SubwardenError {
    /// Configuration is invalid.
    #[error("Configuration error: {0}")]
    ConfigError(String),

    /// A command parameter failed allow-list validation.
    #[error("Invalid {field}: {reason}")]
    InvalidParameter {
        /// Which parameter was rejected.
        field: &'static str,
        /// Why it was rejected.
        reason: String,
    },

    /// Remote host unreachable, refused, or authentication failed.
    #[error("Remote connection error: {0}")]
    Connection(String),

    /// Remote command did not complete within its bound.
    #[error("Remote command timed out after {timeout_ms}ms")]
    CommandTimeout {
        /// The bound that was exceeded, in milliseconds.
        timeout_ms: u64,
    },

    /// A corrective command ran but the remote state could not be changed.
    #[error("Enforcement failed for {subscriber_id} ({action}): {detail}")]
    EnforcementFailure {
        /// Subscriber whose rule was being changed.
        subscriber_id: String,
        /// The attempted action ("block" or "unblock").
        action: &'static str,
        /// Exit status or transport error description.
        detail: String,
    },

    /// Confirmation with no matching, or an expired, payment request.
    #[error("No outstanding payment request for {request_id}")]
    CorrelationMiss {
        /// Provider request identifier from the confirmation.
        request_id: String,
    },

    /// A payment request with this identifier is already outstanding.
    #[error("Payment request {request_id} is already outstanding")]
    CorrelationConflict {
        /// Provider request identifier.
        request_id: String,
    },

    /// Provider transaction identifier was already consumed.
    #[error("Confirmation {transaction_id} was already applied")]
    DuplicateConfirmation {
        /// Provider transaction identifier.
        transaction_id: String,
    },

    /// Subscriber persistence collaborator failed.
    #[error("Subscriber store error: {0}")]
    Store(String),

    /// Local state file I/O error.
    #[error("State I/O error: {0}")]
    StateIO(String),
}

impl SubwardenError {
    /// Whether this is a transport-level failure (connection or timeout).
    pub fn is_transport(&self) -> bool {
        matches!(
            self,
            SubwardenError::Connection(_) | SubwardenError::CommandTimeout { .. }
        )
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn transport_errors_are_classified() {
        assert!(SubwardenError::Connection("refused".into()).is_transport());
        assert!(SubwardenError::CommandTimeout { timeout_ms: 10 }.is_transport());
        assert!(!SubwardenError::Store("down".into()).is_transport());
    }

    #[test]
    fn enforcement_failure_names_subscriber_and_action() {
        let err = SubwardenError::EnforcementFailure {
            subscriber_id: "sub-42".into(),
            action: "block",
            detail: "exit status 1".into(),
        };
        let msg = err.to_string();
        assert!(msg.contains("sub-42"));
        assert!(msg.contains("block"));
    }
}
