//! # Router Error Types
//!
//! Every failure the router can surface to a caller. Errors are `Clone` so the
//! same value can be stored on an [`Exchange`](crate::Exchange) and returned
//! from the call that produced it.

use std::time::Duration;
use thiserror::Error;

/// Router operation errors
#[derive(Error, Debug, Clone, PartialEq, Eq)]
pub enum NmrError {
    /// `lookup` (or a reference) resolved to zero endpoints
    #[error("No endpoint matches {0}")]
    NoMatchingEndpoint(String),

    /// No registered flow accepted the exchange for the chosen endpoint
    #[error("No flow available to dispatch exchange {exchange_id} to endpoint {endpoint}")]
    NoFlowAvailable { exchange_id: String, endpoint: String },

    /// A consumer tried to dispatch an exchange without a target reference
    #[error("Exchange {0} has no target reference")]
    MissingTarget(String),

    /// `send_sync_timeout` did not see the return leg in time
    #[error("Timed out after {timeout:?} waiting for exchange {exchange_id}")]
    Timeout { exchange_id: String, timeout: Duration },

    /// The waiting channel was closed while `send_sync` was blocked
    #[error("Interrupted while waiting for exchange {0}")]
    Interrupted(String),

    /// A register/unregister hook failed
    #[error("Registration of {service} failed: {reason}")]
    Registration { service: String, reason: String },

    /// Filter expression could not be parsed
    #[error("Invalid filter expression: {0}")]
    InvalidFilter(String),

    /// The exchange pattern forbids the requested message slot
    #[error("Message '{message}' is not allowed for pattern {pattern}")]
    IllegalMessage { pattern: String, message: String },

    /// Programming error, e.g. inbound work on a client channel
    #[error("Illegal state: {0}")]
    IllegalState(String),

    /// Channel was closed before the call
    #[error("Channel {0} is closed")]
    ChannelClosed(String),

    /// Worker pool queue is full, the exchange was rejected
    #[error("Channel {channel} rejected work: queue full (capacity {capacity})")]
    QueueFull { channel: String, capacity: usize },

    /// Work was submitted outside of a tokio runtime
    #[error("No tokio runtime available to run {0}")]
    NoRuntime(String),

    /// Router has been shut down (or was never initialised)
    #[error("Router is shut down")]
    Shutdown,

    /// Configuration loading or validation failed
    #[error("Configuration error: {0}")]
    Config(String),
}

impl NmrError {
    /// Errors a caller may reasonably retry after backing off
    pub fn is_recoverable(&self) -> bool {
        matches!(
            self,
            NmrError::Timeout { .. } | NmrError::Interrupted(_) | NmrError::QueueFull { .. }
        )
    }

    /// Errors raised while resolving where an exchange should go
    pub fn is_routing_error(&self) -> bool {
        matches!(
            self,
            NmrError::NoMatchingEndpoint(_)
                | NmrError::NoFlowAvailable { .. }
                | NmrError::MissingTarget(_)
        )
    }

    /// Wrap a hook failure with the service it concerns
    pub fn registration(service: impl Into<String>, reason: impl std::fmt::Display) -> Self {
        NmrError::Registration {
            service: service.into(),
            reason: reason.to_string(),
        }
    }

    /// Create an illegal state error
    pub fn illegal_state(msg: impl Into<String>) -> Self {
        NmrError::IllegalState(msg.into())
    }
}

/// Result type alias for router operations
pub type NmrResult<T> = std::result::Result<T, NmrError>;

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_error_classification() {
        let timeout = NmrError::Timeout {
            exchange_id: "ex-1".to_string(),
            timeout: Duration::from_millis(50),
        };
        assert!(timeout.is_recoverable());
        assert!(!timeout.is_routing_error());

        let no_flow = NmrError::NoFlowAvailable {
            exchange_id: "ex-1".to_string(),
            endpoint: "ep".to_string(),
        };
        assert!(no_flow.is_routing_error());
        assert!(!no_flow.is_recoverable());

        assert!(NmrError::NoMatchingEndpoint("{}".into()).is_routing_error());
        assert!(!NmrError::Shutdown.is_recoverable());
    }

    #[test]
    fn test_error_display() {
        let err = NmrError::registration("endpoint-1", "boom");
        assert_eq!(err.to_string(), "Registration of endpoint-1 failed: boom");

        let err = NmrError::QueueFull {
            channel: "a".to_string(),
            capacity: 8,
        };
        assert!(err.to_string().contains("capacity 8"));
    }
}
