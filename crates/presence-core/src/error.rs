//! Error types for the presence RPC core.
//!
//! Failures are local to the component that detects them, except application
//! faults raised inside a worker, which travel back to the client as data
//! (`RemoteFault`) and are only surfaced as an error at the client boundary.

use serde::{Deserialize, Serialize};
use thiserror::Error;

/// Main error type for the RPC core.
#[derive(Debug, Error)]
pub enum RpcError {
    // Transport errors
    #[error("IO error: {message}")]
    Io {
        message: String,
        #[source]
        source: Option<std::io::Error>,
    },

    #[error("Connection to {peer} closed")]
    Disconnected { peer: String },

    // Serialization errors
    #[error("JSON error: {message}")]
    Json {
        message: String,
        #[source]
        source: Option<serde_json::Error>,
    },

    // Protocol errors
    #[error("Protocol violation: {message}")]
    Protocol { message: String },

    #[error("Validation error for {field}: {message}")]
    Validation { field: String, message: String },

    // Call errors
    #[error("No reply from service {service} after {attempts} attempts")]
    Timeout { service: String, attempts: u32 },

    #[error("Remote {service} instance has no method '{method}'")]
    UnknownMethod { service: String, method: String },

    #[error("Remote fault: {0}")]
    Remote(#[from] RemoteFault),

    // Configuration errors
    #[error("Configuration error: {message}")]
    Config { message: String },

    // Generic errors
    #[error("{0}")]
    Other(String),
}

/// Result type alias for RPC operations.
pub type Result<T> = std::result::Result<T, RpcError>;

/// A fault raised while executing a call on a worker.
///
/// Faults are values: the worker encodes them into the reply payload and the
/// client re-raises them as [`RpcError::Remote`]. `kind` plays the role of the
/// exception type, `message` its text.
#[derive(Debug, Clone, PartialEq, Eq, Error, Serialize, Deserialize)]
#[error("{kind}: {message}")]
pub struct RemoteFault {
    pub kind: String,
    pub message: String,
}

impl RemoteFault {
    pub fn new(kind: impl Into<String>, message: impl Into<String>) -> Self {
        Self {
            kind: kind.into(),
            message: message.into(),
        }
    }

    /// The call named a service other than the one the worker serves.
    pub fn service_mismatch(expected: &str, actual: &str) -> Self {
        Self::new(
            "ServiceMismatch",
            format!(
                "Attempt to call remote function on instance of '{}' as '{}'",
                expected, actual
            ),
        )
    }

    /// The call named a method the bound instance does not expose.
    pub fn unknown_method(service: &str, method: &str) -> Self {
        Self::new(
            "UnknownMethod",
            format!("Remote {} instance has no method '{}'", service, method),
        )
    }
}

// Conversion implementations for common error types

impl From<std::io::Error> for RpcError {
    fn from(err: std::io::Error) -> Self {
        RpcError::Io {
            message: err.to_string(),
            source: Some(err),
        }
    }
}

impl From<serde_json::Error> for RpcError {
    fn from(err: serde_json::Error) -> Self {
        RpcError::Json {
            message: err.to_string(),
            source: Some(err),
        }
    }
}

impl RpcError {
    /// Build a protocol violation error.
    pub fn protocol(message: impl Into<String>) -> Self {
        RpcError::Protocol {
            message: message.into(),
        }
    }

    /// Check if a fresh connection could make the failed operation succeed.
    pub fn is_retryable(&self) -> bool {
        matches!(
            self,
            RpcError::Io { .. } | RpcError::Disconnected { .. } | RpcError::Timeout { .. }
        )
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_error_display() {
        let err = RpcError::Timeout {
            service: "Registry".into(),
            attempts: 3,
        };
        assert_eq!(
            err.to_string(),
            "No reply from service Registry after 3 attempts"
        );
    }

    #[test]
    fn test_remote_fault_display_keeps_kind_and_message() {
        let fault = RemoteFault::new("NameError", "blah");
        assert_eq!(fault.to_string(), "NameError: blah");

        let err: RpcError = fault.clone().into();
        match err {
            RpcError::Remote(inner) => assert_eq!(inner, fault),
            other => panic!("Expected Remote, got: {:?}", other),
        }
    }

    #[test]
    fn test_retryable_errors() {
        assert!(RpcError::Disconnected {
            peer: "127.0.0.1:5000".into()
        }
        .is_retryable());
        assert!(!RpcError::protocol("bad frame").is_retryable());
        assert!(!RpcError::Remote(RemoteFault::new("ValueError", "x")).is_retryable());
        assert!(!RpcError::Validation {
            field: "frame_size".into(),
            message: "too big".into()
        }
        .is_retryable());
    }
}
