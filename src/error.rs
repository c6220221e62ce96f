//! Error types for the Incus cluster operator
//!
//! Provides structured error types for all operator components and the
//! terminal/retriable classification consumed by the reconcilers.

use std::time::Duration;
use thiserror::Error;

/// Unified error type for the operator
#[derive(Error, Debug)]
pub enum Error {
    // =========================================================================
    // Internal Errors
    // =========================================================================
    #[error("Internal error: {0}")]
    Internal(String),

    #[error("Configuration error: {0}")]
    Configuration(String),

    // =========================================================================
    // Kubernetes Errors
    // =========================================================================
    #[error("Kubernetes API error: {0}")]
    Kube(#[from] kube::Error),

    #[error("Secret {name} is missing key {key}")]
    SecretKeyMissing { name: String, key: String },

    // =========================================================================
    // Incus API Errors
    // =========================================================================
    #[error("Incus connection error: {0}")]
    IncusConnection(#[from] reqwest::Error),

    #[error("Incus API error: {operation}: {message}")]
    IncusApi { operation: String, message: String },

    #[error("Not found: {operation}: {message}")]
    NotFound { operation: String, message: String },

    #[error("Already exists: {operation}: {message}")]
    AlreadyExists { operation: String, message: String },

    #[error("Operation {operation} failed: {message}")]
    OperationFailed { operation: String, message: String },

    #[error("Timed out waiting for {0}")]
    WaitTimeout(String),

    #[error("Command {command:?} failed with exit code {code}")]
    CommandFailed { command: Vec<String>, code: i64 },

    // =========================================================================
    // Terminal Errors
    //
    // These do not resolve through retrying; the reconcilers surface them as
    // Error-severity conditions and stop requeueing until the spec changes.
    // =========================================================================
    #[error("Server is missing required extensions: {0:?}")]
    MissingExtensions(Vec<String>),

    #[error("Permission denied: {operation}: {message}")]
    Forbidden { operation: String, message: String },

    #[error("Load balancer configuration conflict: {0}")]
    LoadBalancerConflict(String),

    #[error("Invalid load balancer configuration: {0}")]
    LoadBalancerInvalid(String),

    #[error("Cannot resolve machine image: {0}")]
    ImageNotFound(String),

    // =========================================================================
    // Parse Errors
    // =========================================================================
    #[error("JSON parse error: {0}")]
    JsonParse(#[from] serde_json::Error),

    #[error("Cloud-init status unavailable: {0}")]
    CloudInitStatus(String),
}

/// Action to take on error during reconciliation
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum ErrorAction {
    /// Requeue with exponential backoff
    RequeueWithBackoff,
    /// Requeue after specific duration
    RequeueAfter(Duration),
    /// Don't requeue, wait for changes
    NoRequeue,
}

impl Error {
    /// Whether this error is terminal: retrying cannot fix it, an operator
    /// must edit the resource spec.
    pub fn is_terminal(&self) -> bool {
        matches!(
            self,
            Error::MissingExtensions(_)
                | Error::Forbidden { .. }
                | Error::LoadBalancerConflict(_)
                | Error::LoadBalancerInvalid(_)
                | Error::ImageNotFound(_)
        )
    }

    /// Determine what action to take for this error
    pub fn action(&self) -> ErrorAction {
        match self {
            // Terminal errors - surfaced as conditions, never requeued
            _ if self.is_terminal() => ErrorAction::NoRequeue,

            // Timed-out waits - retry on a short fixed interval
            Error::WaitTimeout(_) => ErrorAction::RequeueAfter(Duration::from_secs(10)),

            // Everything else is transient - retry with backoff
            _ => ErrorAction::RequeueWithBackoff,
        }
    }

    /// Check if this error is retryable
    pub fn is_retryable(&self) -> bool {
        !matches!(self.action(), ErrorAction::NoRequeue)
    }

    /// Whether the hypervisor reported the target resource as absent
    pub fn is_not_found(&self) -> bool {
        matches!(self, Error::NotFound { .. })
    }

    /// Whether the hypervisor reported the target resource as present
    pub fn is_already_exists(&self) -> bool {
        matches!(self, Error::AlreadyExists { .. })
    }
}

/// Result type alias for the operator
pub type Result<T> = std::result::Result<T, Error>;

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_terminal_errors() {
        let err = Error::MissingExtensions(vec!["instance_oci".into()]);
        assert!(err.is_terminal());
        assert!(!err.is_retryable());

        let err = Error::Forbidden {
            operation: "CreateProfile".into(),
            message: "Privileged containers are forbidden".into(),
        };
        assert!(err.is_terminal());

        let err = Error::LoadBalancerConflict("address 10.0.0.1 already claimed".into());
        assert!(err.is_terminal());

        let err = Error::ImageNotFound("kubeadm/v1.31.0".into());
        assert!(err.is_terminal());
    }

    #[test]
    fn test_retriable_errors() {
        let err = Error::IncusApi {
            operation: "GetInstanceState".into(),
            message: "connection reset".into(),
        };
        assert!(!err.is_terminal());
        assert_eq!(err.action(), ErrorAction::RequeueWithBackoff);

        let err = Error::NotFound {
            operation: "GetInstanceState".into(),
            message: "Instance not found".into(),
        };
        assert!(!err.is_terminal());
        assert!(err.is_not_found());
    }

    #[test]
    fn test_wait_timeout_requeues_on_interval() {
        let err = Error::WaitTimeout("instance address".into());
        assert_eq!(
            err.action(),
            ErrorAction::RequeueAfter(Duration::from_secs(10))
        );
        assert!(err.is_retryable());
    }
}
