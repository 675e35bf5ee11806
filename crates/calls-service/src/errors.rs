//! Calls service error types.
//!
//! Every error maps onto one of four classes that decide how far it may
//! propagate:
//!
//! - `FatalBootstrap`: abort activation, the node never becomes ready
//! - `FatalRuntime`: the media backend is gone, affected relay loops stop
//! - `Transient`: contained to one session or one event, logged and dropped
//! - `Conflict`: a coordination bug surfaced to the caller, never resolved silently

use common::types::{CallId, NodeId};
use thiserror::Error;

/// Calls service error type.
#[derive(Debug, Error)]
pub enum CallsError {
    /// The cluster coordination store could not be reached.
    #[error("Coordination store unavailable: {0}")]
    CoordinationUnavailable(String),

    /// A named cluster lock was not acquired within its bounded timeout.
    #[error("Timed out acquiring cluster lock '{name}'")]
    LockTimeout { name: String },

    /// Another node already owns the call.
    #[error("Call {call_id} is already owned by node {owner}")]
    OwnershipConflict { call_id: CallId, owner: NodeId },

    /// The host identity collaborator rejected or failed a request.
    #[error("Identity host error: {0}")]
    Identity(String),

    /// The media backend could not be constructed, started or reached.
    #[error("Media backend error: {0}")]
    Backend(String),

    /// The media backend terminated while the node was serving calls.
    #[error("Media backend terminated")]
    BackendTerminated,

    /// The recording job service could not be initialized.
    #[error("Job service error: {0}")]
    Jobs(String),

    /// Writing to a client transport failed.
    #[error("Transport error: {0}")]
    Transport(String),

    /// Configuration error.
    #[error("Configuration error: {0}")]
    Config(String),

    /// Startup was disabled by the environment flag.
    #[error("Disabled by environment flag")]
    Disabled,

    /// Internal error.
    #[error("Internal error: {0}")]
    Internal(String),
}

/// Propagation class of an error.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum ErrorClass {
    /// Abort startup entirely, no partial activation.
    FatalBootstrap,
    /// Backend died at runtime; surface and stop affected loops.
    FatalRuntime,
    /// Dropped or corrected locally without affecting other sessions.
    Transient,
    /// Logic error in coordination, surfaced to the caller.
    Conflict,
}

impl CallsError {
    /// Returns the propagation class for this error.
    #[must_use]
    pub fn class(&self) -> ErrorClass {
        match self {
            CallsError::CoordinationUnavailable(_)
            | CallsError::LockTimeout { .. }
            | CallsError::Identity(_)
            | CallsError::Backend(_)
            | CallsError::Config(_)
            | CallsError::Disabled => ErrorClass::FatalBootstrap,
            CallsError::BackendTerminated => ErrorClass::FatalRuntime,
            CallsError::Transport(_) | CallsError::Jobs(_) | CallsError::Internal(_) => {
                ErrorClass::Transient
            }
            CallsError::OwnershipConflict { .. } => ErrorClass::Conflict,
        }
    }

    /// Whether a steady-state caller may retry the failed operation.
    ///
    /// Coordination outages are fatal during bootstrap but retryable once the
    /// node is serving.
    #[must_use]
    pub fn is_retryable(&self) -> bool {
        matches!(
            self,
            CallsError::CoordinationUnavailable(_)
                | CallsError::LockTimeout { .. }
                | CallsError::Transport(_)
        )
    }
}

impl From<redis::RedisError> for CallsError {
    fn from(err: redis::RedisError) -> Self {
        CallsError::CoordinationUnavailable(err.to_string())
    }
}

#[cfg(test)]
#[allow(clippy::unwrap_used, clippy::expect_used)]
mod tests {
    use super::*;

    #[test]
    fn test_bootstrap_failures_are_fatal() {
        assert_eq!(
            CallsError::CoordinationUnavailable("refused".to_string()).class(),
            ErrorClass::FatalBootstrap
        );
        assert_eq!(
            CallsError::LockTimeout {
                name: "ensure_bot".to_string()
            }
            .class(),
            ErrorClass::FatalBootstrap
        );
        assert_eq!(
            CallsError::Identity("500".to_string()).class(),
            ErrorClass::FatalBootstrap
        );
        assert_eq!(
            CallsError::Backend("bind failed".to_string()).class(),
            ErrorClass::FatalBootstrap
        );
        assert_eq!(CallsError::Disabled.class(), ErrorClass::FatalBootstrap);
    }

    #[test]
    fn test_runtime_and_transient_classes() {
        assert_eq!(
            CallsError::BackendTerminated.class(),
            ErrorClass::FatalRuntime
        );
        assert_eq!(
            CallsError::Transport("broken pipe".to_string()).class(),
            ErrorClass::Transient
        );
        assert_eq!(
            CallsError::Jobs("503".to_string()).class(),
            ErrorClass::Transient
        );
    }

    #[test]
    fn test_conflict_is_its_own_class() {
        let err = CallsError::OwnershipConflict {
            call_id: CallId::from("call-1"),
            owner: NodeId::from("node-a"),
        };
        assert_eq!(err.class(), ErrorClass::Conflict);
        assert!(!err.is_retryable());
    }

    #[test]
    fn test_coordination_outage_is_retryable_in_steady_state() {
        assert!(CallsError::CoordinationUnavailable("down".to_string()).is_retryable());
        assert!(!CallsError::BackendTerminated.is_retryable());
    }

    #[test]
    fn test_display_formatting() {
        assert_eq!(
            format!(
                "{}",
                CallsError::LockTimeout {
                    name: "cleanup_state".to_string()
                }
            ),
            "Timed out acquiring cluster lock 'cleanup_state'"
        );
        assert_eq!(
            format!(
                "{}",
                CallsError::OwnershipConflict {
                    call_id: CallId::from("call-1"),
                    owner: NodeId::from("node-b"),
                }
            ),
            "Call call-1 is already owned by node node-b"
        );
    }
}
