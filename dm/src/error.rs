//! Merge error types

use std::error::Error as StdError;
use std::sync::Arc;

use thiserror::Error;

/// Shared, cloneable cause carried by upstream failures
pub type Cause = Arc<dyn StdError + Send + Sync + 'static>;

/// Errors that can occur while coordinating a dynamic merge
#[derive(Debug, Clone, Error)]
pub enum MergeError {
    #[error("Unsupported operation: {operation}")]
    UnsupportedOperation { operation: &'static str },

    #[error("Outer control handle already set")]
    HandleAlreadySet,

    #[error("Engine is already bound to a coordinator")]
    EngineAlreadyBound,

    #[error("In-flight inner stream count decremented below zero")]
    InFlightUnderflow,

    #[error("Invalid demand: {requested} (must be positive)")]
    InvalidDemand { requested: u64 },

    #[error("Merged stream already has a subscriber")]
    AlreadySubscribed,

    #[error("Upstream failure: {0}")]
    Upstream(#[source] Cause),
}

impl MergeError {
    /// Wrap an upstream failure without transforming it
    pub fn upstream<E>(err: E) -> Self
    where
        E: StdError + Send + Sync + 'static,
    {
        MergeError::Upstream(Arc::new(err))
    }

    /// Wiring and internal-consistency violations; these signal a bug, never a data condition
    pub fn is_fatal(&self) -> bool {
        match self {
            MergeError::UnsupportedOperation { .. } => true,
            MergeError::EngineAlreadyBound => true,
            MergeError::InFlightUnderflow => true,
            MergeError::HandleAlreadySet => false,
            MergeError::InvalidDemand { .. } => false,
            MergeError::AlreadySubscribed => false,
            MergeError::Upstream(_) => false,
        }
    }

    /// Get the upstream cause if this error came from a producer
    pub fn cause(&self) -> Option<&Cause> {
        match self {
            MergeError::Upstream(cause) => Some(cause),
            _ => None,
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[derive(Debug, Error)]
    #[error("disk on fire")]
    struct DiskError;

    #[test]
    fn test_is_fatal() {
        assert!(
            MergeError::UnsupportedOperation {
                operation: "create_subscription"
            }
            .is_fatal()
        );
        assert!(MergeError::InFlightUnderflow.is_fatal());
        assert!(MergeError::EngineAlreadyBound.is_fatal());

        assert!(!MergeError::HandleAlreadySet.is_fatal());
        assert!(!MergeError::InvalidDemand { requested: 0 }.is_fatal());
        assert!(!MergeError::upstream(DiskError).is_fatal());
    }

    #[test]
    fn test_upstream_preserves_cause() {
        let err = MergeError::upstream(DiskError);
        let cause = err.cause().expect("upstream error should carry a cause");
        assert_eq!(cause.to_string(), "disk on fire");
        assert!(err.to_string().contains("disk on fire"));

        // Clones share the same cause allocation
        let cloned = err.clone();
        assert!(Arc::ptr_eq(cause, cloned.cause().unwrap()));
    }

    #[test]
    fn test_unsupported_operation_message() {
        let err = MergeError::UnsupportedOperation {
            operation: "create_subscription",
        };
        assert!(err.to_string().contains("create_subscription"));
        assert!(err.cause().is_none());
    }
}
