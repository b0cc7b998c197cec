use pixora_pipeline::{EngagementKind, LifecycleKind};
use std::time::Duration;
use thiserror::Error;

/// Failure of a single blob or metadata operation
#[derive(Error, Debug)]
pub enum StorageError {
    #[error("{0} not found")]
    NotFound(String),

    #[error("{operation} failed: {message}")]
    Backend {
        operation: &'static str,
        message: String,
    },

    #[error("{operation} timed out after {after:?}")]
    Timeout {
        operation: &'static str,
        after: Duration,
    },
}

impl StorageError {
    pub fn backend(operation: &'static str, error: impl std::fmt::Display) -> Self {
        StorageError::Backend {
            operation,
            message: error.to_string(),
        }
    }

    pub fn is_not_found(&self) -> bool {
        matches!(self, StorageError::NotFound(_))
    }
}

/// A contended update on a target's aggregate row
#[derive(Error, Debug, Clone, PartialEq, Eq)]
#[error("conflicting update on {target_id}: {reason}")]
pub struct ConflictError {
    pub target_id: String,
    pub reason: String,
}

/// Outcome of applying an engagement event
#[derive(Error, Debug)]
pub enum AggregateError {
    #[error(transparent)]
    Conflict(#[from] ConflictError),

    #[error(transparent)]
    Storage(#[from] StorageError),
}

impl AggregateError {
    pub fn is_conflict(&self) -> bool {
        matches!(self, AggregateError::Conflict(_))
    }
}

/// Returned to the consumer loop when a handler gives up on an event
#[derive(Error, Debug)]
pub enum DispatchError {
    #[error("{kind} of {target_id} failed: {source}")]
    Lifecycle {
        kind: LifecycleKind,
        target_id: String,
        source: StorageError,
    },

    #[error("{kind} on {target_id} failed: {source}")]
    Engagement {
        kind: EngagementKind,
        target_id: String,
        source: AggregateError,
    },
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_dispatch_error_message_names_the_target() {
        let error = DispatchError::Lifecycle {
            kind: LifecycleKind::StatsRefresh,
            target_id: "a.jpg".to_string(),
            source: StorageError::NotFound("a.jpg".to_string()),
        };
        assert_eq!(error.to_string(), "stats_refresh of a.jpg failed: a.jpg not found");
    }

    #[test]
    fn test_conflict_converts_into_aggregate_error() {
        let error: AggregateError = ConflictError {
            target_id: "a.jpg".to_string(),
            reason: "lock timeout".to_string(),
        }
        .into();
        assert!(error.is_conflict());
        assert_eq!(error.to_string(), "conflicting update on a.jpg: lock timeout");
    }
}
