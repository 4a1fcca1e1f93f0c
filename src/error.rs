//! Error types for the placement engine
//!
//! Every variant belongs to exactly one [`ErrorClass`], which is what callers
//! above the engine (API layer, agent manager) use to decide between
//! rejecting a request, retrying elsewhere, or raising an alarm.

use std::time::Duration;
use thiserror::Error;

/// Unified error type for the engine
#[derive(Error, Debug)]
pub enum Error {
    // =========================================================================
    // Input Errors
    // =========================================================================
    #[error("Invalid input: {0}")]
    InvalidInput(String),

    #[error("Resource not found: {kind}/{id}")]
    ResourceNotFound { kind: String, id: String },

    #[error("Configuration error: {0}")]
    Configuration(String),

    // =========================================================================
    // Capacity Errors
    // =========================================================================
    #[error("Insufficient capacity: {0}")]
    InsufficientCapacity(String),

    // =========================================================================
    // Availability Errors
    // =========================================================================
    #[error("Host unavailable: {host_id}")]
    HostUnavailable { host_id: String },

    #[error("Operation timed out on host {host_id}: {command}")]
    OperationTimeout { host_id: String, command: String },

    #[error("Command {command} failed on host {host_id}: {reason}")]
    CommandFailed {
        host_id: String,
        command: String,
        reason: String,
    },

    #[error("Storage pool {pool_id} unavailable: {reason}")]
    StorageUnavailable { pool_id: String, reason: String },

    #[error("Repository error: {0}")]
    Repository(String),

    // =========================================================================
    // State Errors
    // =========================================================================
    #[error("Cannot {operation} {kind} {id} in state {current}")]
    StateConflict {
        kind: String,
        id: String,
        current: String,
        operation: String,
    },

    #[error("Storage conflict on pool {pool_id}: {reason}")]
    StorageConflict { pool_id: String, reason: String },

    #[error("Lost update on {kind} {id}: expected state {expected}")]
    LostUpdate {
        kind: String,
        id: String,
        expected: String,
    },

    // =========================================================================
    // Fatal Errors
    // =========================================================================
    #[error("Fatal inconsistency: {0}")]
    FatalInconsistency(String),

    #[error("Mount failure for pool {pool_id} on host {host_id}: {reason}")]
    MountFailure {
        pool_id: String,
        host_id: String,
        reason: String,
    },

    #[error("Internal error: {0}")]
    Internal(String),

    // =========================================================================
    // Parse / IO Errors
    // =========================================================================
    #[error("YAML parse error: {0}")]
    YamlParse(#[from] serde_yaml::Error),

    #[error("JSON parse error: {0}")]
    JsonParse(#[from] serde_json::Error),

    #[error("IO error: {0}")]
    Io(#[from] std::io::Error),
}

/// Failure classes exposed to callers of the engine
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub enum ErrorClass {
    /// Malformed or contradictory request
    InputError,
    /// No destination or not enough room
    CapacityExhausted,
    /// A specific host or pool is unreachable right now
    ResourceUnavailable,
    /// Illegal lifecycle transition or a lost race
    StateConflict,
    /// Precondition bug, never transient
    FatalInconsistency,
}

impl std::fmt::Display for ErrorClass {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        match self {
            ErrorClass::InputError => write!(f, "input_error"),
            ErrorClass::CapacityExhausted => write!(f, "capacity_exhausted"),
            ErrorClass::ResourceUnavailable => write!(f, "resource_unavailable"),
            ErrorClass::StateConflict => write!(f, "state_conflict"),
            ErrorClass::FatalInconsistency => write!(f, "fatal_inconsistency"),
        }
    }
}

/// What a caller should do with a failed operation
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum ErrorAction {
    /// Try the next candidate host/pool
    RetryElsewhere,
    /// Retry the same operation after a delay
    RetryAfter(Duration),
    /// Do not retry
    Reject,
}

impl Error {
    /// Classify this error
    pub fn class(&self) -> ErrorClass {
        match self {
            Error::InvalidInput(_) | Error::ResourceNotFound { .. } | Error::Configuration(_) => {
                ErrorClass::InputError
            }

            Error::InsufficientCapacity(_) => ErrorClass::CapacityExhausted,

            Error::HostUnavailable { .. }
            | Error::OperationTimeout { .. }
            | Error::CommandFailed { .. }
            | Error::StorageUnavailable { .. }
            | Error::Repository(_) => ErrorClass::ResourceUnavailable,

            Error::StateConflict { .. }
            | Error::StorageConflict { .. }
            | Error::LostUpdate { .. } => ErrorClass::StateConflict,

            Error::FatalInconsistency(_)
            | Error::MountFailure { .. }
            | Error::Internal(_)
            | Error::YamlParse(_)
            | Error::JsonParse(_)
            | Error::Io(_) => ErrorClass::FatalInconsistency,
        }
    }

    /// Determine what action to take for this error
    pub fn action(&self) -> ErrorAction {
        match self {
            // Host-level trouble - move on to another candidate
            Error::HostUnavailable { .. }
            | Error::OperationTimeout { .. }
            | Error::StorageUnavailable { .. } => ErrorAction::RetryElsewhere,

            // Lost a race against another management node
            Error::LostUpdate { .. } => ErrorAction::RetryAfter(Duration::from_millis(200)),

            // Repository hiccup
            Error::Repository(_) => ErrorAction::RetryAfter(Duration::from_secs(5)),

            // Capacity may free up later
            Error::InsufficientCapacity(_) => ErrorAction::RetryAfter(Duration::from_secs(60)),

            _ => ErrorAction::Reject,
        }
    }

    /// Check if this error is retryable
    pub fn is_retryable(&self) -> bool {
        !matches!(self.action(), ErrorAction::Reject)
    }

    /// Check if this error is transient
    pub fn is_transient(&self) -> bool {
        self.class() == ErrorClass::ResourceUnavailable
    }

    /// Conflict or fatal errors abort multi-host batches
    pub fn aborts_batch(&self) -> bool {
        matches!(
            self,
            Error::StorageConflict { .. } | Error::MountFailure { .. } | Error::FatalInconsistency(_)
        )
    }

    pub(crate) fn not_found(kind: &str, id: impl std::fmt::Display) -> Self {
        Error::ResourceNotFound {
            kind: kind.to_string(),
            id: id.to_string(),
        }
    }

    pub(crate) fn state_conflict(
        kind: &str,
        id: impl std::fmt::Display,
        current: impl std::fmt::Display,
        operation: &str,
    ) -> Self {
        Error::StateConflict {
            kind: kind.to_string(),
            id: id.to_string(),
            current: current.to_string(),
            operation: operation.to_string(),
        }
    }
}

/// Result type alias for the engine
pub type Result<T> = std::result::Result<T, Error>;

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_error_classes() {
        let err = Error::InvalidInput("zone missing".into());
        assert_eq!(err.class(), ErrorClass::InputError);
        assert_eq!(err.action(), ErrorAction::Reject);

        let err = Error::HostUnavailable {
            host_id: "host-7".into(),
        };
        assert_eq!(err.class(), ErrorClass::ResourceUnavailable);
        assert_eq!(err.action(), ErrorAction::RetryElsewhere);

        let err = Error::state_conflict("pool", 3, "Up", "delete");
        assert_eq!(err.class(), ErrorClass::StateConflict);
        assert_eq!(err.to_string(), "Cannot delete pool 3 in state Up");

        let err = Error::FatalInconsistency("2 rows updated".into());
        assert_eq!(err.class(), ErrorClass::FatalInconsistency);
    }

    #[test]
    fn test_error_retryable() {
        let transient = Error::OperationTimeout {
            host_id: "host-1".into(),
            command: "ModifyStoragePool".into(),
        };
        assert!(transient.is_retryable());
        assert!(transient.is_transient());

        let lost = Error::LostUpdate {
            kind: "pool".into(),
            id: "4".into(),
            expected: "Up".into(),
        };
        assert!(lost.is_retryable());
        assert!(!lost.is_transient());

        let config_err = Error::Configuration("invalid".into());
        assert!(!config_err.is_retryable());
        assert!(!config_err.is_transient());
    }

    #[test]
    fn test_batch_abort_classes() {
        assert!(Error::StorageConflict {
            pool_id: "1".into(),
            reason: "uuid reused".into()
        }
        .aborts_batch());
        assert!(!Error::HostUnavailable {
            host_id: "2".into()
        }
        .aborts_batch());
    }
}
