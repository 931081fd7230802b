use std::collections::BTreeMap;

use thiserror::Error;

/// Result alias used across the varbridge crates
pub type VarResult<T> = Result<T, VarError>;

/// Error type for every variable, dependency, lock and access operation
#[derive(Error, Debug, Clone, PartialEq)]
pub enum VarError {
    /// Variable not found by name or id
    #[error("Variable not found: {0}")]
    NotFound(String),

    /// Session not found
    #[error("Session not found: {0}")]
    SessionNotFound(String),

    /// No type implementation is registered for the tag
    #[error("Unknown variable type: {0}")]
    UnknownType(String),

    /// Type or constraint mismatch
    #[error("Validation failed: {0}")]
    ValidationFailed(String),

    /// Variable was registered read-only
    #[error("Variable is read-only: {0}")]
    ReadOnly(String),

    /// Caller lacks the requested permission
    #[error("Access denied: {caller} lacks {permission} on {variable}")]
    AccessDenied {
        /// Caller identity
        caller: String,
        /// Requested permission
        permission: String,
        /// Variable name
        variable: String,
    },

    /// Dependency edge rejected because it closes a cycle
    #[error("Dependency {from} -> {to} would create a cycle")]
    WouldCreateCycle {
        /// Prerequisite variable
        from: String,
        /// Dependent variable
        to: String,
    },

    /// Variable is locked by another optimizer
    #[error("Optimization lock held by {0}")]
    LockHeldBy(String),

    /// The optimizer already holds the lock it asked for
    #[error("Optimizer {0} is already optimizing this variable")]
    AlreadyOptimizing(String),

    /// Release or progress report from an optimizer that holds no lock
    #[error("Optimizer {0} does not hold the lock")]
    NotLockHolder(String),

    /// Variable still has dependents
    #[error("Variable {variable} has dependents: {dependents:?}")]
    HasDependents {
        /// Variable name
        variable: String,
        /// Names of dependent variables
        dependents: Vec<String>,
    },

    /// Name already registered in the session
    #[error("Variable name already exists: {0}")]
    DuplicateName(String),

    /// Batch validation failures keyed by identifier
    #[error("Batch failed for {} key(s)", .0.len())]
    PartialFailure(BTreeMap<String, VarError>),

    /// Transport or backend unreachable
    #[error("Unavailable: {0}")]
    Unavailable(String),

    /// Waited too long
    #[error("Timed out: {0}")]
    Timeout(String),

    /// Serialization error
    #[error("Serialization error: {0}")]
    SerializationError(String),

    /// Configuration error
    #[error("Configuration error: {0}")]
    ConfigurationError(String),

    /// Generic error
    #[error("{0}")]
    Other(String),
}

impl VarError {
    /// Short stable name of the error kind, used in audit records and metrics labels
    pub fn kind(&self) -> &'static str {
        match self {
            VarError::NotFound(_) => "not_found",
            VarError::SessionNotFound(_) => "session_not_found",
            VarError::UnknownType(_) => "unknown_type",
            VarError::ValidationFailed(_) => "validation_failed",
            VarError::ReadOnly(_) => "read_only",
            VarError::AccessDenied { .. } => "access_denied",
            VarError::WouldCreateCycle { .. } => "would_create_cycle",
            VarError::LockHeldBy(_) => "lock_held_by",
            VarError::AlreadyOptimizing(_) => "already_optimizing",
            VarError::NotLockHolder(_) => "not_lock_holder",
            VarError::HasDependents { .. } => "has_dependents",
            VarError::DuplicateName(_) => "duplicate_name",
            VarError::PartialFailure(_) => "partial_failure",
            VarError::Unavailable(_) => "unavailable",
            VarError::Timeout(_) => "timeout",
            VarError::SerializationError(_) => "serialization",
            VarError::ConfigurationError(_) => "configuration",
            VarError::Other(_) => "other",
        }
    }
}

impl From<serde_json::Error> for VarError {
    fn from(err: serde_json::Error) -> Self {
        VarError::SerializationError(err.to_string())
    }
}

impl From<serde_yaml::Error> for VarError {
    fn from(err: serde_yaml::Error) -> Self {
        VarError::ConfigurationError(err.to_string())
    }
}

impl From<String> for VarError {
    fn from(err: String) -> Self {
        VarError::Other(err)
    }
}

impl From<&str> for VarError {
    fn from(err: &str) -> Self {
        VarError::Other(err.to_string())
    }
}
